//! Credential persistence.
//!
//! [`KeyValueStore`] is the raw string key-value seam (the native stand-in
//! for browser local storage). [`CredentialStore`] layers the session's
//! typed keys on top of it. Writes are per key; nothing here is atomic
//! across keys.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::Error;
use crate::types::{TokenSet, User};

/// String key-value storage.
///
/// Implementations must be cheap to call synchronously; session checks read
/// from it on every request.
pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<String>;

    /// # Errors
    ///
    /// Returns [`Error::Store`] if the value cannot be persisted.
    fn set(&self, key: &str, value: &str) -> Result<(), Error>;

    /// Removing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the removal cannot be persisted.
    fn remove(&self, key: &str) -> Result<(), Error>;
}

/// In-memory store. Contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.entries.write().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// Store backed by a JSON object on disk, rewritten on every change.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`. A missing file is an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the file exists but cannot be read or parsed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::Store(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(Error::Store(format!("{}: {e}", path.display()))),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), Error> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        std::fs::write(&self.path, bytes)
            .map_err(|e| Error::Store(format!("{}: {e}", self.path.display())))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_owned(), value.to_owned());
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_none() {
            return Ok(());
        }
        self.persist(&entries)
    }
}

/// Which storage key names hold the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyScheme {
    /// `currentUser`, `id_token`, `access_token`, `token_expiration`.
    #[default]
    Current,
    /// `currentUser`, `token`, `tokenExpiration`. No separate id token.
    Legacy,
}

#[derive(Debug, Clone, Copy)]
struct StorageKeys {
    user: &'static str,
    id_token: Option<&'static str>,
    access_token: &'static str,
    expiration: &'static str,
}

impl KeyScheme {
    fn keys(self) -> StorageKeys {
        match self {
            Self::Current => StorageKeys {
                user: "currentUser",
                id_token: Some("id_token"),
                access_token: "access_token",
                expiration: "token_expiration",
            },
            Self::Legacy => StorageKeys {
                user: "currentUser",
                id_token: None,
                access_token: "token",
                expiration: "tokenExpiration",
            },
        }
    }
}

/// Typed view of the session keys over a [`KeyValueStore`].
#[derive(Debug)]
pub struct CredentialStore<S> {
    backend: S,
    keys: StorageKeys,
}

impl<S: KeyValueStore> CredentialStore<S> {
    #[must_use]
    pub fn new(backend: S, scheme: KeyScheme) -> Self {
        Self {
            backend,
            keys: scheme.keys(),
        }
    }

    #[must_use]
    pub fn backend(&self) -> &S {
        &self.backend
    }

    /// Stored user, or `None` if absent or unreadable.
    #[must_use]
    pub fn user(&self) -> Option<User> {
        let raw = self.backend.get(self.keys.user)?;
        match serde_json::from_str(&raw) {
            Ok(user) => Some(user),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable stored user");
                None
            }
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::Store`] or [`Error::Json`] if the user cannot be written.
    pub fn set_user(&self, user: &User) -> Result<(), Error> {
        let json = serde_json::to_string(user)?;
        self.backend.set(self.keys.user, &json)
    }

    #[must_use]
    pub fn access_token(&self) -> Option<String> {
        self.backend.get(self.keys.access_token)
    }

    /// Stored id token. Always `None` under [`KeyScheme::Legacy`].
    #[must_use]
    pub fn id_token(&self) -> Option<String> {
        self.keys.id_token.and_then(|key| self.backend.get(key))
    }

    /// Raw stored expiry string, without parsing.
    #[must_use]
    pub fn raw_expiration(&self) -> Option<String> {
        self.backend.get(self.keys.expiration)
    }

    /// Stored expiry, or `None` if absent or not ISO-8601.
    #[must_use]
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.raw_expiration()
            .and_then(|raw| OffsetDateTime::parse(&raw, &Rfc3339).ok())
    }

    /// Write both tokens and the expiry timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if any key cannot be written. Keys written
    /// before the failure stay written.
    pub fn save_tokens(&self, tokens: &TokenSet, expires_at: OffsetDateTime) -> Result<(), Error> {
        let expiration = expires_at
            .format(&Rfc3339)
            .map_err(|e| Error::Store(format!("format expiry: {e}")))?;
        if let Some(key) = self.keys.id_token {
            self.backend.set(key, &tokens.id_token)?;
        }
        self.backend.set(self.keys.access_token, &tokens.access_token)?;
        self.backend.set(self.keys.expiration, &expiration)
    }

    /// Write user, tokens and expiry.
    ///
    /// # Errors
    ///
    /// See [`save_tokens`](Self::save_tokens).
    pub fn save_session(
        &self,
        user: &User,
        tokens: &TokenSet,
        expires_at: OffsetDateTime,
    ) -> Result<(), Error> {
        self.set_user(user)?;
        self.save_tokens(tokens, expires_at)
    }

    /// Remove every session key. All removals are attempted; the first
    /// failure is returned.
    ///
    /// # Errors
    ///
    /// Returns the first [`Error::Store`] encountered.
    pub fn clear(&self) -> Result<(), Error> {
        let keys = [
            Some(self.keys.user),
            self.keys.id_token,
            Some(self.keys.access_token),
            Some(self.keys.expiration),
        ];
        let mut first_error = None;
        for key in keys.into_iter().flatten() {
            if let Err(e) = self.backend.remove(key) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
