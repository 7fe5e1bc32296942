//! Session lifecycle: sign-in, registration, sign-out, expiry and silent refresh.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::SessionConfig;
use crate::error::Error;
use crate::provider::{
    ATTR_EMAIL, ATTR_NAME, ATTR_PARENT_ID, ATTR_ROLE, AuthTokens, BoxError, IdentityProvider,
    SignUpRequest, UserAttributes,
};
use crate::store::{CredentialStore, KeyValueStore};
use crate::types::{
    AuthResponse, DEFAULT_REGISTRATION_ROLE, FALLBACK_ROLE, ROLE_CHILD, TokenSet, User,
};

/// Account details for [`SessionManager::register`].
#[derive(Clone)]
pub struct Registration {
    pub email: String,
    pub name: String,
    pub password: String,
    pub role: String,
    /// Only sent to the provider when `role` is `"child"`.
    pub parent_id: Option<String>,
}

impl Registration {
    /// New registration with the default `"parent"` role.
    #[must_use]
    pub fn new(
        email: impl Into<String>,
        name: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            email: email.into(),
            name: name.into(),
            password: password.into(),
            role: DEFAULT_REGISTRATION_ROLE.into(),
            parent_id: None,
        }
    }

    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    #[must_use]
    pub fn with_parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    fn attributes(&self) -> UserAttributes {
        let mut attributes = UserAttributes::new()
            .with(ATTR_EMAIL, self.email.as_str())
            .with(ATTR_NAME, self.name.as_str())
            .with(ATTR_ROLE, self.role.as_str());
        if self.role == ROLE_CHILD {
            if let Some(parent_id) = &self.parent_id {
                attributes.insert(ATTR_PARENT_ID, parent_id.as_str());
            }
        }
        attributes
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("email", &self.email)
            .field("name", &self.name)
            .field("password", &"<redacted>")
            .field("role", &self.role)
            .field("parent_id", &self.parent_id)
            .finish()
    }
}

/// Owns the client's authenticated session.
///
/// The manager is the only writer of the credential store and of the
/// current-user cell. It is a cheap handle: clones share one session.
///
/// While a session is live, a background task refreshes the tokens every
/// [`refresh_interval`](SessionConfig::refresh_interval). The task is
/// started by [`login`](Self::login) and [`restore`](Self::restore), and is
/// stopped by logout, [`shutdown`](Self::shutdown), or dropping the last
/// handle.
pub struct SessionManager<P, S> {
    inner: Arc<Inner<P, S>>,
}

struct Inner<P, S> {
    provider: P,
    store: CredentialStore<S>,
    config: SessionConfig,
    current_user: watch::Sender<Option<User>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl<P, S> Drop for Inner<P, S> {
    fn drop(&mut self) {
        if let Some(task) = self.refresh_task.get_mut().take() {
            task.abort();
        }
    }
}

// Manual Clone: avoid derive adding `P: Clone, S: Clone` bounds.
impl<P, S> Clone for SessionManager<P, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: IdentityProvider, S: KeyValueStore> SessionManager<P, S> {
    /// Create a manager. The current user is hydrated from the store.
    #[must_use]
    pub fn new(provider: P, store: S, config: SessionConfig) -> Self {
        let store = CredentialStore::new(store, config.key_scheme());
        let (current_user, _) = watch::channel(store.user());
        Self {
            inner: Arc::new(Inner {
                provider,
                store,
                config,
                current_user,
                refresh_task: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn provider(&self) -> &P {
        &self.inner.provider
    }

    #[must_use]
    pub fn credentials(&self) -> &CredentialStore<S> {
        &self.inner.store
    }

    /// Snapshot of the signed-in user.
    #[must_use]
    pub fn current_user(&self) -> Option<User> {
        self.inner.current_user.borrow().clone()
    }

    /// Subscribe to sign-in / sign-out changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<User>> {
        self.inner.current_user.subscribe()
    }

    /// Stored access token, if any. Expiry is not checked.
    #[must_use]
    pub fn access_token(&self) -> Option<String> {
        self.inner.store.access_token()
    }

    /// Check the identity provider for an existing session, e.g. at startup.
    ///
    /// With a live provider session, the user is reloaded, persisted and
    /// published. Without one, stored state is left as it is. If the check
    /// fails, stored state is cleared.
    pub async fn restore(&self) -> Option<User> {
        match self.discover_session().await {
            Ok(Some((tokens, user))) => match self.commit_session(&user, tokens) {
                Ok(_) => {
                    tracing::info!(user_id = %user.user_id, "Restored existing session");
                    Some(user)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Could not persist restored session");
                    self.clear_local_session();
                    None
                }
            },
            Ok(None) => {
                if self.is_logged_in() {
                    self.start_refresh_task();
                }
                self.current_user()
            }
            Err(e) => {
                tracing::debug!(error = %e, "No active session found");
                self.clear_local_session();
                None
            }
        }
    }

    /// Create an account with the identity provider.
    ///
    /// No local state changes; the new user still has to log in.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registration`] with the provider's message.
    pub async fn register(&self, registration: Registration) -> Result<AuthResponse, Error> {
        let request = SignUpRequest {
            username: registration.email.clone(),
            password: registration.password.clone(),
            attributes: registration.attributes(),
        };

        let output = self.inner.provider.sign_up(request).await.map_err(|e| {
            tracing::warn!(error = %e, email = %registration.email, "Registration failed");
            Error::Registration(provider_message(&e, "Registration failed"))
        })?;

        tracing::info!(
            user_id = %output.user_id,
            confirmed = output.confirmed,
            "User registered"
        );

        Ok(AuthResponse {
            message: "User registered successfully".into(),
            user: User {
                user_id: output.user_id,
                email: registration.email,
                name: registration.name,
                role: registration.role,
                created_at: None,
            },
            tokens: None,
        })
    }

    /// Sign in, then persist and publish the session.
    ///
    /// Every provider call completes before anything is written locally, so
    /// a failure leaves the previous local state untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] if any step fails.
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthResponse, Error> {
        let (tokens, user) = self.authenticate(email, password).await.map_err(|e| {
            tracing::warn!(error = %e, "Login failed");
            Error::Authentication(provider_message(&e, "Login failed"))
        })?;

        let tokens = self
            .commit_session(&user, tokens)
            .map_err(|e| Error::Authentication(e.to_string()))?;

        tracing::info!(user_id = %user.user_id, role = %user.role, "Login successful");

        Ok(AuthResponse {
            message: "Login successful".into(),
            user,
            tokens: Some(tokens),
        })
    }

    /// Sign out remotely, then clear local state.
    ///
    /// Local state is always cleared, even if the remote sign-out fails.
    /// Calling this without a session is a no-op apart from the remote call.
    pub async fn logout(&self) {
        if let Err(e) = self.inner.provider.sign_out().await {
            tracing::warn!(error = %e, "Remote sign-out failed; clearing local session anyway");
        }
        self.clear_local_session();
    }

    /// Whether a non-expired session is stored.
    ///
    /// A stored session whose expiry has passed (or cannot be read) is
    /// logged out as a side effect.
    pub fn is_logged_in(&self) -> bool {
        let store = &self.inner.store;
        if store.access_token().is_none() || store.raw_expiration().is_none() {
            return false;
        }

        let live = store
            .expires_at()
            .is_some_and(|expires_at| expires_at > OffsetDateTime::now_utc());
        if !live {
            tracing::info!("Stored session expired");
            self.expire();
        }
        live
    }

    /// Whether the current user has exactly `role`. `false` when signed out.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.inner
            .current_user
            .borrow()
            .as_ref()
            .is_some_and(|user| user.has_role(role))
    }

    /// Force new tokens from the identity provider and store them.
    ///
    /// The current user is not republished.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionExpired`] after logging out if the provider
    /// cannot refresh or the new tokens cannot be stored.
    pub async fn refresh_tokens(&self) -> Result<TokenSet, Error> {
        let outcome = self
            .inner
            .provider
            .fetch_auth_session(true)
            .await
            .and_then(|session| {
                session
                    .tokens
                    .ok_or_else(|| "No tokens in refreshed session".into())
            });

        let tokens = match outcome {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!(error = %e, "Token refresh failed");
                self.logout().await;
                return Err(Error::SessionExpired);
            }
        };

        let tokens = self.token_set(tokens);
        if let Err(e) = self.inner.store.save_tokens(&tokens, self.next_expiry()) {
            // A partial write mixes old and new tokens
            tracing::warn!(error = %e, "Could not store refreshed tokens");
            self.logout().await;
            return Err(Error::SessionExpired);
        }
        tracing::debug!("Tokens refreshed");
        Ok(tokens)
    }

    /// Stop the background refresh task. The session itself is kept.
    pub fn shutdown(&self) {
        self.cancel_refresh_task();
    }

    /// Whether the background refresh task is running.
    #[must_use]
    pub fn is_refresh_scheduled(&self) -> bool {
        self.inner
            .refresh_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    async fn authenticate(&self, email: &str, password: &str) -> Result<(AuthTokens, User), BoxError> {
        let provider = &self.inner.provider;
        provider.sign_in(email, password).await?;
        let session = provider.fetch_auth_session(false).await?;
        let tokens = session.tokens.ok_or("No tokens in session")?;
        let user = self.load_user(Some(email)).await?;
        Ok((tokens, user))
    }

    async fn discover_session(&self) -> Result<Option<(AuthTokens, User)>, BoxError> {
        let session = self.inner.provider.fetch_auth_session(false).await?;
        let Some(tokens) = session.tokens else {
            return Ok(None);
        };
        let user = self.load_user(None).await?;
        Ok(Some((tokens, user)))
    }

    async fn load_user(&self, fallback_email: Option<&str>) -> Result<User, BoxError> {
        let provider = &self.inner.provider;
        let current = provider.get_current_user().await?;
        let attributes = provider.fetch_user_attributes().await?;

        Ok(User {
            user_id: current.user_id,
            email: attributes
                .email()
                .or(fallback_email)
                .unwrap_or_default()
                .to_owned(),
            name: attributes.name().unwrap_or_default().to_owned(),
            role: attributes.role().unwrap_or(FALLBACK_ROLE).to_owned(),
            created_at: None,
        })
    }

    fn commit_session(&self, user: &User, tokens: AuthTokens) -> Result<TokenSet, Error> {
        let tokens = self.token_set(tokens);
        if let Err(e) = self
            .inner
            .store
            .save_session(user, &tokens, self.next_expiry())
        {
            // Drops the half-written session and any previous user with it
            self.clear_local_session();
            return Err(e);
        }
        self.inner.current_user.send_replace(Some(user.clone()));
        self.start_refresh_task();
        Ok(tokens)
    }

    fn token_set(&self, tokens: AuthTokens) -> TokenSet {
        TokenSet {
            id_token: tokens.id_token,
            access_token: tokens.access_token,
            expires_in: self.inner.config.token_lifetime().as_secs(),
        }
    }

    fn next_expiry(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc() + self.inner.config.token_lifetime()
    }

    fn clear_local_session(&self) {
        if let Err(e) = self.inner.store.clear() {
            tracing::warn!(error = %e, "Could not clear stored credentials");
        }
        self.cancel_refresh_task();
        if let Some(user) = self.inner.current_user.send_replace(None) {
            tracing::info!(user_id = %user.user_id, "Logged out");
        }
    }

    /// Logout for a session found expired during a synchronous check: local
    /// state goes now, the remote sign-out runs in the background.
    fn expire(&self) {
        self.clear_local_session();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(&self.inner);
                handle.spawn(async move {
                    if let Err(e) = inner.provider.sign_out().await {
                        tracing::warn!(error = %e, "Remote sign-out of expired session failed");
                    }
                });
            }
            Err(_) => tracing::debug!("No async runtime; skipping remote sign-out"),
        }
    }

    fn start_refresh_task(&self) {
        let period = self.inner.config.refresh_interval();
        if period.is_zero() {
            tracing::warn!("Refresh interval is zero; background refresh disabled");
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No async runtime; background refresh disabled");
            return;
        };

        let task = handle.spawn(refresh_loop(Arc::downgrade(&self.inner), period));
        if let Some(previous) = self.inner.refresh_task.lock().replace(task) {
            previous.abort();
        }
    }

    fn cancel_refresh_task(&self) {
        if let Some(task) = self.inner.refresh_task.lock().take() {
            task.abort();
        }
    }
}

async fn refresh_loop<P: IdentityProvider, S: KeyValueStore>(
    inner: Weak<Inner<P, S>>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let manager = SessionManager { inner };
        if !manager.is_logged_in() {
            continue;
        }
        match manager.refresh_tokens().await {
            Ok(_) => tracing::info!("Token refreshed successfully"),
            Err(e) => tracing::warn!(error = %e, "Failed to refresh token"),
        }
    }
}

fn provider_message(error: &BoxError, fallback: &str) -> String {
    let message = error.to_string();
    if message.trim().is_empty() {
        fallback.to_owned()
    } else {
        message
    }
}
