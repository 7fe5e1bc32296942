//! Scriptable fakes shared by the unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use http::StatusCode;
use parking_lot::Mutex;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::Error;
use crate::provider::{
    AuthSession, AuthTokens, BoxError, CurrentUser, IdentityProvider, SignUpOutput,
    SignUpRequest, UserAttributes,
};
use crate::store::{KeyValueStore, MemoryStore};
use crate::transport::{ApiRequest, ApiResponse, Transport};
use crate::types::UserId;

#[derive(Default)]
pub(crate) struct ProviderState {
    pub(crate) signed_in: Mutex<Option<AuthTokens>>,
    pub(crate) sign_up_requests: Mutex<Vec<SignUpRequest>>,
    pub(crate) sign_up_error: Mutex<Option<String>>,
    pub(crate) sign_in_error: Mutex<Option<String>>,
    pub(crate) session_error: Mutex<Option<String>>,
    pub(crate) attributes_error: Mutex<Option<String>>,
    pub(crate) refresh_error: Mutex<Option<String>>,
    pub(crate) sign_out_error: Mutex<Option<String>>,
    pub(crate) attributes: Mutex<UserAttributes>,
    pub(crate) refresh_delay: Mutex<Duration>,
    pub(crate) sign_ins: AtomicUsize,
    pub(crate) sign_outs: AtomicUsize,
    pub(crate) forced_fetches: AtomicUsize,
}

/// In-memory identity provider. Clones share state, so a test can keep a
/// handle after moving one into the session manager.
#[derive(Clone)]
pub(crate) struct FakeProvider {
    pub(crate) state: Arc<ProviderState>,
}

pub(crate) const USER_ID: &str = "user-1";

pub(crate) fn initial_tokens() -> AuthTokens {
    AuthTokens {
        id_token: "id-token".into(),
        access_token: "access-token".into(),
    }
}

pub(crate) fn refreshed_tokens() -> AuthTokens {
    AuthTokens {
        id_token: "new-id-token".into(),
        access_token: "new-access-token".into(),
    }
}

impl FakeProvider {
    pub(crate) fn new() -> Self {
        let state = ProviderState::default();
        *state.attributes.lock() = UserAttributes::new()
            .with("email", "parent@example.com")
            .with("name", "Pat Parent")
            .with("custom:role", "parent");
        Self {
            state: Arc::new(state),
        }
    }

    pub(crate) fn signed_in(self) -> Self {
        *self.state.signed_in.lock() = Some(initial_tokens());
        self
    }

    pub(crate) fn sign_outs(&self) -> usize {
        self.state.sign_outs.load(Ordering::SeqCst)
    }

    pub(crate) fn forced_fetches(&self) -> usize {
        self.state.forced_fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn fail(slot: &Mutex<Option<String>>, message: &str) {
        *slot.lock() = Some(message.to_owned());
    }
}

fn scripted_failure(slot: &Mutex<Option<String>>) -> Result<(), BoxError> {
    match slot.lock().clone() {
        Some(message) => Err(message.into()),
        None => Ok(()),
    }
}

impl IdentityProvider for FakeProvider {
    async fn sign_up(&self, request: SignUpRequest) -> Result<SignUpOutput, BoxError> {
        self.state.sign_up_requests.lock().push(request);
        scripted_failure(&self.state.sign_up_error)?;
        Ok(SignUpOutput {
            user_id: UserId::from("new-user"),
            confirmed: false,
        })
    }

    async fn sign_in(&self, _username: &str, _password: &str) -> Result<(), BoxError> {
        self.state.sign_ins.fetch_add(1, Ordering::SeqCst);
        scripted_failure(&self.state.sign_in_error)?;
        *self.state.signed_in.lock() = Some(initial_tokens());
        Ok(())
    }

    async fn sign_out(&self) -> Result<(), BoxError> {
        self.state.sign_outs.fetch_add(1, Ordering::SeqCst);
        *self.state.signed_in.lock() = None;
        scripted_failure(&self.state.sign_out_error)
    }

    async fn fetch_auth_session(&self, force_refresh: bool) -> Result<AuthSession, BoxError> {
        if !force_refresh {
            scripted_failure(&self.state.session_error)?;
            return Ok(AuthSession {
                tokens: self.state.signed_in.lock().clone(),
            });
        }

        self.state.forced_fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.refresh_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        scripted_failure(&self.state.refresh_error)?;
        *self.state.signed_in.lock() = Some(refreshed_tokens());
        Ok(AuthSession {
            tokens: Some(refreshed_tokens()),
        })
    }

    async fn get_current_user(&self) -> Result<CurrentUser, BoxError> {
        if self.state.signed_in.lock().is_none() {
            return Err("not signed in".into());
        }
        Ok(CurrentUser {
            user_id: UserId::from(USER_ID),
            username: "parent@example.com".into(),
        })
    }

    async fn fetch_user_attributes(&self) -> Result<UserAttributes, BoxError> {
        scripted_failure(&self.state.attributes_error)?;
        Ok(self.state.attributes.lock().clone())
    }
}

/// Store pre-populated with a session whose tokens expire at `expires_at`.
pub(crate) fn seeded_store(access_token: &str, expires_at: OffsetDateTime) -> MemoryStore {
    let store = MemoryStore::new();
    store
        .set(
            "currentUser",
            r#"{"user_id":"user-1","email":"parent@example.com","name":"Pat Parent","role":"parent"}"#,
        )
        .unwrap();
    store.set("id_token", "id-token").unwrap();
    store.set("access_token", access_token).unwrap();
    store
        .set("token_expiration", &expires_at.format(&Rfc3339).unwrap())
        .unwrap();
    store
}

/// [`MemoryStore`] whose writes to one key can be made to fail.
#[derive(Default)]
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    failing_key: Mutex<Option<String>>,
}

impl FlakyStore {
    pub(crate) fn fail_writes_to(&self, key: &str) {
        *self.failing_key.lock() = Some(key.to_owned());
    }
}

impl KeyValueStore for FlakyStore {
    fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        if self.failing_key.lock().as_deref() == Some(key) {
            return Err(Error::Store("disk full".into()));
        }
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        self.inner.remove(key)
    }
}

#[derive(Default)]
pub(crate) struct TransportState {
    /// Only this bearer token is accepted; `None` accepts everything.
    pub(crate) valid_token: Mutex<Option<String>>,
    /// Answer every request with this status instead.
    pub(crate) fixed_status: Mutex<Option<StatusCode>>,
    /// `Authorization` header of every request, in send order.
    pub(crate) seen: Mutex<Vec<Option<String>>>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeTransport {
    pub(crate) state: Arc<TransportState>,
}

impl FakeTransport {
    pub(crate) fn accepting(token: &str) -> Self {
        let transport = Self::default();
        *transport.state.valid_token.lock() = Some(token.to_owned());
        transport
    }

    pub(crate) fn seen(&self) -> Vec<Option<String>> {
        self.state.seen.lock().clone()
    }
}

impl Transport for FakeTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, Error> {
        let authorization = request
            .headers()
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);
        self.state.seen.lock().push(authorization.clone());

        let status = if let Some(status) = *self.state.fixed_status.lock() {
            status
        } else {
            match self.state.valid_token.lock().as_deref() {
                None => StatusCode::OK,
                Some(valid)
                    if authorization.as_deref() == Some(format!("Bearer {valid}").as_str()) =>
                {
                    StatusCode::OK
                }
                Some(_) => StatusCode::UNAUTHORIZED,
            }
        };

        let body = status.canonical_reason().unwrap_or_default().as_bytes().to_vec();
        let mut response = http::Response::new(body);
        *response.status_mut() = status;
        Ok(response)
    }
}
