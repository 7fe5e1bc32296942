//! Bearer-token attachment and single-flight recovery from `401 Unauthorized`.
//!
//! The first request rejected with 401 becomes the refresh leader: it moves
//! the authorizer from `Idle` to `Refreshing` and calls
//! [`SessionManager::refresh_tokens`]. Requests rejected while that refresh
//! is running queue up as waiters instead of refreshing again. When the
//! leader finishes it returns the state to `Idle` and hands the outcome to
//! every waiter. Each request is retried at most once.

use std::sync::Arc;

use http::{Method, StatusCode};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::provider::IdentityProvider;
use crate::session::SessionManager;
use crate::store::KeyValueStore;
use crate::transport::{ApiRequest, ApiResponse, Transport, clone_request, with_bearer};

type Waiter = oneshot::Sender<Option<String>>;

enum RefreshState {
    Idle,
    Refreshing { waiters: Vec<Waiter> },
}

enum Role {
    Leader,
    Waiter(oneshot::Receiver<Option<String>>),
}

/// HTTP client wrapper that authorizes requests from the session.
pub struct RequestAuthorizer<P, S, T> {
    session: SessionManager<P, S>,
    transport: Arc<T>,
    state: Arc<Mutex<RefreshState>>,
}

// Manual Clone: avoid derive adding `P: Clone, S: Clone, T: Clone` bounds.
impl<P, S, T> Clone for RequestAuthorizer<P, S, T> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            transport: Arc::clone(&self.transport),
            state: Arc::clone(&self.state),
        }
    }
}

impl<P: IdentityProvider, S: KeyValueStore, T: Transport> RequestAuthorizer<P, S, T> {
    #[must_use]
    pub fn new(session: SessionManager<P, S>, transport: T) -> Self {
        Self {
            session,
            transport: Arc::new(transport),
            state: Arc::new(Mutex::new(RefreshState::Idle)),
        }
    }

    #[must_use]
    pub fn session(&self) -> &SessionManager<P, S> {
        &self.session
    }

    /// Whether a refresh is currently in flight.
    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        matches!(*self.state.lock(), RefreshState::Refreshing { .. })
    }

    /// `GET` a path relative to the configured API base URL.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute). Also returns [`Error::Config`] if the
    /// path does not form a valid URL.
    pub async fn get(&self, path: &str) -> Result<ApiResponse, Error> {
        let uri = api_uri(self.session.config().api_url(), path)?;
        let request = http::Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Vec::new())
            .map_err(|e| Error::Config(format!("request for {path}: {e}")))?;
        self.execute(request).await
    }

    /// Send `request` with the stored bearer token.
    ///
    /// On 401 the session's tokens are refreshed (once per burst of rejected
    /// requests) and the request is retried once with the new token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Status`] for a non-success response. If the refresh
    /// fails, this is the original 401. Transport failures pass through.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, Error> {
        let retry = clone_request(&request);
        let request = match self.session.access_token() {
            Some(token) => with_bearer(request, &token),
            None => request,
        };

        let response = self.transport.send(request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return into_result(response);
        }
        let rejected = status_error(response);

        let Some(token) = self.recover().await else {
            return Err(rejected);
        };
        tracing::debug!(uri = %retry.uri(), "Retrying request with refreshed token");
        let response = self.transport.send(with_bearer(retry, &token)).await?;
        into_result(response)
    }

    /// Obtain a fresh access token, joining an in-flight refresh if there is one.
    async fn recover(&self) -> Option<String> {
        let role = {
            let mut state = self.state.lock();
            match &mut *state {
                RefreshState::Idle => {
                    *state = RefreshState::Refreshing {
                        waiters: Vec::new(),
                    };
                    Role::Leader
                }
                RefreshState::Refreshing { waiters } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Role::Waiter(rx)
                }
            }
        };

        match role {
            Role::Waiter(rx) => rx.await.ok().flatten(),
            Role::Leader => {
                let guard = RefreshGuard {
                    state: &self.state,
                    armed: true,
                };
                // refresh_tokens logs out on failure
                let token = match self.session.refresh_tokens().await {
                    Ok(tokens) => Some(tokens.access_token),
                    Err(e) => {
                        tracing::warn!(error = %e, "Refresh after 401 failed");
                        None
                    }
                };
                guard.finish(token.clone());
                token
            }
        }
    }
}

/// Returns the authorizer to `Idle` when the leader finishes, or when its
/// future is dropped mid-refresh (waiters then see a failed refresh).
struct RefreshGuard<'a> {
    state: &'a Mutex<RefreshState>,
    armed: bool,
}

impl RefreshGuard<'_> {
    fn finish(mut self, token: Option<String>) {
        self.armed = false;
        for waiter in take_waiters(self.state) {
            let _ = waiter.send(token.clone());
        }
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            drop(take_waiters(self.state));
        }
    }
}

fn take_waiters(state: &Mutex<RefreshState>) -> Vec<Waiter> {
    match std::mem::replace(&mut *state.lock(), RefreshState::Idle) {
        RefreshState::Refreshing { waiters } => waiters,
        RefreshState::Idle => Vec::new(),
    }
}

fn into_result(response: ApiResponse) -> Result<ApiResponse, Error> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(status_error(response))
    }
}

fn status_error(response: ApiResponse) -> Error {
    let status = response.status();
    Error::Status {
        status,
        body: response.into_body(),
    }
}

fn api_uri(base: &url::Url, path: &str) -> Result<http::Uri, Error> {
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    joined
        .parse()
        .map_err(|e| Error::Config(format!("{joined}: {e}")))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use time::OffsetDateTime;

    use super::*;
    use crate::config::SessionConfig;
    use crate::store::MemoryStore;
    use crate::testing::{FakeProvider, FakeTransport, seeded_store};

    type Authorizer = RequestAuthorizer<FakeProvider, MemoryStore, FakeTransport>;

    fn authorizer(provider: &FakeProvider, transport: &FakeTransport, token: &str) -> Authorizer {
        let store = seeded_store(token, OffsetDateTime::now_utc() + time::Duration::hours(1));
        let session = SessionManager::new(provider.clone(), store, SessionConfig::default());
        RequestAuthorizer::new(session, transport.clone())
    }

    fn request(path: &str) -> ApiRequest {
        http::Request::builder()
            .uri(format!("http://localhost:5000/api{path}"))
            .body(Vec::new())
            .unwrap()
    }

    #[tokio::test]
    async fn attaches_stored_token() {
        let provider = FakeProvider::new().signed_in();
        let transport = FakeTransport::default();
        let api = authorizer(&provider, &transport, "test-token");

        api.execute(request("/data")).await.unwrap();

        assert_eq!(transport.seen(), vec![Some("Bearer test-token".to_string())]);
    }

    #[tokio::test]
    async fn sends_without_header_when_no_token() {
        let provider = FakeProvider::new();
        let transport = FakeTransport::default();
        let session = SessionManager::new(provider.clone(), MemoryStore::new(), SessionConfig::default());
        let api = RequestAuthorizer::new(session, transport.clone());

        api.execute(request("/data")).await.unwrap();

        assert_eq!(transport.seen(), vec![None]);
    }

    #[tokio::test]
    async fn non_401_errors_pass_through_without_retry() {
        let provider = FakeProvider::new().signed_in();
        let transport = FakeTransport::default();
        *transport.state.fixed_status.lock() = Some(StatusCode::NOT_FOUND);
        let api = authorizer(&provider, &transport, "test-token");

        let err = api.execute(request("/missing")).await.unwrap_err();

        assert!(matches!(err, Error::Status { status, .. } if status == StatusCode::NOT_FOUND));
        assert_eq!(transport.seen().len(), 1);
        assert_eq!(provider.forced_fetches(), 0);
        assert_eq!(provider.sign_outs(), 0);
    }

    #[tokio::test]
    async fn refreshes_and_retries_on_401() {
        let provider = FakeProvider::new().signed_in();
        let transport = FakeTransport::accepting("new-access-token");
        let api = authorizer(&provider, &transport, "expired-token");

        let response = api.execute(request("/data")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            transport.seen(),
            vec![
                Some("Bearer expired-token".to_string()),
                Some("Bearer new-access-token".to_string()),
            ]
        );
        assert_eq!(provider.forced_fetches(), 1);
        assert!(!api.is_refreshing());
    }

    #[tokio::test]
    async fn concurrent_401s_share_one_refresh() {
        let provider = FakeProvider::new().signed_in();
        *provider.state.refresh_delay.lock() = Duration::from_millis(50);
        let transport = FakeTransport::accepting("new-access-token");
        let api = authorizer(&provider, &transport, "expired-token");

        let (first, second) = tokio::join!(
            api.execute(request("/challenges")),
            api.execute(request("/leaderboard")),
        );

        assert_eq!(first.unwrap().status(), StatusCode::OK);
        assert_eq!(second.unwrap().status(), StatusCode::OK);
        assert_eq!(provider.forced_fetches(), 1);

        let seen = transport.seen();
        assert_eq!(seen.len(), 4);
        let retried: Vec<_> = seen
            .iter()
            .filter(|h| h.as_deref() == Some("Bearer new-access-token"))
            .collect();
        assert_eq!(retried.len(), 2);
        assert!(!api.is_refreshing());
    }

    #[tokio::test]
    async fn refresh_failure_logs_out_once_and_returns_original_error() {
        let provider = FakeProvider::new().signed_in();
        FakeProvider::fail(&provider.state.refresh_error, "Refresh Token has been revoked");
        let transport = FakeTransport::accepting("new-access-token");
        let api = authorizer(&provider, &transport, "expired-token");

        let err = api.execute(request("/data")).await.unwrap_err();

        match err {
            Error::Status { status, body } => {
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert_eq!(body, b"Unauthorized");
            }
            other => panic!("expected the original 401, got {other:?}"),
        }
        assert_eq!(provider.sign_outs(), 1);
        assert_eq!(transport.seen().len(), 1);
        assert_eq!(api.session().current_user(), None);
        assert!(!api.is_refreshing());
    }

    #[tokio::test]
    async fn waiters_fail_with_their_own_401_when_refresh_fails() {
        let provider = FakeProvider::new().signed_in();
        *provider.state.refresh_delay.lock() = Duration::from_millis(50);
        FakeProvider::fail(&provider.state.refresh_error, "revoked");
        let transport = FakeTransport::accepting("new-access-token");
        let api = authorizer(&provider, &transport, "expired-token");

        let (first, second) = tokio::join!(
            api.execute(request("/a")),
            api.execute(request("/b")),
        );

        for result in [first, second] {
            assert!(matches!(
                result,
                Err(Error::Status { status, .. }) if status == StatusCode::UNAUTHORIZED
            ));
        }
        assert_eq!(provider.forced_fetches(), 1);
        assert_eq!(provider.sign_outs(), 1);
    }

    #[tokio::test]
    async fn retried_request_is_not_retried_again() {
        let provider = FakeProvider::new().signed_in();
        // Nothing is ever accepted
        let transport = FakeTransport::accepting("some-other-token");
        let api = authorizer(&provider, &transport, "expired-token");

        let err = api.execute(request("/data")).await.unwrap_err();

        assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
        assert_eq!(transport.seen().len(), 2);
        assert_eq!(provider.forced_fetches(), 1);
    }

    #[tokio::test]
    async fn cancelled_leader_releases_refresh_state() {
        let provider = FakeProvider::new().signed_in();
        *provider.state.refresh_delay.lock() = Duration::from_secs(60);
        let transport = FakeTransport::accepting("new-access-token");
        let api = authorizer(&provider, &transport, "expired-token");

        let attempt = tokio::time::timeout(Duration::from_millis(20), api.execute(request("/a"))).await;

        assert!(attempt.is_err());
        assert!(!api.is_refreshing());
    }

    #[tokio::test]
    async fn get_joins_api_base_url() {
        let provider = FakeProvider::new().signed_in();
        let transport = FakeTransport::default();
        let api = authorizer(&provider, &transport, "t");

        let response = api.get("/challenges").await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn api_uri_handles_slashes() {
        let base: url::Url = "http://localhost:5000/api/".parse().unwrap();
        assert_eq!(
            api_uri(&base, "/challenges").unwrap().to_string(),
            "http://localhost:5000/api/challenges"
        );
        assert_eq!(
            api_uri(&base, "children").unwrap().to_string(),
            "http://localhost:5000/api/children"
        );
    }
}
