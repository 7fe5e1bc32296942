use std::collections::BTreeMap;
use std::future::Future;

use crate::types::UserId;

/// Error type reported by [`IdentityProvider`] implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub const ATTR_EMAIL: &str = "email";
pub const ATTR_NAME: &str = "name";
pub const ATTR_ROLE: &str = "custom:role";
pub const ATTR_PARENT_ID: &str = "custom:parentId";

/// User attributes as held by the identity provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserAttributes(BTreeMap<String, String>);

impl UserAttributes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.get(ATTR_EMAIL)
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.get(ATTR_NAME)
    }

    #[must_use]
    pub fn role(&self) -> Option<&str> {
        self.get(ATTR_ROLE)
    }

    #[must_use]
    pub fn parent_id(&self) -> Option<&str> {
        self.get(ATTR_PARENT_ID)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for UserAttributes {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone)]
pub struct SignUpRequest {
    pub username: String,
    pub password: String,
    pub attributes: UserAttributes,
}

#[derive(Debug, Clone)]
pub struct SignUpOutput {
    pub user_id: UserId,
    /// `false` when the account still needs confirmation (e.g. an emailed code).
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthTokens {
    pub id_token: String,
    pub access_token: String,
}

/// Result of a session fetch. `tokens` is `None` when nobody is signed in.
#[derive(Debug, Clone, Default)]
pub struct AuthSession {
    pub tokens: Option<AuthTokens>,
}

#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user_id: UserId,
    pub username: String,
}

/// Managed identity service the session manager authenticates against.
///
/// The provider keeps its own notion of the signed-in principal: after a
/// successful [`sign_in`](Self::sign_in), the session, current user and
/// attribute calls refer to that principal.
pub trait IdentityProvider: Send + Sync + 'static {
    /// Create an account.
    fn sign_up(
        &self,
        request: SignUpRequest,
    ) -> impl Future<Output = Result<SignUpOutput, BoxError>> + Send;

    /// Authenticate with username and password.
    fn sign_in(
        &self,
        username: &str,
        password: &str,
    ) -> impl Future<Output = Result<(), BoxError>> + Send;

    /// End the provider-side session.
    fn sign_out(&self) -> impl Future<Output = Result<(), BoxError>> + Send;

    /// Current tokens. With `force_refresh`, new tokens are obtained even if
    /// the cached ones are still valid.
    fn fetch_auth_session(
        &self,
        force_refresh: bool,
    ) -> impl Future<Output = Result<AuthSession, BoxError>> + Send;

    fn get_current_user(&self) -> impl Future<Output = Result<CurrentUser, BoxError>> + Send;

    fn fetch_user_attributes(
        &self,
    ) -> impl Future<Output = Result<UserAttributes, BoxError>> + Send;
}
