use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

/// Role assigned to new registrations when none is chosen.
pub const DEFAULT_REGISTRATION_ROLE: &str = "parent";
/// Role assumed when the identity provider has no `custom:role` attribute.
pub const FALLBACK_ROLE: &str = "user";
pub const ROLE_PARENT: &str = "parent";
pub const ROLE_CHILD: &str = "child";

/// Identity-provider user identifier (Cognito `sub`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct UserId(pub String);

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Snapshot of the signed-in user, as persisted under `currentUser`.
///
/// Roles are an open set and compared by plain string equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: UserId,
    pub email: String,
    pub name: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

impl User {
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.role == role
    }
}

/// Token pair handed out by login and refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub id_token: String,
    pub access_token: String,
    /// Lifetime in seconds the client assumes for these tokens.
    pub expires_in: u64,
}

/// Normalized result of `register` and `login`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub message: String,
    pub user: User,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenSet>,
}
