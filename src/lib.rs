#![doc = include_str!("../README.md")]

pub mod authorizer;
#[cfg(feature = "cognito")]
pub mod cognito;
pub mod config;
pub mod error;
pub mod forms;
pub mod guard;
pub mod provider;
pub mod session;
pub mod store;
pub mod token;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

// Re-exports for convenient access
pub use authorizer::RequestAuthorizer;
#[cfg(feature = "cognito")]
pub use cognito::{CognitoConfig, CognitoProvider};
pub use config::SessionConfig;
pub use error::Error;
pub use forms::{FieldError, LoginForm, RegisterForm, return_url};
pub use guard::{GuardDecision, Route, RouteAccess, RouteTable};
pub use provider::{
    AuthSession, AuthTokens, BoxError, CurrentUser, IdentityProvider, SignUpOutput,
    SignUpRequest, UserAttributes,
};
pub use session::{Registration, SessionManager};
pub use store::{CredentialStore, FileStore, KeyScheme, KeyValueStore, MemoryStore};
pub use token::{UnverifiedClaims, peek_claims};
pub use transport::{ApiRequest, ApiResponse, Transport};
pub use types::{AuthResponse, TokenSet, User, UserId};
