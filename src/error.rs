use crate::forms::FieldError;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The identity provider rejected a sign-up (duplicate account, weak password, ...).
    #[error("{0}")]
    Registration(String),

    /// Sign-in, or one of the session lookups that follow it, failed.
    #[error("{0}")]
    Authentication(String),

    /// Silent refresh failed; the session has been torn down.
    #[error("Session expired. Please log in again.")]
    SessionExpired,

    #[error("{message}")]
    Provider {
        operation: &'static str,
        kind: Option<String>,
        status: Option<u16>,
        message: String,
    },

    /// Non-success HTTP response from an authorized API call.
    #[error("Request failed with status {status}")]
    Status {
        status: http::StatusCode,
        body: Vec<u8>,
    },

    #[error("Credential store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid form input: {}", display_fields(.0))]
    Validation(Vec<FieldError>),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "reqwest")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// HTTP status carried by the error, if any.
    #[must_use]
    pub fn status(&self) -> Option<http::StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Provider {
                status: Some(code), ..
            } => http::StatusCode::from_u16(*code).ok(),
            _ => None,
        }
    }
}

fn display_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_expired_message_is_user_facing() {
        assert_eq!(
            Error::SessionExpired.to_string(),
            "Session expired. Please log in again."
        );
    }

    #[test]
    fn provider_error_displays_provider_message() {
        let err = Error::Provider {
            operation: "SignUp",
            kind: Some("UsernameExistsException".into()),
            status: Some(400),
            message: "An account with the given email already exists.".into(),
        };
        assert_eq!(
            err.to_string(),
            "An account with the given email already exists."
        );
        assert_eq!(err.status(), Some(http::StatusCode::BAD_REQUEST));
    }

    #[test]
    fn status_error_exposes_status() {
        let err = Error::Status {
            status: http::StatusCode::UNAUTHORIZED,
            body: b"Unauthorized".to_vec(),
        };
        assert_eq!(err.status(), Some(http::StatusCode::UNAUTHORIZED));
        assert_eq!(Error::SessionExpired.status(), None);
    }
}
