use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;

use crate::error::Error;

/// Claims read from a JWT payload without signature verification.
///
/// Only for reading identity hints from tokens this client received
/// directly from the identity provider. Never use for authorization.
#[derive(Debug, Clone)]
pub struct UnverifiedClaims {
    inner: JsonValue,
}

impl UnverifiedClaims {
    /// Gets a claim value by key.
    #[must_use]
    pub fn get_claim(&self, key: &str) -> Option<&JsonValue> {
        self.inner.get(key)
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.inner.get(key).and_then(JsonValue::as_str)
    }

    /// The `sub` claim.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.get_str("sub")
    }

    /// The `exp` claim as a timestamp.
    #[must_use]
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        let exp = self.inner.get("exp").and_then(JsonValue::as_i64)?;
        OffsetDateTime::from_unix_timestamp(exp).ok()
    }

    #[must_use]
    pub fn as_json(&self) -> &JsonValue {
        &self.inner
    }
}

/// Decode the payload segment of a compact JWS (`header.payload.signature`).
///
/// # Errors
///
/// Returns [`Error::Authentication`] if the token is not three dot-separated
/// segments or the payload is not base64url-encoded JSON.
pub fn peek_claims(token: &str) -> Result<UnverifiedClaims, Error> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::Authentication("invalid token format".into()));
    };

    // Some issuers pad their segments anyway
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|_| Error::Authentication("invalid token payload".into()))?;
    let inner: JsonValue = serde_json::from_slice(&bytes)
        .map_err(|_| Error::Authentication("invalid token payload".into()))?;
    if !inner.is_object() {
        return Err(Error::Authentication("invalid token payload".into()));
    }

    Ok(UnverifiedClaims { inner })
}

#[cfg(test)]
pub(crate) fn fake_jwt(claims: &JsonValue) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_subject_and_username() {
        let token = fake_jwt(&json!({
            "sub": "9f1c-user",
            "cognito:username": "parent@example.com",
            "exp": 1_900_000_000,
        }));

        let claims = peek_claims(&token).unwrap();
        assert_eq!(claims.subject(), Some("9f1c-user"));
        assert_eq!(claims.get_str("cognito:username"), Some("parent@example.com"));
        assert_eq!(
            claims.expires_at().map(OffsetDateTime::unix_timestamp),
            Some(1_900_000_000)
        );
    }

    #[test]
    fn rejects_wrong_segment_count() {
        assert!(peek_claims("only.two").is_err());
        assert!(peek_claims("a.b.c.d").is_err());
        assert!(peek_claims("").is_err());
    }

    #[test]
    fn rejects_non_json_payload() {
        let payload = URL_SAFE_NO_PAD.encode("not json");
        assert!(peek_claims(&format!("e30.{payload}.sig")).is_err());
    }

    #[test]
    fn rejects_non_object_payload() {
        let payload = URL_SAFE_NO_PAD.encode("[1,2,3]");
        assert!(peek_claims(&format!("e30.{payload}.sig")).is_err());
    }

    #[test]
    fn tolerates_padded_payload() {
        let payload = base64::engine::general_purpose::URL_SAFE.encode(r#"{"sub":"x"}"#);
        let claims = peek_claims(&format!("e30.{payload}.sig")).unwrap();
        assert_eq!(claims.subject(), Some("x"));
    }
}
