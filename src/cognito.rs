use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::OffsetDateTime;
use url::Url;

use crate::error::Error;
use crate::provider::{
    AuthSession, AuthTokens, BoxError, CurrentUser, IdentityProvider, SignUpOutput,
    SignUpRequest, UserAttributes,
};
use crate::token;

const AMZ_JSON: &str = "application/x-amz-json-1.1";
const TARGET_PREFIX: &str = "AWSCognitoIdentityProviderService";

/// Cached tokens closer than this to expiry are refreshed before use.
const EXPIRY_SKEW: time::Duration = time::Duration::seconds(30);

type HmacSha256 = Hmac<Sha256>;

/// Cognito user pool settings.
///
/// Required fields are constructor parameters.
///
/// ```rust,ignore
/// use activityhub_auth::cognito::CognitoConfig;
///
/// let config = CognitoConfig::new("eu-west-1", "eu-west-1_AbCdEf", "app-client-id")
///     .with_client_secret("s3cr3t");
/// ```
#[derive(Clone)]
#[non_exhaustive]
pub struct CognitoConfig {
    pub(crate) region: String,
    pub(crate) user_pool_id: String,
    pub(crate) client_id: String,
    pub(crate) client_secret: Option<String>,
    pub(crate) endpoint: Option<Url>,
}

impl CognitoConfig {
    /// Create a configuration for one user pool app client.
    #[must_use]
    pub fn new(
        region: impl Into<String>,
        user_pool_id: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            region: region.into(),
            user_pool_id: user_pool_id.into(),
            client_id: client_id.into(),
            client_secret: None,
            endpoint: None,
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `COGNITO_REGION`
    /// - `COGNITO_USER_POOL_ID`
    /// - `COGNITO_CLIENT_ID`
    ///
    /// # Optional env vars
    /// - `COGNITO_CLIENT_SECRET`: App client secret; enables `SECRET_HASH`
    /// - `COGNITO_ENDPOINT`: Override the regional endpoint (local emulators)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if required env vars are missing or the endpoint is invalid.
    pub fn from_env() -> Result<Self, Error> {
        let required = |name: &str| {
            std::env::var(name).map_err(|_| Error::Config(format!("{name} is required")))
        };
        let mut config = Self::new(
            required("COGNITO_REGION")?,
            required("COGNITO_USER_POOL_ID")?,
            required("COGNITO_CLIENT_ID")?,
        );

        if let Ok(secret) = std::env::var("COGNITO_CLIENT_SECRET") {
            config = config.with_client_secret(secret);
        }
        if let Ok(endpoint) = std::env::var("COGNITO_ENDPOINT") {
            let url: Url = endpoint
                .parse()
                .map_err(|e| Error::Config(format!("COGNITO_ENDPOINT: {e}")))?;
            config = config.with_endpoint(url);
        }

        Ok(config)
    }

    /// Set the app client secret. Requests then carry a `SECRET_HASH`.
    #[must_use]
    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    /// Override the Cognito service endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// AWS region of the user pool.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    /// User pool ID.
    #[must_use]
    pub fn user_pool_id(&self) -> &str {
        &self.user_pool_id
    }

    /// App client ID.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Service endpoint; `https://cognito-idp.<region>.amazonaws.com/` unless overridden.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the region does not form a valid host.
    pub fn endpoint(&self) -> Result<Url, Error> {
        if let Some(endpoint) = &self.endpoint {
            return Ok(endpoint.clone());
        }
        format!("https://cognito-idp.{}.amazonaws.com/", self.region)
            .parse()
            .map_err(|e| Error::Config(format!("COGNITO_REGION: {e}")))
    }

    fn secret_hash(&self, username: &str) -> Result<Option<String>, Error> {
        self.client_secret
            .as_deref()
            .map(|secret| secret_hash(secret, username, &self.client_id))
            .transpose()
    }
}

impl fmt::Debug for CognitoConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CognitoConfig")
            .field("region", &self.region)
            .field("user_pool_id", &self.user_pool_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// `base64(HMAC-SHA256(client_secret, username + client_id))`.
pub(crate) fn secret_hash(secret: &str, username: &str, client_id: &str) -> Result<String, Error> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Config(format!("COGNITO_CLIENT_SECRET: {e}")))?;
    mac.update(username.as_bytes());
    mac.update(client_id.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Tokens held for the signed-in user.
#[derive(Clone)]
struct CognitoSession {
    username: String,
    id_token: String,
    access_token: String,
    refresh_token: Option<String>,
    expires_at: OffsetDateTime,
}

impl CognitoSession {
    fn from_result(fallback_username: &str, result: AuthenticationResult) -> Self {
        let username = token::peek_claims(&result.id_token)
            .ok()
            .and_then(|claims| claims.get_str("cognito:username").map(str::to_owned))
            .unwrap_or_else(|| fallback_username.to_owned());
        Self {
            username,
            expires_at: expiry(result.expires_in),
            id_token: result.id_token,
            access_token: result.access_token,
            refresh_token: result.refresh_token,
        }
    }

    fn is_fresh(&self, now: OffsetDateTime) -> bool {
        self.expires_at - EXPIRY_SKEW > now
    }

    fn tokens(&self) -> AuthTokens {
        AuthTokens {
            id_token: self.id_token.clone(),
            access_token: self.access_token.clone(),
        }
    }
}

fn expiry(expires_in: u64) -> OffsetDateTime {
    let secs = i64::try_from(expires_in).unwrap_or(i64::MAX);
    OffsetDateTime::now_utc().saturating_add(time::Duration::seconds(secs))
}

/// [`IdentityProvider`] backed by a Cognito user pool.
///
/// Tokens are kept in memory; the session manager persists what the
/// application needs.
pub struct CognitoProvider {
    config: CognitoConfig,
    http: reqwest::Client,
    session: Mutex<Option<CognitoSession>>,
}

impl CognitoProvider {
    /// Create a provider with a default HTTP client.
    #[must_use]
    pub fn new(config: CognitoConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            session: Mutex::new(None),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// User pool configuration.
    #[must_use]
    pub fn config(&self) -> &CognitoConfig {
        &self.config
    }

    /// # Errors
    ///
    /// Returns [`Error::Provider`] if Cognito rejects the registration.
    pub async fn register_user(&self, request: SignUpRequest) -> Result<SignUpOutput, Error> {
        let body = SignUpBody {
            client_id: &self.config.client_id,
            secret_hash: self.config.secret_hash(&request.username)?,
            username: &request.username,
            password: &request.password,
            user_attributes: request
                .attributes
                .iter()
                .map(|(name, value)| AttributeType {
                    name: name.to_owned(),
                    value: value.to_owned(),
                })
                .collect(),
        };
        let response: SignUpResponse = self.call("SignUp", &body).await?;
        tracing::debug!(user_sub = %response.user_sub, "Cognito sign-up accepted");

        Ok(SignUpOutput {
            user_id: response.user_sub.into(),
            confirmed: response.user_confirmed,
        })
    }

    /// Authenticate with `USER_PASSWORD_AUTH`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Provider`] if the credentials are rejected or Cognito
    /// answers with a challenge.
    pub async fn password_auth(&self, username: &str, password: &str) -> Result<(), Error> {
        let mut parameters = vec![
            ("USERNAME", username.to_owned()),
            ("PASSWORD", password.to_owned()),
        ];
        if let Some(hash) = self.config.secret_hash(username)? {
            parameters.push(("SECRET_HASH", hash));
        }
        let result = self.initiate_auth("USER_PASSWORD_AUTH", parameters).await?;

        *self.session.lock() = Some(CognitoSession::from_result(username, result));
        Ok(())
    }

    /// Drop the local tokens, then revoke the refresh token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Provider`] if revocation fails. The local tokens are
    /// gone either way.
    pub async fn revoke_session(&self) -> Result<(), Error> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };
        let Some(refresh_token) = session.refresh_token else {
            return Ok(());
        };
        let body = RevokeTokenBody {
            token: &refresh_token,
            client_id: &self.config.client_id,
            client_secret: self.config.client_secret.as_deref(),
        };
        let _: IgnoredAny = self.call("RevokeToken", &body).await?;
        Ok(())
    }

    /// Cached tokens, refreshed with `REFRESH_TOKEN_AUTH` when close to
    /// expiry or when `force_refresh` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Provider`] if a refresh is needed but fails, or a
    /// refresh is forced while nobody is signed in.
    pub async fn auth_session(&self, force_refresh: bool) -> Result<AuthSession, Error> {
        let snapshot = self.session.lock().clone();
        let Some(snapshot) = snapshot else {
            if force_refresh {
                return Err(not_signed_in("InitiateAuth"));
            }
            return Ok(AuthSession::default());
        };
        if !force_refresh && snapshot.is_fresh(OffsetDateTime::now_utc()) {
            return Ok(AuthSession {
                tokens: Some(snapshot.tokens()),
            });
        }

        let Some(refresh_token) = snapshot.refresh_token.clone() else {
            return Err(not_signed_in("InitiateAuth"));
        };
        let mut parameters = vec![("REFRESH_TOKEN", refresh_token.clone())];
        if let Some(hash) = self.config.secret_hash(&snapshot.username)? {
            parameters.push(("SECRET_HASH", hash));
        }
        let result = self.initiate_auth("REFRESH_TOKEN_AUTH", parameters).await?;

        let mut guard = self.session.lock();
        let Some(current) = guard
            .as_mut()
            .filter(|current| current.refresh_token.as_deref() == Some(refresh_token.as_str()))
        else {
            return Err(not_signed_in("InitiateAuth"));
        };
        current.expires_at = expiry(result.expires_in);
        current.id_token = result.id_token;
        current.access_token = result.access_token;
        // Cognito only rotates the refresh token when rotation is enabled
        if let Some(rotated) = result.refresh_token {
            current.refresh_token = Some(rotated);
        }
        tracing::debug!(username = %current.username, "Cognito tokens refreshed");

        Ok(AuthSession {
            tokens: Some(current.tokens()),
        })
    }

    /// Read the signed-in user from the id token claims.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Provider`] if nobody is signed in, or
    /// [`Error::Authentication`] if the id token cannot be read.
    pub async fn current_user(&self) -> Result<CurrentUser, Error> {
        let session = self.session.lock().clone();
        let session = session.ok_or_else(|| not_signed_in("GetCurrentUser"))?;
        let claims = token::peek_claims(&session.id_token)?;
        let user_id = claims
            .subject()
            .ok_or_else(|| Error::Authentication("id token has no subject".into()))?;

        Ok(CurrentUser {
            user_id: user_id.into(),
            username: claims
                .get_str("cognito:username")
                .map_or(session.username.clone(), str::to_owned),
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::Provider`] if nobody is signed in or `GetUser` fails.
    pub async fn user_attributes(&self) -> Result<UserAttributes, Error> {
        let tokens = self
            .auth_session(false)
            .await?
            .tokens
            .ok_or_else(|| not_signed_in("GetUser"))?;
        let body = GetUserBody {
            access_token: &tokens.access_token,
        };
        let response: GetUserResponse = self.call("GetUser", &body).await?;

        Ok(response
            .user_attributes
            .into_iter()
            .map(|attribute| (attribute.name, attribute.value))
            .collect())
    }

    async fn initiate_auth(
        &self,
        flow: &'static str,
        parameters: Vec<(&'static str, String)>,
    ) -> Result<AuthenticationResult, Error> {
        let body = InitiateAuthBody {
            auth_flow: flow,
            client_id: &self.config.client_id,
            auth_parameters: parameters.into_iter().collect(),
        };
        let response: InitiateAuthResponse = self.call("InitiateAuth", &body).await?;

        if let Some(challenge) = response.challenge_name {
            return Err(Error::Provider {
                operation: "InitiateAuth",
                kind: Some(challenge.clone()),
                status: None,
                message: format!("Sign-in requires an unsupported challenge: {challenge}"),
            });
        }
        response.authentication_result.ok_or_else(|| Error::Provider {
            operation: "InitiateAuth",
            kind: None,
            status: None,
            message: "Sign-in returned no tokens".into(),
        })
    }

    async fn call<Req, Resp>(&self, operation: &'static str, body: &Req) -> Result<Resp, Error>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let response = self
            .http
            .post(self.config.endpoint()?)
            .header(CONTENT_TYPE, AMZ_JSON)
            .header("X-Amz-Target", format!("{TARGET_PREFIX}.{operation}"))
            .body(serde_json::to_vec(body)?)
            .send()
            .await?;

        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            let err = service_error(operation, status.as_u16(), &bytes);
            tracing::debug!(operation, status = status.as_u16(), error = %err, "Cognito call failed");
            return Err(err);
        }
        serde_json::from_slice(&bytes).map_err(Into::into)
    }
}

impl IdentityProvider for CognitoProvider {
    async fn sign_up(&self, request: SignUpRequest) -> Result<SignUpOutput, BoxError> {
        Ok(Self::register_user(self, request).await?)
    }

    async fn sign_in(&self, username: &str, password: &str) -> Result<(), BoxError> {
        Ok(Self::password_auth(self, username, password).await?)
    }

    async fn sign_out(&self) -> Result<(), BoxError> {
        Ok(Self::revoke_session(self).await?)
    }

    async fn fetch_auth_session(&self, force_refresh: bool) -> Result<AuthSession, BoxError> {
        Ok(Self::auth_session(self, force_refresh).await?)
    }

    async fn get_current_user(&self) -> Result<CurrentUser, BoxError> {
        Ok(Self::current_user(self).await?)
    }

    async fn fetch_user_attributes(&self) -> Result<UserAttributes, BoxError> {
        Ok(Self::user_attributes(self).await?)
    }
}

fn not_signed_in(operation: &'static str) -> Error {
    Error::Provider {
        operation,
        kind: Some("UserUnAuthenticatedException".into()),
        status: None,
        message: "User needs to be authenticated to call this API.".into(),
    }
}

/// Map a Cognito error body (`{"__type": "...#Kind", "message": "..."}`).
fn service_error(operation: &'static str, status: u16, body: &[u8]) -> Error {
    let parsed: Option<ErrorBody> = serde_json::from_slice(body).ok();
    let (kind, message) = parsed.map_or((None, None), |body| (body.kind, body.message));
    let kind = kind.map(|kind| match kind.rsplit_once('#') {
        Some((_, short)) => short.to_owned(),
        None => kind,
    });
    let message = message
        .filter(|message| !message.is_empty())
        .or_else(|| kind.clone())
        .unwrap_or_else(|| format!("{operation} failed with status {status}"));

    Error::Provider {
        operation,
        kind,
        status: Some(status),
        message,
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(rename = "__type", default)]
    kind: Option<String>,
    #[serde(alias = "Message", default)]
    message: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AttributeType {
    name: String,
    value: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SignUpBody<'a> {
    client_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_hash: Option<String>,
    username: &'a str,
    password: &'a str,
    user_attributes: Vec<AttributeType>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SignUpResponse {
    user_confirmed: bool,
    user_sub: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateAuthBody<'a> {
    auth_flow: &'static str,
    client_id: &'a str,
    auth_parameters: std::collections::BTreeMap<&'static str, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateAuthResponse {
    #[serde(default)]
    authentication_result: Option<AuthenticationResult>,
    #[serde(default)]
    challenge_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthenticationResult {
    id_token: String,
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct RevokeTokenBody<'a> {
    token: &'a str,
    client_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_secret: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetUserBody<'a> {
    access_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetUserResponse {
    #[serde(default)]
    user_attributes: Vec<AttributeType>,
}
