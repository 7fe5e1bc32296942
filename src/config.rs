use std::time::Duration;

use url::Url;

use crate::error::Error;
use crate::store::KeyScheme;

const DEFAULT_API_URL: &str = "http://localhost:5000/api";

/// Session timing, storage and navigation settings.
///
/// Use [`from_env()`](SessionConfig::from_env) for convention-based setup,
/// or [`default()`](SessionConfig::default) with `with_*` methods for full control.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SessionConfig {
    pub(crate) api_url: Url,
    pub(crate) token_lifetime: Duration,
    pub(crate) refresh_interval: Duration,
    pub(crate) key_scheme: KeyScheme,
    pub(crate) login_path: String,
    pub(crate) home_path: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.parse().expect("valid default URL"),
            token_lifetime: Duration::from_secs(60 * 60),
            refresh_interval: Duration::from_secs(45 * 60),
            key_scheme: KeyScheme::Current,
            login_path: "/login".into(),
            home_path: "/home".into(),
        }
    }
}

impl SessionConfig {
    /// Create config from environment variables.
    ///
    /// # Optional env vars
    /// - `ACTIVITYHUB_API_URL`: Base URL for authorized API calls
    /// - `ACTIVITYHUB_TOKEN_LIFETIME_SECS`: Assumed token lifetime (default 3600)
    /// - `ACTIVITYHUB_REFRESH_INTERVAL_SECS`: Background refresh period (default 2700)
    /// - `ACTIVITYHUB_LEGACY_KEYS`: Set to `"1"` or `"true"` to use the `token`/`tokenExpiration` keys
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();

        if let Ok(url_str) = std::env::var("ACTIVITYHUB_API_URL") {
            let url: Url = url_str
                .parse()
                .map_err(|e| Error::Config(format!("ACTIVITYHUB_API_URL: {e}")))?;
            config = config.with_api_url(url);
        }
        if let Some(secs) = env_secs("ACTIVITYHUB_TOKEN_LIFETIME_SECS")? {
            config = config.with_token_lifetime(Duration::from_secs(secs));
        }
        if let Some(secs) = env_secs("ACTIVITYHUB_REFRESH_INTERVAL_SECS")? {
            config = config.with_refresh_interval(Duration::from_secs(secs));
        }
        if matches!(
            std::env::var("ACTIVITYHUB_LEGACY_KEYS").as_deref(),
            Ok("1") | Ok("true"),
        ) {
            config = config.with_key_scheme(KeyScheme::Legacy);
        }

        Ok(config)
    }

    /// Override the base URL for authorized API calls.
    #[must_use]
    pub fn with_api_url(mut self, url: Url) -> Self {
        self.api_url = url;
        self
    }

    /// Override the assumed token lifetime (default: 1 hour).
    #[must_use]
    pub fn with_token_lifetime(mut self, lifetime: Duration) -> Self {
        self.token_lifetime = lifetime;
        self
    }

    /// Override the background refresh period (default: 45 minutes; zero disables it).
    #[must_use]
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Select the credential store key names.
    #[must_use]
    pub fn with_key_scheme(mut self, scheme: KeyScheme) -> Self {
        self.key_scheme = scheme;
        self
    }

    /// Override where unauthenticated navigation is sent (default: `/login`).
    #[must_use]
    pub fn with_login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = path.into();
        self
    }

    /// Override where navigation without the required role is sent (default: `/home`).
    #[must_use]
    pub fn with_home_path(mut self, path: impl Into<String>) -> Self {
        self.home_path = path.into();
        self
    }

    /// Base URL for authorized API calls.
    #[must_use]
    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    /// Assumed lifetime of freshly issued tokens.
    #[must_use]
    pub fn token_lifetime(&self) -> Duration {
        self.token_lifetime
    }

    /// Background refresh period.
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Credential store key names.
    #[must_use]
    pub fn key_scheme(&self) -> KeyScheme {
        self.key_scheme
    }

    /// Login page path.
    #[must_use]
    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    /// Home page path.
    #[must_use]
    pub fn home_path(&self) -> &str {
        &self.home_path
    }
}

fn env_secs(name: &str) -> Result<Option<u64>, Error> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}: {e}"))),
        Err(_) => Ok(None),
    }
}
