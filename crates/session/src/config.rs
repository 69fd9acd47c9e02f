//! Client configuration.
//!
//! Stored as TOML, e.g.
//!
//! ```toml
//! base_url = "https://xnat.example.org"
//! username = "admin"
//! password = "secret"
//! max_retries = 3
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::retry::RetryPolicy;

/// Connection settings for a [`SessionClient`](crate::SessionClient).
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server root, e.g. `https://xnat.example.org`.
    pub base_url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Existing JSESSIONID to reuse instead of logging in.
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,

    /// Connect and read timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Additional attempts after a transient failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff unit; retry `n` waits `backoff_base_ms * 2^n`.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Session lifetime assumed when the server does not advertise one.
    #[serde(default = "default_session_expiry_hours")]
    pub session_expiry_hours: u64,
}

fn default_verify_ssl() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_session_expiry_hours() -> u64 {
    12
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("verify_ssl", &self.verify_ssl)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("backoff_base_ms", &self.backoff_base_ms)
            .field("session_expiry_hours", &self.session_expiry_hours)
            .finish()
    }
}

impl ClientConfig {
    /// Creates a configuration with defaults and no credentials.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            username: None,
            password: None,
            token: None,
            verify_ssl: default_verify_ssl(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            session_expiry_hours: default_session_expiry_hours(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base_ms = base.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    /// Parses a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, SessionError> {
        toml::from_str(content).map_err(|e| SessionError::Config(e.to_string()))
    }

    /// Loads and validates a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), url = %config.base_url, "client configuration loaded");
        Ok(config)
    }

    /// Checks the URL and that some form of credential is present.
    pub fn validate(&self) -> Result<(), SessionError> {
        self.normalized_base_url()?;
        let has_login = self.credentials().is_some();
        let has_token = self.token.as_deref().is_some_and(|t| !t.is_empty());
        if !has_login && !has_token {
            return Err(SessionError::Config(
                "either a token or a username and password is required".into(),
            ));
        }
        Ok(())
    }

    /// Base URL without trailing slash; only http and https are accepted.
    pub fn normalized_base_url(&self) -> Result<String, SessionError> {
        let trimmed = self.base_url.trim().trim_end_matches('/');
        let parsed = reqwest::Url::parse(trimmed).map_err(|e| SessionError::InvalidUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(SessionError::InvalidUrl {
                    url: self.base_url.clone(),
                    reason: format!("unsupported scheme {other}"),
                });
            }
        }
        if parsed.host_str().is_none() {
            return Err(SessionError::InvalidUrl {
                url: self.base_url.clone(),
                reason: "missing host".into(),
            });
        }
        Ok(trimmed.to_string())
    }

    /// Username/password pair, if both are set.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) if !u.is_empty() => Some(Credentials {
                username: u.clone(),
                password: p.clone(),
            }),
            _ => None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
        }
    }
}

/// Login credentials used to obtain and refresh a session.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
