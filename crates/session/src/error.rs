/// Errors produced by the session client.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("authentication failed for {url}: {reason}")]
    Authentication { url: String, reason: String },

    #[error("request failed with status {status}: {body}")]
    Request { status: u16, body: String },

    #[error("gave up after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid server URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("session client is closed")]
    Closed,
}

impl SessionError {
    /// HTTP status of a non-success response, if that is what failed.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Request { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}
