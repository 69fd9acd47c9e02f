//! Retry classification and backoff.

use std::time::Duration;

use crate::error::SessionError;

/// Statuses that indicate a temporarily unavailable server.
pub const TRANSIENT_STATUSES: [u16; 3] = [502, 503, 504];

/// Returns `true` for gateway/unavailable statuses worth retrying.
pub fn is_transient_status(status: u16) -> bool {
    TRANSIENT_STATUSES.contains(&status)
}

/// Exponential backoff applied to transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub max_retries: u32,
    /// Unit multiplied by `2^attempt`.
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based): 2, 4, 8, ... units.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.backoff_base.saturating_mul(factor)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Outcome of a single request attempt.
pub(crate) enum Attempt {
    Success(reqwest::Response),
    /// 401/403: the token was rejected.
    Unauthorized { status: u16, body: String },
    /// Worth another attempt; carries the cause for reporting.
    Transient(String),
    Fatal(SessionError),
}

impl Attempt {
    pub(crate) async fn from_response(resp: reqwest::Response) -> Self {
        let status = resp.status();
        if status.is_success() {
            return Self::Success(resp);
        }

        let code = status.as_u16();
        if is_transient_status(code) {
            return Self::Transient(format!("server returned {status}"));
        }

        let body = resp.text().await.unwrap_or_default();
        match code {
            401 | 403 => Self::Unauthorized { status: code, body },
            _ => Self::Fatal(SessionError::Request { status: code, body }),
        }
    }

    pub(crate) fn from_error(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            Self::Transient(err.to_string())
        } else {
            Self::Fatal(SessionError::Http(err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn delays_double_from_two_units() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
    }

    #[test]
    fn delay_saturates() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for_attempt(200) >= Duration::from_secs(1 << 30));
    }

    #[test]
    fn transient_statuses() {
        assert!(is_transient_status(502));
        assert!(is_transient_status(503));
        assert!(is_transient_status(504));
        assert!(!is_transient_status(500));
        assert!(!is_transient_status(404));
        assert!(!is_transient_status(401));
    }
}
