//! Authenticated session against an XNAT server.
//!
//! [`SessionClient`] owns the session token, re-authenticates when the
//! server rejects it, and retries transient failures with exponential
//! backoff. [`Paginator`] walks offset/limit listings on top of it.

pub mod client;
pub mod config;
pub mod error;
pub mod pagination;
pub mod retry;
pub mod session;

pub use client::{RequestBody, SessionClient};
pub use config::{ClientConfig, Credentials};
pub use error::SessionError;
pub use pagination::{DEFAULT_PAGE_SIZE, DEFAULT_RESULT_KEY, Paginator, extract_results};
pub use retry::{RetryPolicy, is_transient_status};
pub use session::Session;

/// Query parameters as sent on the wire.
pub type Params = Vec<(String, String)>;

/// Builds a parameter list from borrowed pairs.
pub fn params<K: ToString, V: ToString>(pairs: &[(K, V)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
