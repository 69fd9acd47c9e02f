//! Session token state.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use reqwest::header::{HeaderMap, SET_COOKIE};

/// Cookie XNAT uses to advertise `"<start_ms>,<duration_ms>"`.
const EXPIRATION_COOKIE: &str = "SESSION_EXPIRATION_TIME";

/// An authenticated server session.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    token: String,
    expires_at: DateTime<Utc>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Session {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Shared token slot. `generation` increases on every (re)authentication
/// so concurrent callers can tell whether a refresh already happened.
#[derive(Debug, Default)]
pub(crate) struct TokenState {
    pub session: Option<Session>,
    pub generation: u64,
}

/// Reads the server-advertised expiry from the response cookies.
pub(crate) fn advertised_expiry(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|cookie| {
            let (name, rest) = cookie.split_once('=')?;
            if name.trim() != EXPIRATION_COOKIE {
                return None;
            }
            let value = rest.split(';').next()?.trim().trim_matches('"');
            parse_expiration_value(value)
        })
}

fn parse_expiration_value(value: &str) -> Option<DateTime<Utc>> {
    let (start, duration) = value.split_once(',')?;
    let start: i64 = start.trim().parse().ok()?;
    let duration: i64 = duration.trim().parse().ok()?;
    DateTime::from_timestamp_millis(start.checked_add(duration)?)
}

/// Expiry to assume when the server does not advertise one.
pub(crate) fn default_expiry(window_hours: u64) -> DateTime<Utc> {
    let hours = i64::try_from(window_hours).unwrap_or(i64::MAX / 3_600_000);
    let window = TimeDelta::try_hours(hours).unwrap_or(TimeDelta::MAX);
    Utc::now()
        .checked_add_signed(window)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
