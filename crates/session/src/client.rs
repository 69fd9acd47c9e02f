//! XNAT REST client with token lifecycle and retry handling.
//!
//! Requests carry the session token as the `JSESSIONID` cookie. A 401/403
//! triggers exactly one re-authentication (shared across all handles) and
//! one replay of the request; 502/503/504 and connection failures are
//! retried with exponential backoff.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, COOKIE};
use reqwest::{Method, RequestBuilder, Response};
use tokio::sync::{Mutex, RwLock};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, Credentials};
use crate::error::SessionError;
use crate::retry::{Attempt, RetryPolicy};
use crate::session::{Session, TokenState, advertised_expiry, default_expiry};

const AUTH_ENDPOINT: &str = "/data/JSESSION";

/// Body of an outgoing request.
///
/// File bodies are re-opened for every attempt so a retried upload streams
/// the same bytes from disk again.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    Bytes {
        data: Vec<u8>,
        content_type: String,
    },
    File {
        path: PathBuf,
        content_type: String,
    },
}

impl RequestBody {
    pub fn file(path: impl Into<PathBuf>, content_type: &str) -> Self {
        Self::File {
            path: path.into(),
            content_type: content_type.to_string(),
        }
    }

    async fn apply(&self, builder: RequestBuilder) -> Result<RequestBuilder, SessionError> {
        Ok(match self {
            Self::Empty => builder,
            Self::Json(value) => builder.json(value),
            Self::Bytes { data, content_type } => builder
                .header(CONTENT_TYPE, content_type.as_str())
                .body(data.clone()),
            Self::File { path, content_type } => {
                let file = tokio::fs::File::open(path).await?;
                let len = file.metadata().await?.len();
                builder
                    .header(CONTENT_TYPE, content_type.as_str())
                    .header(CONTENT_LENGTH, len)
                    .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            }
        })
    }
}

/// State shared by every handle of one logical session.
struct Shared {
    base_url: String,
    credentials: Option<Credentials>,
    policy: RetryPolicy,
    timeout: Duration,
    verify_ssl: bool,
    expiry_hours: u64,
    state: RwLock<TokenState>,
    /// Serializes (re)authentication.
    refresh: Mutex<()>,
    closed: AtomicBool,
}

/// Authenticated XNAT client.
///
/// Cloning is cheap and shares the connection pool; use
/// [`worker_handle`](Self::worker_handle) for a handle with its own pool.
#[derive(Clone)]
pub struct SessionClient {
    http: reqwest::Client,
    shared: Arc<Shared>,
}

impl SessionClient {
    /// Creates a client from a validated configuration. No request is sent.
    pub fn new(config: &ClientConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let base_url = config.normalized_base_url()?;

        let session = config
            .token
            .as_ref()
            .filter(|t| !t.is_empty())
            .map(|t| Session::new(t.clone(), default_expiry(config.session_expiry_hours)));

        let shared = Shared {
            base_url,
            credentials: config.credentials(),
            policy: config.retry_policy(),
            timeout: config.timeout(),
            verify_ssl: config.verify_ssl,
            expiry_hours: config.session_expiry_hours,
            state: RwLock::new(TokenState {
                session,
                generation: 0,
            }),
            refresh: Mutex::new(()),
            closed: AtomicBool::new(false),
        };

        Ok(Self {
            http: build_http(shared.timeout, shared.verify_ssl)?,
            shared: Arc::new(shared),
        })
    }

    /// Returns a handle with a dedicated connection pool bound to the same
    /// session state.
    pub fn worker_handle(&self) -> Result<Self, SessionError> {
        self.ensure_open()?;
        Ok(Self {
            http: build_http(self.shared.timeout, self.shared.verify_ssl)?,
            shared: Arc::clone(&self.shared),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.shared.base_url
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.shared.policy
    }

    /// Current session, if any.
    pub async fn session(&self) -> Option<Session> {
        self.shared.state.read().await.session.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Logs in with the configured credentials and stores the new token.
    pub async fn authenticate(&self) -> Result<Session, SessionError> {
        self.ensure_open()?;
        let _guard = self.shared.refresh.lock().await;
        self.login().await
    }

    /// Sends a request, handling authentication and transient failures.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
        body: RequestBody,
    ) -> Result<Response, SessionError> {
        self.ensure_open()?;
        self.ensure_session().await?;

        let url = self.url(path);
        let policy = self.shared.policy;
        let mut failures: u32 = 0;
        let mut reauthenticated = false;

        loop {
            let (session, generation) = self.snapshot().await;
            let attempt = self
                .send_once(&method, &url, params, &body, session.as_ref())
                .await;

            match attempt {
                Attempt::Success(resp) => return Ok(resp),
                Attempt::Fatal(err) => return Err(err),
                Attempt::Unauthorized { status, body } => {
                    if reauthenticated || self.shared.credentials.is_none() {
                        self.invalidate(generation).await;
                        return Err(SessionError::Authentication {
                            url,
                            reason: format!("server returned {status}: {}", body.trim()),
                        });
                    }
                    debug!(%method, path, status, "session rejected, re-authenticating");
                    self.refresh(generation).await?;
                    reauthenticated = true;
                }
                Attempt::Transient(cause) => {
                    failures += 1;
                    if failures > policy.max_retries {
                        warn!(%method, path, attempts = failures, cause = %cause, "retries exhausted");
                        return Err(SessionError::RetryExhausted {
                            attempts: failures,
                            last: cause,
                        });
                    }
                    let delay = policy.delay_for_attempt(failures);
                    if method == Method::POST {
                        // The server may have applied the first attempt.
                        warn!(path, attempt = failures, delay_ms = delay.as_millis() as u64, cause = %cause, "retrying non-idempotent request");
                    } else {
                        debug!(%method, path, attempt = failures, delay_ms = delay.as_millis() as u64, cause = %cause, "retrying request");
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub async fn get(&self, path: &str, params: &[(String, String)]) -> Result<Response, SessionError> {
        self.request(Method::GET, path, params, RequestBody::Empty).await
    }

    pub async fn post(
        &self,
        path: &str,
        params: &[(String, String)],
        body: RequestBody,
    ) -> Result<Response, SessionError> {
        self.request(Method::POST, path, params, body).await
    }

    pub async fn put(
        &self,
        path: &str,
        params: &[(String, String)],
        body: RequestBody,
    ) -> Result<Response, SessionError> {
        self.request(Method::PUT, path, params, body).await
    }

    pub async fn delete(&self, path: &str, params: &[(String, String)]) -> Result<Response, SessionError> {
        self.request(Method::DELETE, path, params, RequestBody::Empty).await
    }

    /// GET with `format=json`, decoded.
    pub async fn get_json(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<serde_json::Value, SessionError> {
        let mut params = params.to_vec();
        if !params.iter().any(|(k, _)| k == "format") {
            params.push(("format".into(), "json".into()));
        }
        let resp = self.get(path, &params).await?;
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Server version string; a cheap connectivity check.
    pub async fn ping(&self) -> Result<String, SessionError> {
        let resp = self.get("/data/version", &[]).await?;
        Ok(resp.text().await?.trim().to_string())
    }

    /// Invalidates the session on the server and forgets the token.
    pub async fn logout(&self) -> Result<(), SessionError> {
        self.ensure_open()?;
        let (session, generation) = self.snapshot().await;
        let Some(session) = session else {
            return Ok(());
        };

        let url = self.url(AUTH_ENDPOINT);
        let resp = self
            .http
            .delete(&url)
            .header(COOKIE, cookie_header(&session))
            .send()
            .await?;
        self.invalidate(generation).await;

        if !resp.status().is_success() {
            return Err(SessionError::Request {
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        info!(url = %self.shared.base_url, "logged out");
        Ok(())
    }

    /// Closes the client. Later requests fail with [`SessionError::Closed`].
    /// Calling it again is a no-op.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.state.write().await.session = None;
        debug!(url = %self.shared.base_url, "session client closed");
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.shared.base_url, path)
        } else {
            format!("{}/{}", self.shared.base_url, path)
        }
    }

    async fn snapshot(&self) -> (Option<Session>, u64) {
        let state = self.shared.state.read().await;
        (state.session.clone(), state.generation)
    }

    /// Logs in lazily, or refreshes an expired token, before a request.
    async fn ensure_session(&self) -> Result<(), SessionError> {
        if self.shared.credentials.is_none() {
            return Ok(());
        }
        let (session, generation) = self.snapshot().await;
        match session {
            Some(s) if !s.is_expired() => Ok(()),
            _ => self.refresh(generation).await,
        }
    }

    /// Re-authenticates unless another caller already did so since
    /// `seen_generation` was observed.
    async fn refresh(&self, seen_generation: u64) -> Result<(), SessionError> {
        let _guard = self.shared.refresh.lock().await;
        if self.shared.state.read().await.generation != seen_generation {
            return Ok(());
        }
        self.login().await.map(|_| ())
    }

    /// Performs the login request. Caller must hold the refresh lock.
    async fn login(&self) -> Result<Session, SessionError> {
        let url = self.url(AUTH_ENDPOINT);
        let Some(creds) = self.shared.credentials.as_ref() else {
            return Err(SessionError::Authentication {
                url,
                reason: "no credentials configured".into(),
            });
        };

        let result = self
            .http
            .post(&url)
            .basic_auth(&creds.username, Some(&creds.password))
            .send()
            .await;

        let outcome = match result {
            Ok(resp) => {
                let status = resp.status();
                let expiry = advertised_expiry(resp.headers());
                let body = resp.text().await.unwrap_or_default();
                let token = body.trim();
                if !status.is_success() {
                    Err(format!("server returned {status}"))
                } else if token.is_empty() || token.to_ascii_lowercase().contains("<html") {
                    Err("server returned a login page instead of a session token".to_string())
                } else {
                    Ok(Session::new(
                        token,
                        expiry.unwrap_or_else(|| default_expiry(self.shared.expiry_hours)),
                    ))
                }
            }
            Err(e) => Err(e.to_string()),
        };

        let mut state = self.shared.state.write().await;
        state.generation += 1;
        match outcome {
            Ok(session) => {
                state.session = Some(session.clone());
                info!(user = %creds.username, expires_at = %session.expires_at(), "authenticated");
                Ok(session)
            }
            Err(reason) => {
                state.session = None;
                warn!(user = %creds.username, reason = %reason, "authentication failed");
                Err(SessionError::Authentication { url, reason })
            }
        }
    }

    /// Clears the token if it is still the one observed at `generation`.
    async fn invalidate(&self, generation: u64) {
        let mut state = self.shared.state.write().await;
        if state.generation == generation {
            state.session = None;
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        params: &[(String, String)],
        body: &RequestBody,
        session: Option<&Session>,
    ) -> Attempt {
        let mut builder = self.http.request(method.clone(), url);
        if !params.is_empty() {
            builder = builder.query(params);
        }
        if let Some(session) = session {
            builder = builder.header(COOKIE, cookie_header(session));
        }
        let builder = match body.apply(builder).await {
            Ok(b) => b,
            Err(e) => return Attempt::Fatal(e),
        };

        match builder.send().await {
            Ok(resp) => Attempt::from_response(resp).await,
            Err(e) => Attempt::from_error(e),
        }
    }
}

fn cookie_header(session: &Session) -> String {
    format!("JSESSIONID={}", session.token())
}

/// The timeout bounds connecting and each read, not a whole transfer.
fn build_http(timeout: Duration, verify_ssl: bool) -> Result<reqwest::Client, SessionError> {
    Ok(reqwest::Client::builder()
        .connect_timeout(timeout)
        .read_timeout(timeout)
        .danger_accept_invalid_certs(!verify_ssl)
        .build()?)
}
