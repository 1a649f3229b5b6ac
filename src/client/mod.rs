//! Typed client for the Lana HTTP API.
//!
//! GET responses are kept in a bounded [`SharedCache`] (5 minute TTL, 50
//! entries) keyed by path and query. Mutations drop the cached paths they
//! affect. Lesson streams go through [`relay::read_lesson_stream`] and are
//! retried on transport failure or truncation with a linear backoff.

pub mod auth_router;

use std::time::Duration;

use reqwest::{RequestBuilder, Response, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{DEFAULT_CAPACITY, DEFAULT_TTL, SharedCache};
use crate::config::CacheLimits;
use crate::history::{HistoryItem, SaveSearchOutcome};
use crate::lesson::StructuredLesson;
use crate::relay::{self, RelayError};

pub const API_BASE_ENV: &str = "NEXT_PUBLIC_API_BASE";
pub const DEFAULT_API_BASE: &str = "http://localhost:8000";
/// Total attempts for one lesson stream, the first included.
pub const STREAM_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("{message} (status {status})")]
    Status { status: u16, message: &'static str },
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Relay(e) => e.is_retryable(),
            ClientError::Status { .. } | ClientError::Decode(_) => false,
        }
    }

    /// Text suitable for showing to the person using the app.
    pub fn user_message(&self) -> &'static str {
        match self {
            ClientError::Status { message, .. } => *message,
            ClientError::Relay(RelayError::Remote(_)) => "server error",
            _ => "network error",
        }
    }
}

/// User-facing text for a failed HTTP status.
pub fn user_message(status: u16) -> &'static str {
    match status {
        404 => "not found",
        403 => "access denied",
        400..=499 => "check your input",
        500..=599 => "server error",
        _ => "unexpected response",
    }
}

pub struct ApiClient {
    base: String,
    http: reqwest::Client,
    token: Option<String>,
    cache: SharedCache<Value>,
    retry_base: Duration,
}

impl ApiClient {
    pub fn new(base: impl Into<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            http,
            token: None,
            cache: SharedCache::new("client", CacheLimits { ttl: DEFAULT_TTL, capacity: DEFAULT_CAPACITY }),
            retry_base: RETRY_BASE_DELAY,
        })
    }

    /// Base URL from `NEXT_PUBLIC_API_BASE`, else `http://localhost:8000`.
    pub fn from_env() -> Result<Self, ClientError> {
        let base = std::env::var(API_BASE_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Self::new(base)
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_retry_base(mut self, delay: Duration) -> Self {
        self.retry_base = delay;
        self
    }

    fn url(&self, path: &str) -> Result<Url, ClientError> {
        let raw = format!("{}{path}", self.base);
        Url::parse(&raw).map_err(|e| ClientError::Transport(format!("bad url {raw}: {e}")))
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, ClientError> {
        let resp = self.authorized(req).send().await.map_err(|e| ClientError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), url = %resp.url(), "api request failed");
            return Err(ClientError::Status { status: status.as_u16(), message: user_message(status.as_u16()) });
        }
        Ok(resp)
    }

    /// Cached GET. `path` includes the query string and is the cache key.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.get_cached(path, self.url(path)?).await
    }

    /// Cached GET of `path` with `params` form-encoded into the query.
    /// The key is `path?<encoded query>`, so it matches what goes on the wire.
    async fn get_with_query<T: DeserializeOwned>(&self, path: &str, params: &[(&str, String)]) -> Result<T, ClientError> {
        let mut url = self.url(path)?;
        url.query_pairs_mut().extend_pairs(params);
        let key = match url.query() {
            Some(q) if !q.is_empty() => format!("{path}?{q}"),
            _ => path.to_string(),
        };
        self.get_cached(&key, url).await
    }

    async fn get_cached<T: DeserializeOwned>(&self, key: &str, url: Url) -> Result<T, ClientError> {
        let value = match self.cache.get(key) {
            Some(v) => v,
            None => {
                let resp = self.send(self.http.get(url)).await?;
                let v: Value = resp.json().await.map_err(|e| ClientError::Decode(e.to_string()))?;
                self.cache.set(key, v.clone());
                v
            }
        };
        serde_json::from_value(value).map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// Uncached POST with a JSON body.
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let resp = self.send(self.http.post(self.url(path)?).json(body)).await?;
        resp.json().await.map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// Drop cached GET responses whose key matches `pattern`.
    pub fn invalidate(&self, pattern: &str) -> usize {
        match self.cache.invalidate(pattern) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "client cache invalidation failed");
                0
            }
        }
    }

    pub async fn structured_lesson(&self, topic: &str, age: Option<u32>) -> Result<StructuredLesson, ClientError> {
        self.post_json("/api/structured-lesson", &json!({ "topic": topic, "age": age })).await
    }

    pub async fn history(&self, sid: &str, limit: Option<usize>) -> Result<Vec<HistoryItem>, ClientError> {
        let mut params = vec![("sid", sid.to_string())];
        if let Some(limit) = limit {
            params.push(("limit", limit.to_string()));
        }
        self.get_with_query("/history", &params).await
    }

    pub async fn save_search(&self, title: &str) -> Result<SaveSearchOutcome, ClientError> {
        let outcome: SaveSearchOutcome = self.post_json("/api/history", &json!({ "title": title })).await?;
        if outcome.success {
            self.invalidate(r"^/history\?");
        }
        Ok(outcome)
    }

    pub async fn reset(&self, sid: &str) -> Result<Value, ClientError> {
        let out = self.post_json("/reset", &json!({ "sid": sid })).await?;
        self.invalidate(r"^/history\?");
        Ok(out)
    }

    /// Whether the signed-in child has a guardian link.
    pub async fn has_guardian_link(&self) -> Result<bool, ClientError> {
        let v: Value = self.get_json("/api/guardian/link").await?;
        Ok(v.get("linked").and_then(Value::as_bool).unwrap_or(false))
    }

    /// Stream a lesson, forwarding chunk text to `on_chunk`.
    ///
    /// Transport failures and truncated streams are retried up to
    /// [`STREAM_ATTEMPTS`] times in total, sleeping `attempt * base` between
    /// tries. An `error` record or a failed status is returned as is.
    /// `on_chunk` sees the chunks of every attempt.
    pub async fn stream_lesson(
        &self,
        topic: &str,
        age: Option<u32>,
        mut on_chunk: impl FnMut(&str),
    ) -> Result<StructuredLesson, ClientError> {
        let body = json!({ "topic": topic, "age": age });
        let mut attempt = 1;
        loop {
            match self.stream_once(&body, &mut on_chunk).await {
                Ok(lesson) => return Ok(lesson),
                Err(e) if e.is_retryable() && attempt < STREAM_ATTEMPTS => {
                    let delay = self.retry_base * attempt;
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "lesson stream failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn stream_once(&self, body: &Value, on_chunk: &mut impl FnMut(&str)) -> Result<StructuredLesson, ClientError> {
        let req = self
            .http
            .post(self.url("/api/structured-lesson/stream")?)
            .header(reqwest::header::ACCEPT, relay::NDJSON_CONTENT_TYPE)
            .json(body);
        let resp = self.send(req).await?;
        debug!("lesson stream opened");
        Ok(relay::read_lesson_stream(Box::pin(resp.bytes_stream()), |c| on_chunk(c)).await?)
    }
}
