//! Request middleware: security headers and per-client rate limiting.
//!
//! Rate-limited endpoints answer with `x-ratelimit-limit`,
//! `x-ratelimit-remaining` and `x-ratelimit-reset` (unix seconds) for
//! whichever window has less budget left.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{Environment, RateLimitConfig};
use crate::error::AppError;

// ── Security headers ──────────────────────────────────────────────────────────

const CSP: &str = "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; \
img-src 'self' data: https:; font-src 'self' data:; connect-src 'self' https:; media-src 'self'; \
object-src 'none'; base-uri 'self'; form-action 'self'; frame-ancestors 'none'";

const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("x-xss-protection", "1; mode=block"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    ("permissions-policy", "geolocation=(), microphone=(), camera=()"),
    ("content-security-policy", CSP),
];

pub async fn security_headers(req: Request, next: Next) -> Response {
    let is_api = req.uri().path().starts_with("/api/");
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    for (name, value) in SECURITY_HEADERS {
        headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    }
    // audio responses set their own cache policy
    if is_api && !headers.contains_key(header::CACHE_CONTROL) {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache, no-store, must-revalidate"));
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    }
    response
}

// ── Rate limiting ─────────────────────────────────────────────────────────────

/// Length of the long window; the short one comes from config.
pub const HOUR: Duration = Duration::from_secs(60 * 60);

/// Endpoint groups that share a request budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Lesson,
    Tts,
    Math,
    Social,
}

impl Bucket {
    pub fn for_path(path: &str) -> Option<Self> {
        match path {
            "/api/structured-lesson" | "/api/structured-lesson/stream" => Some(Bucket::Lesson),
            "/api/tts" | "/api/tts/lesson" => Some(Bucket::Tts),
            "/api/solve-math" => Some(Bucket::Math),
            "/api/social" => Some(Bucket::Social),
            _ => None,
        }
    }

    /// Requests allowed per short window.
    pub fn per_minute(self, env: Environment) -> usize {
        match (env, self) {
            (Environment::Production, Bucket::Lesson) => 20,
            (Environment::Production, Bucket::Tts) => 15,
            (Environment::Production, Bucket::Math) => 30,
            (Environment::Production, Bucket::Social) => 50,
            (Environment::Development, Bucket::Lesson) => 30,
            (Environment::Development, Bucket::Tts) => 20,
            (Environment::Development, Bucket::Math) => 40,
            (Environment::Development, Bucket::Social) => 100,
        }
    }

    pub fn per_hour(self, env: Environment) -> usize {
        match (env, self) {
            (Environment::Production, Bucket::Lesson) => 300,
            (Environment::Production, Bucket::Tts) => 150,
            (Environment::Production, Bucket::Math) => 400,
            (Environment::Production, Bucket::Social) => 500,
            (Environment::Development, Bucket::Lesson) => 500,
            (Environment::Development, Bucket::Tts) => 200,
            (Environment::Development, Bucket::Math) => 600,
            (Environment::Development, Bucket::Social) => 1000,
        }
    }
}

/// Budget of the tighter window after a request was counted (or refused).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: usize,
    pub remaining: usize,
    /// Seconds until the window frees a slot.
    pub reset_secs: u64,
}

impl Quota {
    fn in_window(limit: usize, used: usize, window: Duration, oldest: Option<Duration>) -> Self {
        let reset = window.saturating_sub(oldest.unwrap_or_default());
        Self { limit, remaining: limit.saturating_sub(used), reset_secs: reset.as_secs().max(1) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Limiter switched off; no budget to report.
    Unlimited,
    Allowed(Quota),
    Limited(Quota),
}

/// Sliding-window limiter keyed by client and bucket.
///
/// Each key keeps the instants of its requests from the last hour. The short
/// window counts the tail of that list, the hour window counts all of it.
pub struct RateLimiter {
    enabled: bool,
    window: Duration,
    environment: Environment,
    hits: Mutex<HashMap<(String, Bucket), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, environment: Environment) -> Self {
        Self {
            enabled: config.enabled,
            window: Duration::from_secs(config.window_seconds.max(1)),
            environment,
            hits: Mutex::new(HashMap::new()),
        }
    }

    fn retention(&self) -> Duration {
        self.window.max(HOUR)
    }

    /// Record one request against both windows of `bucket`.
    pub fn check(&self, client: &str, bucket: Bucket) -> Decision {
        if !self.enabled {
            return Decision::Unlimited;
        }
        let now = Instant::now();
        let retention = self.retention();
        let Ok(mut hits) = self.hits.lock() else {
            warn!("rate limiter lock poisoned, allowing request");
            return Decision::Unlimited;
        };

        let log = hits.entry((client.to_string(), bucket)).or_default();
        while log.front().is_some_and(|t| now.duration_since(*t) >= retention) {
            log.pop_front();
        }

        let age = |t: Option<&Instant>| t.map(|t| now.duration_since(*t));
        let short_used = log.iter().rev().take_while(|t| now.duration_since(**t) < self.window).count();
        let short_limit = bucket.per_minute(self.environment);
        let hour_limit = bucket.per_hour(self.environment);

        if short_used >= short_limit {
            let oldest = age(log.get(log.len() - short_used));
            return Decision::Limited(Quota::in_window(short_limit, short_used, self.window, oldest));
        }
        if log.len() >= hour_limit {
            return Decision::Limited(Quota::in_window(hour_limit, log.len(), retention, age(log.front())));
        }

        log.push_back(now);
        let short = Quota::in_window(short_limit, short_used + 1, self.window, age(log.get(log.len() - short_used - 1)));
        let hour = Quota::in_window(hour_limit, log.len(), retention, age(log.front()));
        Decision::Allowed(if hour.remaining < short.remaining { hour } else { short })
    }

    /// Drop clients with no requests inside the hour window.
    pub fn prune(&self) {
        let now = Instant::now();
        let retention = self.retention();
        if let Ok(mut hits) = self.hits.lock() {
            hits.retain(|_, log| log.back().is_some_and(|t| now.duration_since(*t) < retention));
        }
    }
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the socket peer.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    header_value("x-forwarded-for")
        .or_else(|| header_value("x-real-ip"))
        .or_else(|| peer.map(|p| p.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn quota_headers(headers: &mut HeaderMap, quota: Quota) {
    let reset_at = chrono::Utc::now().timestamp().max(0) as u64 + quota.reset_secs;
    for (name, value) in [
        ("x-ratelimit-limit", quota.limit as u64),
        ("x-ratelimit-remaining", quota.remaining as u64),
        ("x-ratelimit-reset", reset_at),
    ] {
        headers.insert(HeaderName::from_static(name), HeaderValue::from(value));
    }
}

pub async fn rate_limit(State(limiter): State<Arc<RateLimiter>>, req: Request, next: Next) -> Response {
    let Some(bucket) = Bucket::for_path(req.uri().path()) else {
        return next.run(req).await;
    };
    let peer = req.extensions().get::<ConnectInfo<SocketAddr>>().map(|c| c.0);
    let client = client_key(req.headers(), peer);

    match limiter.check(&client, bucket) {
        Decision::Unlimited => next.run(req).await,
        Decision::Allowed(quota) => {
            let mut response = next.run(req).await;
            quota_headers(response.headers_mut(), quota);
            response
        }
        Decision::Limited(quota) => {
            debug!(%client, ?bucket, limit = quota.limit, retry_after_secs = quota.reset_secs, "rate limited");
            let mut response = AppError::RateLimited { retry_after_secs: quota.reset_secs }.into_response();
            quota_headers(response.headers_mut(), quota);
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(env: Environment) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig { enabled: true, window_seconds: 60 }, env)
    }

    fn allowed(d: Decision) -> Quota {
        match d {
            Decision::Allowed(q) => q,
            other => panic!("expected Allowed, got {other:?}"),
        }
    }

    fn limited(d: Decision) -> Quota {
        match d {
            Decision::Limited(q) => q,
            other => panic!("expected Limited, got {other:?}"),
        }
    }

    #[test]
    fn buckets_by_path() {
        assert_eq!(Bucket::for_path("/api/structured-lesson/stream"), Some(Bucket::Lesson));
        assert_eq!(Bucket::for_path("/api/tts/lesson"), Some(Bucket::Tts));
        assert_eq!(Bucket::for_path("/health"), None);
        assert_eq!(Bucket::Lesson.per_minute(Environment::Production), 20);
        assert_eq!(Bucket::Lesson.per_hour(Environment::Production), 300);
        assert_eq!(Bucket::Social.per_minute(Environment::Development), 100);
        assert_eq!(Bucket::Social.per_hour(Environment::Development), 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides() {
        let rl = limiter(Environment::Production);
        let first = allowed(rl.check("1.2.3.4", Bucket::Tts));
        assert_eq!(first, Quota { limit: 15, remaining: 14, reset_secs: 60 });
        for _ in 1..15 {
            allowed(rl.check("1.2.3.4", Bucket::Tts));
        }
        let refused = limited(rl.check("1.2.3.4", Bucket::Tts));
        assert_eq!(refused, Quota { limit: 15, remaining: 0, reset_secs: 60 });
        // other clients and buckets are independent
        allowed(rl.check("5.6.7.8", Bucket::Tts));
        allowed(rl.check("1.2.3.4", Bucket::Math));

        tokio::time::advance(Duration::from_secs(60)).await;
        allowed(rl.check("1.2.3.4", Bucket::Tts));
    }

    #[tokio::test(start_paused = true)]
    async fn hour_budget_outlasts_the_minute_window() {
        let rl = limiter(Environment::Production);
        for _ in 0..10 {
            for _ in 0..15 {
                allowed(rl.check("1.2.3.4", Bucket::Tts));
            }
            tokio::time::advance(Duration::from_secs(60)).await;
        }
        let refused = limited(rl.check("1.2.3.4", Bucket::Tts));
        assert_eq!(refused.limit, 150);
        assert_eq!(refused.reset_secs, 3600 - 600);

        tokio::time::advance(Duration::from_secs(3000)).await;
        let q = allowed(rl.check("1.2.3.4", Bucket::Tts));
        assert_eq!(q.limit, 15);
    }

    #[tokio::test(start_paused = true)]
    async fn reports_the_tighter_window() {
        let rl = limiter(Environment::Production);
        for _ in 0..10 {
            for _ in 0..14 {
                allowed(rl.check("c", Bucket::Tts));
            }
            tokio::time::advance(Duration::from_secs(60)).await;
        }
        let q = allowed(rl.check("c", Bucket::Tts));
        assert_eq!(q, Quota { limit: 150, remaining: 9, reset_secs: 3600 - 600 });
    }

    #[tokio::test(start_paused = true)]
    async fn prune_drops_idle_clients() {
        let rl = limiter(Environment::Development);
        allowed(rl.check("a", Bucket::Social));
        tokio::time::advance(Duration::from_secs(61)).await;
        rl.prune();
        assert_eq!(rl.hits.lock().unwrap().len(), 1);
        tokio::time::advance(HOUR).await;
        rl.prune();
        assert!(rl.hits.lock().unwrap().is_empty());
    }

    #[test]
    fn disabled_limiter_allows_everything() {
        let rl = RateLimiter::new(&RateLimitConfig { enabled: false, window_seconds: 60 }, Environment::Production);
        for _ in 0..100 {
            assert_eq!(rl.check("x", Bucket::Lesson), Decision::Unlimited);
        }
    }

    #[test]
    fn client_key_precedence() {
        let mut h = HeaderMap::new();
        let peer: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        assert_eq!(client_key(&h, Some(peer)), "10.0.0.1");
        h.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(client_key(&h, Some(peer)), "9.9.9.9");
        h.insert("x-forwarded-for", HeaderValue::from_static("1.1.1.1, 2.2.2.2"));
        assert_eq!(client_key(&h, None), "1.1.1.1");
        assert_eq!(client_key(&HeaderMap::new(), None), "unknown");
    }
}
