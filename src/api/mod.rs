//! HTTP surface: shared state, router and server loop.
//!
//! ## URL layout
//!
//! ```text
//! POST /api/structured-lesson          lesson JSON
//! POST /api/structured-lesson/stream   NDJSON relay (chunk* then done|error)
//! POST /api/tts                        audio/wav
//! POST /api/tts/lesson                 audio/wav for part of a lesson
//! POST /api/solve-math                 {final_answer, steps}
//! POST /api/social                     {reply}
//! GET  /history?sid=&limit=            [{id, title, timestamp}]
//! POST /api/history                    save a search (bearer token optional)
//! GET  /api/guardian/link              link for the signed-in child
//! POST /api/guardian/link              guardian links a child
//! POST /reset                          drop cached state for a session
//! GET  /health
//! GET  /api/cache/stats
//! ```

mod handlers;
pub mod middleware;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    Router,
    http::{HeaderValue, Method, header},
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::compression::{
    CompressionLayer,
    predicate::{NotForContentType, Predicate, SizeAbove},
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::auth::AuthVerifier;
use crate::config::Config;
use crate::error::AppError;
use crate::health::{self, HealthRegistry};
use crate::history::HistoryService;
use crate::lesson::LessonService;
use crate::llm::{LlmProvider, providers};
use crate::math::MathService;
use crate::relay::NDJSON_CONTENT_TYPE;
use crate::store::HistoryStore;
use crate::tts::{TtsProvider, TtsService};
use middleware::RateLimiter;

// ── Shared request state ──────────────────────────────────────────────────────

/// Router state injected into every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub lessons: Arc<LessonService>,
    pub tts: Arc<TtsService>,
    pub math: Arc<MathService>,
    pub history: Arc<HistoryService>,
    pub auth: AuthVerifier,
    pub health: HealthRegistry,
    pub limiter: Arc<RateLimiter>,
    llm: LlmProvider,
    started: Instant,
}

impl AppState {
    /// Build providers and stores from config.
    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        let llm = providers::build(&config.llm, config.llm_api_key.clone())?;
        let tts = TtsProvider::build(&config.tts, config.tts_api_key.clone())?;
        let store = HistoryStore::from_config(config.supabase.as_ref())?;
        let auth = AuthVerifier::from_config(config.supabase.as_ref())?;
        Ok(Self::with_parts(config, llm, tts, store, auth))
    }

    /// Assemble state from already-built parts.
    pub fn with_parts(
        config: &Config,
        llm: LlmProvider,
        tts: TtsProvider,
        store: HistoryStore,
        auth: AuthVerifier,
    ) -> Self {
        Self {
            lessons: Arc::new(LessonService::new(llm.clone(), config.cache.lessons)),
            tts: Arc::new(TtsService::new(tts, config.tts.voice.clone(), config.cache.tts)),
            math: Arc::new(MathService::new(llm.clone(), config.cache.math)),
            history: Arc::new(HistoryService::new(store, config.cache.history)),
            auth,
            health: HealthRegistry::new(),
            limiter: Arc::new(RateLimiter::new(&config.rate_limit, config.environment)),
            llm,
            started: Instant::now(),
        }
    }

    pub fn llm(&self) -> &LlmProvider {
        &self.llm
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// `false` when no identity provider is configured (local mode).
    pub fn auth_enabled(&self) -> bool {
        !matches!(self.auth, AuthVerifier::Disabled)
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

fn cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .max_age(Duration::from_secs(60 * 60));

    if origins.iter().any(|o| o == "*") {
        return base.allow_origin(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    base.allow_origin(parsed)
}

/// Bodies smaller than this go out uncompressed.
const COMPRESS_MIN_BYTES: u16 = 500;

/// Gzip for buffered responses. The NDJSON relay is left alone so each
/// record reaches the client as soon as it is written.
fn compression_layer() -> CompressionLayer<impl Predicate> {
    let predicate = SizeAbove::new(COMPRESS_MIN_BYTES)
        .and(NotForContentType::GRPC)
        .and(NotForContentType::IMAGES)
        .and(NotForContentType::SSE)
        .and(NotForContentType::const_new(NDJSON_CONTENT_TYPE));
    CompressionLayer::new().compress_when(predicate)
}

pub fn build_router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/api/structured-lesson", post(handlers::structured_lesson))
        .route("/api/structured-lesson/stream", post(handlers::structured_lesson_stream))
        .route("/api/tts", post(handlers::tts))
        .route("/api/tts/lesson", post(handlers::tts_lesson))
        .route("/api/solve-math", post(handlers::solve_math))
        .route("/api/social", post(handlers::social))
        .route("/api/history", post(handlers::save_history))
        .route("/api/guardian/link", get(handlers::guardian_link).post(handlers::link_guardian))
        .route("/api/cache/stats", get(handlers::cache_stats))
        .route("/history", get(handlers::history))
        .route("/reset", post(handlers::reset))
        .route("/health", get(handlers::health))
        .layer(axum::middleware::from_fn_with_state(state.limiter.clone(), middleware::rate_limit))
        .layer(axum::middleware::from_fn(middleware::security_headers))
        .layer(compression_layer())
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

// ── Server loop ───────────────────────────────────────────────────────────────

/// Bind, serve until `shutdown` fires, then drain in-flight requests.
pub async fn serve(config: &Config, state: AppState, shutdown: CancellationToken) -> Result<(), AppError> {
    let listener = TcpListener::bind(&config.bind)
        .await
        .map_err(|e| AppError::Server(format!("bind failed on {}: {e}", config.bind)))?;
    let local = listener.local_addr().map_err(|e| AppError::Server(e.to_string()))?;

    tokio::spawn(health::run_checks(
        state.health.clone(),
        state.llm.clone(),
        state.history.store().clone(),
        health::CHECK_INTERVAL,
        shutdown.clone(),
    ));

    let limiter = state.limiter.clone();
    let prune_token = shutdown.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(300));
        loop {
            tokio::select! {
                _ = prune_token.cancelled() => return,
                _ = ticker.tick() => limiter.prune(),
            }
        }
    });

    let router = build_router(state, &config.cors_origins);
    info!(bind = %local, "http server listening");

    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| AppError::Server(format!("server error: {e}")))?;

    info!("http server shut down");
    Ok(())
}

/// Cancel `token` on Ctrl-C or SIGTERM.
pub fn spawn_signal_watcher(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("ctrl-c received, shutting down"),
                Err(e) => {
                    warn!(error = %e, "cannot install ctrl-c handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                    info!("SIGTERM received, shutting down");
                }
                Err(e) => {
                    warn!(error = %e, "cannot install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
        token.cancel();
    });
}
