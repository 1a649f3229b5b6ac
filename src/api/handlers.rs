//! Axum handlers. Each returns `Result<_, AppError>`; errors render as
//! `{"error": code, "message": text}` with the matching status.

use axum::{
    Json,
    body::Bytes,
    extract::{
        FromRequest, FromRequestParts, Query, Request, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::AppState;
use crate::auth::AuthUser;
use crate::cache::{CacheSnapshot, CacheStats};
use crate::error::AppError;
use crate::history::{HistoryItem, SaveSearchOutcome};
use crate::lesson::prompt::SOCIAL_REPLY;
use crate::lesson::service::LessonRequest;
use crate::lesson::{SpeechMode, StructuredLesson};
use crate::math::MathSolution;
use crate::relay::{NDJSON_CONTENT_TYPE, ndjson_body};
use crate::store::GuardianLink;
use crate::validate::ValidationError;

// ── Extractors ────────────────────────────────────────────────────────────────

/// `Json` whose rejection renders as an [`AppError`] body.
pub(super) struct ApiJson<T>(T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

pub(super) struct ApiQuery<T>(T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

// ── Request types ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct LessonBody {
    topic: String,
    #[serde(default)]
    age: Option<u32>,
}

/// Unknown keys such as the `sid` older clients send are ignored; audio is
/// cached by content, not session.
#[derive(Deserialize)]
pub(super) struct TtsBody {
    text: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "lowercase")]
enum ModeWire {
    #[default]
    Full,
    Summary,
    Section,
}

#[derive(Deserialize)]
pub(super) struct TtsLessonBody {
    lesson: StructuredLesson,
    #[serde(default)]
    mode: ModeWire,
    #[serde(default)]
    section_index: Option<usize>,
}

#[derive(Deserialize)]
pub(super) struct MathBody {
    question: String,
}

#[derive(Deserialize)]
pub(super) struct HistoryQuery {
    sid: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
pub(super) struct SaveBody {
    title: String,
}

#[derive(Deserialize)]
pub(super) struct ResetBody {
    sid: String,
}

#[derive(Deserialize)]
pub(super) struct LinkBody {
    child_uid: String,
    #[serde(default = "default_true")]
    weekly_report: bool,
    #[serde(default)]
    monthly_report: bool,
}

fn default_true() -> bool {
    true
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn wav_response(audio: Bytes) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("audio/wav")),
            (header::CACHE_CONTROL, HeaderValue::from_static("public, max-age=3600")),
        ],
        audio,
    )
        .into_response()
}

async fn require_user(state: &AppState, headers: &HeaderMap) -> Result<AuthUser, AppError> {
    state
        .auth
        .authenticate(headers)
        .await?
        .ok_or_else(|| AppError::Unauthorized("sign in required".into()))
}

/// With auth configured, a session may only be touched by its owner.
async fn authorize_session(state: &AppState, headers: &HeaderMap, sid: &str) -> Result<(), AppError> {
    if !state.auth_enabled() {
        return Ok(());
    }
    let user = require_user(state, headers).await?;
    if !user.owns_session(sid) {
        warn!(uid = %user.id, "session access denied");
        return Err(AppError::Forbidden("session belongs to another user".into()));
    }
    Ok(())
}

// ── Lessons ───────────────────────────────────────────────────────────────────

/// POST /api/structured-lesson
pub(super) async fn structured_lesson(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<LessonBody>,
) -> Result<Json<StructuredLesson>, AppError> {
    let request = LessonRequest::new(&body.topic, body.age)?;
    Ok(Json(state.lessons.generate(&request).await?))
}

/// POST /api/structured-lesson/stream
pub(super) async fn structured_lesson_stream(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<LessonBody>,
) -> Result<Response, AppError> {
    let request = LessonRequest::new(&body.topic, body.age)?;
    let events = state.lessons.stream(request);
    Response::builder()
        .header(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(ndjson_body(events))
        .map_err(|e| AppError::Server(format!("stream response: {e}")))
}

/// POST /api/social
pub(super) async fn social() -> Json<Value> {
    Json(json!({ "reply": SOCIAL_REPLY }))
}

// ── Speech ────────────────────────────────────────────────────────────────────

/// POST /api/tts
pub(super) async fn tts(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<TtsBody>,
) -> Result<Response, AppError> {
    Ok(wav_response(state.tts.speak(&body.text).await?))
}

/// POST /api/tts/lesson
pub(super) async fn tts_lesson(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<TtsLessonBody>,
) -> Result<Response, AppError> {
    let mode = match (body.mode, body.section_index) {
        (ModeWire::Full, _) => SpeechMode::Full,
        (ModeWire::Summary, _) => SpeechMode::Summary,
        (ModeWire::Section, Some(i)) => SpeechMode::Section(i),
        (ModeWire::Section, None) => {
            return Err(ValidationError::Invalid("section mode needs section_index".into()).into());
        }
    };
    Ok(wav_response(state.tts.speak_lesson(&body.lesson, mode).await?))
}

// ── Math ──────────────────────────────────────────────────────────────────────

/// POST /api/solve-math
pub(super) async fn solve_math(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<MathBody>,
) -> Result<Json<MathSolution>, AppError> {
    Ok(Json(state.math.solve(&body.question).await?))
}

// ── History ───────────────────────────────────────────────────────────────────

/// GET /history?sid=&limit=
pub(super) async fn history(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiQuery(q): ApiQuery<HistoryQuery>,
) -> Result<Json<Vec<HistoryItem>>, AppError> {
    authorize_session(&state, &headers, &q.sid).await?;
    Ok(Json(state.history.history(&q.sid, q.limit).await?))
}

/// POST /api/history
pub(super) async fn save_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<SaveBody>,
) -> Result<Json<SaveSearchOutcome>, AppError> {
    let user = state.auth.authenticate(&headers).await?;
    Ok(Json(state.history.save_search(user.as_ref(), &body.title).await))
}

/// POST /reset
pub(super) async fn reset(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<ResetBody>,
) -> Result<Json<Value>, AppError> {
    authorize_session(&state, &headers, &body.sid).await?;
    let cleared = state.history.reset(&body.sid)?;
    info!(cleared, "session cache reset");
    Ok(Json(json!({ "ok": true, "cleared": cleared })))
}

// ── Guardians ─────────────────────────────────────────────────────────────────

/// GET /api/guardian/link: the guardian link of the signed-in child, if any.
pub(super) async fn guardian_link(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>, AppError> {
    let user = require_user(&state, &headers).await?;
    let link = state.history.guardian_link_for(&user.id).await?;
    Ok(Json(json!({ "linked": link.is_some(), "link": link })))
}

/// POST /api/guardian/link
pub(super) async fn link_guardian(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<LinkBody>,
) -> Result<(StatusCode, Json<GuardianLink>), AppError> {
    let user = require_user(&state, &headers).await?;
    let link = state
        .history
        .link_guardian(&user, &body.child_uid, body.weekly_report, body.monthly_report)
        .await?;
    Ok((StatusCode::CREATED, Json(link)))
}

// ── Operations ────────────────────────────────────────────────────────────────

fn snapshots(state: &AppState) -> Vec<CacheSnapshot> {
    vec![
        state.lessons.cache_snapshot(),
        state.tts.cache_snapshot(),
        state.history.cache_snapshot(),
        state.math.cache_snapshot(),
    ]
}

/// GET /health
pub(super) async fn health(State(state): State<AppState>) -> Json<Value> {
    let components = state.health.snapshot().await;
    let healthy = state.health.all_healthy().await;
    let database = components.iter().find(|c| c.id == "database");

    Json(json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime().as_secs(),
        "cache": { "status": "healthy", "type": "memory", "namespaces": snapshots(&state) },
        "database": {
            "status": match database {
                Some(c) if c.healthy => "healthy",
                Some(_) => "unhealthy",
                None => "unknown",
            },
            "backend": state.history.store().name(),
        },
        "services": {
            "llm": state.llm().name(),
            "tts": state.tts.provider_name(),
            "auth": if state.auth_enabled() { "configured" } else { "not_configured" },
        },
        "components": components,
    }))
}

/// GET /api/cache/stats
pub(super) async fn cache_stats(State(state): State<AppState>) -> Json<Value> {
    let namespaces = snapshots(&state);
    let total = namespaces.iter().fold(CacheStats::default(), |acc, s| CacheStats {
        hits: acc.hits + s.stats.hits,
        misses: acc.misses + s.stats.misses,
        evictions: acc.evictions + s.stats.evictions,
        expirations: acc.expirations + s.stats.expirations,
    });
    Json(json!({
        "hit_rate": total.hit_rate(),
        "total_requests": total.requests(),
        "hits": total.hits,
        "misses": total.misses,
        "evictions": total.evictions,
        "namespaces": namespaces,
    }))
}
