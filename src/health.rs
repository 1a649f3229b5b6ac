//! Health registry: push-based component health state.
//!
//! Components write their state through a [`HealthReporter`]; `/health`
//! reads a snapshot, so the endpoint never waits on upstream I/O. The
//! external dependencies (LLM provider, history store) are checked by
//! [`run_checks`] on a timer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::llm::LlmProvider;
use crate::store::HistoryStore;

pub const CHECK_INTERVAL: Duration = Duration::from_secs(60);

// ── ComponentHealth ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub id: String,
    pub healthy: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ComponentHealth {
    pub fn ok(id: impl Into<String>) -> Self {
        Self { id: id.into(), healthy: true, message: "ok".into(), details: None }
    }

    pub fn degraded(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self { id: id.into(), healthy: false, message: message.into(), details: None }
    }
}

// ── HealthRegistry ────────────────────────────────────────────────────────────

/// Shared registry of per-component health states. Clone freely.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    inner: Arc<RwLock<HashMap<String, ComponentHealth>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reporter(&self, id: impl Into<String>) -> HealthReporter {
        HealthReporter { id: id.into(), registry: self.clone() }
    }

    /// All current states, sorted by id.
    pub async fn snapshot(&self) -> Vec<ComponentHealth> {
        let map = self.inner.read().await;
        let mut v: Vec<_> = map.values().cloned().collect();
        v.sort_by(|a, b| a.id.cmp(&b.id));
        v
    }

    /// `true` if every registered component is healthy, or none are registered.
    pub async fn all_healthy(&self) -> bool {
        self.inner.read().await.values().all(|h| h.healthy)
    }
}

// ── HealthReporter ────────────────────────────────────────────────────────────

/// Per-component write handle into the [`HealthRegistry`].
#[derive(Clone)]
pub struct HealthReporter {
    id: String,
    registry: HealthRegistry,
}

impl HealthReporter {
    pub async fn set_healthy_with(&self, message: impl Into<String>, details: Option<serde_json::Value>) {
        let mut h = ComponentHealth::ok(&self.id);
        h.message = message.into();
        h.details = details;
        self.write(h).await;
    }

    pub async fn set_unhealthy(&self, message: impl Into<String>) {
        self.write(ComponentHealth::degraded(&self.id, message)).await;
    }

    async fn write(&self, h: ComponentHealth) {
        self.registry.inner.write().await.insert(self.id.clone(), h);
    }
}

// ── Checks ────────────────────────────────────────────────────────────────────

/// One check round over the LLM provider and the history store.
pub async fn check_once(registry: &HealthRegistry, llm: &LlmProvider, store: &HistoryStore) {
    let llm_reporter = registry.reporter("llm");
    match llm.ping().await {
        Ok(()) => llm_reporter.set_healthy_with("reachable", Some(json!({ "provider": llm.name() }))).await,
        Err(e) => {
            warn!(provider = llm.name(), error = %e, "llm provider unreachable");
            llm_reporter.set_unhealthy(e.to_string()).await;
        }
    }

    let db_reporter = registry.reporter("database");
    match store.ping().await {
        Ok(()) => db_reporter.set_healthy_with("connected", Some(json!({ "backend": store.name() }))).await,
        Err(e) => {
            warn!(backend = store.name(), error = %e, "history store unreachable");
            db_reporter.set_unhealthy(e.to_string()).await;
        }
    }
    debug!("health checks complete");
}

/// Check every `interval` until `shutdown` fires.
pub async fn run_checks(
    registry: HealthRegistry,
    llm: LlmProvider,
    store: HistoryStore,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("health checks stopping");
                return;
            }
            _ = ticker.tick() => check_once(&registry, &llm, &store).await,
        }
    }
}
