//! Search history and guardian links on top of [`HistoryStore`].
//!
//! History writes are soft: a store failure is reported in the outcome and
//! never fails the request that triggered it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::{AuthUser, Role};
use crate::cache::{CacheSnapshot, SharedCache};
use crate::config::CacheLimits;
use crate::error::AppError;
use crate::store::{GuardianLink, HistoryStore, SearchRecord};
use crate::validate::{TOPIC_MAX_CHARS, ValidationError, sanitize_text, validate_session_id};

pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const MAX_HISTORY_LIMIT: usize = 500;

/// What the history list endpoint returns per row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub id: String,
    pub title: String,
    pub timestamp: DateTime<Utc>,
}

impl From<SearchRecord> for HistoryItem {
    fn from(r: SearchRecord) -> Self {
        Self { id: r.id, title: r.title, timestamp: r.created_at }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveSearchOutcome {
    pub success: bool,
    /// Set when the caller should be nudged to sign in.
    pub suggestion: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SaveSearchOutcome {
    fn saved() -> Self {
        Self { success: true, suggestion: false, message: None }
    }

    fn sign_in_suggested() -> Self {
        Self {
            success: false,
            suggestion: true,
            message: Some("Sign in to keep a history of your lessons.".into()),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self { success: false, suggestion: false, message: Some(message.into()) }
    }
}

/// The uid a session id belongs to (`uid` or `uid:suffix`).
fn session_uid(sid: &str) -> &str {
    sid.split_once(':').map(|(uid, _)| uid).unwrap_or(sid)
}

fn cache_prefix(uid: &str) -> String {
    format!("history:{uid}:")
}

pub struct HistoryService {
    store: HistoryStore,
    cache: SharedCache<Vec<HistoryItem>>,
}

impl HistoryService {
    pub fn new(store: HistoryStore, limits: CacheLimits) -> Self {
        Self { store, cache: SharedCache::new("history", limits) }
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    pub fn cache_snapshot(&self) -> CacheSnapshot {
        self.cache.snapshot()
    }

    /// Persist a search for a signed-in user.
    ///
    /// Anonymous callers get `{success: false, suggestion: true}` and nothing
    /// is written.
    pub async fn save_search(&self, user: Option<&AuthUser>, title: &str) -> SaveSearchOutcome {
        let Some(user) = user else {
            debug!("anonymous search, not persisted");
            return SaveSearchOutcome::sign_in_suggested();
        };

        let title: String = sanitize_text(title).chars().take(TOPIC_MAX_CHARS).collect();
        if title.is_empty() {
            return SaveSearchOutcome::failed(ValidationError::Empty("title").to_string());
        }

        if let Err(e) = self.store.register_user(&user.id) {
            warn!(error = %e, "could not register user");
        }

        match self.store.insert_search(&user.id, &title).await {
            Ok(record) => {
                info!(uid = %user.id, id = %record.id, "search saved");
                self.drop_cached(&user.id);
                SaveSearchOutcome::saved()
            }
            Err(e) => {
                warn!(uid = %user.id, error = %e, "search history not saved");
                SaveSearchOutcome::failed("Your lesson is ready, but history was not saved.")
            }
        }
    }

    /// Newest-first history for `sid`, cached per uid and limit.
    pub async fn history(&self, sid: &str, limit: Option<usize>) -> Result<Vec<HistoryItem>, AppError> {
        let sid = validate_session_id(sid)?;
        let uid = session_uid(&sid);
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
        let key = format!("{}{limit}", cache_prefix(uid));

        if let Some(items) = self.cache.get(&key) {
            return Ok(items);
        }

        let items: Vec<HistoryItem> =
            self.store.recent_searches(uid, limit).await?.into_iter().map(HistoryItem::from).collect();
        self.cache.set(key, items.clone());
        Ok(items)
    }

    /// Forget cached state for `sid`; returns how many entries were dropped.
    pub fn reset(&self, sid: &str) -> Result<usize, AppError> {
        let sid = validate_session_id(sid)?;
        Ok(self.drop_cached(session_uid(&sid)))
    }

    fn drop_cached(&self, uid: &str) -> usize {
        let pattern = format!("^{}", regex::escape(&cache_prefix(uid)));
        match self.cache.invalidate(&pattern) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "history cache invalidation failed");
                0
            }
        }
    }

    /// Link the calling guardian to a child account.
    pub async fn link_guardian(
        &self,
        guardian: &AuthUser,
        child_uid: &str,
        weekly_report: bool,
        monthly_report: bool,
    ) -> Result<GuardianLink, AppError> {
        if guardian.role != Role::Guardian {
            return Err(AppError::Forbidden("only guardians can link a child".into()));
        }
        let email = guardian
            .email
            .clone()
            .ok_or_else(|| AppError::Validation(ValidationError::Empty("guardian email")))?;
        let child_uid = validate_session_id(child_uid)?;
        if !self.store.user_exists(&child_uid).await? {
            return Err(AppError::NotFound(format!("child {child_uid}")));
        }

        let link = GuardianLink { email, child_uid, weekly_report, monthly_report };
        self.store.upsert_guardian(&link).await?;
        info!(child = %link.child_uid, "guardian linked");
        Ok(link)
    }

    pub async fn guardian_link_for(&self, child_uid: &str) -> Result<Option<GuardianLink>, AppError> {
        Ok(self.store.guardian_for_child(child_uid).await?)
    }
}
