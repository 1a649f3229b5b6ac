//! Persistence for search history and guardian links.
//!
//! `HistoryStore` is an enum over backends, like `LlmProvider`: Supabase
//! (PostgREST + Auth admin API) when configured, process memory otherwise.

pub mod memory;
pub mod supabase;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SupabaseConfig;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(String),
    #[error("store lock poisoned")]
    Poisoned,
}

/// One row of the `searches` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRecord {
    #[serde(deserialize_with = "supabase::id_as_string")]
    pub id: String,
    #[serde(default)]
    pub uid: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// One row of the `guardians` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianLink {
    pub email: String,
    pub child_uid: String,
    #[serde(default)]
    pub weekly_report: bool,
    #[serde(default)]
    pub monthly_report: bool,
}

#[derive(Debug, Clone)]
pub enum HistoryStore {
    Memory(memory::MemoryStore),
    Supabase(supabase::SupabaseStore),
}

impl HistoryStore {
    /// Supabase when configured, memory otherwise.
    pub fn from_config(supabase: Option<&SupabaseConfig>) -> Result<Self, StoreError> {
        match supabase {
            Some(cfg) => Ok(HistoryStore::Supabase(supabase::SupabaseStore::new(cfg)?)),
            None => Ok(HistoryStore::Memory(memory::MemoryStore::new())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HistoryStore::Memory(_) => "memory",
            HistoryStore::Supabase(_) => "supabase",
        }
    }

    pub async fn insert_search(&self, uid: &str, title: &str) -> Result<SearchRecord, StoreError> {
        match self {
            HistoryStore::Memory(s) => s.insert_search(uid, title),
            HistoryStore::Supabase(s) => s.insert_search(uid, title).await,
        }
    }

    /// Newest first.
    pub async fn recent_searches(&self, uid: &str, limit: usize) -> Result<Vec<SearchRecord>, StoreError> {
        match self {
            HistoryStore::Memory(s) => s.recent_searches(uid, limit),
            HistoryStore::Supabase(s) => s.recent_searches(uid, limit).await,
        }
    }

    /// Record that `uid` is a known account. Supabase already knows its users.
    pub fn register_user(&self, uid: &str) -> Result<(), StoreError> {
        match self {
            HistoryStore::Memory(s) => s.register_user(uid),
            HistoryStore::Supabase(_) => Ok(()),
        }
    }

    pub async fn user_exists(&self, uid: &str) -> Result<bool, StoreError> {
        match self {
            HistoryStore::Memory(s) => s.user_exists(uid),
            HistoryStore::Supabase(s) => s.user_exists(uid).await,
        }
    }

    pub async fn upsert_guardian(&self, link: &GuardianLink) -> Result<(), StoreError> {
        match self {
            HistoryStore::Memory(s) => s.upsert_guardian(link),
            HistoryStore::Supabase(s) => s.upsert_guardian(link).await,
        }
    }

    pub async fn guardian_for_child(&self, child_uid: &str) -> Result<Option<GuardianLink>, StoreError> {
        match self {
            HistoryStore::Memory(s) => s.guardian_for_child(child_uid),
            HistoryStore::Supabase(s) => s.guardian_for_child(child_uid).await,
        }
    }

    /// Reachability check used by `/health`.
    pub async fn ping(&self) -> Result<(), StoreError> {
        match self {
            HistoryStore::Memory(_) => Ok(()),
            HistoryStore::Supabase(s) => s.ping().await,
        }
    }
}
