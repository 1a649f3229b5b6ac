//! In-memory store used when Supabase is not configured.
//!
//! All data lives in process memory and is discarded when the process exits.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use uuid::Uuid;

use super::{GuardianLink, SearchRecord, StoreError};

#[derive(Debug, Default)]
struct Tables {
    searches: Vec<SearchRecord>,
    /// (email, child_uid) is the row identity.
    guardians: Vec<GuardianLink>,
    users: HashSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn insert_search(&self, uid: &str, title: &str) -> Result<SearchRecord, StoreError> {
        let record = SearchRecord {
            id: Uuid::new_v4().to_string(),
            uid: uid.to_string(),
            title: title.to_string(),
            created_at: Utc::now(),
        };
        self.lock()?.searches.push(record.clone());
        Ok(record)
    }

    pub fn recent_searches(&self, uid: &str, limit: usize) -> Result<Vec<SearchRecord>, StoreError> {
        let tables = self.lock()?;
        // insertion order is chronological, so newest-first is a reverse walk
        Ok(tables.searches.iter().rev().filter(|r| r.uid == uid).take(limit).cloned().collect())
    }

    pub fn register_user(&self, uid: &str) -> Result<(), StoreError> {
        self.lock()?.users.insert(uid.to_string());
        Ok(())
    }

    pub fn user_exists(&self, uid: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.users.contains(uid))
    }

    pub fn upsert_guardian(&self, link: &GuardianLink) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        match tables
            .guardians
            .iter_mut()
            .find(|g| g.email == link.email && g.child_uid == link.child_uid)
        {
            Some(existing) => *existing = link.clone(),
            None => tables.guardians.push(link.clone()),
        }
        Ok(())
    }

    pub fn guardian_for_child(&self, child_uid: &str) -> Result<Option<GuardianLink>, StoreError> {
        Ok(self.lock()?.guardians.iter().find(|g| g.child_uid == child_uid).cloned())
    }

    /// Row counts per table, for tests and diagnostics.
    pub fn counts(&self) -> Result<HashMap<&'static str, usize>, StoreError> {
        let t = self.lock()?;
        Ok(HashMap::from([("searches", t.searches.len()), ("guardians", t.guardians.len()), ("users", t.users.len())]))
    }
}
