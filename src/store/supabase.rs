//! Supabase backend: PostgREST tables and the Auth admin API.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, error};

use super::{GuardianLink, SearchRecord, StoreError};
use crate::config::SupabaseConfig;

const TIMEOUT: Duration = Duration::from_secs(10);

/// PostgREST returns bigint ids as numbers; memory rows use UUID strings.
pub(super) fn id_as_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Num(i64),
        Str(String),
    }
    Ok(match Id::deserialize(d)? {
        Id::Num(n) => n.to_string(),
        Id::Str(s) => s,
    })
}

#[derive(Debug, Clone)]
pub struct SupabaseStore {
    client: Client,
    url: String,
    key: String,
}

#[derive(Serialize)]
struct NewSearch<'a> {
    uid: &'a str,
    title: &'a str,
}

impl SupabaseStore {
    pub fn new(config: &SupabaseConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(TIMEOUT)
            .build()
            .map_err(|e| StoreError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, url: config.url.clone(), key: config.server_key().to_string() })
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.key).bearer_auth(&self.key)
    }

    fn rest(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.url)
    }

    async fn send(&self, req: RequestBuilder, what: &str) -> Result<reqwest::Response, StoreError> {
        let response = self.authed(req).send().await.map_err(|e| {
            error!(what, error = %e, "supabase request failed (transport)");
            StoreError::Request(e.to_string())
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        error!(what, %status, "supabase request returned HTTP error");
        Err(StoreError::Request(format!("{what}: HTTP {status}: {body}")))
    }

    pub async fn insert_search(&self, uid: &str, title: &str) -> Result<SearchRecord, StoreError> {
        let req = self
            .client
            .post(self.rest("searches"))
            .header("Prefer", "return=representation")
            .json(&NewSearch { uid, title });
        let rows: Vec<SearchRecord> = self
            .send(req, "insert search")
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Request(format!("insert search: bad body: {e}")))?;
        debug!(uid, "search saved");
        rows.into_iter().next().ok_or_else(|| StoreError::Request("insert search: no row returned".into()))
    }

    pub async fn recent_searches(&self, uid: &str, limit: usize) -> Result<Vec<SearchRecord>, StoreError> {
        let req = self.client.get(self.rest("searches")).query(&[
            ("select", "id,uid,title,created_at".to_string()),
            ("uid", format!("eq.{uid}")),
            ("order", "created_at.desc".to_string()),
            ("limit", limit.to_string()),
        ]);
        self.send(req, "select searches")
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Request(format!("select searches: bad body: {e}")))
    }

    pub async fn user_exists(&self, uid: &str) -> Result<bool, StoreError> {
        let url = format!("{}/auth/v1/admin/users/{uid}", self.url);
        let response = self
            .authed(self.client.get(url))
            .send()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(StoreError::Request(format!("lookup user: HTTP {s}"))),
        }
    }

    pub async fn upsert_guardian(&self, link: &GuardianLink) -> Result<(), StoreError> {
        let req = self
            .client
            .post(self.rest("guardians"))
            .query(&[("on_conflict", "email,child_uid")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(link);
        self.send(req, "upsert guardian").await.map(|_| ())
    }

    pub async fn guardian_for_child(&self, child_uid: &str) -> Result<Option<GuardianLink>, StoreError> {
        let req = self.client.get(self.rest("guardians")).query(&[
            ("select", "email,child_uid,weekly_report,monthly_report".to_string()),
            ("child_uid", format!("eq.{child_uid}")),
            ("limit", "1".to_string()),
        ]);
        let rows: Vec<GuardianLink> = self
            .send(req, "select guardian")
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Request(format!("select guardian: bad body: {e}")))?;
        Ok(rows.into_iter().next())
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let req = self.client.get(self.rest("searches")).query(&[("select", "id"), ("limit", "1")]);
        self.send(req, "ping").await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_rows_accept_numeric_ids() {
        let rows: Vec<SearchRecord> = serde_json::from_str(
            r#"[{"id": 42, "title": "volcanoes", "created_at": "2024-05-01T10:00:00+00:00"}]"#,
        )
        .unwrap();
        assert_eq!(rows[0].id, "42");
        assert_eq!(rows[0].uid, "");
        let rows: Vec<SearchRecord> = serde_json::from_str(
            r#"[{"id": "a-b", "uid": "u", "title": "t", "created_at": "2024-05-01T10:00:00Z"}]"#,
        )
        .unwrap();
        assert_eq!(rows[0].id, "a-b");
    }

    #[test]
    fn rest_urls() {
        let cfg = SupabaseConfig { url: "https://x.supabase.co".into(), anon_key: "anon".into(), service_key: None };
        let store = SupabaseStore::new(&cfg).unwrap();
        assert_eq!(store.rest("searches"), "https://x.supabase.co/rest/v1/searches");
    }

    #[tokio::test]
    async fn unreachable_host_is_request_error() {
        let cfg = SupabaseConfig { url: "http://127.0.0.1:9".into(), anon_key: "anon".into(), service_key: None };
        let store = SupabaseStore::new(&cfg).unwrap();
        assert!(matches!(store.recent_searches("u", 5).await, Err(StoreError::Request(_))));
    }
}
