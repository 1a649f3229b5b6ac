//! Bearer-token authentication against Supabase Auth.
//!
//! Tokens are not decoded locally; `GET /auth/v1/user` is the authority.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, header::AUTHORIZATION};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SupabaseConfig;
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Child,
    Guardian,
}

impl Role {
    /// Anything that is not explicitly `child` is treated as a guardian.
    pub fn from_metadata(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "child" => Role::Child,
            _ => Role::Guardian,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetadata {
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub grade: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub email: Option<String>,
    pub role: Role,
    pub metadata: UserMetadata,
}

impl AuthUser {
    /// Session ids are either the uid itself or `uid:<suffix>`.
    pub fn owns_session(&self, sid: &str) -> bool {
        sid == self.id || sid.strip_prefix(self.id.as_str()).is_some_and(|rest| rest.starts_with(':'))
    }
}

/// `Authorization: Bearer <token>`, if present and non-empty.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

// ── Wire shape of /auth/v1/user ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SupabaseUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    user_metadata: RawMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct RawMetadata {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    nickname: Option<String>,
    #[serde(default)]
    age: Option<serde_json::Value>,
    #[serde(default)]
    grade: Option<serde_json::Value>,
}

impl From<SupabaseUser> for AuthUser {
    fn from(u: SupabaseUser) -> Self {
        let m = u.user_metadata;
        // signup forms store age and grade as either numbers or strings
        let age = match &m.age {
            Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|a| u32::try_from(a).ok()),
            Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };
        let grade = match m.grade {
            Some(serde_json::Value::String(s)) => Some(s),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        AuthUser {
            id: u.id,
            email: u.email,
            role: Role::from_metadata(m.role.as_deref()),
            metadata: UserMetadata { nickname: m.nickname, age, grade },
        }
    }
}

// ── Verifier ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum AuthVerifier {
    /// No identity provider: every request is anonymous.
    Disabled,
    /// Fixed token table, for local development and tests.
    Static(Arc<HashMap<String, AuthUser>>),
    Supabase { client: Client, url: String, anon_key: String },
}

impl AuthVerifier {
    pub fn from_config(supabase: Option<&SupabaseConfig>) -> Result<Self, StoreError> {
        let Some(cfg) = supabase else {
            return Ok(AuthVerifier::Disabled);
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| StoreError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(AuthVerifier::Supabase { client, url: cfg.url.clone(), anon_key: cfg.anon_key.clone() })
    }

    pub fn with_users(users: impl IntoIterator<Item = (String, AuthUser)>) -> Self {
        AuthVerifier::Static(Arc::new(users.into_iter().collect()))
    }

    /// `Ok(None)` for a token the provider rejects; `Err` only when the
    /// provider could not be asked.
    pub async fn verify(&self, token: &str) -> Result<Option<AuthUser>, StoreError> {
        match self {
            AuthVerifier::Disabled => Ok(None),
            AuthVerifier::Static(users) => Ok(users.get(token).cloned()),
            AuthVerifier::Supabase { client, url, anon_key } => {
                let response = client
                    .get(format!("{url}/auth/v1/user"))
                    .header("apikey", anon_key)
                    .bearer_auth(token)
                    .send()
                    .await
                    .map_err(|e| StoreError::Request(format!("auth: {e}")))?;
                let status = response.status();
                if status.is_client_error() {
                    debug!(%status, "token rejected");
                    return Ok(None);
                }
                if !status.is_success() {
                    warn!(%status, "auth provider returned HTTP error");
                    return Err(StoreError::Request(format!("auth: HTTP {status}")));
                }
                let user: SupabaseUser = response
                    .json()
                    .await
                    .map_err(|e| StoreError::Request(format!("auth: bad body: {e}")))?;
                Ok(Some(user.into()))
            }
        }
    }

    /// Resolve the caller from request headers; anonymous when no token.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<AuthUser>, StoreError> {
        match bearer_token(headers) {
            Some(token) => self.verify(token).await,
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn user(id: &str, role: Role) -> AuthUser {
        AuthUser { id: id.into(), email: None, role, metadata: UserMetadata::default() }
    }

    #[test]
    fn bearer_parsing() {
        let mut h = HeaderMap::new();
        assert_eq!(bearer_token(&h), None);
        h.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&h), Some("abc"));
        h.insert(AUTHORIZATION, HeaderValue::from_static("bearer   "));
        assert_eq!(bearer_token(&h), None);
        h.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&h), None);
    }

    #[test]
    fn supabase_user_mapping() {
        let raw: SupabaseUser = serde_json::from_value(serde_json::json!({
            "id": "u1",
            "email": "kid@example.com",
            "user_metadata": {"role": "child", "nickname": "Ana", "age": "9", "grade": 4}
        }))
        .unwrap();
        let u: AuthUser = raw.into();
        assert_eq!(u.role, Role::Child);
        assert_eq!(u.metadata.age, Some(9));
        assert_eq!(u.metadata.grade.as_deref(), Some("4"));

        let raw: SupabaseUser = serde_json::from_value(serde_json::json!({"id": "u2"})).unwrap();
        assert_eq!(AuthUser::from(raw).role, Role::Guardian);
    }

    #[test]
    fn session_ownership() {
        let u = user("abc", Role::Child);
        assert!(u.owns_session("abc"));
        assert!(u.owns_session("abc:tab1"));
        assert!(!u.owns_session("abcd"));
        assert!(!u.owns_session("xyz"));
    }

    #[tokio::test]
    async fn static_and_disabled_verifiers() {
        let v = AuthVerifier::with_users([("t1".to_string(), user("u1", Role::Guardian))]);
        assert_eq!(v.verify("t1").await.unwrap().unwrap().id, "u1");
        assert!(v.verify("nope").await.unwrap().is_none());
        assert!(AuthVerifier::Disabled.verify("t1").await.unwrap().is_none());
    }
}
