//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` (or the file named by `LANA_CONFIG`), then
//! applies environment overrides. Secrets (LLM/TTS keys, Supabase keys) are
//! only ever read from the environment, never from TOML.

use std::{env, fs, path::Path, time::Duration};

use serde::Deserialize;

use crate::error::AppError;
use crate::logger::LogFormat;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Deployment environment, from `NODE_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_node_env(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("production") => Environment::Production,
            _ => Environment::Development,
        }
    }
}

/// OpenAI-compatible chat completion endpoint (Groq by default).
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Full chat completions endpoint URL.
    pub api_base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Per-request HTTP timeout in seconds.
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// `"dummy"` or `"openai"` / `"groq"`.
    pub provider: String,
    pub openai: OpenAiConfig,
}

#[derive(Debug, Clone)]
pub struct TtsConfig {
    /// `"dummy"` or `"gemini"`.
    pub provider: String,
    /// Base URL of the generative-language API; the model path is appended.
    pub api_base_url: String,
    pub model: String,
    pub voice: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub anon_key: String,
    /// Service-role key; preferred for server-side table access.
    pub service_key: Option<String>,
}

impl SupabaseConfig {
    /// Key used for PostgREST and admin calls.
    pub fn server_key(&self) -> &str {
        self.service_key.as_deref().unwrap_or(&self.anon_key)
    }
}

/// TTL and capacity of one cache namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    pub ttl: Duration,
    pub capacity: usize,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub lessons: CacheLimits,
    pub tts: CacheLimits,
    pub history: CacheLimits,
    pub math: CacheLimits,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub window_seconds: u64,
}

/// Fully-resolved service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Socket address the HTTP server binds to.
    pub bind: String,
    pub log_level: String,
    pub log_format: LogFormat,
    pub environment: Environment,
    /// Allowed CORS origins; `["*"]` allows any.
    pub cors_origins: Vec<String>,
    pub llm: LlmConfig,
    /// From `LLM_API_KEY` (or `GROQ_API_KEY`); `None` for keyless local models.
    pub llm_api_key: Option<String>,
    pub tts: TtsConfig,
    /// From `TTS_API_KEY` (or `GOOGLE_API_KEY`).
    pub tts_api_key: Option<String>,
    /// `None` when no Supabase URL/key is configured; history falls back to memory.
    pub supabase: Option<SupabaseConfig>,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
}

/// Environment values that override or complete the TOML file.
///
/// Tests build this directly instead of mutating process env vars.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub bind: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub node_env: Option<String>,
    pub supabase_url: Option<String>,
    pub supabase_anon_key: Option<String>,
    pub supabase_service_key: Option<String>,
    pub llm_api_key: Option<String>,
    pub tts_api_key: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            bind: var("LANA_BIND"),
            log_level: var("LANA_LOG_LEVEL"),
            log_format: var("LANA_LOG_FORMAT"),
            node_env: var("NODE_ENV"),
            supabase_url: var("SUPABASE_URL").or_else(|| var("NEXT_PUBLIC_SUPABASE_URL")),
            supabase_anon_key: var("SUPABASE_ANON_KEY").or_else(|| var("NEXT_PUBLIC_SUPABASE_ANON_KEY")),
            supabase_service_key: var("SUPABASE_SERVICE_ROLE_KEY"),
            llm_api_key: var("LLM_API_KEY").or_else(|| var("GROQ_API_KEY")),
            tts_api_key: var("TTS_API_KEY").or_else(|| var("GOOGLE_API_KEY")),
        }
    }
}

/// Non-empty env var or `None`.
fn var(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

// ── Raw TOML shape ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawConfig {
    server: RawServer,
    #[serde(default)]
    llm: RawLlm,
    #[serde(default)]
    tts: RawTts,
    #[serde(default)]
    cache: RawCache,
    #[serde(default)]
    rate_limit: RawRateLimit,
}

#[derive(Deserialize)]
struct RawServer {
    #[serde(default = "default_bind")]
    bind: String,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_log_format")]
    log_format: String,
    #[serde(default = "default_cors_origins")]
    cors_origins: Vec<String>,
}

#[derive(Deserialize)]
struct RawLlm {
    /// Maps to `default = "..."` in `[llm]`.
    #[serde(rename = "default", default = "default_llm_provider")]
    provider: String,
    #[serde(default)]
    openai: RawOpenAiConfig,
}

impl Default for RawLlm {
    fn default() -> Self {
        Self { provider: default_llm_provider(), openai: RawOpenAiConfig::default() }
    }
}

#[derive(Deserialize)]
struct RawOpenAiConfig {
    #[serde(default = "default_openai_api_base_url")]
    api_base_url: String,
    #[serde(default = "default_openai_model")]
    model: String,
    #[serde(default = "default_openai_temperature")]
    temperature: f32,
    #[serde(default = "default_openai_max_tokens")]
    max_tokens: u32,
    #[serde(default = "default_timeout_seconds")]
    timeout_seconds: u64,
}

impl Default for RawOpenAiConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_openai_api_base_url(),
            model: default_openai_model(),
            temperature: default_openai_temperature(),
            max_tokens: default_openai_max_tokens(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

#[derive(Deserialize)]
struct RawTts {
    #[serde(rename = "default", default = "default_tts_provider")]
    provider: String,
    #[serde(default = "default_tts_api_base_url")]
    api_base_url: String,
    #[serde(default = "default_tts_model")]
    model: String,
    #[serde(default = "default_tts_voice")]
    voice: String,
    #[serde(default = "default_timeout_seconds")]
    timeout_seconds: u64,
}

impl Default for RawTts {
    fn default() -> Self {
        Self {
            provider: default_tts_provider(),
            api_base_url: default_tts_api_base_url(),
            model: default_tts_model(),
            voice: default_tts_voice(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

#[derive(Deserialize, Clone, Copy)]
struct RawCacheLimits {
    ttl_seconds: u64,
    capacity: usize,
}

impl From<RawCacheLimits> for CacheLimits {
    fn from(raw: RawCacheLimits) -> Self {
        CacheLimits { ttl: Duration::from_secs(raw.ttl_seconds), capacity: raw.capacity }
    }
}

#[derive(Deserialize)]
struct RawCache {
    #[serde(default = "default_lessons_cache")]
    lessons: RawCacheLimits,
    #[serde(default = "default_tts_cache")]
    tts: RawCacheLimits,
    #[serde(default = "default_history_cache")]
    history: RawCacheLimits,
    #[serde(default = "default_math_cache")]
    math: RawCacheLimits,
}

impl Default for RawCache {
    fn default() -> Self {
        Self {
            lessons: default_lessons_cache(),
            tts: default_tts_cache(),
            history: default_history_cache(),
            math: default_math_cache(),
        }
    }
}

#[derive(Deserialize)]
struct RawRateLimit {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_rate_window")]
    window_seconds: u64,
}

impl Default for RawRateLimit {
    fn default() -> Self {
        Self { enabled: true, window_seconds: default_rate_window() }
    }
}

fn default_bind() -> String { "0.0.0.0:8000".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "full".to_string() }
fn default_cors_origins() -> Vec<String> { vec!["*".to_string()] }
fn default_llm_provider() -> String { "dummy".to_string() }
fn default_openai_api_base_url() -> String { "https://api.groq.com/openai/v1/chat/completions".to_string() }
fn default_openai_model() -> String { "llama-3.1-8b-instant".to_string() }
fn default_openai_temperature() -> f32 { 0.2 }
fn default_openai_max_tokens() -> u32 { 1200 }
fn default_timeout_seconds() -> u64 { 60 }
fn default_tts_provider() -> String { "dummy".to_string() }
fn default_tts_api_base_url() -> String { "https://generativelanguage.googleapis.com/v1beta/models".to_string() }
fn default_tts_model() -> String { "gemini-2.5-flash-preview-tts".to_string() }
fn default_tts_voice() -> String { "Leda".to_string() }
fn default_lessons_cache() -> RawCacheLimits { RawCacheLimits { ttl_seconds: 7200, capacity: 1000 } }
fn default_tts_cache() -> RawCacheLimits { RawCacheLimits { ttl_seconds: 3600, capacity: 500 } }
fn default_history_cache() -> RawCacheLimits { RawCacheLimits { ttl_seconds: 300, capacity: 100 } }
fn default_math_cache() -> RawCacheLimits { RawCacheLimits { ttl_seconds: 1800, capacity: 200 } }
fn default_rate_window() -> u64 { 60 }
fn default_true() -> bool { true }

/// Load config from `path`, else `LANA_CONFIG`, else `config/default.toml`,
/// then apply the process environment.
pub fn load(path: Option<&str>) -> Result<Config, AppError> {
    let path = path
        .map(str::to_string)
        .or_else(|| var("LANA_CONFIG"))
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    load_from(Path::new(&path), EnvOverrides::from_env())
}

/// Load from an explicit path with explicit overrides.
pub fn load_from(path: &Path, env: EnvOverrides) -> Result<Config, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    let parsed: RawConfig = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    let s = parsed.server;
    let log_format: LogFormat = env
        .log_format
        .as_deref()
        .unwrap_or(&s.log_format)
        .parse()
        .map_err(|e| AppError::Config(format!("{e}")))?;

    let supabase = match (env.supabase_url, env.supabase_anon_key.or(env.supabase_service_key.clone())) {
        (Some(url), Some(anon_key)) => Some(SupabaseConfig {
            url: url.trim_end_matches('/').to_string(),
            anon_key,
            service_key: env.supabase_service_key,
        }),
        _ => None,
    };

    let llm_provider = parsed.llm.provider;
    if !matches!(llm_provider.as_str(), "dummy" | "openai" | "openai-compatible" | "groq") {
        return Err(AppError::Config(format!("unknown llm provider: {llm_provider}")));
    }
    let tts_provider = parsed.tts.provider;
    if !matches!(tts_provider.as_str(), "dummy" | "gemini") {
        return Err(AppError::Config(format!("unknown tts provider: {tts_provider}")));
    }

    Ok(Config {
        bind: env.bind.unwrap_or(s.bind),
        log_level: env.log_level.unwrap_or(s.log_level),
        log_format,
        environment: Environment::from_node_env(env.node_env.as_deref()),
        cors_origins: s.cors_origins,
        llm: LlmConfig {
            provider: llm_provider,
            openai: OpenAiConfig {
                api_base_url: parsed.llm.openai.api_base_url,
                model: parsed.llm.openai.model,
                temperature: parsed.llm.openai.temperature,
                max_tokens: parsed.llm.openai.max_tokens,
                timeout_seconds: parsed.llm.openai.timeout_seconds,
            },
        },
        llm_api_key: env.llm_api_key,
        tts: TtsConfig {
            provider: tts_provider,
            api_base_url: parsed.tts.api_base_url,
            model: parsed.tts.model,
            voice: parsed.tts.voice,
            timeout_seconds: parsed.tts.timeout_seconds,
        },
        tts_api_key: env.tts_api_key,
        supabase,
        cache: CacheConfig {
            lessons: parsed.cache.lessons.into(),
            tts: parsed.cache.tts.into(),
            history: parsed.cache.history.into(),
            math: parsed.cache.math.into(),
        },
        rate_limit: RateLimitConfig {
            enabled: parsed.rate_limit.enabled,
            window_seconds: parsed.rate_limit.window_seconds,
        },
    })
}

impl Config {
    /// Config for tests: dummy providers, memory store, no rate limit.
    pub fn test_default() -> Self {
        Self {
            bind: "127.0.0.1:0".into(),
            log_level: "info".into(),
            log_format: LogFormat::Compact,
            environment: Environment::Development,
            cors_origins: default_cors_origins(),
            llm: LlmConfig {
                provider: "dummy".into(),
                openai: OpenAiConfig {
                    api_base_url: "http://localhost:0/v1/chat/completions".into(),
                    model: "test-model".into(),
                    temperature: 0.0,
                    max_tokens: 64,
                    timeout_seconds: 1,
                },
            },
            llm_api_key: None,
            tts: TtsConfig {
                provider: "dummy".into(),
                api_base_url: "http://localhost:0".into(),
                model: "test-tts".into(),
                voice: "Leda".into(),
                timeout_seconds: 1,
            },
            tts_api_key: None,
            supabase: None,
            cache: CacheConfig {
                lessons: default_lessons_cache().into(),
                tts: default_tts_cache().into(),
                history: default_history_cache().into(),
                math: default_math_cache().into(),
            },
            rate_limit: RateLimitConfig { enabled: false, window_seconds: default_rate_window() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL_TOML: &str = r#"
[server]
bind = "127.0.0.1:9000"
log_level = "info"
"#;

    fn write_toml(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parse_minimal_config_uses_defaults() {
        let f = write_toml(MINIMAL_TOML);
        let cfg = load_from(f.path(), EnvOverrides::default()).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:9000");
        assert_eq!(cfg.llm.provider, "dummy");
        assert_eq!(cfg.llm.openai.model, "llama-3.1-8b-instant");
        assert_eq!(cfg.cache.history.ttl, Duration::from_secs(300));
        assert_eq!(cfg.cache.lessons.capacity, 1000);
        assert_eq!(cfg.environment, Environment::Development);
        assert_eq!(cfg.log_format, LogFormat::Full);
        assert!(cfg.supabase.is_none());
    }

    #[test]
    fn cache_sections_override_defaults() {
        let f = write_toml(
            r#"
[server]
[cache.history]
ttl_seconds = 10
capacity = 3
"#,
        );
        let cfg = load_from(f.path(), EnvOverrides::default()).unwrap();
        assert_eq!(cfg.cache.history, CacheLimits { ttl: Duration::from_secs(10), capacity: 3 });
        assert_eq!(cfg.cache.math.capacity, 200);
    }

    #[test]
    fn env_overrides_apply() {
        let f = write_toml(MINIMAL_TOML);
        let env = EnvOverrides {
            bind: Some("0.0.0.0:1234".into()),
            log_level: Some("debug".into()),
            log_format: Some("compact".into()),
            node_env: Some("production".into()),
            supabase_url: Some("https://x.supabase.co/".into()),
            supabase_anon_key: Some("anon".into()),
            llm_api_key: Some("k".into()),
            ..Default::default()
        };
        let cfg = load_from(f.path(), env).unwrap();
        assert_eq!(cfg.bind, "0.0.0.0:1234");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.log_format, LogFormat::Compact);
        assert_eq!(cfg.environment, Environment::Production);
        let sb = cfg.supabase.unwrap();
        assert_eq!(sb.url, "https://x.supabase.co");
        assert_eq!(sb.server_key(), "anon");
        assert_eq!(cfg.llm_api_key.as_deref(), Some("k"));
    }

    #[test]
    fn service_key_preferred_for_server_calls() {
        let sb = SupabaseConfig { url: "u".into(), anon_key: "anon".into(), service_key: Some("svc".into()) };
        assert_eq!(sb.server_key(), "svc");
    }

    #[test]
    fn unknown_provider_rejected() {
        let f = write_toml("[server]\n[llm]\ndefault = \"mystery\"\n");
        let err = load_from(f.path(), EnvOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("unknown llm provider"));
    }

    #[test]
    fn unknown_log_format_rejected() {
        let f = write_toml("[server]\nlog_format = \"fancy\"\n");
        let err = load_from(f.path(), EnvOverrides::default()).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert!(err.to_string().contains("unknown log format"));
    }

    #[test]
    fn missing_file_errors() {
        let result = load_from(Path::new("/nonexistent/config.toml"), EnvOverrides::default());
        assert!(result.unwrap_err().to_string().contains("config error"));
    }

    #[test]
    fn node_env_parsing() {
        assert_eq!(Environment::from_node_env(Some("PRODUCTION")), Environment::Production);
        assert_eq!(Environment::from_node_env(Some("development")), Environment::Development);
        assert_eq!(Environment::from_node_env(None), Environment::Development);
    }
}
