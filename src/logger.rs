//! Logging initialisation via tracing-subscriber.
//!
//! A bare level such as `debug` applies to this service and its HTTP layer
//! only; dependencies (hyper, reqwest, rustls) stay at `warn`. Anything else
//! is taken as a full `EnvFilter` directive string.

use std::str::FromStr;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::error::AppError;

/// Crates whose events follow the configured level.
const SERVICE_TARGETS: &[&str] = &["lana_ai", "tower_http"];

/// Level for every other crate when a bare level is configured.
const DEPENDENCY_LEVEL: &str = "warn";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-field lines with timestamps and targets.
    #[default]
    Full,
    /// Shorter lines for local development.
    Compact,
}

impl FromStr for LogFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(LogFormat::Full),
            "compact" => Ok(LogFormat::Compact),
            other => Err(AppError::Logger(format!("unknown log format '{other}' (expected full or compact)"))),
        }
    }
}

/// Expand a bare level into per-target directives; pass directive strings through.
pub fn directives(level: &str) -> String {
    let level = level.trim();
    match level.parse::<LevelFilter>() {
        Ok(_) => std::iter::once(DEPENDENCY_LEVEL.to_string())
            .chain(SERVICE_TARGETS.iter().map(|t| format!("{t}={level}")))
            .collect::<Vec<_>>()
            .join(","),
        Err(_) => level.to_string(),
    }
}

/// Pick the filter. With `prefer_level` (a CLI `-v` flag) the given level
/// wins over `RUST_LOG`; otherwise `RUST_LOG` wins when set.
pub fn filter(level: &str, prefer_level: bool) -> Result<EnvFilter, AppError> {
    let from_level = || {
        EnvFilter::try_new(directives(level)).map_err(|e| AppError::Logger(format!("invalid log level '{level}': {e}")))
    };
    if prefer_level {
        return from_level();
    }
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => from_level(),
    }
}

/// Install the global subscriber. Call once, after config is resolved.
pub fn init(level: &str, format: LogFormat, prefer_level: bool) -> Result<(), AppError> {
    let builder = tracing_subscriber::fmt().with_env_filter(filter(level, prefer_level)?).with_writer(std::io::stderr);
    let installed = match format {
        LogFormat::Full => builder.try_init(),
        LogFormat::Compact => builder.compact().with_target(false).try_init(),
    };
    installed.map_err(|e| AppError::Logger(format!("failed to set subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_level_scopes_to_service_crates() {
        assert_eq!(directives("debug"), "warn,lana_ai=debug,tower_http=debug");
        assert_eq!(directives(" trace "), "warn,lana_ai=trace,tower_http=trace");
    }

    #[test]
    fn directive_strings_pass_through() {
        assert_eq!(directives("lana_ai=trace,hyper=info"), "lana_ai=trace,hyper=info");
    }

    #[test]
    fn levels_and_directives_build_filters() {
        assert!(filter("trace", true).is_ok());
        assert!(filter("lana_ai=debug,tower_http=info", true).is_ok());
    }

    #[test]
    fn bad_directive_is_a_logger_error() {
        assert!(matches!(filter("lana_ai=loud", true), Err(AppError::Logger(_))));
    }

    #[test]
    fn formats_parse() {
        assert_eq!("full".parse::<LogFormat>().unwrap(), LogFormat::Full);
        assert_eq!("Compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("json".parse::<LogFormat>().is_err());
    }

    #[test]
    fn init_succeeds_or_already_init() {
        match init("info", LogFormat::Compact, true) {
            Ok(()) => {}
            Err(AppError::Logger(msg)) if msg.contains("set subscriber") => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
