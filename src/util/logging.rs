//! Tracing subscriber setup
//!
//! Log lines always go to stderr. Stdout carries the single JSON document each CLI command
//! prints, so nothing else may write there. `RUST_LOG` directives are honored on top of the
//! configured level.

use std::env;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_LEVEL_ENV: &str = "FAILTRACE_LOG_LEVEL";
pub const LOG_JSON_ENV: &str = "FAILTRACE_LOG_JSON";

/// Crates whose debug output drowns ours unless `RUST_LOG` asks for it
const QUIET_CRATES: &[&str] = &["h2=warn", "hyper=warn", "reqwest=warn", "sqlx=warn"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Minimum level for failtrace's own events
    pub level: Level,
    /// One JSON object per line instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            json: false,
        }
    }
}

impl LoggingConfig {
    /// Level and format from `FAILTRACE_LOG_LEVEL` and `FAILTRACE_LOG_JSON`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            level: env::var(LOG_LEVEL_ENV)
                .ok()
                .and_then(|v| parse_level(&v))
                .unwrap_or(defaults.level),
            json: env::var(LOG_JSON_ENV)
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.json),
        }
    }

    pub fn with_level(self, level: Level) -> Self {
        Self { level, ..self }
    }

    fn filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::from_default_env();
        if let Ok(directive) = format!("failtrace={}", self.level).parse() {
            filter = filter.add_directive(directive);
        }
        if env::var("RUST_LOG").is_err() {
            for directive in QUIET_CRATES.iter().filter_map(|d| d.parse().ok()) {
                filter = filter.add_directive(directive);
            }
        }
        filter
    }
}

/// Case-insensitive level name; `None` for anything else
pub fn parse_level(value: &str) -> Option<Level> {
    match value.trim().to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Truthy spellings accepted by boolean environment variables
pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed; the earlier one stays active.
pub fn init_logging(config: LoggingConfig) -> bool {
    let layer = fmt::layer().with_writer(std::io::stderr).with_target(true);
    let registry = tracing_subscriber::registry().with(config.filter());
    let installed = if config.json {
        registry.with(layer.json()).try_init()
    } else {
        registry.with(layer).try_init()
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use yare::parameterized;

    #[parameterized(
        lower = { "debug", Some(Level::DEBUG) },
        upper = { "ERROR", Some(Level::ERROR) },
        padded = { " info ", Some(Level::INFO) },
        warning_alias = { "warning", Some(Level::WARN) },
        unknown = { "loud", None },
        empty = { "", None },
    )]
    fn test_parse_level(value: &str, expected: Option<Level>) {
        assert_eq!(parse_level(value), expected);
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("true"));
        assert!(parse_flag(" YES "));
        assert!(parse_flag("1"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag("nope"));
    }

    #[test]
    #[serial]
    fn test_from_env_falls_back_on_bad_values() {
        env::set_var(LOG_LEVEL_ENV, "chatty");
        env::set_var(LOG_JSON_ENV, "on");
        let config = LoggingConfig::from_env();
        env::remove_var(LOG_LEVEL_ENV);
        env::remove_var(LOG_JSON_ENV);

        assert_eq!(config.level, Level::WARN);
        assert!(config.json);
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        env::remove_var(LOG_LEVEL_ENV);
        env::remove_var(LOG_JSON_ENV);
        assert_eq!(LoggingConfig::from_env(), LoggingConfig::default());
        assert_eq!(
            LoggingConfig::default().with_level(Level::DEBUG).level,
            Level::DEBUG
        );
    }

    #[test]
    fn test_second_init_keeps_first_subscriber() {
        init_logging(LoggingConfig::default());
        assert!(!init_logging(LoggingConfig::default().with_level(Level::TRACE)));
    }
}
