//! Configuration management for failtrace
//!
//! Settings are loaded from environment variables with defaults, then checked with
//! [`FailtraceConfig::validate`] before any store or client is built.
//!
//! # Environment Variables
//!
//! - `FAILTRACE_DB_PATH`: SQLite database file - default: `<data dir>/failtrace/cache.db`
//! - `FAILTRACE_GITLAB_URL`: GitLab base URL - default: "https://gitlab.com"
//! - `FAILTRACE_GITLAB_TOKEN`: Personal access token sent as `PRIVATE-TOKEN` - optional
//! - `FAILTRACE_MAX_CONCURRENT_JOBS`: Jobs ingested in parallel - default: "4"
//! - `FAILTRACE_REQUEST_TIMEOUT`: Upstream timeout in seconds - default: "30"
//! - `FAILTRACE_LOG_LEVEL`: Logging level - default: "info"
//!
//! # Example
//!
//! ```no_run
//! use failtrace::FailtraceConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = FailtraceConfig::default();
//! config.validate()?;
//!
//! let store = config.open_store().await?;
//! let client = config.create_client()?;
//! # Ok(())
//! # }
//! ```

use crate::cache::{CacheError, CacheStore};
use crate::ingest::DEFAULT_MAX_CONCURRENT_JOBS;
use crate::upstream::{GitLabClient, UpstreamError};
use reqwest::Url;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_GITLAB_URL: &str = "https://gitlab.com";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DB_FILE_NAME: &str = "cache.db";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Failed to open cache store: {0}")]
    Store(#[from] CacheError),

    #[error("Failed to create GitLab client: {0}")]
    Client(#[from] UpstreamError),
}

#[derive(Debug, Clone)]
pub struct FailtraceConfig {
    /// SQLite database file backing the cache store
    pub db_path: PathBuf,

    pub gitlab_url: String,

    pub gitlab_token: Option<String>,

    /// Upper bound on jobs ingested at the same time
    pub max_concurrent_jobs: usize,

    /// Upstream request timeout in seconds
    pub request_timeout_secs: u64,

    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(env::temp_dir)
        .join("failtrace")
        .join(DB_FILE_NAME)
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl Default for FailtraceConfig {
    /// Reads `FAILTRACE_*` environment variables, falling back to defaults for missing or
    /// unparsable values
    fn default() -> Self {
        let db_path = env::var("FAILTRACE_DB_PATH")
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_db_path);

        let gitlab_url =
            env::var("FAILTRACE_GITLAB_URL").unwrap_or_else(|_| DEFAULT_GITLAB_URL.to_string());

        let gitlab_token = env::var("FAILTRACE_GITLAB_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());

        let max_concurrent_jobs = env_parsed("FAILTRACE_MAX_CONCURRENT_JOBS")
            .unwrap_or(DEFAULT_MAX_CONCURRENT_JOBS);

        let request_timeout_secs =
            env_parsed("FAILTRACE_REQUEST_TIMEOUT").unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);

        let log_level = env::var("FAILTRACE_LOG_LEVEL")
            .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string())
            .to_lowercase();

        Self {
            db_path,
            gitlab_url,
            gitlab_token,
            max_concurrent_jobs,
            request_timeout_secs,
            log_level,
        }
    }
}

impl FailtraceConfig {
    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` naming the first offending setting
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "Request timeout must be at least 1 second".to_string(),
            ));
        }
        if self.request_timeout_secs > 600 {
            return Err(ConfigError::ValidationFailed(
                "Request timeout cannot exceed 10 minutes".to_string(),
            ));
        }

        if !(1..=64).contains(&self.max_concurrent_jobs) {
            return Err(ConfigError::ValidationFailed(format!(
                "Max concurrent jobs must be between 1 and 64, got {}",
                self.max_concurrent_jobs
            )));
        }

        match Url::parse(&self.gitlab_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => {
                return Err(ConfigError::ValidationFailed(format!(
                    "Invalid GitLab URL: {}",
                    self.gitlab_url
                )))
            }
        }

        if self.db_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "Database path must not be empty".to_string(),
            ));
        }

        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::ValidationFailed(format!(
                    "Invalid log level: {}. Valid options: trace, debug, info, warn, error",
                    self.log_level
                )))
            }
        }

        Ok(())
    }

    /// Opens the SQLite store, creating the parent directory when needed
    pub async fn open_store(&self) -> Result<Arc<CacheStore>, ConfigError> {
        if let Some(parent) = self.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                ConfigError::ValidationFailed(format!(
                    "Cannot create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let store = CacheStore::open(&self.db_path, self.max_concurrent_jobs as u32 + 1).await?;
        Ok(Arc::new(store))
    }

    pub fn create_client(&self) -> Result<Arc<GitLabClient>, ConfigError> {
        let client = GitLabClient::with_timeout(
            &self.gitlab_url,
            self.gitlab_token.as_deref(),
            Duration::from_secs(self.request_timeout_secs),
        )?;
        Ok(Arc::new(client))
    }
}

impl fmt::Display for FailtraceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Failtrace Configuration:")?;
        writeln!(f, "  Database: {}", self.db_path.display())?;
        writeln!(f, "  GitLab URL: {}", self.gitlab_url)?;
        writeln!(
            f,
            "  GitLab Token: {}",
            if self.gitlab_token.is_some() { "set" } else { "unset" }
        )?;
        writeln!(f, "  Max Concurrent Jobs: {}", self.max_concurrent_jobs)?;
        writeln!(f, "  Request Timeout: {}s", self.request_timeout_secs)?;
        writeln!(f, "  Log Level: {}", self.log_level)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    /// Helper to temporarily set environment variables for testing
    struct EnvGuard {
        key: String,
        old_value: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let old_value = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                old_value,
            }
        }

        fn unset(key: &str) -> Self {
            let old_value = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                old_value,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.old_value {
                Some(v) => env::set_var(&self.key, v),
                None => env::remove_var(&self.key),
            }
        }
    }

    fn config() -> FailtraceConfig {
        FailtraceConfig {
            db_path: PathBuf::from("/tmp/failtrace/cache.db"),
            gitlab_url: DEFAULT_GITLAB_URL.to_string(),
            gitlab_token: None,
            max_concurrent_jobs: 4,
            request_timeout_secs: 30,
            log_level: "info".to_string(),
        }
    }

    #[test]
    #[serial]
    fn test_default_configuration() {
        let _guards = [
            EnvGuard::unset("FAILTRACE_DB_PATH"),
            EnvGuard::unset("FAILTRACE_GITLAB_URL"),
            EnvGuard::unset("FAILTRACE_GITLAB_TOKEN"),
            EnvGuard::unset("FAILTRACE_MAX_CONCURRENT_JOBS"),
            EnvGuard::unset("FAILTRACE_REQUEST_TIMEOUT"),
            EnvGuard::unset("FAILTRACE_LOG_LEVEL"),
        ];

        let config = FailtraceConfig::default();
        assert_eq!(config.gitlab_url, DEFAULT_GITLAB_URL);
        assert!(config.gitlab_token.is_none());
        assert_eq!(config.max_concurrent_jobs, DEFAULT_MAX_CONCURRENT_JOBS);
        assert_eq!(config.request_timeout_secs, DEFAULT_REQUEST_TIMEOUT_SECS);
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert!(config.db_path.ends_with("failtrace/cache.db"));
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_environment_variable_parsing() {
        let _guards = [
            EnvGuard::set("FAILTRACE_DB_PATH", "/var/lib/failtrace.db"),
            EnvGuard::set("FAILTRACE_GITLAB_URL", "https://gitlab.example.com"),
            EnvGuard::set("FAILTRACE_GITLAB_TOKEN", "glpat-123"),
            EnvGuard::set("FAILTRACE_MAX_CONCURRENT_JOBS", "8"),
            EnvGuard::set("FAILTRACE_REQUEST_TIMEOUT", "60"),
            EnvGuard::set("FAILTRACE_LOG_LEVEL", "DEBUG"),
        ];

        let config = FailtraceConfig::default();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/failtrace.db"));
        assert_eq!(config.gitlab_url, "https://gitlab.example.com");
        assert_eq!(config.gitlab_token.as_deref(), Some("glpat-123"));
        assert_eq!(config.max_concurrent_jobs, 8);
        assert_eq!(config.request_timeout_secs, 60);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    #[serial]
    fn test_unparsable_numbers_fall_back() {
        let _guards = [
            EnvGuard::set("FAILTRACE_MAX_CONCURRENT_JOBS", "many"),
            EnvGuard::set("FAILTRACE_REQUEST_TIMEOUT", "-1"),
        ];

        let config = FailtraceConfig::default();
        assert_eq!(config.max_concurrent_jobs, DEFAULT_MAX_CONCURRENT_JOBS);
        assert_eq!(config.request_timeout_secs, DEFAULT_REQUEST_TIMEOUT_SECS);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut bad = config();
        bad.request_timeout_secs = 0;
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.max_concurrent_jobs = 0;
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.gitlab_url = "gitlab.com".to_string();
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.log_level = "loud".to_string();
        assert!(bad.validate().is_err());

        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_display_hides_token() {
        let mut config = config();
        config.gitlab_token = Some("glpat-secret".to_string());
        let display = config.to_string();
        assert!(display.contains("Failtrace Configuration:"));
        assert!(!display.contains("glpat-secret"));
    }

    #[tokio::test]
    async fn test_open_store_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.db_path = dir.path().join("nested").join("cache.db");

        let store = config.open_store().await.unwrap();
        assert!(config.db_path.exists());
        store.close().await;
    }
}
