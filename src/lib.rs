//! failtrace - framework-aware CI job log parser with a cache-first failure store
//!
//! failtrace turns the raw logs of failed CI jobs into normalized, addressable error
//! records. Ingestion fetches a pipeline's failed jobs, detects which test framework
//! produced each log, parses it, and persists the results in a local SQLite cache. Serving
//! answers `gl://` resource addresses from that cache alone.
//!
//! # Core Concepts
//!
//! - **Detection**: priority-ordered detectors vote on the [`TestFramework`] behind a trace
//! - **Parsing**: one parser per framework produces [`ErrorRecord`]s and warnings
//! - **Cache Store**: TTL'd, compressed records scoped by project, pipeline and job
//! - **Ingestion**: bounded, idempotent per-job processing keyed on the trace hash
//! - **Serving**: typed [`ResourceAddress`]es rendered in one of four response modes
//!
//! # Example Usage
//!
//! ```no_run
//! use failtrace::{CacheStore, FrameworkRegistry, IngestionPipeline, ResourceServer};
//! use failtrace::upstream::GitLabClient;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = Arc::new(CacheStore::open("failtrace.db", 5).await?);
//! let client = Arc::new(GitLabClient::new("https://gitlab.com", None)?);
//! let registry = Arc::new(FrameworkRegistry::with_defaults());
//!
//! let report = IngestionPipeline::new(Arc::clone(&cache), registry, client)
//!     .trigger_analysis(123, 4567)
//!     .await?;
//! println!("{} jobs processed", report.processed);
//!
//! let server = ResourceServer::new(cache);
//! let response = server.get_resource("gl://pipeline/123/4567").await;
//! println!("{:?}", response.status);
//! # Ok(())
//! # }
//! ```
//!
//! # Project Structure
//!
//! - [`framework`]: framework identifiers and the detector/parser registry
//! - [`detection`]: framework detectors
//! - [`parsers`]: per-framework log parsers and shared record types
//! - [`cache`]: SQLite-backed cache store
//! - [`ingest`]: pipeline ingestion
//! - [`serve`]: cache-only resource serving
//! - [`upstream`]: CI client abstraction and GitLab implementation

pub mod cache;
pub mod cli;
pub mod config;
pub mod detection;
pub mod framework;
pub mod ingest;
pub mod parsers;
pub mod progress;
pub mod serve;
pub mod upstream;
pub mod util;

pub use cache::{CacheError, CacheKey, CacheStore, DataType};
pub use config::{ConfigError, FailtraceConfig};
pub use framework::{FrameworkRegistry, TestFramework};
pub use ingest::{AnalysisReport, IngestError, IngestionPipeline};
pub use parsers::{ErrorRecord, ParseOptions, ParseResult, WarningRecord};
pub use serve::{ResourceAddress, ResourceResponse, ResourceServer, ResponseMode};
pub use upstream::{CiClient, UpstreamError};
pub use util::{init_logging, LoggingConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_exists() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name_is_failtrace() {
        assert_eq!(NAME, "failtrace");
    }
}
