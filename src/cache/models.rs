//! Cache record types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

crate::define_id_enum! {
    /// Kind of cached record; selects the TTL and scopes invalidation
    DataType {
        Pipeline => "pipeline" : "Pipeline",
        Job => "job" : "Job",
        Analysis => "analysis" : "Analysis",
        FileErrors => "file_errors" : "File errors",
        Error => "error" : "Error",
        FileIndex => "file_index" : "File index",
        ErrorPatterns => "error_patterns" : "Error patterns",
        Trace => "trace" : "Trace",
        Resource => "resource" : "Resource response",
    }
}

impl DataType {
    /// Time to live; `None` means the record never expires
    pub fn ttl(&self) -> Option<Duration> {
        match self {
            DataType::Pipeline => None,
            DataType::Job | DataType::Trace => Some(Duration::hours(24)),
            DataType::Analysis | DataType::FileErrors | DataType::Error => Some(Duration::days(7)),
            DataType::FileIndex | DataType::Resource => Some(Duration::hours(1)),
            DataType::ErrorPatterns => Some(Duration::hours(6)),
        }
    }

    pub fn expires_at(&self, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.ttl().map(|ttl| created_at + ttl)
    }
}

/// Ownership and type of a record being stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    pub data_type: DataType,
    pub project_id: u64,
    pub pipeline_id: Option<u64>,
    pub job_id: Option<u64>,
    pub file_path: Option<String>,
    pub parser_type: Option<String>,
}

impl EntryMeta {
    pub fn new(data_type: DataType, project_id: u64) -> Self {
        Self {
            data_type,
            project_id,
            pipeline_id: None,
            job_id: None,
            file_path: None,
            parser_type: None,
        }
    }

    pub fn pipeline(mut self, pipeline_id: u64) -> Self {
        self.pipeline_id = Some(pipeline_id);
        self
    }

    pub fn maybe_pipeline(mut self, pipeline_id: Option<u64>) -> Self {
        self.pipeline_id = pipeline_id;
        self
    }

    pub fn job(mut self, job_id: u64) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn file(mut self, file_path: impl Into<String>) -> Self {
        self.file_path = Some(file_path.into());
        self
    }

    pub fn parser(mut self, parser_type: impl Into<String>) -> Self {
        self.parser_type = Some(parser_type.into());
        self
    }
}

/// Metadata row of a stored record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntryInfo {
    pub key: String,
    pub data_type: DataType,
    pub project_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parser_type: Option<String>,
    pub created_at: DateTime<Utc>,
    /// `None` for records that never expire
    pub expires_at: Option<DateTime<Utc>>,
    /// Uncompressed serialized size
    pub size_bytes: u64,
}

impl CacheEntryInfo {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Entry count and logical size for one data type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeStats {
    pub entries: u64,
    pub bytes: u64,
}

/// Store statistics recomputed from the metadata table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: u64,
    /// Sum of uncompressed payload sizes
    pub total_bytes: u64,
    /// Sum of stored (compressed) payload sizes
    pub stored_bytes: u64,
    pub by_type: BTreeMap<String, TypeStats>,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
    /// Expired entries the sweep has not removed yet
    pub expired_entries: u64,
    pub last_cleanup: Option<CleanupRecord>,
}

/// One row of the append-only cleanup audit log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupRecord {
    pub ran_at: DateTime<Utc>,
    pub operation: String,
    pub items_cleaned: u64,
    pub bytes_freed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub detail: String,
}

impl HealthCheck {
    pub fn new(name: &str, status: HealthStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
        }
    }
}

/// Result of [`CacheStore::check_health`](super::CacheStore::check_health)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    /// Overall status is the worst of the individual checks
    pub fn from_checks(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self { status, checks }
    }
}
