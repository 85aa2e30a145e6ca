//! Upstream CI system access
//!
//! The ingestion pipeline only sees the [`CiClient`] trait: pipeline metadata, job lists, and
//! raw trace text. [`GitLabClient`] talks to the GitLab REST v4 API; [`MockCiClient`] serves
//! canned data for tests.

mod gitlab;
mod mock;

pub use gitlab::GitLabClient;
pub use mock::MockCiClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline statuses after which nothing about the pipeline changes
pub const TERMINAL_STATUSES: &[&str] = &["success", "failed", "canceled", "skipped"];

pub fn is_terminal_status(status: &str) -> bool {
    TERMINAL_STATUSES.contains(&status)
}

/// Pipeline metadata as reported upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: u64,
    pub status: String,
    #[serde(rename = "ref", default)]
    pub git_ref: String,
    #[serde(default)]
    pub sha: String,
    #[serde(default)]
    pub web_url: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Pipeline {
    pub fn is_terminal(&self) -> bool {
        is_terminal_status(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub stage: String,
    pub status: String,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl Job {
    pub fn is_failed(&self) -> bool {
        self.status == "failed"
    }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("HTTP request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("upstream returned {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("{entity} {id} not found upstream")]
    NotFound { entity: &'static str, id: u64 },

    #[error("invalid upstream configuration: {0}")]
    Config(String),
}

/// Read-only view of the upstream CI system
#[async_trait]
pub trait CiClient: Send + Sync {
    async fn get_pipeline(&self, project_id: u64, pipeline_id: u64)
        -> Result<Pipeline, UpstreamError>;

    async fn get_jobs(&self, project_id: u64, pipeline_id: u64) -> Result<Vec<Job>, UpstreamError>;

    /// Jobs of the pipeline whose status is `failed`
    async fn get_failed_jobs(
        &self,
        project_id: u64,
        pipeline_id: u64,
    ) -> Result<Vec<Job>, UpstreamError> {
        Ok(self
            .get_jobs(project_id, pipeline_id)
            .await?
            .into_iter()
            .filter(Job::is_failed)
            .collect())
    }

    /// Raw trace text; empty when the job has produced no trace yet
    async fn get_job_trace(&self, project_id: u64, job_id: u64) -> Result<String, UpstreamError>;

    fn name(&self) -> &str;
}
