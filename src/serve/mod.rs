//! Cache-only resource serving
//!
//! [`ResourceServer::get_resource`] answers a resource address exclusively from the
//! [`CacheStore`]. It never contacts the upstream CI system: a miss produces a `not_cached`
//! response naming the ingestion call that would fill it. Every outcome, including malformed
//! addresses and storage failures, is a structured [`ResourceResponse`].

mod address;
pub mod render;

pub use address::{AddressError, ResourceAddress, ResourceRequest, ResponseMode, SUPPORTED_PATTERNS};

use crate::cache::{CacheError, CacheKey, CacheStore, DataType, EntryMeta};
use crate::ingest::{
    AnalysisReport, ErrorPattern, FileErrors, FileIndex, JobRecord, PipelineRecord, StoredError,
    TraceRecord,
};
use crate::parsers::ParseResult;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    NotCached,
    Error,
}

/// Ingestion call that would make a missing resource available
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestedAction {
    pub action: String,
    pub project_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<u64>,
    pub description: String,
}

impl SuggestedAction {
    fn trigger_analysis(project_id: u64, pipeline_id: Option<u64>) -> Self {
        let description = match pipeline_id {
            Some(id) => format!("Run trigger_analysis for project {project_id}, pipeline {id}"),
            None => format!(
                "Run trigger_analysis for project {project_id} and the pipeline containing this job"
            ),
        };
        Self {
            action: "trigger_analysis".to_string(),
            project_id,
            pipeline_id,
            description,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceResponse {
    pub status: ResponseStatus,
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<ResponseMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<SuggestedAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supported_patterns: Option<Vec<String>>,
}

impl ResourceResponse {
    fn success(uri: &str, mode: ResponseMode, data: Value) -> Self {
        Self {
            status: ResponseStatus::Success,
            uri: uri.to_string(),
            mode: Some(mode),
            data: Some(data),
            message: None,
            suggested_action: None,
            supported_patterns: None,
        }
    }

    fn not_cached(uri: &str, mode: ResponseMode, action: SuggestedAction) -> Self {
        Self {
            status: ResponseStatus::NotCached,
            uri: uri.to_string(),
            mode: Some(mode),
            data: None,
            message: Some("Resource is not cached; run the suggested analysis first".to_string()),
            suggested_action: Some(action),
            supported_patterns: None,
        }
    }

    fn error(uri: &str, message: String) -> Self {
        Self {
            status: ResponseStatus::Error,
            uri: uri.to_string(),
            mode: None,
            data: None,
            message: Some(message),
            suggested_action: None,
            supported_patterns: None,
        }
    }

    fn invalid_address(uri: &str, error: &AddressError) -> Self {
        Self {
            supported_patterns: Some(
                error
                    .supported_patterns()
                    .iter()
                    .map(|p| p.to_string())
                    .collect(),
            ),
            ..Self::error(uri, error.to_string())
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

/// Rendered data plus the pipeline it belongs to, when known
struct Rendered {
    data: Value,
    pipeline_id: Option<u64>,
}

/// Read-only resource handlers over the cache
pub struct ResourceServer {
    cache: Arc<CacheStore>,
}

impl ResourceServer {
    pub fn new(cache: Arc<CacheStore>) -> Self {
        Self { cache }
    }

    pub async fn get_resource(&self, uri: &str) -> ResourceResponse {
        let request = match ResourceRequest::parse(uri) {
            Ok(request) => request,
            Err(e) => {
                debug!(uri, error = %e, "Rejected resource address");
                return ResourceResponse::invalid_address(uri, &e);
            }
        };

        match self.serve(&request).await {
            Ok(Some(data)) => ResourceResponse::success(uri, request.mode, data),
            Ok(None) => {
                let address = &request.address;
                ResourceResponse::not_cached(
                    uri,
                    request.mode,
                    SuggestedAction::trigger_analysis(address.project_id(), address.pipeline_id()),
                )
            }
            Err(e) => {
                warn!(uri, error = %e, "Resource lookup failed");
                ResourceResponse::error(uri, e.to_string())
            }
        }
    }

    fn response_key(request: &ResourceRequest) -> String {
        let address = &request.address;
        let mut key = CacheKey::new(DataType::Resource, address.project_id());
        if let Some(pipeline_id) = address.pipeline_id() {
            key = key.pipeline(pipeline_id);
        }
        if let Some(job_id) = address.job_id() {
            key = key.job(job_id);
        }
        key.param("uri", address.to_string())
            .param("mode", request.mode.as_str())
            .build()
    }

    /// Rendered response data, from the response cache or the underlying records
    async fn serve(&self, request: &ResourceRequest) -> Result<Option<Value>, CacheError> {
        let key = Self::response_key(request);
        if let Some(data) = self.cache.get(&key).await? {
            debug!(key = %key, "Resource response cache hit");
            return Ok(Some(data));
        }

        let Some(rendered) = self.render(&request.address, request.mode).await? else {
            return Ok(None);
        };

        let address = &request.address;
        let mut pipeline_id = address.pipeline_id().or(rendered.pipeline_id);
        if let (None, Some(job_id)) = (pipeline_id, address.job_id()) {
            // Owned by the job's pipeline too, so pipeline invalidation reaches it
            pipeline_id = self
                .job_record(address.project_id(), job_id)
                .await?
                .map(|job| job.pipeline_id);
        }
        let mut meta =
            EntryMeta::new(DataType::Resource, address.project_id()).maybe_pipeline(pipeline_id);
        if let Some(job_id) = address.job_id() {
            meta = meta.job(job_id);
        }
        self.cache.set(&key, &rendered.data, &meta).await?;
        Ok(Some(rendered.data))
    }

    async fn render(
        &self,
        address: &ResourceAddress,
        mode: ResponseMode,
    ) -> Result<Option<Rendered>, CacheError> {
        let project_id = address.project_id();
        match address {
            ResourceAddress::Pipeline { pipeline_id, .. } => {
                self.render_pipeline(project_id, *pipeline_id).await
            }
            ResourceAddress::PipelineJobs { pipeline_id, .. } => {
                let key = CacheKey::pipeline_analysis(project_id, *pipeline_id);
                let Some(report) = self.cache.get_as::<AnalysisReport>(&key).await? else {
                    return Ok(None);
                };
                Ok(Some(Rendered {
                    data: json!({
                        "pipeline_id": pipeline_id,
                        "total_failed_jobs": report.total_failed_jobs,
                        "jobs": report.jobs,
                    }),
                    pipeline_id: Some(*pipeline_id),
                }))
            }
            ResourceAddress::Analysis { pipeline_id, .. } => {
                let key = CacheKey::pipeline_analysis(project_id, *pipeline_id);
                let Some(report) = self.cache.get_as::<AnalysisReport>(&key).await? else {
                    return Ok(None);
                };
                let patterns: Vec<ErrorPattern> = self
                    .cache
                    .get_as(&CacheKey::error_patterns(project_id, *pipeline_id))
                    .await?
                    .unwrap_or_default();
                Ok(Some(Rendered {
                    data: json!({ "analysis": report, "error_patterns": patterns }),
                    pipeline_id: Some(*pipeline_id),
                }))
            }
            ResourceAddress::Job { job_id, .. } => {
                let Some(job) = self.job_record(project_id, *job_id).await? else {
                    return Ok(None);
                };
                let index: Option<FileIndex> = self
                    .cache
                    .get_as(&CacheKey::file_index(project_id, *job_id))
                    .await?;
                let pipeline_id = job.pipeline_id;
                Ok(Some(Rendered {
                    data: json!({ "job": job, "files": index.map(|i| i.files) }),
                    pipeline_id: Some(pipeline_id),
                }))
            }
            ResourceAddress::JobProblems { job_id, .. } => {
                let Some((job, result)) = self.job_analysis(project_id, *job_id).await? else {
                    return Ok(None);
                };
                let errors = stored_errors(*job_id, &result);
                Ok(Some(Rendered {
                    data: json!({
                        "job_id": job_id,
                        "framework": result.framework,
                        "parser_type": result.parser_type,
                        "error_count": result.error_count,
                        "warning_count": result.warning_count,
                        "errors": render::errors(&errors, mode),
                        "warnings": result.warnings,
                        "summary": result.summary,
                    }),
                    pipeline_id: Some(job.pipeline_id),
                }))
            }
            ResourceAddress::JobErrors { job_id, .. } => {
                let Some((job, result)) = self.job_analysis(project_id, *job_id).await? else {
                    return Ok(None);
                };
                let errors = stored_errors(*job_id, &result);
                Ok(Some(Rendered {
                    data: json!({
                        "job_id": job_id,
                        "error_count": errors.len(),
                        "errors": render::errors(&errors, mode),
                    }),
                    pipeline_id: Some(job.pipeline_id),
                }))
            }
            ResourceAddress::FileErrors {
                job_id, file_path, ..
            } => {
                let key = CacheKey::file_errors(project_id, *job_id, file_path);
                let Some(group) = self.cache.get_as::<FileErrors>(&key).await? else {
                    return Ok(None);
                };
                Ok(Some(Rendered {
                    data: json!({
                        "job_id": job_id,
                        "file_path": group.file_path,
                        "error_count": group.errors.len(),
                        "errors": render::errors(&group.errors, mode),
                    }),
                    pipeline_id: None,
                }))
            }
            ResourceAddress::Error {
                job_id, error_id, ..
            } => {
                let Some(stored) = self.stored_error(project_id, *job_id, error_id).await? else {
                    return Ok(None);
                };
                Ok(Some(Rendered {
                    data: render::error(&stored, mode),
                    pipeline_id: None,
                }))
            }
            ResourceAddress::ErrorTrace {
                job_id, error_id, ..
            } => {
                let Some(stored) = self.stored_error(project_id, *job_id, error_id).await? else {
                    return Ok(None);
                };
                let key = CacheKey::job_trace(project_id, *job_id);
                let Some(trace) = self.cache.get_as::<TraceRecord>(&key).await? else {
                    return Ok(None);
                };
                Ok(Some(Rendered {
                    data: json!({
                        "error": render::error(&stored, mode),
                        "trace": render::trace_excerpt(
                            &trace.content,
                            stored.record.trace_line,
                            mode
                        ),
                    }),
                    pipeline_id: None,
                }))
            }
        }
    }

    async fn render_pipeline(
        &self,
        project_id: u64,
        pipeline_id: u64,
    ) -> Result<Option<Rendered>, CacheError> {
        let record: Option<PipelineRecord> = self
            .cache
            .get_as(&CacheKey::pipeline_record(project_id, pipeline_id))
            .await?;
        let report: Option<AnalysisReport> = self
            .cache
            .get_as(&CacheKey::pipeline_analysis(project_id, pipeline_id))
            .await?;
        if record.is_none() && report.is_none() {
            return Ok(None);
        }

        let summary = report.as_ref().map(|r| {
            json!({
                "status": r.pipeline_status,
                "sha": r.sha,
                "total_failed_jobs": r.total_failed_jobs,
                "processed": r.processed,
                "cached": r.cached,
                "errors": r.errors,
            })
        });
        Ok(Some(Rendered {
            data: json!({
                "pipeline": record,
                "analysis": summary,
                "resources": report.map(|r| r.resources).unwrap_or_default(),
            }),
            pipeline_id: Some(pipeline_id),
        }))
    }

    async fn job_record(
        &self,
        project_id: u64,
        job_id: u64,
    ) -> Result<Option<JobRecord>, CacheError> {
        self.cache
            .get_as(&CacheKey::job_record(project_id, job_id))
            .await
    }

    async fn job_analysis(
        &self,
        project_id: u64,
        job_id: u64,
    ) -> Result<Option<(JobRecord, ParseResult)>, CacheError> {
        let Some(job) = self.job_record(project_id, job_id).await? else {
            return Ok(None);
        };
        let result = self
            .cache
            .get_as(&CacheKey::job_analysis(project_id, job_id))
            .await?;
        Ok(result.map(|result| (job, result)))
    }

    async fn stored_error(
        &self,
        project_id: u64,
        job_id: u64,
        error_id: &str,
    ) -> Result<Option<StoredError>, CacheError> {
        self.cache
            .get_as(&CacheKey::error(project_id, job_id, error_id))
            .await
    }
}

fn stored_errors(job_id: u64, result: &ParseResult) -> Vec<StoredError> {
    result
        .errors
        .iter()
        .map(|e| StoredError::new(job_id, e.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::FrameworkRegistry;
    use crate::ingest::IngestionPipeline;
    use crate::progress::NoOpHandler;
    use crate::upstream::MockCiClient;

    const TRACE: &str = "\
$ pip install -r requirements.txt
ERROR: Package installation failed: numpy==1.24.0
WARNING: deprecated API
";

    async fn ingested() -> (Arc<CacheStore>, Arc<MockCiClient>, ResourceServer) {
        let cache = Arc::new(CacheStore::in_memory().await.unwrap());
        let client = Arc::new(MockCiClient::new());
        client.set_pipeline(3, MockCiClient::pipeline(30, "failed", "cafe"));
        client.add_job(3, 30, MockCiClient::job(31, "deps", "build", "failed"), TRACE);
        IngestionPipeline::new(
            Arc::clone(&cache),
            Arc::new(FrameworkRegistry::with_defaults()),
            client.clone(),
        )
        .with_progress(Arc::new(NoOpHandler))
        .trigger_analysis(3, 30)
        .await
        .unwrap();
        let server = ResourceServer::new(Arc::clone(&cache));
        (cache, client, server)
    }

    #[tokio::test]
    async fn test_miss_suggests_analysis() {
        let cache = Arc::new(CacheStore::in_memory().await.unwrap());
        let server = ResourceServer::new(cache);
        let response = server.get_resource("gl://pipeline/1/2").await;
        assert_eq!(response.status, ResponseStatus::NotCached);
        let action = response.suggested_action.unwrap();
        assert_eq!(action.action, "trigger_analysis");
        assert_eq!(action.pipeline_id, Some(2));
    }

    #[tokio::test]
    async fn test_invalid_address_lists_patterns() {
        let cache = Arc::new(CacheStore::in_memory().await.unwrap());
        let response = ResourceServer::new(cache).get_resource("gl://nope/1").await;
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(
            response.supported_patterns.unwrap().len(),
            SUPPORTED_PATTERNS.len()
        );
    }

    #[tokio::test]
    async fn test_serves_ingested_records_without_upstream() {
        let (_cache, client, server) = ingested().await;
        let calls = client.trace_calls();

        let pipeline = server.get_resource("gl://pipeline/3/30").await;
        assert!(pipeline.is_success());
        assert_eq!(pipeline.data.as_ref().unwrap()["pipeline"]["sha"], "cafe");

        let problems = server.get_resource("gl://job/3/31/problems").await;
        let data = problems.data.unwrap();
        assert_eq!(data["error_count"], 1);
        assert_eq!(data["warning_count"], 1);

        let error_id = data["errors"][0]["error_id"].as_str().unwrap().to_string();
        let error = server
            .get_resource(&format!("gl://error/3/31/{error_id}?mode=fixing"))
            .await;
        assert!(error.data.unwrap().get("fix_guidance").is_some());

        let trace = server
            .get_resource(&format!("gl://error/3/31/{error_id}/trace/minimal"))
            .await;
        let lines = trace.data.unwrap()["trace"]["lines"].clone();
        assert!(lines
            .as_array()
            .unwrap()
            .iter()
            .any(|l| l.as_str().unwrap().contains("numpy")));

        assert_eq!(client.trace_calls(), calls);
    }

    #[tokio::test]
    async fn test_modes_are_cached_separately() {
        let (cache, _client, server) = ingested().await;
        server.get_resource("gl://job/3/31/errors?mode=minimal").await;
        server.get_resource("gl://job/3/31/errors?mode=full").await;
        server.get_resource("gl://job/3/31/errors?mode=full").await;
        assert_eq!(cache.get_stats().await.unwrap().by_type["resource"].entries, 2);

        let minimal = server.get_resource("gl://job/3/31/errors?mode=minimal").await;
        assert!(minimal.data.unwrap()["errors"][0].get("category").is_none());
    }

    #[tokio::test]
    async fn test_invalidated_pipeline_is_not_cached_again() {
        let (cache, _client, server) = ingested().await;
        assert!(server.get_resource("gl://job/3/31").await.is_success());

        cache.invalidate_pipeline(3, 30).await.unwrap();
        let response = server.get_resource("gl://job/3/31").await;
        assert_eq!(response.status, ResponseStatus::NotCached);
    }
}
