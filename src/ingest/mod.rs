//! Pipeline ingestion: fetch trace, detect, parse, persist
//!
//! Each failed job of a pipeline goes through
//! `FetchingTrace -> Detecting -> Parsing -> Persisting` on a bounded worker pool. The SHA-256
//! of the raw trace is the idempotency token: a job whose stored record carries the same hash
//! is reported as cached and never parsed again. Per-job failures are folded into the report
//! and never abort sibling jobs. The pipeline record goes in the same batch as the pipeline
//! analysis, and only once the pipeline is terminal, so an interrupted run is never mistaken
//! for a completed one.

pub mod records;

pub use records::{
    ErrorOccurrence, ErrorPattern, FileEntry, FileErrors, FileIndex, JobRecord, PipelineRecord,
    StoredError, TraceRecord,
};

use crate::cache::{CacheError, CacheKey, CacheStore, CacheWrite, DataType, EntryMeta};
use crate::framework::{FrameworkRegistry, TestFramework};
use crate::parsers::{ParseOptions, ParseResult};
use crate::progress::{IngestState, LoggingHandler, ProgressEvent, ProgressHandler};
use crate::serve::ResourceAddress;
use crate::upstream::{CiClient, Job, Pipeline, UpstreamError};
use crate::util::KeyedLocks;
use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("job {job_id} has no trace yet")]
    EmptyTrace { job_id: u64 },

    #[error("parser task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Processed,
    Cached,
    Error,
}

/// Result of ingesting one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: u64,
    pub name: String,
    pub stage: String,
    pub status: JobStatus,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework: Option<TestFramework>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parser_type: Option<String>,
    pub error_count: usize,
    pub warning_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobOutcome {
    fn from_record(record: &JobRecord, status: JobStatus) -> Self {
        Self {
            job_id: record.job_id,
            name: record.name.clone(),
            stage: record.stage.clone(),
            status,
            cached: status == JobStatus::Cached,
            framework: Some(record.framework),
            parser_type: Some(record.parser_type.clone()),
            error_count: record.error_count,
            warning_count: record.warning_count,
            trace_hash: Some(record.trace_hash.clone()),
            error: None,
        }
    }

    fn failed(job: &Job, error: &IngestError) -> Self {
        Self {
            job_id: job.id,
            name: job.name.clone(),
            stage: job.stage.clone(),
            status: JobStatus::Error,
            cached: false,
            framework: None,
            parser_type: None,
            error_count: 0,
            warning_count: 0,
            trace_hash: None,
            error: Some(error.to_string()),
        }
    }
}

/// Pipeline-level analysis record, also returned by [`IngestionPipeline::trigger_analysis`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub project_id: u64,
    pub pipeline_id: u64,
    pub pipeline_status: String,
    pub sha: String,
    pub total_failed_jobs: usize,
    pub processed: usize,
    pub cached: usize,
    pub errors: usize,
    pub processing_time_seconds: f64,
    /// Nothing was fetched beyond pipeline metadata
    pub short_circuited: bool,
    /// Whether the terminal pipeline record is stored
    pub pipeline_recorded: bool,
    pub jobs: Vec<JobOutcome>,
    pub resources: Vec<String>,
}

impl AnalysisReport {
    fn tally(&mut self) {
        self.total_failed_jobs = self.jobs.len();
        self.processed = self.count(JobStatus::Processed);
        self.cached = self.count(JobStatus::Cached);
        self.errors = self.count(JobStatus::Error);
    }

    fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }
}

/// Job outcome plus the files it produced, for resource listing
struct JobRun {
    outcome: JobOutcome,
    files: Vec<String>,
}

impl JobRun {
    fn from_record(record: &JobRecord, status: JobStatus) -> Self {
        Self {
            outcome: JobOutcome::from_record(record, status),
            files: record.files.clone(),
        }
    }
}

pub fn trace_hash(trace: &str) -> String {
    hex::encode(Sha256::digest(trace.as_bytes()))
}

/// Orchestrates ingestion of one pipeline at a time; shareable across tasks
pub struct IngestionPipeline {
    cache: Arc<CacheStore>,
    registry: Arc<FrameworkRegistry>,
    client: Arc<dyn CiClient>,
    progress: Arc<dyn ProgressHandler>,
    options: ParseOptions,
    workers: Arc<Semaphore>,
    job_locks: KeyedLocks<(u64, u64)>,
}

impl IngestionPipeline {
    pub fn new(
        cache: Arc<CacheStore>,
        registry: Arc<FrameworkRegistry>,
        client: Arc<dyn CiClient>,
    ) -> Self {
        Self {
            cache,
            registry,
            client,
            progress: Arc::new(LoggingHandler),
            options: ParseOptions::default(),
            workers: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT_JOBS)),
            job_locks: KeyedLocks::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressHandler>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.workers = Arc::new(Semaphore::new(max.max(1)));
        self
    }

    pub fn with_parse_options(mut self, options: ParseOptions) -> Self {
        self.options = options;
        self
    }

    fn emit(&self, event: ProgressEvent) {
        self.progress.on_progress(&event);
    }

    fn pipeline_state(&self, project_id: u64, pipeline_id: u64, state: IngestState) {
        self.emit(ProgressEvent::PipelineState {
            project_id,
            pipeline_id,
            state,
        });
    }

    /// Analyze every failed job of a pipeline and persist the results
    pub async fn trigger_analysis(
        &self,
        project_id: u64,
        pipeline_id: u64,
    ) -> Result<AnalysisReport, IngestError> {
        let started = Instant::now();
        self.pipeline_state(project_id, pipeline_id, IngestState::Received);

        match self.run(project_id, pipeline_id, started).await {
            Ok(report) => {
                self.pipeline_state(project_id, pipeline_id, IngestState::Done);
                self.emit(ProgressEvent::Completed {
                    pipeline_id,
                    processed: report.processed,
                    cached: report.cached,
                    errors: report.errors,
                    total_time: started.elapsed(),
                });
                Ok(report)
            }
            Err(e) => {
                self.pipeline_state(project_id, pipeline_id, IngestState::Failed);
                self.emit(ProgressEvent::Failed {
                    pipeline_id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        project_id: u64,
        pipeline_id: u64,
        started: Instant,
    ) -> Result<AnalysisReport, IngestError> {
        self.pipeline_state(project_id, pipeline_id, IngestState::FetchingMetadata);
        let pipeline = self.client.get_pipeline(project_id, pipeline_id).await?;

        if let Some(report) = self.short_circuit(project_id, &pipeline, started).await? {
            self.emit(ProgressEvent::ShortCircuited { pipeline_id });
            return Ok(report);
        }

        self.pipeline_state(project_id, pipeline_id, IngestState::FetchingJobs);
        let jobs = self.client.get_failed_jobs(project_id, pipeline_id).await?;
        self.emit(ProgressEvent::JobsListed {
            pipeline_id,
            failed_jobs: jobs.len(),
        });

        let runs = join_all(
            jobs.iter()
                .map(|job| self.process_job(project_id, pipeline_id, job)),
        )
        .await;

        let mut report = self.report(project_id, &pipeline, runs, started, false);
        self.persist_pipeline(project_id, &pipeline, &jobs, &mut report)
            .await?;
        report.processing_time_seconds = started.elapsed().as_secs_f64();
        Ok(report)
    }

    /// Report straight from the store when this terminal pipeline was fully analyzed before
    async fn short_circuit(
        &self,
        project_id: u64,
        pipeline: &Pipeline,
        started: Instant,
    ) -> Result<Option<AnalysisReport>, IngestError> {
        if !pipeline.is_terminal() {
            return Ok(None);
        }
        let key = CacheKey::pipeline_record(project_id, pipeline.id);
        let Some(stored) = self.cache.get_as::<PipelineRecord>(&key).await? else {
            return Ok(None);
        };
        if !stored.matches(pipeline) {
            return Ok(None);
        }

        let mut runs = Vec::with_capacity(stored.failed_job_ids.len());
        for job_id in &stored.failed_job_ids {
            let job_key = CacheKey::job_record(project_id, *job_id);
            match self.cache.get_as::<JobRecord>(&job_key).await? {
                Some(record) => runs.push(JobRun::from_record(&record, JobStatus::Cached)),
                None => {
                    debug!(job_id, "Job record missing, re-ingesting pipeline");
                    return Ok(None);
                }
            }
        }

        let mut report = self.report(project_id, pipeline, runs, started, true);
        report.pipeline_recorded = true;
        Ok(Some(report))
    }

    fn report(
        &self,
        project_id: u64,
        pipeline: &Pipeline,
        runs: Vec<JobRun>,
        started: Instant,
        short_circuited: bool,
    ) -> AnalysisReport {
        let pipeline_id = pipeline.id;
        let mut resources = vec![
            ResourceAddress::Pipeline {
                project_id,
                pipeline_id,
            },
            ResourceAddress::PipelineJobs {
                project_id,
                pipeline_id,
            },
            ResourceAddress::Analysis {
                project_id,
                pipeline_id,
            },
        ];
        for run in runs.iter().filter(|r| r.outcome.status != JobStatus::Error) {
            let job_id = run.outcome.job_id;
            resources.push(ResourceAddress::Job { project_id, job_id });
            resources.push(ResourceAddress::JobProblems { project_id, job_id });
            resources.push(ResourceAddress::JobErrors { project_id, job_id });
            resources.extend(run.files.iter().map(|file_path| ResourceAddress::FileErrors {
                project_id,
                job_id,
                file_path: file_path.clone(),
            }));
        }

        let mut report = AnalysisReport {
            project_id,
            pipeline_id,
            pipeline_status: pipeline.status.clone(),
            sha: pipeline.sha.clone(),
            total_failed_jobs: 0,
            processed: 0,
            cached: 0,
            errors: 0,
            processing_time_seconds: started.elapsed().as_secs_f64(),
            short_circuited,
            pipeline_recorded: false,
            jobs: runs.into_iter().map(|r| r.outcome).collect(),
            resources: resources.iter().map(ToString::to_string).collect(),
        };
        report.tally();
        report
    }

    async fn process_job(&self, project_id: u64, pipeline_id: u64, job: &Job) -> JobRun {
        let Ok(_permit) = self.workers.acquire().await else {
            let error = IngestError::Task("worker pool closed".to_string());
            return JobRun {
                outcome: JobOutcome::failed(job, &error),
                files: Vec::new(),
            };
        };
        let _guard = self.job_locks.lock((project_id, job.id)).await;
        let started = Instant::now();

        match self.ingest_job(project_id, pipeline_id, job, started).await {
            Ok(run) => run,
            Err(error) => {
                self.emit(ProgressEvent::JobState {
                    job_id: job.id,
                    state: IngestState::Failed,
                });
                self.emit(ProgressEvent::JobFailed {
                    job_id: job.id,
                    error: error.to_string(),
                });
                JobRun {
                    outcome: JobOutcome::failed(job, &error),
                    files: Vec::new(),
                }
            }
        }
    }

    async fn ingest_job(
        &self,
        project_id: u64,
        pipeline_id: u64,
        job: &Job,
        started: Instant,
    ) -> Result<JobRun, IngestError> {
        self.emit(ProgressEvent::JobState {
            job_id: job.id,
            state: IngestState::FetchingTrace,
        });
        let trace = self.client.get_job_trace(project_id, job.id).await?;
        if trace.is_empty() {
            return Err(IngestError::EmptyTrace { job_id: job.id });
        }
        let hash = trace_hash(&trace);

        let job_key = CacheKey::job_record(project_id, job.id);
        let previous = self.cache.get_as::<JobRecord>(&job_key).await?;
        if let Some(record) = &previous {
            if record.trace_hash == hash {
                self.emit(ProgressEvent::JobCached { job_id: job.id });
                return Ok(JobRun::from_record(record, JobStatus::Cached));
            }
        }

        self.emit(ProgressEvent::JobState {
            job_id: job.id,
            state: IngestState::Detecting,
        });
        let (framework, result, trace) = self.classify(job, trace).await?;

        self.emit(ProgressEvent::JobState {
            job_id: job.id,
            state: IngestState::Persisting,
        });
        let (writes, record) =
            Self::job_writes(project_id, pipeline_id, job, framework, &result, trace, hash)?;
        if previous.is_some() {
            // Changed trace: error ids and files of the old parse no longer apply
            self.cache.replace_job(project_id, job.id, &writes).await?;
        } else {
            self.cache.set_many(&writes).await?;
        }

        self.emit(ProgressEvent::JobCompleted {
            job_id: job.id,
            framework: framework.to_string(),
            errors: result.error_count,
            warnings: result.warning_count,
            duration: started.elapsed(),
        });
        Ok(JobRun::from_record(&record, JobStatus::Processed))
    }

    /// Detect and parse on the blocking pool; the trace is handed back for persistence
    async fn classify(
        &self,
        job: &Job,
        trace: String,
    ) -> Result<(TestFramework, ParseResult, String), IngestError> {
        let registry = Arc::clone(&self.registry);
        let progress = Arc::clone(&self.progress);
        let options = self.options.clone();
        let (job_id, name, stage) = (job.id, job.name.clone(), job.stage.clone());

        tokio::task::spawn_blocking(move || {
            let framework = registry.detect_framework(&name, &stage, &trace);
            progress.on_progress(&ProgressEvent::JobState {
                job_id,
                state: IngestState::Parsing,
            });
            let result = registry.parse_with_framework(&trace, framework, &options);
            (framework, result, trace)
        })
        .await
        .map_err(|e| IngestError::Task(e.to_string()))
    }

    /// The parse result and everything derived from it, job record last
    fn job_writes(
        project_id: u64,
        pipeline_id: u64,
        job: &Job,
        framework: TestFramework,
        result: &ParseResult,
        trace: String,
        hash: String,
    ) -> Result<(Vec<CacheWrite>, JobRecord), IngestError> {
        let job_id = job.id;
        let meta = |data_type: DataType| {
            EntryMeta::new(data_type, project_id)
                .pipeline(pipeline_id)
                .job(job_id)
                .parser(result.parser_type.clone())
        };

        let groups = records::group_by_file(job_id, result);
        let index = records::file_index(job_id, &groups);
        let mut writes = vec![CacheWrite::new(
            CacheKey::job_analysis(project_id, job_id),
            serde_json::to_value(result).map_err(CacheError::from)?,
            meta(DataType::Analysis),
        )];

        for group in &groups {
            for stored in &group.errors {
                writes.push(CacheWrite::new(
                    CacheKey::error(project_id, job_id, &stored.error_id),
                    serde_json::to_value(stored).map_err(CacheError::from)?,
                    meta(DataType::Error).file(group.file_path.clone()),
                ));
            }
            writes.push(CacheWrite::new(
                CacheKey::file_errors(project_id, job_id, &group.file_path),
                serde_json::to_value(group).map_err(CacheError::from)?,
                meta(DataType::FileErrors).file(group.file_path.clone()),
            ));
        }
        writes.push(CacheWrite::new(
            CacheKey::file_index(project_id, job_id),
            serde_json::to_value(&index).map_err(CacheError::from)?,
            meta(DataType::FileIndex),
        ));

        let record = JobRecord {
            project_id,
            pipeline_id,
            job_id,
            name: job.name.clone(),
            stage: job.stage.clone(),
            status: job.status.clone(),
            failure_reason: job.failure_reason.clone(),
            framework,
            parser_type: result.parser_type.clone(),
            trace_hash: hash.clone(),
            error_count: result.error_count,
            warning_count: result.warning_count,
            error_ids: records::distinct_error_ids(result),
            files: groups.iter().map(|g| g.file_path.clone()).collect(),
            analyzed_at: Utc::now(),
        };
        writes.push(CacheWrite::new(
            CacheKey::job_trace(project_id, job_id),
            serde_json::to_value(TraceRecord {
                job_id,
                trace_hash: hash,
                content: trace,
            })
            .map_err(CacheError::from)?,
            meta(DataType::Trace),
        ));
        // The job record marks the job processed, so it goes in the same batch
        writes.push(CacheWrite::new(
            CacheKey::job_record(project_id, job_id),
            serde_json::to_value(&record).map_err(CacheError::from)?,
            meta(DataType::Job),
        ));
        Ok((writes, record))
    }

    /// Pipeline analysis, error patterns and the pipeline record, stored as one batch
    async fn persist_pipeline(
        &self,
        project_id: u64,
        pipeline: &Pipeline,
        jobs: &[Job],
        report: &mut AnalysisReport,
    ) -> Result<(), IngestError> {
        let pipeline_id = pipeline.id;
        // Only a complete analysis of a finished pipeline becomes a permanent record
        report.pipeline_recorded = pipeline.is_terminal() && report.errors == 0;

        let mut analyses = Vec::new();
        for outcome in report.jobs.iter().filter(|j| j.status != JobStatus::Error) {
            let key = CacheKey::job_analysis(project_id, outcome.job_id);
            if let Some(result) = self.cache.get_as::<ParseResult>(&key).await? {
                analyses.push((outcome.job_id, result));
            }
        }
        let patterns = records::error_patterns(
            analyses
                .iter()
                .flat_map(|(job_id, result)| result.errors.iter().map(move |e| (*job_id, e))),
        );

        let record = report.pipeline_recorded.then(|| {
            PipelineRecord::new(project_id, pipeline, jobs.iter().map(|j| j.id).collect())
        });
        match self
            .store_pipeline(project_id, pipeline_id, report, &patterns, record.as_ref())
            .await
        {
            Ok(()) => {}
            Err(IngestError::Cache(CacheError::ImmutableRecord {
                stored, attempted, ..
            })) => {
                warn!(
                    pipeline_id,
                    stored = %stored,
                    attempted = %attempted,
                    "Stored pipeline record differs; invalidate the pipeline to replace it"
                );
                report.pipeline_recorded = false;
                self.store_pipeline(project_id, pipeline_id, report, &patterns, None)
                    .await?;
            }
            Err(e) => return Err(e),
        }
        // Rendered pipeline-level responses predate this analysis
        self.cache
            .invalidate_pipeline_type(project_id, pipeline_id, DataType::Resource)
            .await?;

        if !report.pipeline_recorded {
            debug!(
                pipeline_id,
                status = %pipeline.status,
                errors = report.errors,
                "Pipeline record not stored yet"
            );
        }
        Ok(())
    }

    async fn store_pipeline(
        &self,
        project_id: u64,
        pipeline_id: u64,
        report: &AnalysisReport,
        patterns: &[ErrorPattern],
        record: Option<&PipelineRecord>,
    ) -> Result<(), IngestError> {
        let meta =
            |data_type: DataType| EntryMeta::new(data_type, project_id).pipeline(pipeline_id);
        let mut writes = vec![
            CacheWrite::new(
                CacheKey::pipeline_analysis(project_id, pipeline_id),
                serde_json::to_value(report).map_err(CacheError::from)?,
                meta(DataType::Analysis),
            ),
            CacheWrite::new(
                CacheKey::error_patterns(project_id, pipeline_id),
                serde_json::to_value(patterns).map_err(CacheError::from)?,
                meta(DataType::ErrorPatterns),
            ),
        ];
        if let Some(record) = record {
            writes.push(CacheWrite::new(
                CacheKey::pipeline_record(project_id, pipeline_id),
                serde_json::to_value(record).map_err(CacheError::from)?,
                meta(DataType::Pipeline),
            ));
        }
        self.cache.set_many(&writes).await?;
        Ok(())
    }
}
