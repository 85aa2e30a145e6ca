//! Progress handler trait and events

use std::time::Duration;

crate::define_id_enum! {
    /// Ingestion state machine positions
    IngestState {
        Received => "received" : "Received",
        FetchingMetadata => "fetching_metadata" : "Fetching metadata",
        FetchingJobs => "fetching_jobs" : "Fetching jobs",
        FetchingTrace => "fetching_trace" : "Fetching trace",
        Detecting => "detecting" : "Detecting",
        Parsing => "parsing" : "Parsing",
        Persisting => "persisting" : "Persisting",
        Done => "done" : "Done",
        Failed => "failed" : "Failed",
    }
}

/// Events emitted while ingesting a pipeline
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Pipeline-level state change
    PipelineState {
        project_id: u64,
        pipeline_id: u64,
        state: IngestState,
    },

    /// Failed jobs listed for the pipeline
    JobsListed { pipeline_id: u64, failed_jobs: usize },

    /// Per-job state change
    JobState { job_id: u64, state: IngestState },

    /// Trace hash matched the stored record; parsing skipped
    JobCached { job_id: u64 },

    /// Job parsed and persisted
    JobCompleted {
        job_id: u64,
        framework: String,
        errors: usize,
        warnings: usize,
        duration: Duration,
    },

    /// Job could not be processed
    JobFailed { job_id: u64, error: String },

    /// Pipeline already analyzed with the same terminal status and sha
    ShortCircuited { pipeline_id: u64 },

    /// Ingestion finished
    Completed {
        pipeline_id: u64,
        processed: usize,
        cached: usize,
        errors: usize,
        total_time: Duration,
    },

    /// Ingestion aborted before any job ran
    Failed { pipeline_id: u64, error: String },
}

/// Trait for handling progress events during ingestion
pub trait ProgressHandler: Send + Sync {
    /// Called when a progress event occurs
    fn on_progress(&self, event: &ProgressEvent);
}

/// No-op handler that ignores all events
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpHandler;

impl ProgressHandler for NoOpHandler {
    fn on_progress(&self, _event: &ProgressEvent) {}
}
