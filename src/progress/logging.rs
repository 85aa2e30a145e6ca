//! Logging-based progress handler

use super::{IngestState, ProgressEvent, ProgressHandler};
use tracing::{debug, info, warn};

/// Handler that logs progress events using tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl ProgressHandler for LoggingHandler {
    fn on_progress(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::PipelineState {
                project_id,
                pipeline_id,
                state,
            } => match state {
                IngestState::Received => {
                    info!(project_id, pipeline_id, "Starting pipeline analysis")
                }
                IngestState::Failed => warn!(project_id, pipeline_id, "Pipeline analysis failed"),
                _ => debug!(project_id, pipeline_id, state = %state, "Pipeline state"),
            },
            ProgressEvent::JobsListed {
                pipeline_id,
                failed_jobs,
            } => {
                info!(pipeline_id, failed_jobs, "Failed jobs listed");
            }
            ProgressEvent::JobState { job_id, state } => {
                debug!(job_id, state = %state, "Job state");
            }
            ProgressEvent::JobCached { job_id } => {
                info!(job_id, "Trace unchanged, using cached analysis");
            }
            ProgressEvent::JobCompleted {
                job_id,
                framework,
                errors,
                warnings,
                duration,
            } => {
                info!(
                    job_id,
                    framework = %framework,
                    errors,
                    warnings,
                    duration_ms = duration.as_millis(),
                    "Job analyzed"
                );
            }
            ProgressEvent::JobFailed { job_id, error } => {
                warn!(job_id, error = %error, "Job analysis failed");
            }
            ProgressEvent::ShortCircuited { pipeline_id } => {
                info!(pipeline_id, "Pipeline already analyzed");
            }
            ProgressEvent::Completed {
                pipeline_id,
                processed,
                cached,
                errors,
                total_time,
            } => {
                info!(
                    pipeline_id,
                    processed,
                    cached,
                    errors,
                    total_time_ms = total_time.as_millis(),
                    "Pipeline analysis complete"
                );
            }
            ProgressEvent::Failed { pipeline_id, error } => {
                warn!(pipeline_id, error = %error, "Pipeline analysis aborted");
            }
        }
    }
}
