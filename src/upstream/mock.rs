use super::{CiClient, Job, Pipeline, UpstreamError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// In-memory CI system with call counters
#[derive(Default)]
pub struct MockCiClient {
    pipelines: Mutex<HashMap<(u64, u64), Pipeline>>,
    jobs: Mutex<HashMap<(u64, u64), Vec<Job>>>,
    traces: Mutex<HashMap<(u64, u64), String>>,
    failing_traces: Mutex<HashMap<(u64, u64), u16>>,
    pipeline_calls: AtomicUsize,
    trace_calls: AtomicUsize,
}

impl MockCiClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pipeline(id: u64, status: &str, sha: &str) -> Pipeline {
        Pipeline {
            id,
            status: status.to_string(),
            git_ref: "main".to_string(),
            sha: sha.to_string(),
            web_url: format!("https://gitlab.example.com/group/project/-/pipelines/{id}"),
            created_at: None,
            updated_at: None,
        }
    }

    pub fn job(id: u64, name: &str, stage: &str, status: &str) -> Job {
        Job {
            id,
            name: name.to_string(),
            stage: stage.to_string(),
            status: status.to_string(),
            failure_reason: (status == "failed").then(|| "script_failure".to_string()),
        }
    }

    pub fn set_pipeline(&self, project_id: u64, pipeline: Pipeline) {
        self.pipelines
            .lock()
            .unwrap()
            .insert((project_id, pipeline.id), pipeline);
    }

    /// Attach a job and its trace to a pipeline
    pub fn add_job(&self, project_id: u64, pipeline_id: u64, job: Job, trace: &str) {
        self.traces
            .lock()
            .unwrap()
            .insert((project_id, job.id), trace.to_string());
        self.jobs
            .lock()
            .unwrap()
            .entry((project_id, pipeline_id))
            .or_default()
            .push(job);
    }

    pub fn set_trace(&self, project_id: u64, job_id: u64, trace: &str) {
        self.traces
            .lock()
            .unwrap()
            .insert((project_id, job_id), trace.to_string());
    }

    /// Make trace fetches for a job fail with the given HTTP status
    pub fn fail_trace(&self, project_id: u64, job_id: u64, status: u16) {
        self.failing_traces
            .lock()
            .unwrap()
            .insert((project_id, job_id), status);
    }

    pub fn pipeline_calls(&self) -> usize {
        self.pipeline_calls.load(Ordering::SeqCst)
    }

    pub fn trace_calls(&self) -> usize {
        self.trace_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CiClient for MockCiClient {
    async fn get_pipeline(
        &self,
        project_id: u64,
        pipeline_id: u64,
    ) -> Result<Pipeline, UpstreamError> {
        self.pipeline_calls.fetch_add(1, Ordering::SeqCst);
        self.pipelines
            .lock()
            .unwrap()
            .get(&(project_id, pipeline_id))
            .cloned()
            .ok_or(UpstreamError::NotFound {
                entity: "pipeline",
                id: pipeline_id,
            })
    }

    async fn get_jobs(&self, project_id: u64, pipeline_id: u64) -> Result<Vec<Job>, UpstreamError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .get(&(project_id, pipeline_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_job_trace(&self, project_id: u64, job_id: u64) -> Result<String, UpstreamError> {
        self.trace_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.failing_traces.lock().unwrap().get(&(project_id, job_id)) {
            return Err(UpstreamError::Status {
                url: format!("mock://projects/{project_id}/jobs/{job_id}/trace"),
                status: *status,
            });
        }
        Ok(self
            .traces
            .lock()
            .unwrap()
            .get(&(project_id, job_id))
            .cloned()
            .unwrap_or_default())
    }

    fn name(&self) -> &str {
        "mock"
    }
}
