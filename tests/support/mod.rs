//! Shared setup for integration tests
#![allow(dead_code)]

use failtrace::progress::NoOpHandler;
use failtrace::upstream::MockCiClient;
use failtrace::{CacheStore, FrameworkRegistry, IngestionPipeline, ResourceServer};
use std::sync::Arc;

pub const PYTEST_TRACE: &str = include_str!("../fixtures/traces/pytest_session.log");
pub const JEST_TRACE: &str = include_str!("../fixtures/traces/jest_run.log");
pub const DJANGO_TRACE: &str = include_str!("../fixtures/traces/django_integrity.log");
pub const GENERIC_TRACE: &str = include_str!("../fixtures/traces/generic_install.log");

pub const PROJECT: u64 = 42;
pub const PIPELINE: u64 = 1000;

/// Store, fake upstream, ingestion pipeline and resource server wired together
pub struct Harness {
    pub cache: Arc<CacheStore>,
    pub client: Arc<MockCiClient>,
    pub pipeline: IngestionPipeline,
    pub server: ResourceServer,
}

impl Harness {
    pub async fn in_memory() -> Self {
        Self::with_store(CacheStore::in_memory().await.unwrap()).await
    }

    pub async fn with_store(store: CacheStore) -> Self {
        let cache = Arc::new(store);
        let client = Arc::new(MockCiClient::new());
        let pipeline = IngestionPipeline::new(
            Arc::clone(&cache),
            Arc::new(FrameworkRegistry::with_defaults()),
            client.clone(),
        )
        .with_progress(Arc::new(NoOpHandler))
        .with_max_concurrent_jobs(2);
        let server = ResourceServer::new(Arc::clone(&cache));
        Self {
            cache,
            client,
            pipeline,
            server,
        }
    }

    /// A failed pipeline with one job per fixture framework plus a passing job
    pub fn seed_pipeline(&self, project: u64, pipeline: u64, status: &str) {
        self.client
            .set_pipeline(project, MockCiClient::pipeline(pipeline, status, "d34db33f"));
        let base = pipeline * 10;
        for (offset, name, stage, trace) in [
            (1, "unit-tests", "test", PYTEST_TRACE),
            (2, "frontend", "test", JEST_TRACE),
            (3, "django-models", "test", DJANGO_TRACE),
            (4, "install", "build", GENERIC_TRACE),
        ] {
            self.client.add_job(
                project,
                pipeline,
                MockCiClient::job(base + offset, name, stage, "failed"),
                trace,
            );
        }
        self.client.add_job(
            project,
            pipeline,
            MockCiClient::job(base + 9, "lint", "test", "success"),
            "All checks passed\n",
        );
    }
}
