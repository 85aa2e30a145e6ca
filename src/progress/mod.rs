//! Progress reporting for pipeline ingestion

mod handler;
mod logging;

pub use handler::{IngestState, NoOpHandler, ProgressEvent, ProgressHandler};
pub use logging::LoggingHandler;
