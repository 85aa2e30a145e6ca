//! Framework detection
//!
//! Detectors look at a job's name, stage and trace text and vote on which framework
//! produced it. They are pure functions of their input; the
//! [`FrameworkRegistry`](crate::framework::FrameworkRegistry) asks them in descending
//! priority order and takes the first match.

mod detectors;

pub use detectors::{
    DjangoPytestDetector, GenericDetector, JestDetector, PytestDetector, SonarQubeDetector,
};

use crate::framework::TestFramework;

/// What a detector knows about a job
#[derive(Debug, Clone, Copy)]
pub struct JobContext<'a> {
    pub job_name: &'a str,
    pub job_stage: &'a str,
    pub trace: &'a str,
}

impl<'a> JobContext<'a> {
    pub fn new(job_name: &'a str, job_stage: &'a str, trace: &'a str) -> Self {
        Self {
            job_name,
            job_stage,
            trace,
        }
    }

    pub fn name_contains(&self, needle: &str) -> bool {
        self.job_name.to_lowercase().contains(needle)
    }

    pub fn stage_contains(&self, needle: &str) -> bool {
        self.job_stage.to_lowercase().contains(needle)
    }
}

/// Result of asking one detector about one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionOutcome {
    Match,
    NoMatch,
    /// The detector could not reach a verdict; it is skipped for this job only
    Failed(String),
}

impl DetectionOutcome {
    pub fn from_bool(matched: bool) -> Self {
        if matched {
            DetectionOutcome::Match
        } else {
            DetectionOutcome::NoMatch
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, DetectionOutcome::Match)
    }
}

/// Priority-ranked predicate voting for one framework
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    fn framework(&self) -> TestFramework;

    /// Higher priorities are asked first
    fn priority(&self) -> u32;

    fn detect(&self, job: &JobContext<'_>) -> DetectionOutcome;
}
