//! Registry composing detectors and parsers

use crate::detection::{
    DetectionOutcome, Detector, DjangoPytestDetector, GenericDetector, JestDetector, JobContext,
    PytestDetector, SonarQubeDetector,
};
use crate::parsers::{
    DjangoPytestParser, GenericParser, JestParser, LogParser, ParseOptions, ParseResult,
    PytestParser, SonarQubeParser,
};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::TestFramework;

/// Parser tag reported when no parser is registered for the requested framework
pub const FALLBACK_PARSER_TYPE: &str = "fallback";

/// Detectors kept in descending priority order plus one parser per framework
pub struct FrameworkRegistry {
    detectors: Vec<Box<dyn Detector>>,
    parsers: HashMap<TestFramework, Box<dyn LogParser>>,
}

impl FrameworkRegistry {
    pub fn new() -> Self {
        Self {
            detectors: Vec::new(),
            parsers: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_detector(Box::new(SonarQubeDetector));
        registry.register_detector(Box::new(DjangoPytestDetector));
        registry.register_detector(Box::new(JestDetector));
        registry.register_detector(Box::new(PytestDetector));
        registry.register_detector(Box::new(GenericDetector));

        registry.register_parser(TestFramework::Generic, Box::new(GenericParser));
        registry.register_parser(TestFramework::Pytest, Box::new(PytestParser));
        registry.register_parser(TestFramework::DjangoPytest, Box::new(DjangoPytestParser));
        registry.register_parser(TestFramework::Jest, Box::new(JestParser));
        registry.register_parser(TestFramework::SonarQube, Box::new(SonarQubeParser));
        registry
    }

    /// Insert a detector after every detector of equal or higher priority
    pub fn register_detector(&mut self, detector: Box<dyn Detector>) {
        let priority = detector.priority();
        let pos = self
            .detectors
            .iter()
            .position(|d| d.priority() < priority)
            .unwrap_or(self.detectors.len());
        self.detectors.insert(pos, detector);
    }

    /// Map a framework to its parser, replacing any earlier registration
    pub fn register_parser(&mut self, framework: TestFramework, parser: Box<dyn LogParser>) {
        self.parsers.insert(framework, parser);
    }

    pub fn get_parser(&self, framework: TestFramework) -> Option<&dyn LogParser> {
        self.parsers.get(&framework).map(|p| p.as_ref())
    }

    /// Detector names in the order they are asked
    pub fn detector_order(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    /// Framework of the first matching detector, `Generic` when nothing matches
    pub fn detect_framework(&self, job_name: &str, job_stage: &str, trace: &str) -> TestFramework {
        let job = JobContext::new(job_name, job_stage, trace);
        for detector in &self.detectors {
            match detector.detect(&job) {
                DetectionOutcome::Match => {
                    debug!(
                        detector = detector.name(),
                        framework = %detector.framework(),
                        job = job_name,
                        "Framework detected"
                    );
                    return detector.framework();
                }
                DetectionOutcome::NoMatch => {}
                DetectionOutcome::Failed(reason) => {
                    warn!(
                        detector = detector.name(),
                        job = job_name,
                        reason = %reason,
                        "Detector failed, skipping"
                    );
                }
            }
        }
        TestFramework::Generic
    }

    /// Run the parser registered for `framework` and guarantee a well-formed result
    pub fn parse_with_framework(
        &self,
        trace: &str,
        framework: TestFramework,
        options: &ParseOptions,
    ) -> ParseResult {
        let Some(parser) = self.get_parser(framework) else {
            warn!(framework = %framework, "No parser registered, returning empty result");
            return ParseResult::empty(FALLBACK_PARSER_TYPE, framework);
        };

        let mut result = parser.parse(trace, options);
        if !result.is_well_formed() {
            warn!(
                parser = parser.parser_type(),
                error_count = result.error_count,
                errors = result.errors.len(),
                warning_count = result.warning_count,
                warnings = result.warnings.len(),
                "Parser returned inconsistent result, repairing"
            );
            if result.parser_type.is_empty() {
                result.parser_type = parser.parser_type().to_string();
            }
            result.normalize();
        }
        result
    }

    /// Detect then parse in one step
    pub fn analyze(
        &self,
        job_name: &str,
        job_stage: &str,
        trace: &str,
        options: &ParseOptions,
    ) -> (TestFramework, ParseResult) {
        let framework = self.detect_framework(job_name, job_stage, trace);
        (framework, self.parse_with_framework(trace, framework, options))
    }
}

impl Default for FrameworkRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
