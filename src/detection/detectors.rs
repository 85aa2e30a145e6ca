//! Built-in detectors

use super::{DetectionOutcome, Detector, JobContext};
use crate::framework::TestFramework;
use regex::Regex;
use std::sync::OnceLock;

fn pytest_signature_regex() -> &'static Regex {
    static PYTEST_REGEX: OnceLock<Regex> = OnceLock::new();
    PYTEST_REGEX.get_or_init(|| {
        Regex::new(
            r"(?m)^=+ test session starts =+$|^\$ .*\bpy\.?test\b|^=+ .*\b(?:passed|failed|errors?)\b.* in [\d.]+s\b.*=+$",
        )
        .expect("Invalid pytest signature regex")
    })
}

fn django_signature_regex() -> &'static Regex {
    static DJANGO_REGEX: OnceLock<Regex> = OnceLock::new();
    DJANGO_REGEX.get_or_init(|| {
        Regex::new(r"\bdjango(?:\.|-)|DJANGO_SETTINGS_MODULE|\bpytest-django\b")
            .expect("Invalid django signature regex")
    })
}

fn jest_signature_regex() -> &'static Regex {
    static JEST_REGEX: OnceLock<Regex> = OnceLock::new();
    JEST_REGEX.get_or_init(|| {
        Regex::new(
            r"(?m)^\s*(?:PASS|FAIL)\s+\S+\.(?:test|spec)\.[cm]?[jt]sx?\b|^\$ .*\bjest\b|^Test Suites:\s+\d+",
        )
        .expect("Invalid jest signature regex")
    })
}

fn sonar_signature_regex() -> &'static Regex {
    static SONAR_REGEX: OnceLock<Regex> = OnceLock::new();
    SONAR_REGEX.get_or_init(|| {
        Regex::new(
            r"QUALITY GATE STATUS:|SonarScanner|sonar-scanner|INFO: Analysis report uploaded|EXECUTION (?:SUCCESS|FAILURE)",
        )
        .expect("Invalid sonar signature regex")
    })
}

fn has_pytest_signature(job: &JobContext<'_>) -> bool {
    job.name_contains("pytest") || pytest_signature_regex().is_match(job.trace)
}

/// Quality-gate scanner jobs; outranks everything so a `sonar-test` job is not read as tests
#[derive(Debug, Default, Clone, Copy)]
pub struct SonarQubeDetector;

impl Detector for SonarQubeDetector {
    fn name(&self) -> &'static str {
        "sonarqube"
    }

    fn framework(&self) -> TestFramework {
        TestFramework::SonarQube
    }

    fn priority(&self) -> u32 {
        90
    }

    fn detect(&self, job: &JobContext<'_>) -> DetectionOutcome {
        DetectionOutcome::from_bool(
            job.name_contains("sonar")
                || job.stage_contains("sonar")
                || sonar_signature_regex().is_match(job.trace),
        )
    }
}

/// Pytest runs of a Django project
#[derive(Debug, Default, Clone, Copy)]
pub struct DjangoPytestDetector;

impl Detector for DjangoPytestDetector {
    fn name(&self) -> &'static str {
        "django-pytest"
    }

    fn framework(&self) -> TestFramework {
        TestFramework::DjangoPytest
    }

    fn priority(&self) -> u32 {
        85
    }

    fn detect(&self, job: &JobContext<'_>) -> DetectionOutcome {
        let django = job.name_contains("django") || django_signature_regex().is_match(job.trace);
        DetectionOutcome::from_bool(django && has_pytest_signature(job))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JestDetector;

impl Detector for JestDetector {
    fn name(&self) -> &'static str {
        "jest"
    }

    fn framework(&self) -> TestFramework {
        TestFramework::Jest
    }

    fn priority(&self) -> u32 {
        80
    }

    fn detect(&self, job: &JobContext<'_>) -> DetectionOutcome {
        DetectionOutcome::from_bool(
            job.name_contains("jest") || jest_signature_regex().is_match(job.trace),
        )
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PytestDetector;

impl Detector for PytestDetector {
    fn name(&self) -> &'static str {
        "pytest"
    }

    fn framework(&self) -> TestFramework {
        TestFramework::Pytest
    }

    fn priority(&self) -> u32 {
        70
    }

    fn detect(&self, job: &JobContext<'_>) -> DetectionOutcome {
        DetectionOutcome::from_bool(has_pytest_signature(job))
    }
}

/// Always matches; the last resort at the bottom of the priority list
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericDetector;

impl Detector for GenericDetector {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn framework(&self) -> TestFramework {
        TestFramework::Generic
    }

    fn priority(&self) -> u32 {
        0
    }

    fn detect(&self, _job: &JobContext<'_>) -> DetectionOutcome {
        DetectionOutcome::Match
    }
}
