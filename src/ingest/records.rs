//! Records written by ingestion and read back by the serving layer

use crate::framework::TestFramework;
use crate::parsers::django::fingerprint;
use crate::parsers::{ErrorCategory, ErrorRecord, ParseResult};
use crate::upstream::Pipeline;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Terminal pipeline fact; stored alongside the pipeline analysis, never expires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub project_id: u64,
    pub pipeline_id: u64,
    pub status: String,
    pub sha: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub web_url: String,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub failed_job_ids: Vec<u64>,
    pub recorded_at: DateTime<Utc>,
}

impl PipelineRecord {
    pub fn new(project_id: u64, pipeline: &Pipeline, failed_job_ids: Vec<u64>) -> Self {
        Self {
            project_id,
            pipeline_id: pipeline.id,
            status: pipeline.status.clone(),
            sha: pipeline.sha.clone(),
            git_ref: pipeline.git_ref.clone(),
            web_url: pipeline.web_url.clone(),
            created_at: pipeline.created_at.clone(),
            updated_at: pipeline.updated_at.clone(),
            failed_job_ids,
            recorded_at: Utc::now(),
        }
    }

    /// Same upstream fact as `pipeline`
    pub fn matches(&self, pipeline: &Pipeline) -> bool {
        self.status == pipeline.status && self.sha == pipeline.sha
    }
}

/// Marks a job as processed for one trace hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub project_id: u64,
    pub pipeline_id: u64,
    pub job_id: u64,
    pub name: String,
    pub stage: String,
    pub status: String,
    pub failure_reason: Option<String>,
    pub framework: TestFramework,
    pub parser_type: String,
    /// SHA-256 of the raw trace; the idempotency token
    pub trace_hash: String,
    pub error_count: usize,
    pub warning_count: usize,
    pub error_ids: Vec<String>,
    pub files: Vec<String>,
    pub analyzed_at: DateTime<Utc>,
}

/// Where one instance of a repeated error was reported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorOccurrence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_line: Option<usize>,
}

impl From<&ErrorRecord> for ErrorOccurrence {
    fn from(record: &ErrorRecord) -> Self {
        Self {
            test_name: record.test_name.clone(),
            test_function: record.test_function.clone(),
            trace_line: record.trace_line,
        }
    }
}

/// Error record addressed by its derived id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredError {
    pub error_id: String,
    pub job_id: u64,
    #[serde(flatten)]
    pub record: ErrorRecord,
    /// Every instance sharing this id, in trace order; empty when the error occurred once
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub occurrences: Vec<ErrorOccurrence>,
}

impl StoredError {
    pub fn new(job_id: u64, record: ErrorRecord) -> Self {
        Self {
            error_id: record.error_id(),
            job_id,
            record,
            occurrences: Vec::new(),
        }
    }

    /// Fold in a later error with the same id
    fn absorb(&mut self, other: &ErrorRecord) {
        if self.occurrences.is_empty() {
            self.occurrences.push(ErrorOccurrence::from(&self.record));
        }
        self.occurrences.push(ErrorOccurrence::from(other));
    }

    pub fn occurrence_count(&self) -> usize {
        self.occurrences.len().max(1)
    }
}

/// Distinct error ids of a parse result in trace order
pub fn distinct_error_ids(result: &ParseResult) -> Vec<String> {
    let mut seen = BTreeSet::new();
    result
        .errors
        .iter()
        .map(ErrorRecord::error_id)
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Errors of one job attributed to one source file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileErrors {
    pub job_id: u64,
    pub file_path: String,
    pub errors: Vec<StoredError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub file_path: String,
    pub error_count: usize,
}

/// Files of a job that have errors, most errors first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIndex {
    pub job_id: u64,
    pub files: Vec<FileEntry>,
}

/// Raw trace kept for trace-context responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub job_id: u64,
    pub trace_hash: String,
    pub content: String,
}

/// Recurring error shape across a pipeline's jobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub fingerprint: String,
    pub category: ErrorCategory,
    pub exception_type: Option<String>,
    pub occurrences: usize,
    pub job_ids: BTreeSet<u64>,
    pub example_message: String,
}

/// Group errors of many jobs by normalized fingerprint, most frequent first
pub fn error_patterns<'a>(
    errors: impl IntoIterator<Item = (u64, &'a ErrorRecord)>,
) -> Vec<ErrorPattern> {
    let mut patterns: BTreeMap<String, ErrorPattern> = BTreeMap::new();
    for (job_id, record) in errors {
        let pattern = patterns
            .entry(fingerprint(record))
            .or_insert_with_key(|key| ErrorPattern {
                fingerprint: key.clone(),
                category: record.category,
                exception_type: record.exception_type.clone(),
                occurrences: 0,
                job_ids: BTreeSet::new(),
                example_message: record.message.clone(),
            });
        pattern.occurrences += 1;
        pattern.job_ids.insert(job_id);
    }

    let mut patterns: Vec<ErrorPattern> = patterns.into_values().collect();
    patterns.sort_by(|a, b| {
        b.occurrences
            .cmp(&a.occurrences)
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    });
    patterns
}

/// Group a parse result's errors by source file, preserving trace order inside each file.
///
/// Errors sharing an id collapse into one stored error that lists their occurrences.
pub fn group_by_file(job_id: u64, result: &ParseResult) -> Vec<FileErrors> {
    let mut files: BTreeMap<&str, Vec<StoredError>> = BTreeMap::new();
    for record in &result.errors {
        let errors = files.entry(record.file_path.as_str()).or_default();
        let error_id = record.error_id();
        match errors.iter_mut().find(|e| e.error_id == error_id) {
            Some(existing) => existing.absorb(record),
            None => errors.push(StoredError::new(job_id, record.clone())),
        }
    }
    files
        .into_iter()
        .map(|(file_path, errors)| FileErrors {
            job_id,
            file_path: file_path.to_string(),
            errors,
        })
        .collect()
}

pub fn file_index(job_id: u64, groups: &[FileErrors]) -> FileIndex {
    let mut files: Vec<FileEntry> = groups
        .iter()
        .map(|group| FileEntry {
            file_path: group.file_path.clone(),
            error_count: group.errors.iter().map(StoredError::occurrence_count).sum(),
        })
        .collect();
    files.sort_by(|a, b| {
        b.error_count
            .cmp(&a.error_count)
            .then_with(|| a.file_path.cmp(&b.file_path))
    });
    FileIndex { job_id, files }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn result(errors: Vec<ErrorRecord>) -> ParseResult {
        ParseResult::new("pytest", TestFramework::Pytest, errors, Vec::new(), Map::new())
    }

    #[test]
    fn test_group_by_file_and_index() {
        let result = result(vec![
            ErrorRecord::new("a", ErrorCategory::Test).with_location("tests/test_a.py", Some(3)),
            ErrorRecord::new("b", ErrorCategory::Test).with_location("tests/test_b.py", Some(9)),
            ErrorRecord::new("c", ErrorCategory::Test).with_location("tests/test_b.py", Some(12)),
        ]);
        let groups = group_by_file(7, &result);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1].errors[1].record.message, "c");

        let index = file_index(7, &groups);
        assert_eq!(index.files[0].file_path, "tests/test_b.py");
        assert_eq!(index.files[0].error_count, 2);
    }

    #[test]
    fn test_repeated_error_ids_collapse_with_occurrences() {
        let failure = |test: &str, line: usize| {
            let mut record = ErrorRecord::new("assert 1 == 2", ErrorCategory::Test)
                .with_exception("AssertionError")
                .with_location("tests/test_x.py", Some(4))
                .at_line(line);
            record.test_name = Some(test.to_string());
            record
        };
        let result = result(vec![
            failure("test_x[1]", 10),
            failure("test_x[2]", 20),
            ErrorRecord::new("other", ErrorCategory::Test).with_location("tests/test_x.py", Some(9)),
        ]);

        let ids = distinct_error_ids(&result);
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], result.errors[0].error_id());

        let groups = group_by_file(5, &result);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].errors.len(), 2);
        let repeated = &groups[0].errors[0];
        let names: Vec<_> = repeated
            .occurrences
            .iter()
            .map(|o| (o.test_name.as_deref(), o.trace_line))
            .collect();
        assert_eq!(names, [(Some("test_x[1]"), Some(10)), (Some("test_x[2]"), Some(20))]);
        assert!(groups[0].errors[1].occurrences.is_empty());
        assert_eq!(file_index(5, &groups).files[0].error_count, 3);
    }

    #[test]
    fn test_stored_error_flattens_record() {
        let record = ErrorRecord::new("boom", ErrorCategory::Runtime)
            .with_exception("ValueError")
            .with_location("app/x.py", Some(1));
        let stored = StoredError::new(3, record.clone());
        let json = serde_json::to_value(&stored).unwrap();
        assert_eq!(json["error_id"], record.error_id());
        assert_eq!(json["message"], "boom");
        let back: StoredError = serde_json::from_value(json).unwrap();
        assert_eq!(back, stored);
    }

    #[test]
    fn test_error_patterns_group_across_jobs() {
        let a = ErrorRecord::new("duplicate key 17", ErrorCategory::Database)
            .with_exception("IntegrityError");
        let b = ErrorRecord::new("duplicate key 42", ErrorCategory::Database)
            .with_exception("IntegrityError");
        let c = ErrorRecord::new("boom", ErrorCategory::Runtime).with_exception("ValueError");

        let patterns = error_patterns([(1, &a), (2, &b), (2, &c)]);
        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[0].occurrences, 2);
        assert_eq!(patterns[0].job_ids, BTreeSet::from([1, 2]));
    }
}
