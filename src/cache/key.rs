//! Deterministic cache key construction

use super::models::DataType;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Hex characters of the file path digest embedded in keys
const FILE_HASH_LEN: usize = 16;

/// Builder for cache keys.
///
/// The same logical request always produces the same key: identifiers appear in a fixed
/// order, file paths are hashed, and extra parameters are sorted by name.
///
/// ```
/// use failtrace::cache::{CacheKey, DataType};
///
/// let key = CacheKey::new(DataType::Error, 7).job(42).param("error_id", "ab12").build();
/// assert_eq!(key, "error:p7:j42:error_id=ab12");
/// ```
#[derive(Debug, Clone)]
pub struct CacheKey {
    data_type: DataType,
    project_id: u64,
    pipeline_id: Option<u64>,
    job_id: Option<u64>,
    file_path: Option<String>,
    params: BTreeMap<String, String>,
}

impl CacheKey {
    pub fn new(data_type: DataType, project_id: u64) -> Self {
        Self {
            data_type,
            project_id,
            pipeline_id: None,
            job_id: None,
            file_path: None,
            params: BTreeMap::new(),
        }
    }

    pub fn pipeline(mut self, pipeline_id: u64) -> Self {
        self.pipeline_id = Some(pipeline_id);
        self
    }

    pub fn job(mut self, job_id: u64) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn file(mut self, file_path: impl Into<String>) -> Self {
        self.file_path = Some(file_path.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn build(&self) -> String {
        let mut key = format!("{}:p{}", self.data_type, self.project_id);
        if let Some(pipeline_id) = self.pipeline_id {
            key.push_str(&format!(":pl{pipeline_id}"));
        }
        if let Some(job_id) = self.job_id {
            key.push_str(&format!(":j{job_id}"));
        }
        if let Some(path) = &self.file_path {
            key.push_str(":f");
            key.push_str(&hash_path(path));
        }
        if !self.params.is_empty() {
            let params: Vec<String> = self
                .params
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect();
            key.push(':');
            key.push_str(&params.join(","));
        }
        key
    }

    pub fn pipeline_record(project_id: u64, pipeline_id: u64) -> String {
        Self::new(DataType::Pipeline, project_id)
            .pipeline(pipeline_id)
            .build()
    }

    pub fn pipeline_analysis(project_id: u64, pipeline_id: u64) -> String {
        Self::new(DataType::Analysis, project_id)
            .pipeline(pipeline_id)
            .build()
    }

    pub fn error_patterns(project_id: u64, pipeline_id: u64) -> String {
        Self::new(DataType::ErrorPatterns, project_id)
            .pipeline(pipeline_id)
            .build()
    }

    pub fn job_record(project_id: u64, job_id: u64) -> String {
        Self::new(DataType::Job, project_id).job(job_id).build()
    }

    /// Full parse result of one job
    pub fn job_analysis(project_id: u64, job_id: u64) -> String {
        Self::new(DataType::Analysis, project_id).job(job_id).build()
    }

    pub fn job_trace(project_id: u64, job_id: u64) -> String {
        Self::new(DataType::Trace, project_id).job(job_id).build()
    }

    pub fn file_index(project_id: u64, job_id: u64) -> String {
        Self::new(DataType::FileIndex, project_id).job(job_id).build()
    }

    pub fn file_errors(project_id: u64, job_id: u64, file_path: &str) -> String {
        Self::new(DataType::FileErrors, project_id)
            .job(job_id)
            .file(file_path)
            .build()
    }

    pub fn error(project_id: u64, job_id: u64, error_id: &str) -> String {
        Self::new(DataType::Error, project_id)
            .job(job_id)
            .param("error_id", error_id)
            .build()
    }
}

fn hash_path(path: &str) -> String {
    let mut digest = hex::encode(Sha256::digest(path.as_bytes()));
    digest.truncate(FILE_HASH_LEN);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_deterministic() {
        let a = CacheKey::new(DataType::Resource, 1)
            .job(5)
            .param("uri", "gl://job/1/5")
            .param("mode", "full")
            .build();
        let b = CacheKey::new(DataType::Resource, 1)
            .job(5)
            .param("mode", "full")
            .param("uri", "gl://job/1/5")
            .build();
        assert_eq!(a, b);
        assert_eq!(a, "resource:p1:j5:mode=full,uri=gl://job/1/5");
    }

    #[test]
    fn test_file_path_is_hashed() {
        let key = CacheKey::file_errors(3, 9, "app/models.py");
        assert!(key.starts_with("file_errors:p3:j9:f"));
        assert!(!key.contains("models.py"));
        assert_ne!(key, CacheKey::file_errors(3, 9, "app/views.py"));
    }

    #[test]
    fn test_record_keys_differ_by_type() {
        assert_eq!(CacheKey::pipeline_record(1, 2), "pipeline:p1:pl2");
        assert_eq!(CacheKey::pipeline_analysis(1, 2), "analysis:p1:pl2");
        assert_eq!(CacheKey::job_analysis(1, 2), "analysis:p1:j2");
        assert_eq!(CacheKey::job_record(1, 2), "job:p1:j2");
    }
}
