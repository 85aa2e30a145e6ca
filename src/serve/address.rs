//! Resource address grammar
//!
//! ```text
//! gl://pipeline/{project}/{pipeline}[/jobs]
//! gl://analysis/{project}/{pipeline}
//! gl://job/{project}/{job}[/problems|/errors]
//! gl://file/{project}/{job}/{path...}/errors
//! gl://error/{project}/{job}/{error_id}[/trace/{mode}]
//! ```
//!
//! Any address may carry `?mode=minimal|balanced|fixing|full`.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const SCHEME: &str = "gl://";

pub const SUPPORTED_PATTERNS: &[&str] = &[
    "gl://pipeline/{project_id}/{pipeline_id}",
    "gl://pipeline/{project_id}/{pipeline_id}/jobs",
    "gl://analysis/{project_id}/{pipeline_id}",
    "gl://job/{project_id}/{job_id}",
    "gl://job/{project_id}/{job_id}/problems",
    "gl://job/{project_id}/{job_id}/errors",
    "gl://file/{project_id}/{job_id}/{file_path}/errors",
    "gl://error/{project_id}/{job_id}/{error_id}",
    "gl://error/{project_id}/{job_id}/{error_id}/trace/{mode}",
];

crate::define_id_enum! {
    /// How much of each error record a response carries
    ResponseMode {
        Minimal => "minimal" : "Minimal",
        Balanced => "balanced" : "Balanced",
        Fixing => "fixing" : "Fixing",
        Full => "full" : "Full",
    }
}

impl Default for ResponseMode {
    fn default() -> Self {
        ResponseMode::Balanced
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("resource address must start with 'gl://': '{0}'")]
    Scheme(String),

    #[error("unsupported resource address '{0}'")]
    Unsupported(String),

    #[error("invalid {field} '{value}' in resource address")]
    InvalidId { field: &'static str, value: String },

    #[error("{0}")]
    InvalidMode(String),
}

impl AddressError {
    pub fn supported_patterns(&self) -> &'static [&'static str] {
        SUPPORTED_PATTERNS
    }
}

/// Typed form of a resource address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceAddress {
    Pipeline { project_id: u64, pipeline_id: u64 },
    PipelineJobs { project_id: u64, pipeline_id: u64 },
    Analysis { project_id: u64, pipeline_id: u64 },
    Job { project_id: u64, job_id: u64 },
    JobProblems { project_id: u64, job_id: u64 },
    JobErrors { project_id: u64, job_id: u64 },
    FileErrors { project_id: u64, job_id: u64, file_path: String },
    Error { project_id: u64, job_id: u64, error_id: String },
    ErrorTrace {
        project_id: u64,
        job_id: u64,
        error_id: String,
        mode: ResponseMode,
    },
}

impl ResourceAddress {
    pub fn project_id(&self) -> u64 {
        match self {
            ResourceAddress::Pipeline { project_id, .. }
            | ResourceAddress::PipelineJobs { project_id, .. }
            | ResourceAddress::Analysis { project_id, .. }
            | ResourceAddress::Job { project_id, .. }
            | ResourceAddress::JobProblems { project_id, .. }
            | ResourceAddress::JobErrors { project_id, .. }
            | ResourceAddress::FileErrors { project_id, .. }
            | ResourceAddress::Error { project_id, .. }
            | ResourceAddress::ErrorTrace { project_id, .. } => *project_id,
        }
    }

    pub fn pipeline_id(&self) -> Option<u64> {
        match self {
            ResourceAddress::Pipeline { pipeline_id, .. }
            | ResourceAddress::PipelineJobs { pipeline_id, .. }
            | ResourceAddress::Analysis { pipeline_id, .. } => Some(*pipeline_id),
            _ => None,
        }
    }

    pub fn job_id(&self) -> Option<u64> {
        match self {
            ResourceAddress::Job { job_id, .. }
            | ResourceAddress::JobProblems { job_id, .. }
            | ResourceAddress::JobErrors { job_id, .. }
            | ResourceAddress::FileErrors { job_id, .. }
            | ResourceAddress::Error { job_id, .. }
            | ResourceAddress::ErrorTrace { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    /// Short name of the address shape, used in responses and logs
    pub fn kind(&self) -> &'static str {
        match self {
            ResourceAddress::Pipeline { .. } => "pipeline",
            ResourceAddress::PipelineJobs { .. } => "pipeline_jobs",
            ResourceAddress::Analysis { .. } => "analysis",
            ResourceAddress::Job { .. } => "job",
            ResourceAddress::JobProblems { .. } => "job_problems",
            ResourceAddress::JobErrors { .. } => "job_errors",
            ResourceAddress::FileErrors { .. } => "file_errors",
            ResourceAddress::Error { .. } => "error",
            ResourceAddress::ErrorTrace { .. } => "error_trace",
        }
    }

    fn from_segments(uri: &str, segments: &[&str]) -> Result<Self, AddressError> {
        fn id(field: &'static str, value: &str) -> Result<u64, AddressError> {
            value.parse().map_err(|_| AddressError::InvalidId {
                field,
                value: value.to_string(),
            })
        }

        let address = match segments {
            ["pipeline", project, pipeline] => ResourceAddress::Pipeline {
                project_id: id("project_id", project)?,
                pipeline_id: id("pipeline_id", pipeline)?,
            },
            ["pipeline", project, pipeline, "jobs"] => ResourceAddress::PipelineJobs {
                project_id: id("project_id", project)?,
                pipeline_id: id("pipeline_id", pipeline)?,
            },
            ["analysis", project, pipeline] => ResourceAddress::Analysis {
                project_id: id("project_id", project)?,
                pipeline_id: id("pipeline_id", pipeline)?,
            },
            ["job", project, job] => ResourceAddress::Job {
                project_id: id("project_id", project)?,
                job_id: id("job_id", job)?,
            },
            ["job", project, job, "problems"] => ResourceAddress::JobProblems {
                project_id: id("project_id", project)?,
                job_id: id("job_id", job)?,
            },
            ["job", project, job, "errors"] => ResourceAddress::JobErrors {
                project_id: id("project_id", project)?,
                job_id: id("job_id", job)?,
            },
            ["file", project, job, path @ .., "errors"] if path.iter().any(|s| !s.is_empty()) => {
                ResourceAddress::FileErrors {
                    project_id: id("project_id", project)?,
                    job_id: id("job_id", job)?,
                    file_path: path.join("/"),
                }
            }
            ["error", project, job, error_id] => ResourceAddress::Error {
                project_id: id("project_id", project)?,
                job_id: id("job_id", job)?,
                error_id: error_id.to_string(),
            },
            ["error", project, job, error_id, "trace", mode] => ResourceAddress::ErrorTrace {
                project_id: id("project_id", project)?,
                job_id: id("job_id", job)?,
                error_id: error_id.to_string(),
                mode: mode.parse().map_err(AddressError::InvalidMode)?,
            },
            _ => return Err(AddressError::Unsupported(uri.to_string())),
        };
        Ok(address)
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(SCHEME)?;
        match self {
            ResourceAddress::Pipeline {
                project_id,
                pipeline_id,
            } => write!(f, "pipeline/{project_id}/{pipeline_id}"),
            ResourceAddress::PipelineJobs {
                project_id,
                pipeline_id,
            } => write!(f, "pipeline/{project_id}/{pipeline_id}/jobs"),
            ResourceAddress::Analysis {
                project_id,
                pipeline_id,
            } => write!(f, "analysis/{project_id}/{pipeline_id}"),
            ResourceAddress::Job { project_id, job_id } => write!(f, "job/{project_id}/{job_id}"),
            ResourceAddress::JobProblems { project_id, job_id } => {
                write!(f, "job/{project_id}/{job_id}/problems")
            }
            ResourceAddress::JobErrors { project_id, job_id } => {
                write!(f, "job/{project_id}/{job_id}/errors")
            }
            ResourceAddress::FileErrors {
                project_id,
                job_id,
                file_path,
            } => write!(f, "file/{project_id}/{job_id}/{file_path}/errors"),
            ResourceAddress::Error {
                project_id,
                job_id,
                error_id,
            } => write!(f, "error/{project_id}/{job_id}/{error_id}"),
            ResourceAddress::ErrorTrace {
                project_id,
                job_id,
                error_id,
                mode,
            } => write!(f, "error/{project_id}/{job_id}/{error_id}/trace/{mode}"),
        }
    }
}

/// A parsed address plus the response mode it asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub address: ResourceAddress,
    pub mode: ResponseMode,
}

impl ResourceRequest {
    pub fn parse(uri: &str) -> Result<Self, AddressError> {
        let trimmed = uri.trim();
        let rest = trimmed
            .strip_prefix(SCHEME)
            .ok_or_else(|| AddressError::Scheme(trimmed.to_string()))?;

        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };

        let mut mode = None;
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            if let Some(value) = pair.strip_prefix("mode=") {
                mode = Some(value.parse().map_err(AddressError::InvalidMode)?);
            }
        }

        // Empty segments are kept so absolute file paths survive the round trip
        let segments: Vec<&str> = path.trim_end_matches('/').split('/').collect();
        let address = ResourceAddress::from_segments(trimmed, &segments)?;

        // A mode in the path wins over the query
        let mode = match &address {
            ResourceAddress::ErrorTrace { mode, .. } => *mode,
            _ => mode.unwrap_or_default(),
        };
        Ok(Self { address, mode })
    }
}

impl FromStr for ResourceRequest {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yare::parameterized;

    #[parameterized(
        pipeline = { "gl://pipeline/1/2", "pipeline" },
        pipeline_jobs = { "gl://pipeline/1/2/jobs", "pipeline_jobs" },
        analysis = { "gl://analysis/1/2", "analysis" },
        job = { "gl://job/1/3", "job" },
        problems = { "gl://job/1/3/problems", "job_problems" },
        errors = { "gl://job/1/3/errors", "job_errors" },
        file = { "gl://file/1/3/src/app/models.py/errors", "file_errors" },
        error = { "gl://error/1/3/ab12cd34ef56ab12", "error" },
        error_trace = { "gl://error/1/3/ab12cd34ef56ab12/trace/full", "error_trace" },
    )]
    fn test_supported_patterns_roundtrip(uri: &str, kind: &str) {
        let request = ResourceRequest::parse(uri).unwrap();
        assert_eq!(request.address.kind(), kind);
        assert_eq!(request.address.to_string(), uri);
    }

    #[test]
    fn test_file_path_keeps_slashes() {
        let request = ResourceRequest::parse("gl://file/7/9/src/app/models.py/errors").unwrap();
        assert_eq!(
            request.address,
            ResourceAddress::FileErrors {
                project_id: 7,
                job_id: 9,
                file_path: "src/app/models.py".to_string()
            }
        );

        let absolute = ResourceAddress::FileErrors {
            project_id: 7,
            job_id: 9,
            file_path: "/builds/app/models.py".to_string(),
        };
        let request = ResourceRequest::parse(&absolute.to_string()).unwrap();
        assert_eq!(request.address, absolute);
    }

    #[test]
    fn test_mode_query_and_path() {
        let request = ResourceRequest::parse("gl://job/1/2/errors?mode=fixing").unwrap();
        assert_eq!(request.mode, ResponseMode::Fixing);

        let request = ResourceRequest::parse("gl://job/1/2").unwrap();
        assert_eq!(request.mode, ResponseMode::Balanced);

        let request = ResourceRequest::parse("gl://error/1/2/abc/trace/minimal?mode=full").unwrap();
        assert_eq!(request.mode, ResponseMode::Minimal);
    }

    #[parameterized(
        wrong_scheme = { "http://job/1/2" },
        unknown_entity = { "gl://runner/1/2" },
        missing_id = { "gl://job/1" },
        file_without_path = { "gl://file/1/2/errors" },
        trailing_segment = { "gl://job/1/2/logs" },
    )]
    fn test_rejects_unknown_shapes(uri: &str) {
        let err = ResourceRequest::parse(uri).unwrap_err();
        assert_eq!(err.supported_patterns().len(), SUPPORTED_PATTERNS.len());
    }

    #[test]
    fn test_rejects_bad_ids_and_modes() {
        assert!(matches!(
            ResourceRequest::parse("gl://job/abc/2"),
            Err(AddressError::InvalidId { field: "project_id", .. })
        ));
        assert!(matches!(
            ResourceRequest::parse("gl://job/1/2?mode=verbose"),
            Err(AddressError::InvalidMode(_))
        ));
    }
}
