use crate::framework::TestFramework;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Placeholder used when a record cannot be attributed to a source file
pub const UNKNOWN_FILE: &str = "unknown";

/// Number of hex characters kept from the SHA-256 digest of an error's identity
const ERROR_ID_LEN: usize = 16;

/// Broad classification of an extracted error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Test,
    Assertion,
    Syntax,
    Import,
    Dependency,
    Build,
    Lint,
    Timeout,
    Database,
    Validation,
    Configuration,
    QualityGate,
    Runtime,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Test => "test",
            ErrorCategory::Assertion => "assertion",
            ErrorCategory::Syntax => "syntax",
            ErrorCategory::Import => "import",
            ErrorCategory::Dependency => "dependency",
            ErrorCategory::Build => "build",
            ErrorCategory::Lint => "lint",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Database => "database",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::QualityGate => "quality_gate",
            ErrorCategory::Runtime => "runtime",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Short remediation hint included in `fixing` and `full` responses
    pub fn fix_guidance(&self) -> &'static str {
        match self {
            ErrorCategory::Test => "Inspect the failing test and the code path it exercises.",
            ErrorCategory::Assertion => {
                "Compare expected and actual values; update the code or the expectation."
            }
            ErrorCategory::Syntax => "Fix the syntax error at the reported file and line.",
            ErrorCategory::Import => {
                "Check the module path, package installation and PYTHONPATH/moduleDirectories."
            }
            ErrorCategory::Dependency => {
                "Verify the package name and version pin, and that the index is reachable."
            }
            ErrorCategory::Build => "Fix the compiler diagnostic at the reported location.",
            ErrorCategory::Lint => "Apply the linter rule or add a justified suppression.",
            ErrorCategory::Timeout => {
                "Look for hanging I/O or raise the timeout for legitimately slow tests."
            }
            ErrorCategory::Database => {
                "Check fixtures, migrations and constraints touched by the failing code."
            }
            ErrorCategory::Validation => "Check the input data against the model or form rules.",
            ErrorCategory::Configuration => {
                "Check settings modules, environment variables and installed apps."
            }
            ErrorCategory::QualityGate => {
                "Open the quality gate dashboard and resolve the failing conditions."
            }
            ErrorCategory::Runtime => "Follow the traceback to the first frame in project code.",
            ErrorCategory::Unknown => "Read the surrounding log context for the root cause.",
        }
    }

    /// Classify a Python/JS exception type name
    pub fn from_exception(exception_type: &str) -> Self {
        let short = exception_type.rsplit('.').next().unwrap_or(exception_type);
        match short {
            "AssertionError" => ErrorCategory::Assertion,
            "SyntaxError" | "IndentationError" | "TabError" => ErrorCategory::Syntax,
            "ImportError" | "ModuleNotFoundError" => ErrorCategory::Import,
            "TimeoutError" | "Timeout" | "TimeoutExpired" => ErrorCategory::Timeout,
            "IntegrityError" | "OperationalError" | "DatabaseError" | "ProgrammingError"
            | "DoesNotExist" | "MultipleObjectsReturned" | "TransactionManagementError" => {
                ErrorCategory::Database
            }
            "ValidationError" => ErrorCategory::Validation,
            "ImproperlyConfigured" | "TemplateDoesNotExist" | "NoReverseMatch" => {
                ErrorCategory::Configuration
            }
            _ => ErrorCategory::Test,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stack frame extracted from a traceback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracebackFrame {
    pub file_path: String,
    pub line_number: u32,
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_line: Option<String>,
}

/// Normalized error extracted from a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub message: String,
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_type: Option<String>,
    pub category: ErrorCategory,
    pub has_traceback: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traceback: Vec<TracebackFrame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
    /// Zero-based line index in the cleaned trace where the error was found
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_line: Option<usize>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub detail: BTreeMap<String, Value>,
}

impl ErrorRecord {
    pub fn new(message: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            message: message.into(),
            file_path: UNKNOWN_FILE.to_string(),
            line_number: None,
            column: None,
            exception_type: None,
            category,
            has_traceback: false,
            traceback: Vec::new(),
            context: None,
            test_function: None,
            test_name: None,
            trace_line: None,
            detail: BTreeMap::new(),
        }
    }

    pub fn with_location(mut self, file_path: impl Into<String>, line_number: Option<u32>) -> Self {
        self.file_path = file_path.into();
        self.line_number = line_number;
        self
    }

    pub fn with_exception(mut self, exception_type: impl Into<String>) -> Self {
        self.exception_type = Some(exception_type.into());
        self
    }

    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context.filter(|c| !c.is_empty());
        self
    }

    pub fn at_line(mut self, trace_line: usize) -> Self {
        self.trace_line = Some(trace_line);
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.detail.insert(key.to_string(), value.into());
        self
    }

    pub fn has_known_file(&self) -> bool {
        self.file_path != UNKNOWN_FILE
    }

    /// Stable identifier derived from the error's identity fields
    pub fn error_id(&self) -> String {
        error_id(
            self.exception_type.as_deref(),
            &self.message,
            &self.file_path,
            self.line_number,
        )
    }
}

/// Derive the stable id of an error.
///
/// The same `(exception_type, message, file_path, line_number)` always maps to the same
/// id, and any difference in one of the fields yields a different id.
pub fn error_id(
    exception_type: Option<&str>,
    message: &str,
    file_path: &str,
    line_number: Option<u32>,
) -> String {
    // Serializing the tuple keeps field boundaries unambiguous
    let identity = serde_json::to_string(&(exception_type, message, file_path, line_number))
        .unwrap_or_default();
    let digest = Sha256::digest(identity.as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(ERROR_ID_LEN);
    id
}

/// Warning line extracted from a trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningRecord {
    pub message: String,
    pub line_number: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Aggregate counts reported by a test runner footer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub errors: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

/// Knobs shared by every parser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOptions {
    /// Keep extracted traceback frames on each record
    pub include_traceback: bool,
    /// Lines of context captured on each side of a matched line
    pub context_lines: usize,
    /// Extra path fragments treated as third-party code when locating the failing frame
    pub exclude_paths: Vec<String>,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            include_traceback: true,
            context_lines: 2,
            exclude_paths: Vec::new(),
        }
    }
}

/// Output of a parser run; never mutated once produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseResult {
    pub parser_type: String,
    pub framework: TestFramework,
    pub errors: Vec<ErrorRecord>,
    pub error_count: usize,
    pub warnings: Vec<WarningRecord>,
    pub warning_count: usize,
    pub summary: Map<String, Value>,
}

impl ParseResult {
    pub fn new(
        parser_type: impl Into<String>,
        framework: TestFramework,
        errors: Vec<ErrorRecord>,
        warnings: Vec<WarningRecord>,
        summary: Map<String, Value>,
    ) -> Self {
        Self {
            parser_type: parser_type.into(),
            framework,
            error_count: errors.len(),
            errors,
            warning_count: warnings.len(),
            warnings,
            summary,
        }
    }

    pub fn empty(parser_type: impl Into<String>, framework: TestFramework) -> Self {
        Self::new(parser_type, framework, Vec::new(), Vec::new(), Map::new())
    }

    /// Whether the reported counts and tag agree with the collections
    pub fn is_well_formed(&self) -> bool {
        !self.parser_type.is_empty()
            && self.error_count == self.errors.len()
            && self.warning_count == self.warnings.len()
    }

    /// Recompute counts from the collections
    pub fn normalize(&mut self) {
        self.error_count = self.errors.len();
        self.warning_count = self.warnings.len();
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}
