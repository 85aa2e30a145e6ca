//! Line-oriented parser for traces without a recognized test framework

use super::clean::{clean_trace, context_window, is_noise};
use super::{ErrorCategory, ErrorRecord, LogParser, ParseOptions, ParseResult, WarningRecord};
use crate::framework::TestFramework;
use regex::{Captures, Regex};
use serde_json::{json, Map};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// How far ahead a `rustc` diagnostic may place its `-->` location line
const LOCATION_LOOKAHEAD: usize = 3;

struct LinePattern {
    regex: Regex,
    category: ErrorCategory,
    /// Derive the category from the captured exception type instead
    classify_exception: bool,
}

impl LinePattern {
    fn new(pattern: &str, category: ErrorCategory) -> Self {
        Self {
            regex: Regex::new(pattern).expect("Invalid generic parser regex"),
            category,
            classify_exception: false,
        }
    }

    fn exception(pattern: &str) -> Self {
        Self {
            classify_exception: true,
            ..Self::new(pattern, ErrorCategory::Runtime)
        }
    }
}

fn error_patterns() -> &'static [LinePattern] {
    static ERROR_PATTERNS: OnceLock<Vec<LinePattern>> = OnceLock::new();
    ERROR_PATTERNS.get_or_init(|| {
        vec![
            LinePattern::exception(
                r"^\s*(?P<exc>(?:[A-Za-z_]\w*\.)*[A-Z]\w*(?:Error|Exception)):\s+(?P<msg>.+)$",
            ),
            LinePattern::new(
                r"^error(?:\[(?P<code>E\d{4})\])?:\s+(?P<msg>.+)$",
                ErrorCategory::Build,
            ),
            LinePattern::new(
                r"^(?P<file>[^\s:]+\.[A-Za-z]+):(?P<line>\d+):(?:(?P<col>\d+):)?\s*(?:fatal\s+)?error:\s*(?P<msg>.+)$",
                ErrorCategory::Build,
            ),
            LinePattern::new(
                r"^(?P<file>[^\s(]+\.[jt]sx?)\((?P<line>\d+),(?P<col>\d+)\):\s*error\s+(?P<code>TS\d+):\s*(?P<msg>.+)$",
                ErrorCategory::Build,
            ),
            LinePattern::new(
                r"^(?P<file>[^\s:]+\.\w+):(?P<line>\d+):(?P<col>\d+):\s+(?P<code>[A-Z]{1,4}\d{1,4})\s+(?P<msg>.+)$",
                ErrorCategory::Lint,
            ),
            LinePattern::new(
                r"(?i)^\s*(?:ERROR:\s*)?(?P<msg>(?:could not find a version that satisfies|no matching distribution found|package installation failed|failed building wheel|resolutionimpossible|npm ERR!|unable to resolve dependency|could not resolve dependencies).*)$",
                ErrorCategory::Dependency,
            ),
            LinePattern::new(
                r"^make(?:\[\d+\])?:\s+\*\*\*\s+(?P<msg>.*Error\s+\d+.*)$",
                ErrorCategory::Build,
            ),
            LinePattern::new(
                r"(?i)(?:job failed|command failed|process exited|exited)\b.*?(?:exit code|exit status|with code)\s*(?P<code>[1-9]\d*)",
                ErrorCategory::Runtime,
            ),
            LinePattern::new(
                r"^\s*(?:\[ERROR\]|ERROR:|ERROR|FATAL:|FATAL|Error:)\s+(?P<msg>\S.*)$",
                ErrorCategory::Unknown,
            ),
            LinePattern::new(r"^(?P<msg>.*: command not found)$", ErrorCategory::Runtime),
        ]
    })
}

fn warning_patterns() -> &'static [Regex] {
    static WARNING_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    WARNING_PATTERNS.get_or_init(|| {
        [
            r"^\s*(?P<file>[^\s:]+\.py):(?P<line>\d+):\s*(?P<exc>\w*Warning):\s*(?P<msg>.+)$",
            r"^\s*(?P<exc>[A-Z]\w*Warning):\s*(?P<msg>.+)$",
            r"^npm WARN\s+(?P<msg>.+)$",
            r"(?i)^\s*(?:\[WARN(?:ING)?\]|WARN(?:ING)?:?)\s+(?P<msg>\S.*)$",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("Invalid generic warning regex"))
        .collect()
    })
}

fn location_regex() -> &'static Regex {
    static LOCATION_REGEX: OnceLock<Regex> = OnceLock::new();
    LOCATION_REGEX.get_or_init(|| {
        Regex::new(r"^\s*-->\s*(?P<file>[^:\s]+):(?P<line>\d+):(?P<col>\d+)")
            .expect("Invalid location regex")
    })
}

fn capture_u32(caps: &Captures<'_>, name: &str) -> Option<u32> {
    caps.name(name).and_then(|m| m.as_str().parse().ok())
}

/// Parser that classifies individual lines against ordered error and warning patterns
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericParser;

impl GenericParser {
    /// Scan already-cleaned lines. Each line is classified at most once: errors are
    /// tried before warnings and the first matching pattern wins.
    pub fn scan_lines(
        lines: &[&str],
        options: &ParseOptions,
    ) -> (Vec<ErrorRecord>, Vec<WarningRecord>) {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for (idx, line) in lines.iter().enumerate() {
            if line.trim().is_empty() || is_noise(line) {
                continue;
            }

            if let Some(record) = Self::match_error(lines, idx, options) {
                errors.push(record);
                continue;
            }

            if let Some(caps) = warning_patterns().iter().find_map(|re| re.captures(line)) {
                let message = caps
                    .name("msg")
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_else(|| line.trim().to_string());
                warnings.push(WarningRecord {
                    message,
                    line_number: idx + 1,
                    warning_type: caps.name("exc").map(|m| m.as_str().to_string()),
                    context: context_window(lines, idx, options.context_lines),
                });
            }
        }

        (errors, warnings)
    }

    fn match_error(lines: &[&str], idx: usize, options: &ParseOptions) -> Option<ErrorRecord> {
        let line = lines[idx];
        let (pattern, caps) = error_patterns()
            .iter()
            .find_map(|p| p.regex.captures(line).map(|caps| (p, caps)))?;

        let message = caps
            .name("msg")
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_else(|| line.trim().to_string());

        let exception_type = caps.name("exc").map(|m| m.as_str().to_string());
        let category = match (&exception_type, pattern.classify_exception) {
            (Some(exc), true) => match ErrorCategory::from_exception(exc) {
                ErrorCategory::Test => ErrorCategory::Runtime,
                other => other,
            },
            _ => pattern.category,
        };

        let mut record = ErrorRecord::new(message, category)
            .with_context(context_window(lines, idx, options.context_lines))
            .at_line(idx);
        record.exception_type = exception_type;

        if let Some(file) = caps.name("file") {
            record.file_path = file.as_str().to_string();
            record.line_number = capture_u32(&caps, "line");
            record.column = capture_u32(&caps, "col");
        } else if pattern.category == ErrorCategory::Build {
            let end = (idx + 1 + LOCATION_LOOKAHEAD).min(lines.len());
            if let Some(loc) = lines[idx + 1..end]
                .iter()
                .find_map(|l| location_regex().captures(l))
            {
                record.file_path = loc["file"].to_string();
                record.line_number = capture_u32(&loc, "line");
                record.column = capture_u32(&loc, "col");
            }
        }

        if let Some(code) = caps.name("code") {
            let key = if pattern.category == ErrorCategory::Runtime {
                "exit_code"
            } else {
                "code"
            };
            record = record.with_detail(key, code.as_str());
        }

        Some(record)
    }
}

impl LogParser for GenericParser {
    fn parser_type(&self) -> &'static str {
        "generic"
    }

    fn framework(&self) -> TestFramework {
        TestFramework::Generic
    }

    fn parse(&self, trace: &str, options: &ParseOptions) -> ParseResult {
        let cleaned = clean_trace(trace);
        let lines: Vec<&str> = cleaned.lines().collect();
        let (errors, warnings) = Self::scan_lines(&lines, options);

        let mut categories: BTreeMap<&str, usize> = BTreeMap::new();
        for error in &errors {
            *categories.entry(error.category.as_str()).or_default() += 1;
        }

        let mut summary = Map::new();
        summary.insert("lines_scanned".to_string(), json!(lines.len()));
        summary.insert("error_categories".to_string(), json!(categories));

        ParseResult::new(
            self.parser_type(),
            self.framework(),
            errors,
            warnings,
            summary,
        )
    }
}
