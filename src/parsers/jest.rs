//! Parser for Jest test runner output

use super::clean::{clean_trace, context_window, is_noise, is_vendored_path};
use super::{
    ErrorCategory, ErrorRecord, LogParser, ParseOptions, ParseResult, TestSummary,
    WarningRecord, UNKNOWN_FILE,
};
use crate::framework::TestFramework;
use regex::{Captures, Regex};
use serde_json::{json, Map};
use std::sync::OnceLock;

/// Lines searched above a failure for the test it belongs to
const NAME_LOOKBEHIND: usize = 10;
/// Lines searched below a failure for its stack location
const STACK_LOOKAHEAD: usize = 15;
/// Lines searched below an assertion for its Expected/Received values
const DIFF_LOOKAHEAD: usize = 8;

struct FailurePattern {
    regex: Regex,
    category: ErrorCategory,
    exception: Option<&'static str>,
}

fn failure_patterns() -> &'static [FailurePattern] {
    static FAILURE_PATTERNS: OnceLock<Vec<FailurePattern>> = OnceLock::new();
    FAILURE_PATTERNS.get_or_init(|| {
        let pattern = |p: &str, category, exception| FailurePattern {
            regex: Regex::new(p).expect("Invalid jest failure regex"),
            category,
            exception,
        };
        vec![
            pattern(
                r"^\s*(?P<exc>SyntaxError):\s*(?P<msg>.+)$",
                ErrorCategory::Syntax,
                None,
            ),
            pattern(
                r"(?P<msg>Cannot find module '(?P<module>[^']+)'(?: from '(?P<from>[^']+)')?)",
                ErrorCategory::Import,
                Some("ModuleNotFoundError"),
            ),
            pattern(
                r"^\s*(?P<msg>expect\([^)]*\)\.(?:not\.|resolves\.|rejects\.)?(?P<matcher>to\w+)\(.*)$",
                ErrorCategory::Assertion,
                Some("JestAssertionError"),
            ),
            pattern(
                r"(?P<msg>Exceeded timeout of (?P<timeout>\d+)\s*ms.*)$",
                ErrorCategory::Timeout,
                Some("TimeoutError"),
            ),
            pattern(
                r"^\s*(?P<exc>TypeError|ReferenceError|RangeError):\s*(?P<msg>.+)$",
                ErrorCategory::Runtime,
                None,
            ),
        ]
    })
}

struct JestPatterns {
    banner: Regex,
    header: Regex,
    label: Regex,
    code_frame: Regex,
    stack: Regex,
    expected: Regex,
    received: Regex,
    tests_line: Regex,
    suites_line: Regex,
    time_line: Regex,
    count: Regex,
    node_warning: Regex,
}

fn patterns() -> &'static JestPatterns {
    static PATTERNS: OnceLock<JestPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |p: &str| Regex::new(p).expect("Invalid jest regex");
        JestPatterns {
            banner: re(r"^\s*(?P<status>PASS|FAIL)\s+(?P<file>\S+)"),
            header: re(r"^\s*● (?P<name>.+?)\s*$"),
            label: re(r#"\b(?:describe|it|test)(?:\.\w+)?\(\s*['"`](?P<name>[^'"`]+)['"`]"#),
            code_frame: re(r"^\s*>?\s*\d+\s*\||^\s*\|"),
            stack: re(r"^\s*at (?:.*?\()?(?P<file>[^()\s]+?):(?P<line>\d+):(?P<col>\d+)\)?\s*$"),
            expected: re(r"^\s*Expected(?: value)?:\s*(?P<value>.+)$"),
            received: re(r"^\s*Received(?: value)?:\s*(?P<value>.+)$"),
            tests_line: re(r"^\s*Tests:\s+(?P<body>.+)$"),
            suites_line: re(r"^\s*Test Suites:\s+(?P<body>.+)$"),
            time_line: re(r"^\s*Time:\s+(?P<value>[\d.]+)\s*(?P<unit>ms|s)\b"),
            count: re(r"(?P<n>\d+) (?P<kind>failed|passed|skipped|todo|total)"),
            node_warning: re(r"^\(node:\d+\) (?P<exc>\w*Warning): (?P<msg>.+)$"),
        }
    })
}

fn counts(body: &str) -> Map<String, serde_json::Value> {
    let mut map = Map::new();
    for caps in patterns().count.captures_iter(body) {
        let n: u32 = caps["n"].parse().unwrap_or(0);
        map.insert(caps["kind"].to_string(), json!(n));
    }
    map
}

fn count_of(map: &Map<String, serde_json::Value>, key: &str) -> u32 {
    map.get(key)
        .and_then(|v| v.as_u64())
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0)
}

/// `●` header being read, flushed as a record if nothing more specific matched inside it
#[derive(Debug)]
struct OpenBlock {
    name: String,
    start: usize,
    file: Option<String>,
    produced: bool,
}

/// Parser for Jest runs
#[derive(Debug, Default, Clone, Copy)]
pub struct JestParser;

impl JestParser {
    fn test_name_before(lines: &[&str], idx: usize) -> Option<String> {
        let p = patterns();
        let floor = idx.saturating_sub(NAME_LOOKBEHIND);
        lines[floor..idx].iter().rev().find_map(|line| {
            p.header
                .captures(line)
                .or_else(|| p.label.captures(line))
                .map(|c| c["name"].to_string())
        })
    }

    /// First `at ... (file:line:col)` below `idx` that is not in installed packages
    fn location_after(
        lines: &[&str],
        idx: usize,
        options: &ParseOptions,
    ) -> Option<(String, u32, u32)> {
        let end = (idx + 1 + STACK_LOOKAHEAD).min(lines.len());
        lines[(idx + 1).min(end)..end].iter().find_map(|line| {
            let caps = patterns().stack.captures(line)?;
            let file = &caps["file"];
            if is_vendored_path(file, &options.exclude_paths)
                || file.starts_with("node:")
                || file.starts_with("internal/")
            {
                return None;
            }
            Some((
                file.to_string(),
                caps["line"].parse().ok()?,
                caps["col"].parse().ok()?,
            ))
        })
    }

    fn build_record(
        lines: &[&str],
        idx: usize,
        pattern: &FailurePattern,
        caps: &Captures<'_>,
        block: Option<&OpenBlock>,
        current_file: Option<&str>,
        options: &ParseOptions,
    ) -> ErrorRecord {
        let message = caps
            .name("msg")
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_else(|| lines[idx].trim().to_string());
        let mut record = ErrorRecord::new(message, pattern.category)
            .with_context(context_window(lines, idx, options.context_lines))
            .at_line(idx);
        record.exception_type = caps
            .name("exc")
            .map(|m| m.as_str().to_string())
            .or_else(|| pattern.exception.map(str::to_string));

        let test_name =
            Self::test_name_before(lines, idx).or_else(|| block.map(|b| b.name.clone()));
        Self::attach_test_name(&mut record, test_name);

        if let Some(module) = caps.name("module") {
            record = record.with_detail("module", module.as_str());
        }
        if let Some(matcher) = caps.name("matcher") {
            record = record.with_detail("matcher", matcher.as_str());
            let end = (idx + 1 + DIFF_LOOKAHEAD).min(lines.len());
            for line in &lines[idx + 1..end] {
                if let Some(c) = patterns().expected.captures(line) {
                    record = record.with_detail("expected", c["value"].trim());
                } else if let Some(c) = patterns().received.captures(line) {
                    record = record.with_detail("received", c["value"].trim());
                }
            }
        }
        if let Some(timeout) = caps.name("timeout").and_then(|m| m.as_str().parse::<u64>().ok()) {
            record = record.with_detail("timeout_ms", timeout);
        }

        let fallback_file = caps
            .name("from")
            .map(|m| m.as_str().to_string())
            .or_else(|| block.and_then(|b| b.file.clone()))
            .or_else(|| current_file.map(str::to_string));
        Self::locate(&mut record, lines, idx, fallback_file, options);
        record
    }

    fn attach_test_name(record: &mut ErrorRecord, test_name: Option<String>) {
        let Some(name) = test_name.filter(|n| n != "Test suite failed to run") else {
            return;
        };
        record.test_function = name.rsplit(" › ").next().map(|s| s.trim().to_string());
        record.test_name = Some(name);
    }

    fn locate(
        record: &mut ErrorRecord,
        lines: &[&str],
        idx: usize,
        fallback_file: Option<String>,
        options: &ParseOptions,
    ) {
        match Self::location_after(lines, idx, options) {
            Some((file, line, col)) => {
                record.file_path = file;
                record.line_number = Some(line);
                record.column = Some(col);
                record.has_traceback = true;
            }
            None => {
                record.file_path = fallback_file.unwrap_or_else(|| UNKNOWN_FILE.to_string());
            }
        }
    }

    fn flush_block(
        block: Option<OpenBlock>,
        lines: &[&str],
        options: &ParseOptions,
        errors: &mut Vec<ErrorRecord>,
    ) {
        let Some(block) = block.filter(|b| !b.produced) else {
            return;
        };
        let mut record = ErrorRecord::new(block.name.clone(), ErrorCategory::Test)
            .with_context(context_window(lines, block.start, options.context_lines))
            .at_line(block.start);
        Self::attach_test_name(&mut record, Some(block.name.clone()));
        Self::locate(&mut record, lines, block.start, block.file, options);
        errors.push(record);
    }
}

impl LogParser for JestParser {
    fn parser_type(&self) -> &'static str {
        "jest"
    }

    fn framework(&self) -> TestFramework {
        TestFramework::Jest
    }

    fn parse(&self, trace: &str, options: &ParseOptions) -> ParseResult {
        let p = patterns();
        let cleaned = clean_trace(trace);
        let lines: Vec<&str> = cleaned.lines().collect();

        let mut errors: Vec<ErrorRecord> = Vec::new();
        let mut warnings: Vec<WarningRecord> = Vec::new();
        let mut current_file: Option<String> = None;
        let mut failed_files: Vec<String> = Vec::new();
        let mut block: Option<OpenBlock> = None;
        let mut tests_counts = Map::new();
        let mut suites_counts = Map::new();
        let mut duration: Option<f64> = None;

        for (idx, &line) in lines.iter().enumerate() {
            if line.trim().is_empty() || is_noise(line) {
                continue;
            }

            if let Some(caps) = p.banner.captures(line) {
                Self::flush_block(block.take(), &lines, options, &mut errors);
                let file = caps["file"].to_string();
                if &caps["status"] == "FAIL" && !failed_files.contains(&file) {
                    failed_files.push(file.clone());
                }
                current_file = Some(file);
                continue;
            }
            if let Some(caps) = p.header.captures(line) {
                Self::flush_block(block.take(), &lines, options, &mut errors);
                block = Some(OpenBlock {
                    name: caps["name"].to_string(),
                    start: idx,
                    file: current_file.clone(),
                    produced: false,
                });
                continue;
            }
            if let Some(caps) = p.tests_line.captures(line) {
                Self::flush_block(block.take(), &lines, options, &mut errors);
                tests_counts = counts(&caps["body"]);
                continue;
            }
            if let Some(caps) = p.suites_line.captures(line) {
                Self::flush_block(block.take(), &lines, options, &mut errors);
                suites_counts = counts(&caps["body"]);
                continue;
            }
            if let Some(caps) = p.time_line.captures(line) {
                let value: f64 = caps["value"].parse().unwrap_or(0.0);
                duration = Some(if &caps["unit"] == "ms" { value / 1000.0 } else { value });
                continue;
            }
            if p.code_frame.is_match(line) || line.trim_start().starts_with("at ") {
                continue;
            }
            if let Some(caps) = p.node_warning.captures(line) {
                warnings.push(WarningRecord {
                    message: caps["msg"].trim().to_string(),
                    line_number: idx + 1,
                    warning_type: Some(caps["exc"].to_string()),
                    context: None,
                });
                continue;
            }
            if line.trim() == "console.warn" {
                if let Some(next) = lines.get(idx + 1).map(|l| l.trim()).filter(|l| !l.is_empty()) {
                    warnings.push(WarningRecord {
                        message: next.to_string(),
                        line_number: idx + 2,
                        warning_type: Some("console.warn".to_string()),
                        context: None,
                    });
                }
                continue;
            }

            let matched = failure_patterns()
                .iter()
                .find_map(|fp| fp.regex.captures(line).map(|caps| (fp, caps)));
            if let Some((pattern, caps)) = matched {
                let record = Self::build_record(
                    &lines,
                    idx,
                    pattern,
                    &caps,
                    block.as_ref(),
                    current_file.as_deref(),
                    options,
                );
                if let Some(open) = block.as_mut() {
                    open.produced = true;
                }
                let duplicate = errors.iter().any(|e| {
                    e.message == record.message
                        && e.test_name == record.test_name
                        && e.file_path == record.file_path
                });
                if !duplicate {
                    errors.push(record);
                }
            }
        }
        Self::flush_block(block.take(), &lines, options, &mut errors);

        let mut summary = Map::new();
        if !tests_counts.is_empty() {
            let skipped = count_of(&tests_counts, "skipped") + count_of(&tests_counts, "todo");
            let test_summary = TestSummary {
                total: count_of(&tests_counts, "total"),
                passed: count_of(&tests_counts, "passed"),
                failed: count_of(&tests_counts, "failed"),
                skipped,
                errors: 0,
                duration_seconds: duration,
            };
            summary.insert("test_summary".to_string(), json!(test_summary));
        }
        if !suites_counts.is_empty() {
            summary.insert("test_suites".to_string(), json!(suites_counts));
        }
        summary.insert("failed_files".to_string(), json!(failed_files));

        ParseResult::new(
            self.parser_type(),
            self.framework(),
            errors,
            warnings,
            summary,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUN: &str = r#"$ npx jest --ci
PASS src/utils/format.test.js
FAIL src/components/Button.test.js
  ● Button › renders label

    expect(received).toBe(expected) // Object.is equality

    Expected: "Submit"
    Received: "Cancel"

      10 |   it('renders label', () => {
      11 |     render(<Button label="Submit" />);
    > 12 |     expect(screen.getByRole('button').textContent).toBe('Submit');
         |                                                    ^
      13 |   });

      at Object.<anonymous> (src/components/Button.test.js:12:52)

  ● Button › loads data

    thrown: "Exceeded timeout of 5000 ms for a test.
    Add a timeout value to this test to increase the timeout, if this is a long-running test."

      at Object.<anonymous> (node_modules/jest-circus/build/utils.js:92:3)
      at Object.<anonymous> (src/components/Button.test.js:20:3)

FAIL src/api/client.test.ts
  ● Test suite failed to run

    Cannot find module './config' from 'src/api/client.ts'

Test Suites: 2 failed, 1 passed, 3 total
Tests:       2 failed, 4 passed, 6 total
Snapshots:   0 total
Time:        2.3 s
"#;

    fn parse(trace: &str) -> ParseResult {
        JestParser.parse(trace, &ParseOptions::default())
    }

    #[test]
    fn test_assertion_failure() {
        let result = parse(RUN);
        assert_eq!(result.error_count, 3);
        let error = &result.errors[0];
        assert_eq!(error.category, ErrorCategory::Assertion);
        assert_eq!(error.test_name.as_deref(), Some("Button › renders label"));
        assert_eq!(error.test_function.as_deref(), Some("renders label"));
        assert_eq!(error.file_path, "src/components/Button.test.js");
        assert_eq!(error.line_number, Some(12));
        assert_eq!(error.column, Some(52));
        assert_eq!(error.detail["matcher"], "toBe");
        assert_eq!(error.detail["expected"], "\"Submit\"");
        assert_eq!(error.detail["received"], "\"Cancel\"");
    }

    #[test]
    fn test_timeout_skips_node_modules_frames() {
        let result = parse(RUN);
        let error = &result.errors[1];
        assert_eq!(error.category, ErrorCategory::Timeout);
        assert_eq!(error.detail["timeout_ms"], 5000);
        assert_eq!(error.file_path, "src/components/Button.test.js");
        assert_eq!(error.line_number, Some(20));
    }

    #[test]
    fn test_missing_module() {
        let result = parse(RUN);
        let error = &result.errors[2];
        assert_eq!(error.category, ErrorCategory::Import);
        assert_eq!(error.detail["module"], "./config");
        assert_eq!(error.file_path, "src/api/client.ts");
        assert!(error.test_name.is_none());
    }

    #[test]
    fn test_summary_counts() {
        let result = parse(RUN);
        let summary: TestSummary =
            serde_json::from_value(result.summary["test_summary"].clone()).unwrap();
        assert_eq!(summary.total, 6);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.passed, 4);
        assert_eq!(summary.duration_seconds, Some(2.3));
        assert_eq!(result.summary["test_suites"]["failed"], 2);
        assert_eq!(
            result.summary["failed_files"],
            json!(["src/components/Button.test.js", "src/api/client.test.ts"])
        );
    }

    #[test]
    fn test_header_without_known_pattern() {
        let trace = "FAIL src/a.test.js\n  ● suite › does a thing\n\n    Error: custom failure\n\n      at Object.<anonymous> (src/a.test.js:4:11)\n";
        let result = parse(trace);
        assert_eq!(result.error_count, 1);
        let error = &result.errors[0];
        assert_eq!(error.message, "suite › does a thing");
        assert_eq!(error.category, ErrorCategory::Test);
        assert_eq!(error.line_number, Some(4));
    }

    #[test]
    fn test_runtime_error_uses_current_file() {
        let trace = "FAIL src/b.test.js\nTypeError: Cannot read properties of undefined (reading 'id')\n";
        let result = parse(trace);
        assert_eq!(result.error_count, 1);
        assert_eq!(result.errors[0].exception_type.as_deref(), Some("TypeError"));
        assert_eq!(result.errors[0].file_path, "src/b.test.js");
    }

    #[test]
    fn test_node_warning() {
        let result = parse("(node:4242) ExperimentalWarning: VM Modules is experimental\n");
        assert_eq!(result.warning_count, 1);
        assert_eq!(result.warnings[0].warning_type.as_deref(), Some("ExperimentalWarning"));
    }
}
