//! Parser for pytest session output
//!
//! Understands the session banners pytest prints (`test session starts`, `FAILURES`,
//! `ERRORS`, `short test summary info`, `warnings summary`) and the footer with the
//! aggregate counts. Each failure block becomes one [`ErrorRecord`] carrying the test
//! function, exception and traceback frames; short summary lines fill in the node id
//! and cover failures whose detailed block was truncated or not printed.

use super::clean::{clean_trace, is_vendored_path};
use super::generic::GenericParser;
use super::{
    ErrorCategory, ErrorRecord, LogParser, ParseOptions, ParseResult, TestSummary,
    TracebackFrame, WarningRecord,
};
use crate::framework::TestFramework;
use regex::Regex;
use serde_json::{json, Map};
use std::collections::HashSet;
use std::sync::OnceLock;

/// Upper bound on block lines kept as context on a record
const MAX_CONTEXT_LINES: usize = 30;

struct PytestPatterns {
    session_start: Regex,
    section: Regex,
    block_header: Regex,
    summary_line: Regex,
    e_line: Regex,
    frame: Regex,
    exception: Regex,
    footer: Regex,
    count: Regex,
    warning: Regex,
}

fn patterns() -> &'static PytestPatterns {
    static PATTERNS: OnceLock<PytestPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |p: &str| Regex::new(p).expect("Invalid pytest regex");
        PytestPatterns {
            session_start: re(r"^=+ test session starts =+$"),
            section: re(r"^=+ (?P<title>.+?) =+$"),
            block_header: re(r"^_{3,} (?P<name>.+?) _{3,}$"),
            summary_line: re(r"^(?P<kind>FAILED|ERROR) (?P<node>\S+)(?: - (?P<msg>.*))?$"),
            e_line: re(r"^E(?:\s+(?P<text>.*))?$"),
            frame: re(r"^(?P<file>[^\s:][^:]*\.py):(?P<line>\d+):\s(?P<rest>.+)$"),
            exception: re(
                r"^(?P<exc>(?:[A-Za-z_]\w*\.)*[A-Z]\w*(?:Error|Exception|DoesNotExist|MultipleObjectsReturned|Failed|Exit))(?::\s*(?P<msg>.*))?$",
            ),
            footer: re(
                r"^=*\s*(?P<body>\d+ (?:passed|failed|skipped|errors?|deselected|xfailed|xpassed|warnings?)\b.*?) in (?P<dur>[\d.]+)s\b.*$",
            ),
            count: re(
                r"(?P<n>\d+) (?P<kind>passed|failed|skipped|errors?|deselected|xfailed|xpassed|warnings?)",
            ),
            warning: re(r"(?P<exc>[A-Z]\w*Warning): (?P<msg>.+)$"),
        }
    })
}

/// A `path:line: ...` line from a pytest traceback
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FrameLine {
    /// `path.py:12: in function_name`
    Call(TracebackFrame),
    /// `path.py:12: ExceptionType`, the location pytest reports for the failure
    Raise(TracebackFrame),
}

pub(crate) fn parse_frame_line(line: &str) -> Option<FrameLine> {
    let caps = patterns().frame.captures(line)?;
    let line_number = caps["line"].parse().ok()?;
    let file_path = caps["file"].to_string();
    let rest = caps["rest"].trim();
    match rest.strip_prefix("in ") {
        Some(function) => Some(FrameLine::Call(TracebackFrame {
            file_path,
            line_number,
            function: function.trim().to_string(),
            code_line: None,
        })),
        None => Some(FrameLine::Raise(TracebackFrame {
            file_path,
            line_number,
            function: rest.to_string(),
            code_line: None,
        })),
    }
}

/// Pick the frame that best locates the failure: the deepest frame in project code,
/// falling back to the deepest frame overall.
pub(crate) fn choose_location<'a>(
    frames: &'a [TracebackFrame],
    exclude_paths: &[String],
) -> Option<&'a TracebackFrame> {
    frames
        .iter()
        .rev()
        .find(|f| !is_vendored_path(&f.file_path, exclude_paths))
        .or_else(|| frames.last())
}

/// Split `Type: message` text into its exception type and message
pub(crate) fn split_exception(text: &str) -> Option<(String, String)> {
    let caps = patterns().exception.captures(text.trim())?;
    let exc = caps["exc"].to_string();
    let msg = caps
        .name("msg")
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();
    Some((exc, msg))
}

/// Header of a failure block, e.g. `TestUser.test_delete`
pub(crate) fn block_header_name(line: &str) -> Option<&str> {
    patterns()
        .block_header
        .captures(line)
        .and_then(|c| c.name("name"))
        .map(|m| m.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Other,
    Failures,
    ShortSummary,
    Warnings,
}

#[derive(Debug)]
struct FailureBlock<'a> {
    name: String,
    start: usize,
    lines: Vec<&'a str>,
}

#[derive(Debug)]
struct SummaryEntry {
    node_id: String,
    test_file: String,
    test_function: Option<String>,
    message: Option<String>,
    line_idx: usize,
}

impl SummaryEntry {
    fn from_node(node_id: &str, message: Option<&str>, line_idx: usize) -> Self {
        let test_file = node_id.split("::").next().unwrap_or(node_id).to_string();
        let test_function = node_id
            .rsplit("::")
            .next()
            .filter(|_| node_id.contains("::"))
            .map(str::to_string);
        Self {
            node_id: node_id.to_string(),
            test_file,
            test_function,
            message: message.map(|m| m.trim().to_string()).filter(|m| !m.is_empty()),
            line_idx,
        }
    }

    /// Whether this entry describes the failure printed under `block_name`
    fn matches_block(&self, block_name: &str) -> bool {
        if let Some(target) = block_name.strip_prefix("ERROR collecting ") {
            return self.test_function.is_none() && self.test_file == target.trim();
        }
        let name = strip_phase_prefix(block_name);
        match self.node_id.split_once("::") {
            Some((_, qualified)) => qualified == name.replace('.', "::") || qualified == name,
            None => false,
        }
    }
}

fn strip_phase_prefix(name: &str) -> &str {
    name.strip_prefix("ERROR at setup of ")
        .or_else(|| name.strip_prefix("ERROR at teardown of "))
        .unwrap_or(name)
}

/// Parser for pytest sessions
#[derive(Debug, Default, Clone, Copy)]
pub struct PytestParser;

impl PytestParser {
    fn record_from_block(block: &FailureBlock<'_>, options: &ParseOptions) -> ErrorRecord {
        let p = patterns();
        let collecting = block.name.strip_prefix("ERROR collecting ").map(str::trim);
        let test_name = strip_phase_prefix(&block.name).to_string();
        let test_function = match collecting {
            Some(_) => None,
            None => test_name.rsplit('.').next().map(str::to_string),
        };

        let mut frames: Vec<TracebackFrame> = Vec::new();
        let mut raise_location: Option<TracebackFrame> = None;
        let mut e_texts: Vec<&str> = Vec::new();

        let mut iter = block.lines.iter().peekable();
        while let Some(line) = iter.next() {
            if let Some(caps) = p.e_line.captures(line) {
                let text = caps.name("text").map(|m| m.as_str().trim()).unwrap_or("");
                if !text.is_empty() {
                    e_texts.push(text);
                }
                continue;
            }
            match parse_frame_line(line) {
                Some(FrameLine::Call(mut frame)) => {
                    if let Some(next) = iter.peek() {
                        if next.starts_with(' ') && !next.trim().is_empty() {
                            frame.code_line = Some(next.trim().to_string());
                        }
                    }
                    frames.push(frame);
                }
                Some(FrameLine::Raise(frame)) => raise_location = Some(frame),
                None => {}
            }
        }

        let from_e_lines = e_texts.iter().find_map(|t| split_exception(t));
        let (exception_type, message) = match from_e_lines {
            Some((exc, msg)) => {
                let msg = if msg.is_empty() { exc.clone() } else { msg };
                (Some(exc), msg)
            }
            None => {
                let raised = raise_location
                    .as_ref()
                    .and_then(|f| split_exception(&f.function))
                    .map(|(exc, _)| exc);
                let exc = raised.or_else(|| {
                    e_texts
                        .first()
                        .filter(|t| t.starts_with("assert"))
                        .map(|_| "AssertionError".to_string())
                });
                let msg = e_texts
                    .first()
                    .map(|t| t.to_string())
                    .or_else(|| exc.clone())
                    .unwrap_or_else(|| test_name.clone());
                (exc, msg)
            }
        };

        let category = exception_type
            .as_deref()
            .map(ErrorCategory::from_exception)
            .unwrap_or(ErrorCategory::Test);

        let mut record = ErrorRecord::new(message, category).at_line(block.start);
        record.exception_type = exception_type;
        record.test_function = test_function;
        record.test_name = Some(test_name);
        record.has_traceback = !frames.is_empty();

        let mut candidates = frames.clone();
        if let Some(raise) = raise_location {
            candidates.push(raise);
        }
        match choose_location(&candidates, &options.exclude_paths) {
            Some(frame) => {
                record.file_path = frame.file_path.clone();
                record.line_number = Some(frame.line_number);
            }
            None => {
                if let Some(target) = collecting {
                    record.file_path = target.to_string();
                }
            }
        }

        if e_texts.len() > 1 {
            record = record.with_detail("error_lines", e_texts.clone());
        }
        if options.include_traceback {
            record.traceback = frames;
        }
        if options.context_lines > 0 {
            let context: Vec<&str> = block
                .lines
                .iter()
                .copied()
                .filter(|l| !l.trim().is_empty())
                .take(MAX_CONTEXT_LINES)
                .collect();
            record = record.with_context(Some(context.join("\n")));
        }
        record
    }

    fn record_from_summary(entry: &SummaryEntry) -> ErrorRecord {
        let parsed = entry.message.as_deref().map(|m| (m, split_exception(m)));
        let (exception_type, message) = match parsed {
            Some((_, Some((exc, msg)))) => {
                let msg = if msg.is_empty() { exc.clone() } else { msg };
                (Some(exc), msg)
            }
            Some((raw, None)) => {
                let exc = raw.starts_with("assert").then(|| "AssertionError".to_string());
                (exc, raw.to_string())
            }
            None => (None, format!("{} failed", entry.node_id)),
        };
        let category = exception_type
            .as_deref()
            .map(ErrorCategory::from_exception)
            .unwrap_or(ErrorCategory::Test);

        let mut record = ErrorRecord::new(message, category)
            .with_location(entry.test_file.clone(), None)
            .at_line(entry.line_idx);
        record.exception_type = exception_type;
        record.test_function = entry.test_function.clone();
        record.test_name = Some(entry.node_id.clone());
        record
    }

    fn parse_footer(body: &str, duration: &str) -> TestSummary {
        let mut summary = TestSummary {
            duration_seconds: duration.parse().ok(),
            ..Default::default()
        };
        for caps in patterns().count.captures_iter(body) {
            let n: u32 = caps["n"].parse().unwrap_or(0);
            match &caps["kind"] {
                "passed" | "xpassed" => summary.passed += n,
                "failed" => summary.failed += n,
                "skipped" | "xfailed" => summary.skipped += n,
                "error" | "errors" => summary.errors += n,
                _ => {}
            }
        }
        summary.total = summary.passed + summary.failed + summary.skipped + summary.errors;
        summary
    }
}

impl LogParser for PytestParser {
    fn parser_type(&self) -> &'static str {
        "pytest"
    }

    fn framework(&self) -> TestFramework {
        TestFramework::Pytest
    }

    fn parse(&self, trace: &str, options: &ParseOptions) -> ParseResult {
        let p = patterns();
        let cleaned = clean_trace(trace);
        let lines: Vec<&str> = cleaned.lines().collect();

        let session_detected = lines.iter().any(|l| p.session_start.is_match(l));
        let mut section = Section::Other;
        let mut blocks: Vec<FailureBlock<'_>> = Vec::new();
        let mut current: Option<FailureBlock<'_>> = None;
        let mut entries: Vec<SummaryEntry> = Vec::new();
        let mut warnings: Vec<WarningRecord> = Vec::new();
        let mut test_summary: Option<TestSummary> = None;

        for (idx, &line) in lines.iter().enumerate() {
            if let Some(caps) = p.footer.captures(line) {
                blocks.extend(current.take());
                test_summary = Some(Self::parse_footer(&caps["body"], &caps["dur"]));
                section = Section::Other;
                continue;
            }
            if let Some(caps) = p.section.captures(line) {
                blocks.extend(current.take());
                let title = caps["title"].to_lowercase();
                section = match title.as_str() {
                    "failures" | "errors" => Section::Failures,
                    t if t.contains("short test summary") => Section::ShortSummary,
                    t if t.contains("warnings summary") => Section::Warnings,
                    _ => Section::Other,
                };
                continue;
            }

            match section {
                Section::Failures => {
                    if let Some(name) = block_header_name(line) {
                        blocks.extend(current.take());
                        current = Some(FailureBlock {
                            name: name.to_string(),
                            start: idx,
                            lines: Vec::new(),
                        });
                    } else if let Some(block) = current.as_mut() {
                        block.lines.push(line);
                    }
                }
                Section::ShortSummary => {
                    if let Some(caps) = p.summary_line.captures(line) {
                        entries.push(SummaryEntry::from_node(
                            &caps["node"],
                            caps.name("msg").map(|m| m.as_str()),
                            idx,
                        ));
                    }
                }
                Section::Warnings => {
                    if let Some(caps) = p.warning.captures(line) {
                        warnings.push(WarningRecord {
                            message: caps["msg"].trim().to_string(),
                            line_number: idx + 1,
                            warning_type: Some(caps["exc"].to_string()),
                            context: None,
                        });
                    }
                }
                Section::Other => {}
            }
        }
        blocks.extend(current.take());

        if !session_detected && blocks.is_empty() && entries.is_empty() {
            let (errors, generic_warnings) = GenericParser::scan_lines(&lines, options);
            let mut summary = Map::new();
            summary.insert("session_detected".to_string(), json!(false));
            summary.insert("fallback".to_string(), json!("generic"));
            return ParseResult::new(
                self.parser_type(),
                self.framework(),
                errors,
                generic_warnings,
                summary,
            );
        }

        let mut matched_entries = vec![false; entries.len()];
        let mut errors: Vec<ErrorRecord> = Vec::new();
        for block in &blocks {
            let mut record = Self::record_from_block(block, options);
            let entry = entries
                .iter()
                .enumerate()
                .find(|(i, e)| !matched_entries[*i] && e.matches_block(&block.name));
            if let Some((i, entry)) = entry {
                matched_entries[i] = true;
                record.test_name = Some(entry.node_id.clone());
                if !record.has_known_file() {
                    record.file_path = entry.test_file.clone();
                }
                record = record.with_detail("test_file", entry.test_file.clone());
            }
            errors.push(record);
        }
        for (entry, matched) in entries.iter().zip(&matched_entries) {
            if !matched {
                errors.push(Self::record_from_summary(entry));
            }
        }

        let mut seen = HashSet::new();
        errors.retain(|e| seen.insert((e.error_id(), e.test_name.clone())));

        let mut summary = Map::new();
        summary.insert("session_detected".to_string(), json!(session_detected));
        summary.insert("failure_blocks".to_string(), json!(blocks.len()));
        if let Some(ts) = test_summary {
            summary.insert("test_summary".to_string(), json!(ts));
        }

        ParseResult::new(
            self.parser_type(),
            self.framework(),
            errors,
            warnings,
            summary,
        )
    }
}
