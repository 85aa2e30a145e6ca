//! Django-aware pytest parser
//!
//! Runs [`PytestParser`] first, then scans the trace again for Django exception
//! signatures the base parser misses or classifies too broadly. Both record sets are merged
//! and deduplicated by a normalized fingerprint so a failure reported twice survives once.

use super::clean::{clean_trace, is_noise};
use super::pytest::{
    block_header_name, choose_location, parse_frame_line, split_exception, FrameLine,
};
use super::{
    ErrorCategory, ErrorRecord, LogParser, ParseOptions, ParseResult, PytestParser,
    TracebackFrame,
};
use crate::framework::TestFramework;
use regex::Regex;
use serde_json::json;
use std::sync::OnceLock;

/// How far above a signature line frames are collected when no block header intervenes
const FRAME_LOOKBEHIND: usize = 60;

fn django_exception_regex() -> &'static Regex {
    static DJANGO_REGEX: OnceLock<Regex> = OnceLock::new();
    DJANGO_REGEX.get_or_init(|| {
        Regex::new(
            r"(?:^|\s)(?P<exc>(?:[A-Za-z_]\w*\.)*(?:ValidationError|IntegrityError|ImproperlyConfigured|DoesNotExist|MultipleObjectsReturned|OperationalError|TransactionManagementError|NoReverseMatch|TemplateDoesNotExist))(?::\s*(?P<msg>.*))?$",
        )
        .expect("Invalid Django exception regex")
    })
}

fn native_frame_regex() -> &'static Regex {
    static NATIVE_FRAME_REGEX: OnceLock<Regex> = OnceLock::new();
    NATIVE_FRAME_REGEX.get_or_init(|| {
        Regex::new(r#"^\s*File "(?P<file>[^"]+)", line (?P<line>\d+), in (?P<func>\S+)"#)
            .expect("Invalid native frame regex")
    })
}

struct ConstraintPattern {
    regex: Regex,
    kind: &'static str,
}

fn constraint_patterns() -> &'static [ConstraintPattern] {
    static CONSTRAINT_PATTERNS: OnceLock<Vec<ConstraintPattern>> = OnceLock::new();
    CONSTRAINT_PATTERNS.get_or_init(|| {
        let pattern = |p: &str, kind| ConstraintPattern {
            regex: Regex::new(p).expect("Invalid constraint regex"),
            kind,
        };
        vec![
            pattern(r"UNIQUE constraint failed: (?P<target>[\w.,\s]+)", "unique"),
            pattern(r#"duplicate key value violates unique constraint "(?P<target>[^"]+)""#, "unique"),
            pattern(r"NOT NULL constraint failed: (?P<target>[\w.]+)", "not_null"),
            pattern(r#"null value in column "(?P<target>[^"]+)""#, "not_null"),
            pattern(r"FOREIGN KEY constraint failed", "foreign_key"),
            pattern(r#"violates foreign key constraint "(?P<target>[^"]+)""#, "foreign_key"),
        ]
    })
}

fn path_regex() -> &'static Regex {
    static PATH_REGEX: OnceLock<Regex> = OnceLock::new();
    PATH_REGEX.get_or_init(|| {
        Regex::new(r"(?:/?[\w.\-]+/)+[\w.\-]+|\b[\w\-]+\.py\b").expect("Invalid path regex")
    })
}

fn number_regex() -> &'static Regex {
    static NUMBER_REGEX: OnceLock<Regex> = OnceLock::new();
    NUMBER_REGEX.get_or_init(|| Regex::new(r"\d+").expect("Invalid number regex"))
}

/// Normalized identity used to collapse the same failure reported by different patterns:
/// the short exception type plus the message with paths and numbers replaced.
pub fn fingerprint(record: &ErrorRecord) -> String {
    let (exc, message) = match record.exception_type.as_deref() {
        Some(exc) => (exc.to_string(), record.message.clone()),
        None => split_exception(&record.message)
            .unwrap_or_else(|| (String::new(), record.message.clone())),
    };
    let short = exc.rsplit('.').next().unwrap_or(&exc);
    let message = path_regex().replace_all(message.trim(), "<path>");
    let message = number_regex().replace_all(&message, "<n>");
    format!("{short}|{message}")
}

/// Pytest parser extended with Django exception signatures
#[derive(Debug, Default, Clone, Copy)]
pub struct DjangoPytestParser;

impl DjangoPytestParser {
    /// Records for every distinct Django signature in the cleaned lines
    fn scan_django(lines: &[&str], options: &ParseOptions) -> Vec<ErrorRecord> {
        let mut records: Vec<ErrorRecord> = Vec::new();

        for (idx, line) in lines.iter().enumerate() {
            // `path.py:328: IntegrityError` only locates a failure already reported
            if is_noise(line) || parse_frame_line(line).is_some() {
                continue;
            }
            let Some(caps) = django_exception_regex().captures(line) else {
                continue;
            };
            let exc = caps["exc"].to_string();
            let message = caps
                .name("msg")
                .map(|m| m.as_str().trim().to_string())
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| exc.clone());

            let mut record = ErrorRecord::new(message, ErrorCategory::from_exception(&exc))
                .with_exception(exc)
                .at_line(idx);

            for pattern in constraint_patterns() {
                if let Some(c) = pattern.regex.captures(&record.message) {
                    let target = c.name("target").map(|m| m.as_str().trim().to_string());
                    record = record.with_detail("constraint", pattern.kind);
                    if let Some(target) = target {
                        record = record.with_detail("constraint_target", target);
                    }
                    break;
                }
            }

            let (frames, test_function) = Self::frames_before(lines, idx);
            if let Some(frame) = choose_location(&frames, &options.exclude_paths) {
                record.file_path = frame.file_path.clone();
                record.line_number = Some(frame.line_number);
            }
            record.test_function = test_function;
            record.has_traceback = !frames.is_empty();
            if options.include_traceback {
                record.traceback = frames;
            }
            record = record.with_detail("django", true);

            let fp = fingerprint(&record);
            if !records.iter().any(|r| fingerprint(r) == fp) {
                records.push(record);
            }
        }

        records
    }

    /// Frames between the enclosing failure header (or a bounded lookbehind) and `idx`
    fn frames_before(lines: &[&str], idx: usize) -> (Vec<TracebackFrame>, Option<String>) {
        let floor = idx.saturating_sub(FRAME_LOOKBEHIND);
        let mut start = floor;
        let mut test_function = None;
        for (i, line) in lines.iter().enumerate().take(idx).skip(floor).rev() {
            if let Some(name) = block_header_name(line) {
                start = i + 1;
                test_function = name.rsplit('.').next().map(str::to_string);
                break;
            }
        }

        let mut frames = Vec::new();
        for (i, line) in lines.iter().enumerate().take(idx).skip(start) {
            if let Some(caps) = native_frame_regex().captures(line) {
                let Ok(line_number) = caps["line"].parse() else {
                    continue;
                };
                let code_line = lines
                    .get(i + 1)
                    .map(|l| l.trim())
                    .filter(|l| !l.is_empty() && !l.starts_with("File "))
                    .map(str::to_string);
                frames.push(TracebackFrame {
                    file_path: caps["file"].to_string(),
                    line_number,
                    function: caps["func"].to_string(),
                    code_line,
                });
            } else if let Some(FrameLine::Call(frame)) = parse_frame_line(line) {
                frames.push(frame);
            }
        }
        (frames, test_function)
    }

    /// Fold a Django-specific record into an existing one with the same fingerprint
    fn enrich(existing: &mut ErrorRecord, specific: ErrorRecord) {
        if matches!(
            existing.category,
            ErrorCategory::Test | ErrorCategory::Runtime | ErrorCategory::Unknown
        ) {
            existing.category = specific.category;
        }
        if !existing.has_known_file() && specific.has_known_file() {
            existing.file_path = specific.file_path;
            existing.line_number = specific.line_number;
        }
        if existing.exception_type.is_none() {
            existing.exception_type = specific.exception_type;
        }
        if existing.traceback.is_empty() && !specific.traceback.is_empty() {
            existing.traceback = specific.traceback;
            existing.has_traceback = true;
        }
        for (key, value) in specific.detail {
            existing.detail.entry(key).or_insert(value);
        }
    }
}

impl LogParser for DjangoPytestParser {
    fn parser_type(&self) -> &'static str {
        "django-pytest"
    }

    fn framework(&self) -> TestFramework {
        TestFramework::DjangoPytest
    }

    fn parse(&self, trace: &str, options: &ParseOptions) -> ParseResult {
        let base = PytestParser.parse(trace, options);
        let cleaned = clean_trace(trace);
        let lines: Vec<&str> = cleaned.lines().collect();
        let specific = Self::scan_django(&lines, options);
        let django_count = specific.len();

        let mut errors = base.errors;
        let mut fingerprints: Vec<String> = errors.iter().map(fingerprint).collect();
        for record in specific {
            let fp = fingerprint(&record);
            match fingerprints.iter().position(|f| *f == fp) {
                Some(pos) => Self::enrich(&mut errors[pos], record),
                None => {
                    fingerprints.push(fp);
                    errors.push(record);
                }
            }
        }

        let mut summary = base.summary;
        summary.insert("django_errors".to_string(), json!(django_count));

        ParseResult::new(
            self.parser_type(),
            self.framework(),
            errors,
            base.warnings,
            summary,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(trace: &str) -> ParseResult {
        DjangoPytestParser.parse(trace, &ParseOptions::default())
    }

    #[test]
    fn test_generic_and_django_report_collapse() {
        let trace = "Traceback (most recent call last):\n\
                     \x20 File \"/builds/app/accounts/models.py\", line 41, in save\n\
                     \x20   super().save(*args, **kwargs)\n\
                     \x20 File \"/usr/local/lib/python3.11/site-packages/django/db/models/base.py\", line 814, in save\n\
                     \x20   self.save_base(using=using)\n\
                     django.db.utils.IntegrityError: UNIQUE constraint failed: accounts_user.email\n";
        let result = parse(trace);
        assert_eq!(result.error_count, 1);
        let error = &result.errors[0];
        assert_eq!(error.exception_type.as_deref(), Some("django.db.utils.IntegrityError"));
        assert_eq!(error.category, ErrorCategory::Database);
        assert_eq!(error.file_path, "/builds/app/accounts/models.py");
        assert_eq!(error.line_number, Some(41));
        assert_eq!(error.detail["constraint"], "unique");
        assert_eq!(error.detail["constraint_target"], "accounts_user.email");
    }

    #[test]
    fn test_pytest_block_and_summary_with_django_error() {
        let trace = "============================= test session starts ==============================\n\
                     =================================== FAILURES ===================================\n\
                     ___________________________ test_duplicate_email ____________________________\n\
                     accounts/models.py:41: in save\n\
                     \x20   super().save(*args, **kwargs)\n\
                     E   django.db.utils.IntegrityError: UNIQUE constraint failed: accounts_user.email\n\
                     /usr/lib/python3.11/site-packages/django/db/backends/sqlite3/base.py:328: IntegrityError\n\
                     =========================== short test summary info ============================\n\
                     FAILED tests/test_accounts.py::test_duplicate_email - django.db.utils.IntegrityError: UNIQUE constraint failed: accounts_user.email\n\
                     ============================== 1 failed in 0.40s ===============================\n";
        let result = parse(trace);
        assert_eq!(result.parser_type, "django-pytest");
        assert_eq!(result.framework, TestFramework::DjangoPytest);
        assert_eq!(result.error_count, 1);
        let error = &result.errors[0];
        assert_eq!(error.test_function.as_deref(), Some("test_duplicate_email"));
        assert_eq!(error.file_path, "accounts/models.py");
        assert_eq!(error.line_number, Some(41));
        assert_eq!(error.category, ErrorCategory::Database);
        assert_eq!(error.detail["constraint"], "unique");
        assert_eq!(result.summary["django_errors"], 1);
        assert!(result.summary.contains_key("test_summary"));
    }

    #[test]
    fn test_enrich_fills_missing_fields_only() {
        let mut existing = ErrorRecord::new("boom", ErrorCategory::Test)
            .with_detail("constraint", "unique");
        let specific = ErrorRecord::new("boom", ErrorCategory::Database)
            .with_exception("django.db.utils.IntegrityError")
            .with_location("app/models.py", Some(7))
            .with_detail("constraint", "not_null")
            .with_detail("constraint_target", "app_user.email");

        DjangoPytestParser::enrich(&mut existing, specific);
        assert_eq!(existing.category, ErrorCategory::Database);
        assert_eq!(
            existing.exception_type.as_deref(),
            Some("django.db.utils.IntegrityError")
        );
        assert_eq!(existing.file_path, "app/models.py");
        assert_eq!(existing.line_number, Some(7));
        assert_eq!(existing.detail["constraint"], "unique");
        assert_eq!(existing.detail["constraint_target"], "app_user.email");
    }

    #[test]
    fn test_distinct_django_errors_kept() {
        let trace = "accounts.models.User.DoesNotExist: User matching query does not exist.\n\
                     django.core.exceptions.ImproperlyConfigured: SECRET_KEY must not be empty\n";
        let result = parse(trace);
        assert_eq!(result.error_count, 2);
        assert_eq!(result.errors[0].category, ErrorCategory::Database);
        assert_eq!(result.errors[1].category, ErrorCategory::Configuration);
    }

    #[test]
    fn test_fingerprint_ignores_paths_and_numbers() {
        let a = ErrorRecord::new(
            "Field 'id' expected a number but got 'x' (/builds/a/models.py line 12)",
            ErrorCategory::Validation,
        )
        .with_exception("django.core.exceptions.ValidationError");
        let b = ErrorRecord::new(
            "Field 'id' expected a number but got 'x' (/tmp/b/models.py line 99)",
            ErrorCategory::Unknown,
        )
        .with_exception("ValidationError");
        assert_eq!(fingerprint(&a), fingerprint(&b));

        let untyped = ErrorRecord::new("ValidationError: bad row 3", ErrorCategory::Unknown);
        let typed = ErrorRecord::new("bad row 7", ErrorCategory::Validation)
            .with_exception("ValidationError");
        assert_eq!(fingerprint(&untyped), fingerprint(&typed));
    }

    #[test]
    fn test_postgres_duplicate_key_detail() {
        let result = parse(
            "psycopg2.errors.UniqueViolation: x\ndjango.db.utils.IntegrityError: duplicate key value violates unique constraint \"accounts_user_email_key\"\n",
        );
        let django = result
            .errors
            .iter()
            .find(|e| e.detail.contains_key("constraint"))
            .unwrap();
        assert_eq!(django.detail["constraint_target"], "accounts_user_email_key");
    }
}
