//! Trace text normalization shared by all parsers

use regex::Regex;
use std::sync::OnceLock;

/// Runner chatter that never carries failure information
const NOISE_PREFIXES: &[&str] = &[
    "Running with gitlab-runner",
    "Preparing the \"",
    "Preparing environment",
    "Using Docker executor",
    "Using docker image",
    "Pulling docker image",
    "Running on runner-",
    "Getting source from Git repository",
    "Fetching changes with git depth",
    "Initialized empty Git repository",
    "Created fresh repository",
    "Checking out ",
    "Skipping Git submodules setup",
    "Executing \"step_script\" stage",
    "Restoring cache",
    "Saving cache",
    "Uploading artifacts",
    "Downloading artifacts",
    "Cleaning up project directory",
    "Cleaning up file based variables",
];

fn ansi_regex() -> &'static Regex {
    static ANSI_REGEX: OnceLock<Regex> = OnceLock::new();
    ANSI_REGEX.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07|\x1b[@-Z\\-_]")
            .expect("Invalid ANSI regex")
    })
}

fn section_regex() -> &'static Regex {
    static SECTION_REGEX: OnceLock<Regex> = OnceLock::new();
    SECTION_REGEX.get_or_init(|| {
        Regex::new(r"section_(?:start|end):\d+:[A-Za-z0-9_.\-\[\]=,]+").expect("Invalid section regex")
    })
}

/// Remove ANSI escape sequences
pub fn strip_ansi(text: &str) -> String {
    ansi_regex().replace_all(text, "").into_owned()
}

/// Normalize raw trace text into plain lines.
///
/// Strips ANSI escapes and GitLab collapsible-section markers, and resolves carriage
/// return overwrites so each line holds the text a terminal would finally show.
pub fn clean_trace(trace: &str) -> String {
    let stripped = strip_ansi(trace);
    let stripped = section_regex().replace_all(&stripped, "");

    stripped
        .split('\n')
        .map(|raw| {
            let raw = raw.strip_suffix('\r').unwrap_or(raw);
            raw.rsplit('\r').next().unwrap_or(raw).trim_end()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Whether a cleaned line is runner output or an echoed shell command
pub fn is_noise(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("$ ")
        || NOISE_PREFIXES
            .iter()
            .any(|prefix| trimmed.starts_with(prefix))
}

/// Lines `[idx - radius, idx + radius]` joined with newlines, clipped to the trace
pub fn context_window(lines: &[&str], idx: usize, radius: usize) -> Option<String> {
    if radius == 0 || lines.is_empty() {
        return None;
    }
    let start = idx.saturating_sub(radius);
    let end = (idx + radius + 1).min(lines.len());
    Some(lines[start..end].join("\n"))
}

/// Whether a path points into installed third-party code rather than the project
pub fn is_vendored_path(path: &str, extra: &[String]) -> bool {
    const VENDORED: &[&str] = &[
        "site-packages/",
        "dist-packages/",
        "/.venv/",
        ".venv/",
        "/venv/",
        "/usr/lib/python",
        "/usr/local/lib/python",
        "node_modules/",
        "<frozen ",
        "_pytest/",
        "/pluggy/",
    ];
    VENDORED.iter().any(|v| path.contains(v))
        || path.starts_with('<')
        || extra.iter().any(|e| !e.is_empty() && path.contains(e.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[31;1mERROR\x1b[0;m: boom"), "ERROR: boom");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn test_clean_trace_section_markers() {
        let raw = "section_start:1700000000:step_script\r\x1b[0K\x1b[0K\x1b[36;1mExecuting step\x1b[0;m\n\
                   $ pytest\n\
                   section_end:1700000001:step_script\r\x1b[0K\n";
        let cleaned = clean_trace(raw);
        let lines: Vec<&str> = cleaned.lines().collect();
        assert_eq!(lines[0], "Executing step");
        assert_eq!(lines[1], "$ pytest");
        assert_eq!(lines[2], "");
    }

    #[test]
    fn test_clean_trace_carriage_return_overwrite() {
        let cleaned = clean_trace("Downloading 10%\rDownloading 100%\r\nDone");
        assert_eq!(cleaned, "Downloading 100%\nDone");
    }

    #[test]
    fn test_clean_trace_keeps_line_count() {
        assert_eq!(clean_trace("a\nb\n"), "a\nb\n");
        assert_eq!(clean_trace("a\nb\n").lines().count(), 2);
        assert_eq!(clean_trace("a\r\nb").lines().count(), 2);
        assert_eq!(clean_trace("a\n\nb\n").lines().count(), 3);
    }

    #[test]
    fn test_is_noise() {
        assert!(is_noise("Running with gitlab-runner 16.5.0 (853330f9)"));
        assert!(is_noise("$ echo ERROR: not real"));
        assert!(!is_noise("ERROR: real failure"));
    }

    #[test]
    fn test_context_window_clips() {
        let lines = vec!["a", "b", "c", "d"];
        assert_eq!(context_window(&lines, 0, 2).unwrap(), "a\nb\nc");
        assert_eq!(context_window(&lines, 3, 1).unwrap(), "c\nd");
        assert!(context_window(&lines, 1, 0).is_none());
    }

    #[test]
    fn test_is_vendored_path() {
        assert!(is_vendored_path(
            "/usr/local/lib/python3.11/site-packages/django/db/models/query.py",
            &[]
        ));
        assert!(is_vendored_path("libs/thirdparty/x.py", &["libs/thirdparty".to_string()]));
        assert!(!is_vendored_path("app/models.py", &[]));
    }
}
