//! Parser for SonarScanner output
//!
//! Scanner logs are machine generated and narrow, so instead of line heuristics this parser
//! looks for a handful of specific banners and pulls identifiers out of them.

use super::clean::{clean_trace, context_window, is_noise};
use super::{ErrorCategory, ErrorRecord, LogParser, ParseOptions, ParseResult, WarningRecord};
use crate::framework::TestFramework;
use regex::Regex;
use reqwest::Url;
use serde::Serialize;
use serde_json::{json, Map};
use std::sync::OnceLock;

/// Following `ERROR:` lines kept as causes of a scanner execution failure
const MAX_CAUSES: usize = 5;

struct SonarPatterns {
    quality_gate: Regex,
    scanner_failure: Regex,
    sensor_failure: Regex,
    sensor_name: Regex,
    relocation: Regex,
    error_line: Regex,
    warn_line: Regex,
    analysis_successful: Regex,
}

fn patterns() -> &'static SonarPatterns {
    static PATTERNS: OnceLock<SonarPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |p: &str| Regex::new(p).expect("Invalid sonarqube regex");
        SonarPatterns {
            quality_gate: re(
                r"QUALITY GATE STATUS:\s*(?P<status>[A-Z_]+)(?:\s*-\s*View details on\s+(?P<url>\S+))?",
            ),
            scanner_failure: re(r"(?i)Error during SonarScanner execution"),
            sensor_failure: re(r"^\s*(?:\[ERROR\]|ERROR:?)\s*(?P<msg>.*\bSensor\b.*)$"),
            sensor_name: re(r"Sensor (?P<name>[^\[:]+?)\s*(?:\[|failed|:|$)"),
            relocation: re(r"(?P<msg>(?:Unable to relocate|Error relocating)\b.*)$"),
            error_line: re(r"^\s*(?:\[ERROR\]|ERROR:)\s*(?P<msg>\S.*)$"),
            warn_line: re(r"^\s*(?:\[WARN(?:ING)?\]|WARN(?:ING)?:)\s*(?P<msg>\S.*)$"),
            analysis_successful: re(r"ANALYSIS SUCCESSFUL"),
        }
    })
}

/// Quality gate outcome reported in the parse summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QualityGate {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl QualityGate {
    fn from_banner(status: &str, url: Option<&str>) -> Self {
        let mut gate = QualityGate {
            status: status.to_string(),
            dashboard_url: url.map(str::to_string),
            ..Default::default()
        };
        if let Some(parsed) = url.and_then(|u| Url::parse(u).ok()) {
            for (key, value) in parsed.query_pairs() {
                match key.as_ref() {
                    "id" => gate.project_key = Some(value.into_owned()),
                    "pullRequest" => gate.pull_request = Some(value.into_owned()),
                    "branch" => gate.branch = Some(value.into_owned()),
                    _ => {}
                }
            }
        }
        gate
    }

    fn failed(&self) -> bool {
        !matches!(self.status.as_str(), "OK" | "PASSED" | "SUCCESS")
    }
}

/// Parser for SonarQube scanner jobs
#[derive(Debug, Default, Clone, Copy)]
pub struct SonarQubeParser;

impl SonarQubeParser {
    fn push_unique(errors: &mut Vec<ErrorRecord>, record: ErrorRecord) {
        if !errors
            .iter()
            .any(|e| e.message == record.message && e.category == record.category)
        {
            errors.push(record);
        }
    }
}

impl LogParser for SonarQubeParser {
    fn parser_type(&self) -> &'static str {
        "sonarqube"
    }

    fn framework(&self) -> TestFramework {
        TestFramework::SonarQube
    }

    fn parse(&self, trace: &str, options: &ParseOptions) -> ParseResult {
        let p = patterns();
        let cleaned = clean_trace(trace);
        let lines: Vec<&str> = cleaned.lines().collect();

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut gate: Option<QualityGate> = None;
        let mut analysis_successful = false;

        for (idx, &line) in lines.iter().enumerate() {
            if line.trim().is_empty() || is_noise(line) {
                continue;
            }
            let context = || context_window(&lines, idx, options.context_lines);

            if let Some(caps) = p.quality_gate.captures(line) {
                let current =
                    QualityGate::from_banner(&caps["status"], caps.name("url").map(|m| m.as_str()));
                if current.failed() {
                    let mut record = ErrorRecord::new(
                        format!("Quality gate status: {}", current.status),
                        ErrorCategory::QualityGate,
                    )
                    .with_context(context())
                    .at_line(idx);
                    if let Some(url) = &current.dashboard_url {
                        record = record.with_detail("dashboard_url", url.as_str());
                    }
                    if let Some(key) = &current.project_key {
                        record = record.with_detail("project_key", key.as_str());
                    }
                    if let Some(pr) = &current.pull_request {
                        record = record.with_detail("pull_request", pr.as_str());
                    }
                    if let Some(branch) = &current.branch {
                        record = record.with_detail("branch", branch.as_str());
                    }
                    Self::push_unique(&mut errors, record);
                }
                // A later banner with a URL is more informative than an earlier bare one
                let better = gate.as_ref().map_or(true, |g| {
                    g.dashboard_url.is_none() || current.dashboard_url.is_some()
                });
                if better {
                    gate = Some(current);
                }
                continue;
            }

            if p.scanner_failure.is_match(line) {
                let causes: Vec<String> = lines[idx + 1..]
                    .iter()
                    .take_while(|l| !l.trim().is_empty())
                    .filter_map(|l| p.error_line.captures(l))
                    .map(|c| c["msg"].trim().to_string())
                    .filter(|m| !m.contains("Re-run SonarScanner") && !m.starts_with("Caused by"))
                    .take(MAX_CAUSES)
                    .collect();
                let message = match causes.first() {
                    Some(cause) => format!("Error during SonarScanner execution: {cause}"),
                    None => "Error during SonarScanner execution".to_string(),
                };
                let mut record = ErrorRecord::new(message, ErrorCategory::Configuration)
                    .with_context(context())
                    .at_line(idx);
                if !causes.is_empty() {
                    record = record.with_detail("causes", causes);
                }
                Self::push_unique(&mut errors, record);
                continue;
            }

            if let Some(caps) = p.sensor_failure.captures(line) {
                let message = caps["msg"].trim().to_string();
                let mut record = ErrorRecord::new(message.clone(), ErrorCategory::Build)
                    .with_context(context())
                    .at_line(idx);
                if let Some(name) = p.sensor_name.captures(&message) {
                    record = record.with_detail("sensor", name["name"].trim());
                }
                Self::push_unique(&mut errors, record);
                continue;
            }

            if let Some(caps) = p.relocation.captures(line) {
                let record = ErrorRecord::new(caps["msg"].trim(), ErrorCategory::Runtime)
                    .with_context(context())
                    .at_line(idx);
                Self::push_unique(&mut errors, record);
                continue;
            }

            if p.analysis_successful.is_match(line) {
                analysis_successful = true;
                continue;
            }

            if let Some(caps) = p.warn_line.captures(line) {
                warnings.push(WarningRecord {
                    message: caps["msg"].trim().to_string(),
                    line_number: idx + 1,
                    warning_type: None,
                    context: None,
                });
            }
        }

        let mut summary = Map::new();
        summary.insert("analysis_successful".to_string(), json!(analysis_successful));
        if let Some(gate) = gate {
            summary.insert("quality_gate".to_string(), json!(gate));
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
