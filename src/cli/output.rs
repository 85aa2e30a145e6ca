//! JSON documents written to stdout
//!
//! Every command prints exactly one JSON document. Failures are reported as
//! `{"status": "error", "message": ...}` so callers never have to scrape stderr.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::io::Write;

/// Output style for the JSON document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Pretty,
    Compact,
}

pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn format<T: Serialize>(&self, value: &T) -> Result<String> {
        match self.format {
            OutputFormat::Pretty => {
                serde_json::to_string_pretty(value).context("Failed to serialize output")
            }
            OutputFormat::Compact => {
                serde_json::to_string(value).context("Failed to serialize output")
            }
        }
    }

    /// Error document for a failed command
    pub fn format_error(&self, error: &anyhow::Error) -> Result<String> {
        let causes: Vec<String> = error.chain().skip(1).map(ToString::to_string).collect();
        let mut document = json!({
            "status": "error",
            "message": error.to_string(),
        });
        if !causes.is_empty() {
            document["causes"] = Value::from(causes);
        }
        self.format(&document)
    }

    pub fn print<T: Serialize>(&self, value: &T) -> Result<()> {
        let text = self.format(value)?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{text}").context("Failed to write to stdout")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_compact_is_single_line() {
        let formatter = OutputFormatter::new(OutputFormat::Compact);
        let text = formatter.format(&json!({"a": 1, "b": [1, 2]})).unwrap();
        assert!(!text.contains('\n'));

        let pretty = OutputFormatter::new(OutputFormat::Pretty)
            .format(&json!({"a": 1}))
            .unwrap();
        assert!(pretty.contains('\n'));
    }

    #[test]
    fn test_error_document_includes_causes() {
        let error = anyhow!("connection refused").context("Failed to fetch pipeline");
        let text = OutputFormatter::new(OutputFormat::Compact)
            .format_error(&error)
            .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["message"], "Failed to fetch pipeline");
        assert_eq!(value["causes"][0], "connection refused");
    }
}
