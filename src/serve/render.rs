//! Mode-dependent projections of stored records

use super::ResponseMode;
use crate::ingest::StoredError;
use crate::parsers::clean::{clean_trace, is_vendored_path};
use serde_json::{json, Map, Value};

const MINIMAL_MESSAGE_CHARS: usize = 200;

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn insert_some<T: Into<Value>>(map: &mut Map<String, Value>, key: &str, value: Option<T>) {
    if let Some(value) = value {
        map.insert(key.to_string(), value.into());
    }
}

/// Project one error record to the fields `mode` asks for
pub fn error(stored: &StoredError, mode: ResponseMode) -> Value {
    let record = &stored.record;
    if mode == ResponseMode::Full {
        let mut value = serde_json::to_value(stored).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.insert(
                "fix_guidance".to_string(),
                record.category.fix_guidance().into(),
            );
        }
        return value;
    }

    let mut map = Map::new();
    map.insert("error_id".to_string(), stored.error_id.clone().into());
    insert_some(&mut map, "exception_type", record.exception_type.clone());
    map.insert("file_path".to_string(), record.file_path.clone().into());
    insert_some(&mut map, "line_number", record.line_number);

    if mode == ResponseMode::Minimal {
        map.insert(
            "message".to_string(),
            truncate(&record.message, MINIMAL_MESSAGE_CHARS).into(),
        );
        return Value::Object(map);
    }

    map.insert("message".to_string(), record.message.clone().into());
    map.insert("category".to_string(), record.category.as_str().into());
    insert_some(&mut map, "column", record.column);
    insert_some(&mut map, "test_name", record.test_name.clone());
    insert_some(&mut map, "test_function", record.test_function.clone());
    insert_some(&mut map, "context", record.context.clone());
    map.insert("has_traceback".to_string(), record.has_traceback.into());
    if !stored.occurrences.is_empty() {
        map.insert(
            "occurrences".to_string(),
            serde_json::to_value(&stored.occurrences).unwrap_or(Value::Null),
        );
    }

    if mode == ResponseMode::Fixing {
        map.insert(
            "fix_guidance".to_string(),
            record.category.fix_guidance().into(),
        );
        let frames: Vec<Value> = record
            .traceback
            .iter()
            .filter(|f| !is_vendored_path(&f.file_path, &[]))
            .map(|f| serde_json::to_value(f).unwrap_or(Value::Null))
            .collect();
        if !frames.is_empty() {
            map.insert("traceback".to_string(), frames.into());
        }
        if !record.detail.is_empty() {
            map.insert(
                "detail".to_string(),
                serde_json::to_value(&record.detail).unwrap_or(Value::Null),
            );
        }
    }
    Value::Object(map)
}

pub fn errors<'a>(
    errors: impl IntoIterator<Item = &'a StoredError>,
    mode: ResponseMode,
) -> Vec<Value> {
    errors.into_iter().map(|e| error(e, mode)).collect()
}

/// Lines of trace on each side of the error line
fn trace_radius(mode: ResponseMode) -> Option<usize> {
    match mode {
        ResponseMode::Minimal => Some(5),
        ResponseMode::Balanced => Some(20),
        ResponseMode::Fixing => Some(40),
        ResponseMode::Full => None,
    }
}

/// Slice of the cleaned trace around the line an error was found on
pub fn trace_excerpt(trace: &str, trace_line: Option<usize>, mode: ResponseMode) -> Value {
    let cleaned = clean_trace(trace);
    let lines: Vec<&str> = cleaned.lines().collect();
    let total = lines.len();

    let (start, end) = match (trace_line, trace_radius(mode)) {
        (Some(line), Some(radius)) => {
            let line = line.min(total.saturating_sub(1));
            (line.saturating_sub(radius), (line + radius + 1).min(total))
        }
        // Without a known line the tail of the trace is the most useful part
        (None, Some(radius)) => (total.saturating_sub(radius * 2), total),
        (_, None) => (0, total),
    };

    json!({
        "start_line": start,
        "end_line": end,
        "total_lines": total,
        "error_line": trace_line,
        "lines": lines[start..end],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ErrorOccurrence;
    use crate::parsers::{ErrorCategory, ErrorRecord, TracebackFrame};

    fn stored() -> StoredError {
        let mut record = ErrorRecord::new("x".repeat(300), ErrorCategory::Database)
            .with_exception("IntegrityError")
            .with_location("app/models.py", Some(10))
            .with_context(Some("ctx".to_string()))
            .with_detail("constraint", "unique");
        record.has_traceback = true;
        record.traceback = vec![
            TracebackFrame {
                file_path: "app/models.py".to_string(),
                line_number: 10,
                function: "save".to_string(),
                code_line: None,
            },
            TracebackFrame {
                file_path: "/usr/lib/python3/site-packages/django/db.py".to_string(),
                line_number: 99,
                function: "execute".to_string(),
                code_line: None,
            },
        ];
        StoredError::new(4, record)
    }

    #[test]
    fn test_modes_grow_monotonically() {
        let stored = stored();
        let minimal = error(&stored, ResponseMode::Minimal);
        let balanced = error(&stored, ResponseMode::Balanced);
        let fixing = error(&stored, ResponseMode::Fixing);
        let full = error(&stored, ResponseMode::Full);

        assert!(minimal["message"].as_str().unwrap().ends_with("..."));
        assert!(minimal.get("context").is_none());
        assert_eq!(balanced["context"], "ctx");
        assert!(balanced.get("fix_guidance").is_none());
        assert_eq!(fixing["traceback"].as_array().unwrap().len(), 1);
        assert_eq!(fixing["detail"]["constraint"], "unique");
        assert_eq!(full["traceback"].as_array().unwrap().len(), 2);
        assert!(full.get("fix_guidance").is_some());
    }

    #[test]
    fn test_repeated_error_lists_occurrences() {
        let mut stored = stored();
        assert!(error(&stored, ResponseMode::Balanced).get("occurrences").is_none());

        stored.occurrences = ["test_x[1]", "test_x[2]"]
            .into_iter()
            .map(|name| ErrorOccurrence {
                test_name: Some(name.to_string()),
                test_function: None,
                trace_line: None,
            })
            .collect();
        assert!(error(&stored, ResponseMode::Minimal).get("occurrences").is_none());
        let balanced = error(&stored, ResponseMode::Balanced);
        assert_eq!(balanced["occurrences"][1]["test_name"], "test_x[2]");
        assert_eq!(error(&stored, ResponseMode::Full)["occurrences"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_trace_excerpt_window() {
        let trace: String = (0..100).map(|i| format!("line {i}\n")).collect();
        let excerpt = trace_excerpt(&trace, Some(50), ResponseMode::Minimal);
        assert_eq!(excerpt["start_line"], 45);
        assert_eq!(excerpt["end_line"], 56);
        assert_eq!(excerpt["lines"][5], "line 50");

        let full = trace_excerpt(&trace, Some(50), ResponseMode::Full);
        assert_eq!(full["lines"].as_array().unwrap().len(), 100);

        let tail = trace_excerpt(&trace, None, ResponseMode::Minimal);
        assert_eq!(tail["start_line"], 90);
    }
}
