//! Unified-log NDJSON parsing.
//!
//! The log query tool emits one JSON object per line. Invalid lines are
//! skipped; the process name is the basename of `processImagePath`.

use serde_json::Value;
use std::path::Path;

/// One parsed log row tied to a capture.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogEntry {
    pub timestamp: String,
    pub event_message: String,
    pub mach_timestamp: Option<i64>,
    pub subsystem: Option<String>,
    pub category: Option<String>,
    pub process_name: Option<String>,
    pub process_id: Option<i64>,
    pub message_type: Option<String>,
}

/// Parse NDJSON bytes into log entries, skipping anything unparseable.
pub fn parse_logs_ndjson(data: &[u8]) -> Vec<LogEntry> {
    let text = String::from_utf8_lossy(data);
    let mut entries = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(obj) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let Some(map) = obj.as_object() else {
            continue;
        };

        let str_field = |key: &str| map.get(key).and_then(Value::as_str).map(str::to_string);

        let process_name = str_field("processImagePath").map(|p| {
            Path::new(&p)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or(p)
        });

        entries.push(LogEntry {
            timestamp: str_field("timestamp").unwrap_or_default(),
            event_message: str_field("eventMessage").unwrap_or_default(),
            mach_timestamp: map.get("machTimestamp").and_then(Value::as_i64),
            subsystem: str_field("subsystem"),
            category: str_field("category"),
            process_name,
            process_id: map.get("processID").and_then(Value::as_i64),
            message_type: str_field("messageType"),
        });
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_entry() {
        let data = br#"{"timestamp":"2026-07-14 09:31:02.000-0700","eventMessage":"GPU hang detected","machTimestamp":123456789,"subsystem":"com.apple.windowserver","category":"display","processImagePath":"/System/Library/CoreServices/WindowServer","processID":410,"messageType":"Error"}"#;
        let entries = parse_logs_ndjson(data);
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.timestamp, "2026-07-14 09:31:02.000-0700");
        assert_eq!(e.event_message, "GPU hang detected");
        assert_eq!(e.mach_timestamp, Some(123456789));
        assert_eq!(e.subsystem.as_deref(), Some("com.apple.windowserver"));
        assert_eq!(e.category.as_deref(), Some("display"));
        assert_eq!(e.process_name.as_deref(), Some("WindowServer"));
        assert_eq!(e.process_id, Some(410));
        assert_eq!(e.message_type.as_deref(), Some("Error"));
    }

    #[test]
    fn invalid_lines_are_skipped() {
        let data = b"not json\n{\"timestamp\":\"t1\",\"eventMessage\":\"ok\"}\n{broken\n\n[1,2,3]\n";
        let entries = parse_logs_ndjson(data);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_message, "ok");
    }

    #[test]
    fn missing_optional_fields_are_none() {
        let data = br#"{"timestamp":"t","eventMessage":"m"}"#;
        let entries = parse_logs_ndjson(data);
        let e = &entries[0];
        assert!(e.subsystem.is_none());
        assert!(e.process_name.is_none());
        assert!(e.mach_timestamp.is_none());
    }

    #[test]
    fn process_name_is_basename_of_image_path() {
        let data = br#"{"timestamp":"t","eventMessage":"m","processImagePath":"/usr/libexec/powerd"}"#;
        let entries = parse_logs_ndjson(data);
        assert_eq!(entries[0].process_name.as_deref(), Some("powerd"));
    }

    #[test]
    fn empty_input() {
        assert!(parse_logs_ndjson(b"").is_empty());
    }

    #[test]
    fn invalid_utf8_is_replaced_not_fatal() {
        let mut data = br#"{"timestamp":"t","eventMessage":"m"}"#.to_vec();
        data.extend_from_slice(b"\n\xff\xfe garbage\n");
        let entries = parse_logs_ndjson(&data);
        assert_eq!(entries.len(), 1);
    }
}
