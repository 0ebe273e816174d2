//! Structured JSON logger
//!
//! - One line per event on stderr; stdout stays free for command output
//! - Keys in fixed order: `event`, `severity`, `ts`, then fields sorted by key
//! - Synchronous, one write per line

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::{SecondsFormat, Utc};

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Per-request detail
    Trace = 0,
    /// Normal operations
    Info = 1,
    /// Recoverable issues
    Warn = 2,
    /// Session or node failures
    Error = 3,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Severity::Trace,
            1 => Severity::Info,
            2 => Severity::Warn,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static MIN_SEVERITY: AtomicU8 = AtomicU8::new(Severity::Info as u8);

/// Process-wide JSON lines logger
pub struct Logger;

impl Logger {
    /// Drop events below `severity` from now on.
    pub fn set_min_severity(severity: Severity) {
        MIN_SEVERITY.store(severity as u8, Ordering::Relaxed);
    }

    pub fn min_severity() -> Severity {
        Severity::from_u8(MIN_SEVERITY.load(Ordering::Relaxed))
    }

    pub fn log(severity: Severity, event: &str, fields: &[(&str, &str)]) {
        if severity < Self::min_severity() {
            return;
        }
        let line = Self::format_line(severity, event, fields);
        let mut stderr = io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
    }

    pub fn warn(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Warn, event, fields);
    }

    fn format_line(severity: Severity, event: &str, fields: &[(&str, &str)]) -> String {
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        let mut sorted: Vec<&(&str, &str)> = fields.iter().collect();
        sorted.sort_by_key(|(key, _)| *key);

        let mut line = String::with_capacity(128 + fields.len() * 32);
        line.push('{');
        push_pair(&mut line, "event", event);
        line.push(',');
        push_pair(&mut line, "severity", severity.as_str());
        line.push(',');
        push_pair(&mut line, "ts", &ts);
        for (key, value) in sorted {
            line.push(',');
            push_pair(&mut line, key, value);
        }
        line.push_str("}\n");
        line
    }
}

/// Append `"key":"value"` with JSON string escaping.
fn push_pair(line: &mut String, key: &str, value: &str) {
    push_string(line, key);
    line.push(':');
    push_string(line, value);
}

fn push_string(line: &mut String, value: &str) {
    // Serializing a str cannot fail
    match serde_json::to_string(value) {
        Ok(quoted) => line.push_str(&quoted),
        Err(_) => line.push_str("\"\""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_round_trip() {
        for severity in [
            Severity::Trace,
            Severity::Info,
            Severity::Warn,
            Severity::Error,
        ] {
            assert_eq!(Severity::from_u8(severity as u8), severity);
        }
        assert!(Severity::Trace < Severity::Error);
    }

    #[test]
    fn test_line_is_json_with_fixed_prefix() {
        let line = Logger::format_line(Severity::Info, "SESSION_ESTABLISHED", &[]);
        assert!(line.starts_with(r#"{"event":"SESSION_ESTABLISHED","severity":"INFO","ts":""#));
        assert!(line.ends_with("}\n"));

        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert!(parsed["ts"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_fields_sorted_by_key() {
        let line = Logger::format_line(
            Severity::Warn,
            "CONNECT_ATTEMPT_FAILED",
            &[("endpoint", "node1:2181"), ("elapsed_ms", "12")],
        );
        assert!(line.find("elapsed_ms").unwrap() < line.find("endpoint").unwrap());
    }

    #[test]
    fn test_values_are_escaped() {
        let line = Logger::format_line(
            Severity::Info,
            "CONNECTION_CLOSED",
            &[("reason", "peer said \"bye\"\n\u{1}")],
        );
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["reason"], "peer said \"bye\"\n\u{1}");
        assert_eq!(line.matches('\n').count(), 1);
    }
}
