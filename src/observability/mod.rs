//! Observability
//!
//! - Structured logging (JSON lines on stderr)
//! - Client counters
//! - Typed lifecycle events
//!
//! Observability is read-only: nothing here feeds back into session
//! decisions. State transitions are exposed to applications through
//! watchers, not through logs.
//!
//! ```ignore
//! use ensemble::observability::{log_event_with_fields, Event};
//!
//! log_event_with_fields(Event::MajorityServerFound, &[("endpoint", "node2:2181")]);
//! ```

mod events;
mod logger;
mod metrics;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{ClientMetrics, MetricsSnapshot};

/// Log a lifecycle event at its own severity
pub fn log_event(event: Event) {
    Logger::log(event.severity(), event.as_str(), &[]);
}

/// Log a lifecycle event with fields
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event() {
        log_event(Event::SessionConnecting);
        log_event(Event::ProbeStopped);
    }

    #[test]
    fn test_log_event_with_fields() {
        log_event_with_fields(Event::ConnectionLost, &[("endpoint", "node1:2181")]);
    }
}
