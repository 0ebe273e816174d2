//! Client metrics registry
//!
//! - Counters only, monotonic
//! - Reset only when a new client is created
//! - Lock-free: every counter is an atomic with relaxed ordering

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for one client instance.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    /// Handshakes started (session and probe handshakes are counted apart)
    handshakes_attempted: AtomicU64,
    /// Handshakes that produced a session
    handshakes_succeeded: AtomicU64,
    /// Connected sessions that had to reconnect
    reconnects: AtomicU64,
    /// Probe handshakes sent while read-only
    probes_sent: AtomicU64,
    /// Probes that found a read-write server
    majorities_found: AtomicU64,
    /// Mutating operations refused locally in read-only mode
    read_only_rejections: AtomicU64,
    /// Operations completed with a server reply
    operations_completed: AtomicU64,
    /// State events handed to watchers
    events_delivered: AtomicU64,
    /// Watcher invocations that panicked
    watcher_panics: AtomicU64,
}

impl ClientMetrics {
    /// Create a registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_handshakes_attempted(&self) {
        self.handshakes_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_handshakes_succeeded(&self) {
        self.handshakes_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_probes_sent(&self) {
        self.probes_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_majorities_found(&self) {
        self.majorities_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_read_only_rejections(&self) {
        self.read_only_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_operations_completed(&self) {
        self.operations_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_events_delivered(&self) {
        self.events_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_watcher_panics(&self) {
        self.watcher_panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            handshakes_attempted: self.handshakes_attempted.load(Ordering::Relaxed),
            handshakes_succeeded: self.handshakes_succeeded.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            probes_sent: self.probes_sent.load(Ordering::Relaxed),
            majorities_found: self.majorities_found.load(Ordering::Relaxed),
            read_only_rejections: self.read_only_rejections.load(Ordering::Relaxed),
            operations_completed: self.operations_completed.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            watcher_panics: self.watcher_panics.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub handshakes_attempted: u64,
    pub handshakes_succeeded: u64,
    pub reconnects: u64,
    pub probes_sent: u64,
    pub majorities_found: u64,
    pub read_only_rejections: u64,
    pub operations_completed: u64,
    pub events_delivered: u64,
    pub watcher_panics: u64,
}

impl MetricsSnapshot {
    /// Snapshot as a single JSON object
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registry_has_zero_values() {
        let snapshot = ClientMetrics::new().snapshot();
        assert_eq!(snapshot.handshakes_attempted, 0);
        assert_eq!(snapshot.probes_sent, 0);
        assert_eq!(snapshot.events_delivered, 0);
    }

    #[test]
    fn test_increment_counters() {
        let metrics = ClientMetrics::new();

        metrics.increment_handshakes_attempted();
        metrics.increment_handshakes_attempted();
        metrics.increment_handshakes_succeeded();
        metrics.increment_probes_sent();
        metrics.increment_majorities_found();
        metrics.increment_read_only_rejections();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.handshakes_attempted, 2);
        assert_eq!(snapshot.handshakes_succeeded, 1);
        assert_eq!(snapshot.probes_sent, 1);
        assert_eq!(snapshot.majorities_found, 1);
        assert_eq!(snapshot.read_only_rejections, 1);
    }

    #[test]
    fn test_to_json() {
        let metrics = ClientMetrics::new();
        metrics.increment_reconnects();

        let parsed: serde_json::Value =
            serde_json::from_str(&metrics.snapshot().to_json()).unwrap();
        assert_eq!(parsed["reconnects"], 1);
        assert_eq!(parsed["watcher_panics"], 0);
    }

    #[test]
    fn test_thread_safety() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(ClientMetrics::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let m = Arc::clone(&metrics);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    m.increment_events_delivered();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.snapshot().events_delivered, 800);
    }
}
