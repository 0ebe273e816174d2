//! Majority prober
//!
//! Runs while the session is connected read-only. Every probe interval it
//! opens a throwaway session (`allow_read_only = false`) against the next
//! roster endpoint, skipping the one in use. The first endpoint that accepts
//! read-write gets hinted, logged, and sent to the session task over a
//! one-slot channel; the prober then stops.
//!
//! At most one probe is in flight and missed ticks are skipped. Stopping the
//! handle cancels an in-flight probe.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::observability::{log_event_with_fields, ClientMetrics, Event};
use crate::protocol::{ConnectRequest, HandshakeRejection, Operation, Request};
use crate::roster::{EndpointRef, RoleHint, ServerRoster};
use crate::transport::{Connector, HandshakeOutcome};

/// Xid used to close probe sessions.
const PROBE_CLOSE_XID: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeOutcome {
    MajorityFound,
    ReadOnly,
    Failed,
}

/// Background majority search for one read-only connection.
pub struct MajorityProber {
    pub roster: Arc<ServerRoster>,
    pub connector: Arc<dyn Connector>,
    pub metrics: Arc<ClientMetrics>,
    /// Address of the read-only endpoint in use
    pub current: String,
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub timeout_hint_ms: u64,
    pub auth: Option<String>,
    /// "Switch now" signal to the session task
    pub switch: mpsc::Sender<EndpointRef>,
}

/// Cancels the prober when stopped or dropped.
pub struct ProberHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ProberHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ProberHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl MajorityProber {
    pub fn spawn(self) -> ProberHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(cancel.clone()));
        ProberHandle { cancel, task }
    }

    async fn run(self, cancel: CancellationToken) {
        log_event_with_fields(
            Event::ProbeStarted,
            &[
                ("current", &self.current),
                ("interval_ms", &self.interval.as_millis().to_string()),
            ],
        );

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cursor = 0usize;

        let reason = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break "cancelled",
                _ = ticker.tick() => {}
            }

            let Some(endpoint) = self.next_candidate(&mut cursor) else {
                continue;
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break "cancelled",
                outcome = self.probe(&endpoint) => outcome,
            };

            if outcome == ProbeOutcome::MajorityFound {
                self.metrics.increment_majorities_found();
                log_event_with_fields(
                    Event::MajorityServerFound,
                    &[("current", &self.current), ("endpoint", &endpoint.address())],
                );
                // One slot: a pending signal already says "switch"
                let _ = self.switch.try_send(endpoint);
                break "majority found";
            }
        };

        log_event_with_fields(
            Event::ProbeStopped,
            &[("current", &self.current), ("reason", reason)],
        );
    }

    /// Next endpoint in round-robin order, skipping the current one.
    fn next_candidate(&self, cursor: &mut usize) -> Option<EndpointRef> {
        let endpoints = self.roster.snapshot();
        let len = endpoints.len();
        for _ in 0..len {
            let endpoint = &endpoints[*cursor % len];
            *cursor = (*cursor + 1) % len;
            if endpoint.address() != self.current {
                return Some(Arc::clone(endpoint));
            }
        }
        None
    }

    async fn probe(&self, endpoint: &EndpointRef) -> ProbeOutcome {
        self.metrics.increment_probes_sent();
        let request =
            ConnectRequest::fresh(self.timeout_hint_ms, false).with_auth(self.auth.clone());

        let outcome = match timeout(
            self.probe_timeout,
            self.connector.handshake(endpoint, request),
        )
        .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) | Err(_) => return ProbeOutcome::Failed,
        };

        match outcome {
            HandshakeOutcome::Accepted {
                response,
                mut connection,
            } => {
                let _ = timeout(
                    self.probe_timeout,
                    connection.send(Request {
                        xid: PROBE_CLOSE_XID,
                        op: Operation::CloseSession,
                    }),
                )
                .await;
                connection.cancel().await;

                if response.read_only {
                    endpoint.set_role_hint(RoleHint::ReadOnly);
                    ProbeOutcome::ReadOnly
                } else {
                    endpoint.set_role_hint(RoleHint::ReadWrite);
                    ProbeOutcome::MajorityFound
                }
            }
            HandshakeOutcome::Rejected(HandshakeRejection::ReadOnlyRefused) => {
                endpoint.set_role_hint(RoleHint::ReadOnly);
                ProbeOutcome::ReadOnly
            }
            HandshakeOutcome::Rejected(_) => ProbeOutcome::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::roster::ServerEndpoint;
    use crate::transport::{MemoryConnector, MemoryEnsemble, TransportResult};

    fn prober(
        ensemble: &MemoryEnsemble,
        roster: Arc<ServerRoster>,
        switch: mpsc::Sender<EndpointRef>,
        metrics: Arc<ClientMetrics>,
    ) -> MajorityProber {
        MajorityProber {
            roster,
            connector: Arc::new(ensemble.connector()),
            metrics,
            current: ensemble.address(0).unwrap(),
            interval: Duration::from_millis(20),
            probe_timeout: Duration::from_millis(200),
            timeout_hint_ms: 30_000,
            auth: None,
            switch,
        }
    }

    #[tokio::test]
    async fn test_finds_majority_and_stops() {
        let ensemble = MemoryEnsemble::new(3).unwrap();
        ensemble.suspend(0);
        let roster = Arc::new(ensemble.roster().unwrap());
        let metrics = Arc::new(ClientMetrics::new());
        let (tx, mut rx) = mpsc::channel(1);

        let handle = prober(&ensemble, Arc::clone(&roster), tx, Arc::clone(&metrics)).spawn();

        let found = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(found.address(), ensemble.address(0).unwrap());
        assert_eq!(found.role_hint(), RoleHint::ReadWrite);
        assert_eq!(metrics.snapshot().majorities_found, 1);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_keeps_probing_without_quorum() {
        let ensemble = MemoryEnsemble::new(3).unwrap();
        ensemble.stop(2);
        ensemble.suspend(1);
        let roster = Arc::new(ensemble.roster().unwrap());
        let metrics = Arc::new(ClientMetrics::new());
        let (tx, mut rx) = mpsc::channel(1);

        let handle = prober(&ensemble, Arc::clone(&roster), tx, Arc::clone(&metrics)).spawn();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(rx.try_recv().is_err());
        assert!(metrics.snapshot().probes_sent >= 2);
        // node2 is looking and refuses read-write probes
        assert_eq!(
            roster.find(&ensemble.address(1).unwrap()).unwrap().role_hint(),
            RoleHint::ReadOnly
        );
        assert!(!handle.is_finished());
        handle.stop();
    }

    /// Handshakes that take `delay`, counting how many run at once.
    struct SlowConnector {
        inner: MemoryConnector,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    struct InFlight<'a>(&'a AtomicUsize);

    impl Drop for InFlight<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Connector for SlowConnector {
        async fn handshake(
            &self,
            endpoint: &ServerEndpoint,
            request: ConnectRequest,
        ) -> TransportResult<HandshakeOutcome> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlight(&self.in_flight);
            tokio::time::sleep(self.delay).await;
            self.inner.handshake(endpoint, request).await
        }
    }

    async fn wait_finished(handle: &ProberHandle) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_single_handshake_in_flight_and_stop_ends_task() {
        let ensemble = MemoryEnsemble::new(3).unwrap();
        ensemble.stop(2);
        ensemble.suspend(1);
        let roster = Arc::new(ensemble.roster().unwrap());
        let metrics = Arc::new(ClientMetrics::new());
        let connector = Arc::new(SlowConnector {
            inner: ensemble.connector(),
            // Spans several ticks
            delay: Duration::from_millis(100),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let (tx, _rx) = mpsc::channel(1);

        let mut config = prober(&ensemble, roster, tx, Arc::clone(&metrics));
        config.connector = Arc::clone(&connector) as Arc<dyn Connector>;
        let handle = config.spawn();

        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(metrics.snapshot().probes_sent >= 2);
        assert_eq!(connector.max_in_flight.load(Ordering::SeqCst), 1);

        handle.stop();
        wait_finished(&handle).await;
        // The in-flight handshake was cancelled with the task
        assert_eq!(connector.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropping_handle_ends_task() {
        let ensemble = MemoryEnsemble::new(3).unwrap();
        ensemble.stop_many(&[1, 2]);
        let roster = Arc::new(ensemble.roster().unwrap());
        let (tx, _rx) = mpsc::channel(1);

        let handle = prober(&ensemble, roster, tx, Arc::new(ClientMetrics::new())).spawn();
        let cancel = handle.cancel.clone();
        drop(handle);
        assert!(cancel.is_cancelled());
    }
}
