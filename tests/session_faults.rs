//! Session behavior under connection faults
//!
//! `FaultyConnector` wraps the in-process ensemble's connector and can lose
//! the reply to a write or hold every reply back, while recording what the
//! session actually sent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use ensemble::client::{
    ChannelWatcher, Client, ClientConfig, ClientError, KeeperState, WatchedEvent,
};
use ensemble::protocol::{ConnectRequest, Operation, Reply, Request, ANY_VERSION};
use ensemble::roster::ServerEndpoint;
use ensemble::transport::{
    Connection, Connector, HandshakeOutcome, MemoryConnector, MemoryEnsemble, TransportError,
    TransportResult,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Faults {
    /// Lose the reply to the next write, then fail the connection
    lose_next_write_reply: AtomicBool,
    /// Never hand a reply to the session
    hold_replies: AtomicBool,
    sent: Mutex<Vec<Operation>>,
}

impl Faults {
    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn sent_since(&self, start: usize) -> Vec<Operation> {
        self.sent.lock().unwrap()[start..].to_vec()
    }
}

struct FaultyConnector {
    inner: MemoryConnector,
    faults: Arc<Faults>,
}

#[async_trait]
impl Connector for FaultyConnector {
    async fn handshake(
        &self,
        endpoint: &ServerEndpoint,
        request: ConnectRequest,
    ) -> TransportResult<HandshakeOutcome> {
        match self.inner.handshake(endpoint, request).await? {
            HandshakeOutcome::Accepted {
                response,
                connection,
            } => Ok(HandshakeOutcome::Accepted {
                response,
                connection: Box::new(FaultyConnection {
                    inner: connection,
                    faults: Arc::clone(&self.faults),
                    lost_xid: None,
                }),
            }),
            rejected => Ok(rejected),
        }
    }
}

struct FaultyConnection {
    inner: Box<dyn Connection>,
    faults: Arc<Faults>,
    lost_xid: Option<i32>,
}

#[async_trait]
impl Connection for FaultyConnection {
    async fn send(&mut self, request: Request) -> TransportResult<()> {
        self.faults.sent.lock().unwrap().push(request.op.clone());
        if request.op.is_mutating() && self.faults.lose_next_write_reply.swap(false, Ordering::SeqCst)
        {
            self.lost_xid = Some(request.xid);
        }
        self.inner.send(request).await
    }

    async fn receive(&mut self) -> TransportResult<Reply> {
        if self.faults.hold_replies.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        let reply = self.inner.receive().await?;
        if Some(reply.xid) == self.lost_xid {
            self.inner.cancel().await;
            return Err(TransportError::Closed);
        }
        Ok(reply)
    }

    async fn cancel(&mut self) {
        self.inner.cancel().await;
    }
}

fn config() -> ClientConfig {
    ClientConfig {
        connect_timeout_ms: 500,
        probe_interval_ms: 100,
        probe_timeout_ms: 50,
        request_timeout_ms: 2_000,
        shuffle_roster: false,
        reconnect_backoff_ms: 20,
        max_reconnect_backoff_ms: 100,
        ..ClientConfig::default()
    }
}

fn connect(
    ensemble: &MemoryEnsemble,
    faults: &Arc<Faults>,
    config: ClientConfig,
) -> (Client, mpsc::Receiver<WatchedEvent>) {
    let roster = Arc::new(ensemble.roster().unwrap());
    let (watcher, events) = ChannelWatcher::channel(64);
    let connector = FaultyConnector {
        inner: ensemble.connector(),
        faults: Arc::clone(faults),
    };
    let client = Client::connect(roster, config, Arc::new(connector), Some(Arc::new(watcher)))
        .unwrap();
    (client, events)
}

async fn next_state(events: &mut mpsc::Receiver<WatchedEvent>) -> KeeperState {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for a state event")
        .expect("event channel closed")
        .state
}

// =============================================================================
// UNANSWERED WRITES
// =============================================================================

/// A create applied by the server whose reply never arrives reports
/// ConnectionLoss and is not sent again.
#[tokio::test]
async fn test_unanswered_create_is_not_replayed() {
    let ensemble = MemoryEnsemble::new(3).unwrap();
    let faults = Arc::new(Faults::default());
    let (client, mut events) = connect(&ensemble, &faults, config());
    assert_eq!(next_state(&mut events).await, KeeperState::SyncConnected);

    faults.lose_next_write_reply.store(true, Ordering::SeqCst);
    assert_eq!(
        client.create("/once", "x").await,
        Err(ClientError::ConnectionLoss)
    );
    assert_eq!(next_state(&mut events).await, KeeperState::Disconnected);
    assert_eq!(next_state(&mut events).await, KeeperState::SyncConnected);

    // Applied exactly once, by the lost request
    assert!(client.exists("/once").await.unwrap().is_some());
    let creates = faults
        .sent_since(0)
        .into_iter()
        .filter(|op| matches!(op, Operation::Create { .. }))
        .count();
    assert_eq!(creates, 1);

    client.close().await;
}

#[tokio::test]
async fn test_unanswered_set_data_is_applied_once() {
    let ensemble = MemoryEnsemble::new(3).unwrap();
    let faults = Arc::new(Faults::default());
    let (client, mut events) = connect(&ensemble, &faults, config());
    assert_eq!(next_state(&mut events).await, KeeperState::SyncConnected);
    client.create("/counter", "0").await.unwrap();

    faults.lose_next_write_reply.store(true, Ordering::SeqCst);
    assert_eq!(
        client.set_data("/counter", "1", ANY_VERSION).await,
        Err(ClientError::ConnectionLoss)
    );

    let (data, stat) = client.get_data("/counter").await.unwrap();
    assert_eq!(data, b"1".to_vec());
    assert_eq!(stat.version, 1);

    client.close().await;
}

// =============================================================================
// HEARTBEATS
// =============================================================================

/// An idle session pings; with nothing coming back the connection is
/// declared lost well before the session timeout.
#[tokio::test]
async fn test_silent_connection_is_declared_lost() {
    // 50ms tick: session timeouts negotiate within 100ms..1s
    let ensemble = MemoryEnsemble::with_tick(3, Duration::from_millis(50)).unwrap();
    let faults = Arc::new(Faults::default());
    let config = ClientConfig {
        session_timeout_ms: 300,
        ..config()
    };
    let (client, mut events) = connect(&ensemble, &faults, config);
    assert_eq!(next_state(&mut events).await, KeeperState::SyncConnected);
    assert_eq!(client.status().negotiated_timeout, Duration::from_millis(300));

    let start = faults.sent_count();
    faults.hold_replies.store(true, Ordering::SeqCst);

    let lost = timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("silent connection was not declared lost")
        .unwrap();
    assert_eq!(lost.state, KeeperState::Disconnected);
    assert!(faults.sent_since(start).contains(&Operation::Ping));

    faults.hold_replies.store(false, Ordering::SeqCst);
    assert_eq!(next_state(&mut events).await, KeeperState::SyncConnected);

    client.close().await;
}

// =============================================================================
// REQUEST QUEUE
// =============================================================================

/// With room for one pending operation, a second concurrent submit waits
/// for room, fails at its deadline and is never sent.
#[tokio::test]
async fn test_full_queue_holds_back_submits() {
    let ensemble = MemoryEnsemble::new(3).unwrap();
    let faults = Arc::new(Faults::default());
    let config = ClientConfig {
        request_queue_capacity: 1,
        request_timeout_ms: 300,
        ..config()
    };
    let (client, mut events) = connect(&ensemble, &faults, config);
    assert_eq!(next_state(&mut events).await, KeeperState::SyncConnected);

    let start = faults.sent_count();
    faults.hold_replies.store(true, Ordering::SeqCst);

    let (first, second) = tokio::join!(client.get_data("/a"), client.get_data("/b"));
    let limit = ClientError::OperationTimeout(Duration::from_millis(300));
    assert_eq!(first, Err(limit.clone()));
    assert_eq!(second, Err(limit));

    assert_eq!(faults.sent_since(start), vec![Operation::get_data("/a")]);

    client.close().await;
}

// =============================================================================
// SCOPED RELEASE
// =============================================================================

/// Dropping the last handle closes the session on the server and ends
/// event delivery.
#[tokio::test]
async fn test_dropping_last_handle_closes_session() {
    let ensemble = MemoryEnsemble::new(3).unwrap();
    let faults = Arc::new(Faults::default());
    let (client, mut events) = connect(&ensemble, &faults, config());
    assert_eq!(next_state(&mut events).await, KeeperState::SyncConnected);
    let session_id = client.session_id();
    assert!(ensemble.node(0).unwrap().session_alive(session_id));

    drop(client);

    let closed = timeout(WAIT, events.recv()).await.unwrap();
    assert!(closed.is_none(), "no events after the session closes");
    assert!(faults.sent_since(0).contains(&Operation::CloseSession));
    assert!(!ensemble.node(0).unwrap().session_alive(session_id));
}
