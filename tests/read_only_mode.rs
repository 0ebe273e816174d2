//! Read-only mode session tests
//!
//! Drives `Client` against an in-process three node ensemble and checks the
//! state events, operation outcomes and migrations the session goes through
//! as quorum is lost and regained.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::timeout;

use ensemble::client::{
    ChannelWatcher, Client, ClientConfig, ClientError, KeeperState, SessionState, WatchedEvent,
};
use ensemble::protocol::ANY_VERSION;
use ensemble::transport::MemoryEnsemble;

const EVENT_WAIT: Duration = Duration::from_secs(5);

/// Short timers so migrations finish quickly.
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
    .with_allow_read_only(true)
}

fn connect(ensemble: &MemoryEnsemble, config: ClientConfig) -> (Client, mpsc::Receiver<WatchedEvent>) {
    let roster = Arc::new(ensemble.roster().unwrap());
    let (watcher, events) = ChannelWatcher::channel(64);
    let client = Client::connect(
        roster,
        config,
        Arc::new(ensemble.connector()),
        Some(Arc::new(watcher)),
    )
    .unwrap();
    (client, events)
}

async fn next_state(events: &mut mpsc::Receiver<WatchedEvent>) -> KeeperState {
    timeout(EVENT_WAIT, events.recv())
        .await
        .expect("timed out waiting for a state event")
        .expect("event channel closed")
        .state
}

/// Connect read-write, then lose nodes 2 and 3.
async fn degrade(
    ensemble: &MemoryEnsemble,
    events: &mut mpsc::Receiver<WatchedEvent>,
) -> Vec<KeeperState> {
    let mut seen = vec![next_state(events).await];
    ensemble.stop_many(&[1, 2]);
    seen.push(next_state(events).await);
    seen.push(next_state(events).await);
    seen
}

// =============================================================================
// DEGRADED EPISODE
// =============================================================================

/// Losing quorum produces exactly SyncConnected, Disconnected,
/// ConnectedReadOnly.
#[tokio::test]
async fn test_degraded_episode_event_order() {
    let ensemble = MemoryEnsemble::new(3).unwrap();
    let (client, mut events) = connect(&ensemble, config());

    let seen = degrade(&ensemble, &mut events).await;
    assert_eq!(
        seen,
        vec![
            KeeperState::SyncConnected,
            KeeperState::Disconnected,
            KeeperState::ConnectedReadOnly
        ]
    );
    assert_eq!(client.state(), SessionState::ConnectedReadOnly);
    assert!(client.is_read_only());
    assert_eq!(client.status().endpoint, ensemble.address(0));

    client.close().await;
}

/// Writes fail with NotReadOnly and never reach a server.
#[tokio::test]
async fn test_writes_rejected_locally_while_read_only() {
    let ensemble = MemoryEnsemble::new(3).unwrap();
    let (client, mut events) = connect(&ensemble, config());
    degrade(&ensemble, &mut events).await;

    let before = ensemble.total_requests_served();
    assert_eq!(
        client.create("/locked", "x").await,
        Err(ClientError::NotReadOnly)
    );
    assert_eq!(
        client.set_data("/", "x", ANY_VERSION).await,
        Err(ClientError::NotReadOnly)
    );
    assert_eq!(
        client.delete("/locked", ANY_VERSION).await,
        Err(ClientError::NotReadOnly)
    );
    assert_eq!(ensemble.total_requests_served(), before);
    assert_eq!(client.metrics().read_only_rejections, 3);

    client.close().await;
}

/// Reads see the latest value visible to the read-only node.
#[tokio::test]
async fn test_reads_served_while_read_only() {
    let ensemble = MemoryEnsemble::new(3).unwrap();
    let (client, mut events) = connect(&ensemble, config());
    assert_eq!(next_state(&mut events).await, KeeperState::SyncConnected);

    client.create("/config", "v1").await.unwrap();
    let stat = client.set_data("/config", "v2", ANY_VERSION).await.unwrap();
    assert_eq!(stat.version, 1);

    ensemble.stop_many(&[1, 2]);
    assert_eq!(next_state(&mut events).await, KeeperState::Disconnected);
    assert_eq!(next_state(&mut events).await, KeeperState::ConnectedReadOnly);

    let (data, stat) = client.get_data("/config").await.unwrap();
    assert_eq!(data, b"v2".to_vec());
    assert_eq!(stat.version, 1);
    assert_eq!(
        client.get_children("/").await.unwrap(),
        vec!["config".to_string()]
    );
    assert!(client.exists("/missing").await.unwrap().is_none());

    client.close().await;
}

// =============================================================================
// MIGRATION
// =============================================================================

/// End to end: degrade, refuse a write, migrate back once the majority
/// returns, then write again.
#[tokio::test]
async fn test_migrates_back_to_majority() {
    let ensemble = MemoryEnsemble::new(3).unwrap();
    let config = config();
    let bound = Duration::from_millis(config.probe_interval_ms + config.connect_timeout_ms);
    let (client, mut events) = connect(&ensemble, config);

    assert_eq!(next_state(&mut events).await, KeeperState::SyncConnected);
    client.create("/app", "before").await.unwrap();

    ensemble.stop_many(&[1, 2]);
    assert_eq!(next_state(&mut events).await, KeeperState::Disconnected);
    assert_eq!(next_state(&mut events).await, KeeperState::ConnectedReadOnly);
    assert_eq!(
        client.set_data("/app", "during", ANY_VERSION).await,
        Err(ClientError::NotReadOnly)
    );

    let restarted = Instant::now();
    ensemble.start_many(&[1, 2]);
    assert_eq!(next_state(&mut events).await, KeeperState::Disconnected);
    assert_eq!(next_state(&mut events).await, KeeperState::SyncConnected);
    // Scheduling slack on top of one probe interval and one connect timeout
    assert!(restarted.elapsed() < bound + Duration::from_secs(1));

    assert_eq!(client.state(), SessionState::Connected);
    assert_ne!(client.status().endpoint, ensemble.address(0));
    client.set_data("/app", "after", ANY_VERSION).await.unwrap();
    let (data, _) = client.get_data("/app").await.unwrap();
    assert_eq!(data, b"after".to_vec());
    assert_eq!(client.metrics().majorities_found, 1);

    client.close().await;
}

/// A session minted by a read-only node is replaced after migrating to the
/// majority. The new id is not an error.
#[tokio::test]
async fn test_read_only_session_id_replaced_after_migration() {
    let ensemble = MemoryEnsemble::new(3).unwrap();
    ensemble.stop_many(&[1, 2]);
    let (client, mut events) = connect(&ensemble, config());

    assert_eq!(next_state(&mut events).await, KeeperState::ConnectedReadOnly);
    let read_only_id = client.session_id();
    assert_ne!(read_only_id, 0);

    ensemble.start_many(&[1, 2]);
    assert_eq!(next_state(&mut events).await, KeeperState::Disconnected);
    assert_eq!(next_state(&mut events).await, KeeperState::SyncConnected);

    assert_ne!(client.session_id(), read_only_id);
    assert_ne!(client.session_id(), 0);
    client.create("/after-migration", "").await.unwrap();

    client.close().await;
}

/// A node that cannot rejoin serves read-only while the other two form a
/// quorum; the prober finds the majority.
#[tokio::test]
async fn test_prober_finds_majority_with_suspended_node() {
    let ensemble = MemoryEnsemble::new(3).unwrap();
    ensemble.suspend(0);
    let (client, mut events) = connect(&ensemble, config());

    assert_eq!(next_state(&mut events).await, KeeperState::ConnectedReadOnly);
    assert_eq!(next_state(&mut events).await, KeeperState::Disconnected);
    assert_eq!(next_state(&mut events).await, KeeperState::SyncConnected);

    let metrics = client.metrics();
    assert_eq!(metrics.majorities_found, 1);
    assert!(metrics.probes_sent >= 1);
    assert_ne!(client.status().endpoint, ensemble.address(0));

    client.close().await;
}

// =============================================================================
// WITHOUT READ-ONLY MODE
// =============================================================================

/// Without read-only mode a lost quorum surfaces as ConnectionLoss once the
/// operation deadline passes.
#[tokio::test]
async fn test_no_read_only_means_connection_loss() {
    let ensemble = MemoryEnsemble::new(3).unwrap();
    let config = ClientConfig {
        request_timeout_ms: 300,
        ..config().with_allow_read_only(false)
    };
    let (client, mut events) = connect(&ensemble, config);

    assert_eq!(next_state(&mut events).await, KeeperState::SyncConnected);
    ensemble.stop_many(&[1, 2]);
    assert_eq!(next_state(&mut events).await, KeeperState::Disconnected);

    assert_eq!(
        client.get_data("/").await,
        Err(ClientError::ConnectionLoss)
    );
    assert_eq!(client.state(), SessionState::Connecting);

    client.close().await;
}

// =============================================================================
// TERMINAL STATES
// =============================================================================

#[tokio::test]
async fn test_expired_session_is_terminal() {
    let ensemble = MemoryEnsemble::new(3).unwrap();
    let (client, mut events) = connect(&ensemble, config());
    assert_eq!(next_state(&mut events).await, KeeperState::SyncConnected);

    assert!(ensemble.expire_session(client.session_id()));
    assert_eq!(next_state(&mut events).await, KeeperState::Disconnected);
    assert_eq!(next_state(&mut events).await, KeeperState::Expired);

    assert_eq!(client.state(), SessionState::Expired);
    assert_eq!(client.get_data("/").await, Err(ClientError::SessionExpired));
    assert_eq!(
        client
            .wait_for_state(SessionState::Connected, Duration::from_millis(100))
            .await,
        Err(ClientError::SessionExpired)
    );
}

#[tokio::test]
async fn test_auth_failure_is_terminal() {
    let ensemble = MemoryEnsemble::new(3).unwrap();
    ensemble.require_auth(Some("token".to_string()));

    let (client, mut events) = connect(&ensemble, config());
    assert_eq!(next_state(&mut events).await, KeeperState::AuthFailed);
    assert_eq!(client.state(), SessionState::AuthFailed);
    assert_eq!(client.exists("/").await, Err(ClientError::AuthFailed));

    let authenticated = ClientConfig {
        auth: Some("token".to_string()),
        ..config()
    };
    let (client, mut events) = connect(&ensemble, authenticated);
    assert_eq!(next_state(&mut events).await, KeeperState::SyncConnected);
    client.close().await;
}

// =============================================================================
// CLOSE
// =============================================================================

/// Closing twice is fine and produces no events.
#[tokio::test]
async fn test_close_is_idempotent() {
    let ensemble = MemoryEnsemble::new(3).unwrap();
    let (client, mut events) = connect(&ensemble, config());
    assert_eq!(next_state(&mut events).await, KeeperState::SyncConnected);

    client.close().await;
    client.close().await;

    assert_eq!(client.state(), SessionState::Closed);
    assert_eq!(client.get_data("/").await, Err(ClientError::SessionClosed));
    // The watcher is released without another event
    let next = timeout(EVENT_WAIT, events.recv()).await.unwrap();
    assert!(next.is_none());
}

/// Operations waiting for a connection fail with SessionClosed.
#[tokio::test]
async fn test_close_fails_pending_operations() {
    let ensemble = MemoryEnsemble::new(3).unwrap();
    ensemble.stop_many(&[1, 2]);
    let (client, _events) = connect(&ensemble, config().with_allow_read_only(false));
    let client = Arc::new(client);

    let waiting = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.get_data("/").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.state(), SessionState::Connecting);

    client.close().await;
    let result = timeout(EVENT_WAIT, waiting).await.unwrap().unwrap();
    assert_eq!(result, Err(ClientError::SessionClosed));
}

// =============================================================================
// ORDERING
// =============================================================================

/// Pipelined operations are applied and completed in submission order.
#[tokio::test]
async fn test_completions_follow_submission_order() {
    let ensemble = MemoryEnsemble::new(3).unwrap();
    let (client, _events) = connect(&ensemble, config());
    client
        .wait_until_connected(EVENT_WAIT)
        .await
        .unwrap();

    let (a, b, c) = tokio::join!(
        client.create("/a", ""),
        client.create("/b", ""),
        client.create("/c", "")
    );
    assert_eq!(a.unwrap(), "/a");
    assert_eq!(b.unwrap(), "/b");
    assert_eq!(c.unwrap(), "/c");

    let a = client.exists("/a").await.unwrap().unwrap();
    let b = client.exists("/b").await.unwrap().unwrap();
    let c = client.exists("/c").await.unwrap().unwrap();
    assert!(a.czxid < b.czxid && b.czxid < c.czxid);

    client.close().await;
}
