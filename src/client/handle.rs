//! Client handle
//!
//! `Client` is the application-facing side of a session. It checks the
//! published session status for fast local answers (closed, expired,
//! read-only writes) and otherwise hands operations to the session task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, timeout_at, Instant};

use crate::observability::{log_event_with_fields, ClientMetrics, Event, MetricsSnapshot};
use crate::protocol::{OpResult, Operation, Stat};
use crate::roster::ServerRoster;
use crate::transport::Connector;

use super::config::ClientConfig;
use super::errors::{ClientError, ClientResult};
use super::session::{Command, Inbox, SessionTask};
use super::state::{SessionState, SessionStatus};
use super::watcher::{Watcher, WatcherDispatcher, WatcherId};

/// A read-only capable session against an ensemble.
///
/// Dropping the last handle closes the session.
pub struct Client {
    commands: mpsc::Sender<Command>,
    closes: mpsc::UnboundedSender<oneshot::Sender<()>>,
    status: watch::Receiver<SessionStatus>,
    dispatcher: Arc<WatcherDispatcher>,
    metrics: Arc<ClientMetrics>,
    request_timeout: Duration,
    closed: AtomicBool,
}

impl Client {
    /// Start a session. Returns immediately; the session connects in the
    /// background and reports progress to `watcher`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn connect(
        roster: Arc<ServerRoster>,
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> ClientResult<Self> {
        config.validate()?;
        if roster.is_empty() {
            return Err(ClientError::Config("roster is empty".to_string()));
        }
        if config.shuffle_roster {
            roster.shuffle();
        }

        let metrics = Arc::new(ClientMetrics::new());
        let dispatcher = Arc::new(WatcherDispatcher::new(
            config.watcher_queue_capacity,
            Arc::clone(&metrics),
        ));
        // Registered before the task starts so the first event is seen
        if let Some(watcher) = watcher {
            dispatcher.register(watcher);
        }

        let (commands, receiver) = mpsc::channel(config.request_queue_capacity);
        let (closes, close_requests) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SessionStatus::initial());
        let request_timeout = config.request_timeout();

        let task = SessionTask::new(
            config,
            roster,
            connector,
            Arc::clone(&dispatcher),
            Arc::clone(&metrics),
            Inbox::new(receiver, close_requests),
            status_tx,
        );
        tokio::spawn(task.run());

        Ok(Self {
            commands,
            closes,
            status,
            dispatcher,
            metrics,
            request_timeout,
            closed: AtomicBool::new(false),
        })
    }

    // ==================
    // Operations
    // ==================

    /// Submit an operation and wait for its result.
    ///
    /// Writes fail with `NotReadOnly` right away while the session is
    /// connected read-only. With `request_queue_capacity` operations already
    /// pending, waits for room; the request deadline covers the wait.
    pub async fn submit(&self, op: Operation) -> ClientResult<OpResult> {
        if op.is_internal() {
            return Err(ClientError::InvalidOperation(op.name()));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::SessionClosed);
        }

        let state = self.status.borrow().state;
        match state {
            SessionState::Closed => return Err(ClientError::SessionClosed),
            SessionState::Expired => return Err(ClientError::SessionExpired),
            SessionState::AuthFailed => return Err(ClientError::AuthFailed),
            SessionState::ConnectedReadOnly if op.is_mutating() => {
                self.metrics.increment_read_only_rejections();
                log_event_with_fields(
                    Event::WriteRejectedReadOnly,
                    &[("operation", op.name()), ("path", op.path().unwrap_or(""))],
                );
                return Err(ClientError::NotReadOnly);
            }
            _ => {}
        }

        let deadline = Instant::now() + self.request_timeout;
        let (reply, result) = oneshot::channel();
        match timeout_at(deadline, self.commands.send(Command { op, reply })).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(self.ended_error()),
            Err(_) => return Err(self.timeout_error()),
        }

        match timeout_at(deadline, result).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.ended_error()),
            Err(_) => Err(self.timeout_error()),
        }
    }

    pub async fn get_data(&self, path: &str) -> ClientResult<(Vec<u8>, Stat)> {
        match self.submit(Operation::get_data(path)).await? {
            OpResult::Data { data, stat } => Ok((data, stat)),
            _ => Err(ClientError::UnexpectedReply("get_data")),
        }
    }

    pub async fn exists(&self, path: &str) -> ClientResult<Option<Stat>> {
        match self.submit(Operation::exists(path)).await? {
            OpResult::Stat(stat) => Ok(stat),
            _ => Err(ClientError::UnexpectedReply("exists")),
        }
    }

    pub async fn get_children(&self, path: &str) -> ClientResult<Vec<String>> {
        match self.submit(Operation::get_children(path)).await? {
            OpResult::Children(children) => Ok(children),
            _ => Err(ClientError::UnexpectedReply("get_children")),
        }
    }

    /// Create a node. Returns the created path.
    pub async fn create(&self, path: &str, data: impl Into<Vec<u8>>) -> ClientResult<String> {
        match self.submit(Operation::create(path, data)).await? {
            OpResult::Created(path) => Ok(path),
            _ => Err(ClientError::UnexpectedReply("create")),
        }
    }

    pub async fn set_data(
        &self,
        path: &str,
        data: impl Into<Vec<u8>>,
        version: i32,
    ) -> ClientResult<Stat> {
        match self.submit(Operation::set_data(path, data, version)).await? {
            OpResult::Stat(Some(stat)) => Ok(stat),
            _ => Err(ClientError::UnexpectedReply("set_data")),
        }
    }

    pub async fn delete(&self, path: &str, version: i32) -> ClientResult<()> {
        match self.submit(Operation::delete(path, version)).await? {
            OpResult::Done => Ok(()),
            _ => Err(ClientError::UnexpectedReply("delete")),
        }
    }

    pub async fn sync(&self, path: &str) -> ClientResult<()> {
        match self.submit(Operation::sync(path)).await? {
            OpResult::Done => Ok(()),
            _ => Err(ClientError::UnexpectedReply("sync")),
        }
    }

    /// Close the session. Pending operations fail with `SessionClosed`.
    /// Calling it again does nothing.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let (done, finished) = oneshot::channel();
        if self.closes.send(done).is_ok() {
            let _ = finished.await;
        }
    }

    // ==================
    // Status
    // ==================

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    /// Current session id, or 0 before the first handshake.
    pub fn session_id(&self) -> u64 {
        self.status.borrow().session_id
    }

    pub fn is_read_only(&self) -> bool {
        self.state() == SessionState::ConnectedReadOnly
    }

    /// Wait until the session reaches `target`. Fails if the session ends
    /// in another state or `within` elapses first.
    pub async fn wait_for_state(&self, target: SessionState, within: Duration) -> ClientResult<()> {
        self.wait_until(within, |state| state == target).await?;
        if self.state() == target {
            Ok(())
        } else {
            Err(self.ended_error())
        }
    }

    /// Wait until the session is connected, read-write or read-only.
    pub async fn wait_until_connected(&self, within: Duration) -> ClientResult<SessionState> {
        self.wait_until(within, |state| state.is_connected()).await?;
        let state = self.state();
        if state.is_connected() {
            Ok(state)
        } else {
            Err(self.ended_error())
        }
    }

    async fn wait_until<F>(&self, within: Duration, mut reached: F) -> ClientResult<()>
    where
        F: FnMut(SessionState) -> bool,
    {
        let mut status = self.status.clone();
        let waited = timeout(
            within,
            status.wait_for(|status| reached(status.state) || status.state.is_terminal()),
        )
        .await;
        match waited {
            Ok(_) => Ok(()),
            Err(_) => Err(ClientError::OperationTimeout(within)),
        }
    }

    // ==================
    // Watchers and metrics
    // ==================

    /// Register another watcher. It sees events from now on.
    pub fn register_watcher(&self, watcher: Arc<dyn Watcher>) -> WatcherId {
        self.dispatcher.register(watcher)
    }

    pub fn unregister_watcher(&self, id: WatcherId) -> bool {
        self.dispatcher.unregister(id)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Error for an operation that could not finish because the session
    /// task is gone.
    fn ended_error(&self) -> ClientError {
        match self.state() {
            SessionState::Expired => ClientError::SessionExpired,
            SessionState::AuthFailed => ClientError::AuthFailed,
            _ => ClientError::SessionClosed,
        }
    }

    fn timeout_error(&self) -> ClientError {
        if self.state().is_connected() {
            ClientError::OperationTimeout(self.request_timeout)
        } else {
            ClientError::ConnectionLoss
        }
    }
}
