//! Session task
//!
//! One task per client owns the connection, the session record and the
//! pending queue, and is the only writer of all three. It alternates
//! between two phases:
//!
//! - `establish`: walk the roster until a handshake succeeds, backing off
//!   after each exhausted pass
//! - `serve`: pipeline requests, match replies, send heartbeats, and watch
//!   for disconnects and for the prober's "switch now" signal
//!
//! Submits from `Client` handles are taken in both phases until the pending
//! queue is full; after that senders wait on the bounded command channel
//! under their own deadline. Close requests travel on a separate channel and
//! are always taken.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::observability::{log_event_with_fields, ClientMetrics, Event};
use crate::protocol::{ConnectResponse, ErrorCode, HandshakeRejection, Operation, Reply, Request};
use crate::roster::{EndpointRef, EndpointSelector, RoleHint, ServerRoster};
use crate::transport::{Connection, Connector, HandshakeOutcome, TransportResult};

use super::config::ClientConfig;
use super::errors::{ClientError, ClientResult};
use super::pending::{PendingQueue, ReplySender};
use super::prober::{MajorityProber, ProberHandle};
use super::state::{HandshakeEffect, KeeperState, Session, SessionState, SessionStatus};
use super::watcher::{WatchedEvent, WatcherDispatcher};

/// Operation submitted by a `Client` handle.
pub(crate) struct Command {
    pub op: Operation,
    pub reply: ReplySender,
}

/// A close request; `done` is absent when the last handle was dropped.
struct CloseRequest {
    done: Option<oneshot::Sender<()>>,
}

/// Receiving side of the handle channels.
pub(crate) struct Inbox {
    commands: mpsc::Receiver<Command>,
    closes: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
}

enum Inbound {
    Submit(Command),
    Close(CloseRequest),
}

impl Inbox {
    pub(crate) fn new(
        commands: mpsc::Receiver<Command>,
        closes: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
    ) -> Self {
        Self { commands, closes }
    }

    /// Next close request, or the next submit if `accept_submits`. Both
    /// channels closing means the last handle is gone.
    async fn next(&mut self, accept_submits: bool) -> Inbound {
        tokio::select! {
            biased;
            done = self.closes.recv() => Inbound::Close(CloseRequest { done }),
            command = self.commands.recv(), if accept_submits => match command {
                Some(command) => Inbound::Submit(command),
                None => Inbound::Close(CloseRequest { done: None }),
            },
        }
    }

    /// Stop taking commands and answer the ones already queued.
    fn reject_remaining(&mut self, error: ClientError) {
        self.commands.close();
        self.closes.close();
        while let Ok(command) = self.commands.try_recv() {
            let _ = command.reply.send(Err(error.clone()));
        }
        while let Ok(done) = self.closes.try_recv() {
            let _ = done.send(());
        }
    }
}

/// Where the task goes next.
enum Next {
    Serve(Box<dyn Connection>, EndpointRef),
    Reconnect,
    Close(Option<Box<dyn Connection>>, CloseRequest),
    Terminal(HandshakeRejection),
}

/// Result of a single handshake attempt.
enum Attempt {
    Connected(Box<dyn Connection>),
    Failed,
    Terminal(HandshakeRejection),
    Closed(CloseRequest),
}

/// One connection attempt, logged when it ends.
struct ConnectionAttempt {
    endpoint: String,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl ConnectionAttempt {
    fn start(endpoint: &EndpointRef) -> Self {
        Self {
            endpoint: endpoint.address(),
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> String {
        self.started.elapsed().as_millis().to_string()
    }

    fn failed(self, outcome: &str) {
        log_event_with_fields(
            Event::ConnectAttemptFailed,
            &[
                ("elapsed_ms", &self.elapsed_ms()),
                ("endpoint", &self.endpoint),
                ("outcome", outcome),
                ("started_at", &self.started_at.to_rfc3339()),
            ],
        );
    }
}

pub(crate) struct SessionTask {
    config: ClientConfig,
    roster: Arc<ServerRoster>,
    connector: Arc<dyn Connector>,
    dispatcher: Arc<WatcherDispatcher>,
    metrics: Arc<ClientMetrics>,
    inbox: Inbox,
    status: watch::Sender<SessionStatus>,
    state: SessionState,
    session: Session,
    selector: EndpointSelector,
    pending: PendingQueue,
    next_xid: i32,
    switch_tx: mpsc::Sender<EndpointRef>,
    switch_rx: mpsc::Receiver<EndpointRef>,
    prober: Option<ProberHandle>,
    backoff: Duration,
    has_connected: bool,
}

impl SessionTask {
    pub(crate) fn new(
        config: ClientConfig,
        roster: Arc<ServerRoster>,
        connector: Arc<dyn Connector>,
        dispatcher: Arc<WatcherDispatcher>,
        metrics: Arc<ClientMetrics>,
        inbox: Inbox,
        status: watch::Sender<SessionStatus>,
    ) -> Self {
        let (switch_tx, switch_rx) = mpsc::channel(1);
        let backoff = config.reconnect_backoff();
        let pending = PendingQueue::new(config.request_queue_capacity);
        Self {
            config,
            roster,
            connector,
            dispatcher,
            metrics,
            inbox,
            status,
            state: SessionState::Init,
            session: Session::new(),
            selector: EndpointSelector::new(),
            pending,
            next_xid: 0,
            switch_tx,
            switch_rx,
            prober: None,
            backoff,
            has_connected: false,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut next = self.establish().await;
        loop {
            next = match next {
                Next::Serve(connection, endpoint) => self.serve(connection, endpoint).await,
                Next::Reconnect => self.establish().await,
                Next::Close(connection, close) => {
                    self.finish_close(connection, close).await;
                    return;
                }
                Next::Terminal(rejection) => {
                    self.finish_terminal(rejection).await;
                    return;
                }
            };
        }
    }

    // ==================
    // Establishing
    // ==================

    async fn establish(&mut self) -> Next {
        let state = self.state.begin_connecting();
        self.transition(state);
        self.publish_status(None);
        log_event_with_fields(
            Event::SessionConnecting,
            &[("session_id", &format_session_id(self.session.id()))],
        );

        self.selector.begin_episode();
        loop {
            let endpoints = self.roster.snapshot();
            let Some(endpoint) = self.selector.next(&endpoints) else {
                if let Some(close) = self.back_off().await {
                    return Next::Close(None, close);
                }
                self.selector.begin_episode();
                continue;
            };

            match self.attempt(&endpoint).await {
                Attempt::Connected(connection) => {
                    self.backoff = self.config.reconnect_backoff();
                    return Next::Serve(connection, endpoint);
                }
                Attempt::Failed => continue,
                Attempt::Terminal(rejection) => return Next::Terminal(rejection),
                Attempt::Closed(close) => return Next::Close(None, close),
            }
        }
    }

    /// Sleep after an exhausted roster pass, still taking commands.
    async fn back_off(&mut self) -> Option<CloseRequest> {
        log_event_with_fields(
            Event::RosterExhausted,
            &[
                ("backoff_ms", &self.backoff.as_millis().to_string()),
                ("endpoints", &self.roster.len().to_string()),
            ],
        );

        let sleep = tokio::time::sleep(self.backoff);
        tokio::pin!(sleep);
        loop {
            self.pending.prune_abandoned();
            let accept = !self.pending.is_full();
            tokio::select! {
                _ = &mut sleep => break,
                inbound = self.inbox.next(accept) => {
                    if let Some(close) = self.intake(inbound) {
                        return Some(close);
                    }
                }
            }
        }

        self.backoff = (self.backoff * 2).min(self.config.max_reconnect_backoff());
        None
    }

    async fn attempt(&mut self, endpoint: &EndpointRef) -> Attempt {
        let attempt = ConnectionAttempt::start(endpoint);
        self.metrics.increment_handshakes_attempted();

        let request = self.session.connect_request(&self.config);
        let connector = Arc::clone(&self.connector);
        let target = Arc::clone(endpoint);
        let handshake = tokio::time::timeout(self.config.connect_timeout(), async move {
            connector.handshake(&target, request).await
        });
        tokio::pin!(handshake);

        let result = loop {
            self.pending.prune_abandoned();
            let accept = !self.pending.is_full();
            tokio::select! {
                result = &mut handshake => break result,
                inbound = self.inbox.next(accept) => {
                    if let Some(close) = self.intake(inbound) {
                        return Attempt::Closed(close);
                    }
                }
            }
        };

        match result {
            Err(_) => {
                endpoint.set_role_hint(RoleHint::Unknown);
                attempt.failed("timeout");
                Attempt::Failed
            }
            Ok(Err(e)) => {
                endpoint.set_role_hint(RoleHint::Unknown);
                attempt.failed(&e.to_string());
                Attempt::Failed
            }
            Ok(Ok(HandshakeOutcome::Rejected(rejection))) => {
                log_event_with_fields(
                    Event::HandshakeRejected,
                    &[
                        ("elapsed_ms", &attempt.elapsed_ms()),
                        ("endpoint", &attempt.endpoint),
                        ("reason", rejection.as_str()),
                    ],
                );
                if rejection.is_terminal() {
                    Attempt::Terminal(rejection)
                } else {
                    endpoint.set_role_hint(RoleHint::ReadOnly);
                    Attempt::Failed
                }
            }
            Ok(Ok(HandshakeOutcome::Accepted {
                response,
                connection,
            })) => {
                self.on_established(endpoint, &response, &attempt).await;
                Attempt::Connected(connection)
            }
        }
    }

    async fn on_established(
        &mut self,
        endpoint: &EndpointRef,
        response: &ConnectResponse,
        attempt: &ConnectionAttempt,
    ) {
        let effect = self.session.apply_handshake(response);
        self.metrics.increment_handshakes_succeeded();
        if self.has_connected {
            self.metrics.increment_reconnects();
        }
        self.has_connected = true;

        if let HandshakeEffect::Replaced { previous } = effect {
            log_event_with_fields(
                Event::SessionIdChanged,
                &[
                    ("current", &format_session_id(response.session_id)),
                    ("endpoint", &attempt.endpoint),
                    ("previous", &format_session_id(previous)),
                ],
            );
        }

        endpoint.set_role_hint(if response.read_only {
            RoleHint::ReadOnly
        } else {
            RoleHint::ReadWrite
        });
        let state = self.state.established(response.read_only);
        self.transition(state);
        self.publish_status(Some(endpoint));

        log_event_with_fields(
            Event::SessionEstablished,
            &[
                ("elapsed_ms", &attempt.elapsed_ms()),
                ("endpoint", &attempt.endpoint),
                ("read_only", if response.read_only { "true" } else { "false" }),
                ("session_id", &format_session_id(response.session_id)),
                ("timeout_ms", &response.negotiated_timeout_ms.to_string()),
            ],
        );

        let keeper = if response.read_only {
            log_event_with_fields(
                Event::ReadOnlyModeEntered,
                &[("endpoint", &attempt.endpoint)],
            );
            KeeperState::ConnectedReadOnly
        } else {
            KeeperState::SyncConnected
        };
        self.dispatcher.publish(WatchedEvent::state(keeper)).await;
    }

    // ==================
    // Serving
    // ==================

    async fn serve(&mut self, mut connection: Box<dyn Connection>, endpoint: EndpointRef) -> Next {
        if self.session.read_only() {
            self.start_prober(&endpoint);
        }

        let timeout = self.session.negotiated_timeout();
        let ping_every = (timeout / 3).max(Duration::from_millis(1));
        let read_timeout = timeout * 2 / 3;
        let mut ticker = interval_at(Instant::now() + ping_every, ping_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_heard = Instant::now();

        let reason: String = loop {
            if let Err(e) = self.dispatch(connection.as_mut()).await {
                break e.to_string();
            }

            let accept = !self.pending.is_full();
            tokio::select! {
                biased;
                inbound = self.inbox.next(accept) => {
                    if let Some(close) = self.intake(inbound) {
                        self.stop_prober();
                        return Next::Close(Some(connection), close);
                    }
                }
                reply = connection.receive() => match reply {
                    Ok(reply) => {
                        last_heard = Instant::now();
                        if let Err(reason) = self.on_reply(reply) {
                            if reason == ClientError::SessionExpired {
                                connection.cancel().await;
                                return Next::Terminal(HandshakeRejection::SessionExpired);
                            }
                            break reason.to_string();
                        }
                    }
                    Err(e) => break e.to_string(),
                },
                Some(target) = self.switch_rx.recv() => {
                    self.selector.prefer(target.address());
                    break format!("switching to read-write server {}", target);
                }
                _ = ticker.tick() => {
                    if last_heard.elapsed() >= read_timeout {
                        break format!("nothing received for {}ms", read_timeout.as_millis());
                    }
                    if !self.pending.has_ping() {
                        let xid = self.allocate_xid();
                        self.pending.push(xid, Operation::Ping, None);
                    }
                }
            }
        };

        self.on_disconnect(connection, &endpoint, &reason).await;
        Next::Reconnect
    }

    async fn dispatch(
        &mut self,
        connection: &mut dyn Connection,
    ) -> TransportResult<()> {
        let dispatch = self.pending.dispatch(self.session.read_only());
        for _ in 0..dispatch.rejected_read_only {
            self.metrics.increment_read_only_rejections();
        }
        for request in dispatch.requests {
            connection.send(request).await?;
        }
        Ok(())
    }

    /// `Err` ends the connection. `SessionExpired` ends the session.
    fn on_reply(&mut self, reply: Reply) -> ClientResult<()> {
        self.session.observe_zxid(reply.zxid);
        if reply.result == Err(ErrorCode::SessionExpired) {
            return Err(ClientError::SessionExpired);
        }
        match self.pending.complete(reply) {
            Ok(completed) => {
                for _ in 0..completed {
                    self.metrics.increment_operations_completed();
                }
                Ok(())
            }
            Err(xid) => Err(ClientError::UnexpectedReply(if xid < 0 {
                "negative xid"
            } else {
                "out of order xid"
            })),
        }
    }

    async fn on_disconnect(
        &mut self,
        mut connection: Box<dyn Connection>,
        endpoint: &EndpointRef,
        reason: &str,
    ) {
        connection.cancel().await;
        self.stop_prober();
        let writes_lost = self.pending.requeue_in_flight();

        log_event_with_fields(
            Event::ConnectionLost,
            &[
                ("endpoint", &endpoint.address()),
                ("reason", reason),
                ("session_id", &format_session_id(self.session.id())),
                ("writes_lost", &writes_lost.to_string()),
            ],
        );

        let state = self.state.begin_connecting();
        self.transition(state);
        self.publish_status(None);
        self.dispatcher
            .publish(WatchedEvent::state(KeeperState::Disconnected))
            .await;
    }

    fn start_prober(&mut self, endpoint: &EndpointRef) {
        let prober = MajorityProber {
            roster: Arc::clone(&self.roster),
            connector: Arc::clone(&self.connector),
            metrics: Arc::clone(&self.metrics),
            current: endpoint.address(),
            interval: self.config.probe_interval(),
            probe_timeout: self.config.probe_timeout(),
            timeout_hint_ms: self.config.session_timeout_ms,
            auth: self.config.auth.clone(),
            switch: self.switch_tx.clone(),
        };
        self.prober = Some(prober.spawn());
    }

    fn stop_prober(&mut self) {
        if let Some(prober) = self.prober.take() {
            prober.stop();
        }
        // A signal from the stopped prober is stale
        while self.switch_rx.try_recv().is_ok() {}
    }

    // ==================
    // Commands
    // ==================

    /// Queue a submit, or pass a close request on.
    fn intake(&mut self, inbound: Inbound) -> Option<CloseRequest> {
        match inbound {
            Inbound::Submit(Command { op, reply }) => {
                let xid = self.allocate_xid();
                self.pending.push(xid, op, Some(reply));
                None
            }
            Inbound::Close(close) => Some(close),
        }
    }

    fn allocate_xid(&mut self) -> i32 {
        self.next_xid = if self.next_xid == i32::MAX {
            1
        } else {
            self.next_xid + 1
        };
        self.next_xid
    }

    // ==================
    // Ending
    // ==================

    async fn finish_close(&mut self, connection: Option<Box<dyn Connection>>, close: CloseRequest) {
        self.stop_prober();
        self.pending.fail_all(ClientError::SessionClosed);

        if let Some(mut connection) = connection {
            let request = Request {
                xid: self.allocate_xid(),
                op: Operation::CloseSession,
            };
            let _ = tokio::time::timeout(self.config.connect_timeout(), connection.send(request)).await;
            connection.cancel().await;
        }

        self.state = self.state.close();
        self.publish_status(None);
        log_event_with_fields(
            Event::SessionClosed,
            &[("session_id", &format_session_id(self.session.id()))],
        );

        self.dispatcher.shutdown();
        self.inbox.reject_remaining(ClientError::SessionClosed);
        if let Some(done) = close.done {
            let _ = done.send(());
        }
    }

    async fn finish_terminal(&mut self, rejection: HandshakeRejection) {
        self.stop_prober();

        let (state, keeper, error, event) = match rejection {
            HandshakeRejection::AuthFailed => (
                self.state.auth_failed(),
                KeeperState::AuthFailed,
                ClientError::AuthFailed,
                Event::AuthFailed,
            ),
            HandshakeRejection::SessionExpired | HandshakeRejection::ReadOnlyRefused => (
                self.state.expire(),
                KeeperState::Expired,
                ClientError::SessionExpired,
                Event::SessionExpired,
            ),
        };
        self.transition(state);
        self.publish_status(None);
        log_event_with_fields(
            event,
            &[("session_id", &format_session_id(self.session.id()))],
        );

        self.pending.fail_all(error.clone());
        self.dispatcher.publish(WatchedEvent::state(keeper)).await;
        self.dispatcher.shutdown();
        self.inbox.reject_remaining(error);
    }

    // ==================
    // Status
    // ==================

    fn transition(&mut self, next: ClientResult<SessionState>) {
        match next {
            Ok(state) => self.state = state,
            Err(e) => log_event_with_fields(
                Event::IllegalTransition,
                &[("error", &e.to_string()), ("state", self.state.state_name())],
            ),
        }
    }

    fn publish_status(&self, endpoint: Option<&EndpointRef>) {
        self.status.send_replace(SessionStatus {
            state: self.state,
            session_id: self.session.id(),
            read_only: self.state == SessionState::ConnectedReadOnly,
            negotiated_timeout: self.session.negotiated_timeout(),
            endpoint: endpoint.map(|endpoint| endpoint.address()),
        });
    }
}

fn format_session_id(id: u64) -> String {
    format!("{:#018x}", id)
}
