//! Serving node
//!
//! Combines the read-only gate, the data tree and the session tables behind
//! a transport-neutral handshake / process / release interface. Both the
//! in-process ensemble and the TCP listener drive connections through it.
//!
//! Session policy:
//! - Read-write handshakes resume a known session or mint a new global one.
//!   An unknown id (for example one minted by a read-only node) is replaced,
//!   a retired id is `SessionExpired`.
//! - Read-only handshakes resume a global session if it exists, otherwise a
//!   node-local one, otherwise mint a node-local session unknown to the rest
//!   of the ensemble.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::watch;

use crate::observability::{log_event_with_fields, Event};
use crate::protocol::{
    ConnectRequest, ConnectResponse, ErrorCode, HandshakeRejection, OpResult, Operation, Reply,
    Request,
};

use super::gate::{ConnectionMode, QuorumRole, ReadOnlyGate};
use super::sessions::{SessionGrant, SessionTable};
use super::tree::DataTree;

/// Static node settings.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    /// Name used in logs
    pub name: String,
    /// Base time unit; session timeouts are negotiated within 2 to 20 ticks
    pub tick: Duration,
    /// Token every handshake must present, if set
    pub auth_token: Option<String>,
    /// Prefix for node-local session ids (non-zero)
    pub local_session_prefix: u8,
}

impl NodeSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tick: Duration::from_millis(2000),
            auth_token: None,
            local_session_prefix: 1,
        }
    }

    pub fn min_session_timeout(&self) -> Duration {
        self.tick * 2
    }

    pub fn max_session_timeout(&self) -> Duration {
        self.tick * 20
    }
}

/// Which table a connection's session lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionScope {
    Global,
    Local,
}

/// Session bound to an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachedSession {
    pub session_id: u64,
    pub mode: ConnectionMode,
    pub scope: SessionScope,
}

/// Accepted handshake.
#[derive(Debug, Clone)]
pub struct Admission {
    pub response: ConnectResponse,
    pub session: AttachedSession,
}

/// One ensemble member.
#[derive(Debug)]
pub struct ServerNode {
    settings: NodeSettings,
    gate: ReadOnlyGate,
    tree: Arc<DataTree>,
    sessions: Arc<SessionTable>,
    local_sessions: SessionTable,
    auth_token: RwLock<Option<String>>,
    epoch: watch::Sender<u64>,
}

impl ServerNode {
    /// Node sharing a data tree and global session table with its peers.
    pub fn new(
        settings: NodeSettings,
        role: QuorumRole,
        tree: Arc<DataTree>,
        sessions: Arc<SessionTable>,
    ) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            local_sessions: SessionTable::new(settings.local_session_prefix.max(1)),
            auth_token: RwLock::new(settings.auth_token.clone()),
            settings,
            gate: ReadOnlyGate::new(role),
            tree,
            sessions,
            epoch,
        }
    }

    /// Node with its own tree and session table.
    pub fn standalone(settings: NodeSettings, role: QuorumRole) -> Self {
        Self::new(
            settings,
            role,
            Arc::new(DataTree::new()),
            Arc::new(SessionTable::new(0)),
        )
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn tick(&self) -> Duration {
        self.settings.tick
    }

    pub fn role(&self) -> QuorumRole {
        self.gate.role()
    }

    pub fn tree(&self) -> &Arc<DataTree> {
        &self.tree
    }

    /// Apply a role change from the consensus module. Leaving quorum drops
    /// every open connection; joining drops nothing.
    pub fn set_role(&self, role: QuorumRole) {
        let previous = self.gate.set_role(role);
        if previous == role {
            return;
        }
        log_event_with_fields(
            Event::NodeRoleChanged,
            &[
                ("from", previous.as_str()),
                ("node", self.name()),
                ("to", role.as_str()),
            ],
        );
        if previous.in_quorum() && !role.in_quorum() {
            self.drop_connections();
        }
    }

    /// Ask every open connection to close.
    pub fn drop_connections(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Connections close once the epoch moves past the value they started at.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    pub fn require_auth(&self, token: Option<String>) {
        *self
            .auth_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    /// Run the handshake policy.
    pub fn handshake(&self, request: &ConnectRequest) -> Result<Admission, HandshakeRejection> {
        let expected = self
            .auth_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(expected) = expected {
            if request.auth.as_deref() != Some(expected.as_str()) {
                return Err(HandshakeRejection::AuthFailed);
            }
        }

        let mode = self
            .gate
            .evaluate(request.allow_read_only)
            .mode()
            .ok_or(HandshakeRejection::ReadOnlyRefused)?;

        let timeout = self.negotiate_timeout(request.timeout_hint_ms);
        let (grant, scope) = match mode {
            ConnectionMode::ReadWrite => (self.attach_global(request, timeout)?, SessionScope::Global),
            ConnectionMode::ReadOnly => self.attach_read_only(request, timeout)?,
        };

        Ok(Admission {
            response: ConnectResponse {
                session_id: grant.session_id,
                session_secret: grant.secret,
                negotiated_timeout_ms: grant.timeout.as_millis() as u64,
                read_only: mode == ConnectionMode::ReadOnly,
            },
            session: AttachedSession {
                session_id: grant.session_id,
                mode,
                scope,
            },
        })
    }

    /// Execute one request on an accepted connection.
    pub fn process(&self, session: &AttachedSession, request: Request) -> Reply {
        let table = self.table(session.scope);
        let xid = request.xid;
        if !table.touch(session.session_id) {
            return Reply {
                xid,
                zxid: self.tree.last_zxid(),
                result: Err(ErrorCode::SessionExpired),
            };
        }

        match request.op {
            Operation::Ping => Reply {
                xid,
                zxid: self.tree.last_zxid(),
                result: Ok(OpResult::Done),
            },
            Operation::CloseSession => {
                table.retire(session.session_id);
                Reply {
                    xid,
                    zxid: self.tree.last_zxid(),
                    result: Ok(OpResult::Done),
                }
            }
            op => {
                if let Err(code) = self.gate.admit(session.mode, &op).to_result() {
                    return Reply {
                        xid,
                        zxid: self.tree.last_zxid(),
                        result: Err(code),
                    };
                }
                let (zxid, result) = self.tree.apply(&op);
                Reply { xid, zxid, result }
            }
        }
    }

    /// The connection is gone.
    pub fn release(&self, session: &AttachedSession) {
        self.table(session.scope).detach(session.session_id);
    }

    /// Expire a session immediately. Open connections notice on their next
    /// request or handshake.
    pub fn expire_session(&self, session_id: u64) -> bool {
        let global = self.sessions.retire(session_id);
        let local = self.local_sessions.retire(session_id);
        global || local
    }

    /// Expire idle sessions in both tables. Returns how many expired.
    pub fn sweep_sessions(&self) -> usize {
        let expired = self.sessions.sweep() + self.local_sessions.sweep();
        if expired > 0 {
            log_event_with_fields(
                Event::SessionsExpired,
                &[("count", &expired.to_string()), ("node", self.name())],
            );
        }
        expired
    }

    pub fn session_alive(&self, session_id: u64) -> bool {
        self.sessions.is_alive(session_id) || self.local_sessions.is_alive(session_id)
    }

    fn table(&self, scope: SessionScope) -> &SessionTable {
        match scope {
            SessionScope::Global => &self.sessions,
            SessionScope::Local => &self.local_sessions,
        }
    }

    fn negotiate_timeout(&self, hint_ms: u64) -> Duration {
        Duration::from_millis(hint_ms).clamp(
            self.settings.min_session_timeout(),
            self.settings.max_session_timeout(),
        )
    }

    fn attach_global(
        &self,
        request: &ConnectRequest,
        timeout: Duration,
    ) -> Result<SessionGrant, HandshakeRejection> {
        if !request.is_fresh() {
            if let Some(grant) = self
                .sessions
                .resume(request.last_session_id, &request.session_secret)?
            {
                return Ok(grant);
            }
        }
        Ok(self.sessions.create(timeout))
    }

    fn attach_read_only(
        &self,
        request: &ConnectRequest,
        timeout: Duration,
    ) -> Result<(SessionGrant, SessionScope), HandshakeRejection> {
        if !request.is_fresh() {
            if let Some(grant) = self
                .sessions
                .resume(request.last_session_id, &request.session_secret)?
            {
                return Ok((grant, SessionScope::Global));
            }
            if let Some(grant) = self
                .local_sessions
                .resume(request.last_session_id, &request.session_secret)?
            {
                return Ok((grant, SessionScope::Local));
            }
        }
        Ok((self.local_sessions.create(timeout), SessionScope::Local))
    }
}
