//! In-process ensemble
//!
//! `n` serving nodes (`node1:2181` .. `nodeN:2181`) sharing one data tree
//! and one global session table, with reachability and quorum driven by the
//! caller:
//!
//! - `stop` / `start` take a node off or back on the network
//! - `suspend` keeps a node reachable but unable to join a quorum
//!
//! A quorum exists while a strict majority of nodes is up and not
//! suspended. Its members lead or follow; every other reachable node is
//! looking and serves read-only. Nodes are addressed by zero-based index.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::protocol::{ConnectRequest, Reply, Request};
use crate::roster::{RosterError, ServerEndpoint, ServerRoster};
use crate::server::{AttachedSession, DataTree, NodeSettings, QuorumRole, ServerNode, SessionTable};

use super::{Connection, Connector, HandshakeOutcome, TransportError, TransportResult};

const PORT: u16 = 2181;

/// Each member needs its own non-zero local session prefix.
pub const MAX_MEMBERS: usize = u8::MAX as usize;

#[derive(Debug)]
struct Member {
    host: String,
    node: ServerNode,
    up: AtomicBool,
    suspended: AtomicBool,
    requests: AtomicU64,
}

impl Member {
    fn address(&self) -> String {
        format!("{}:{}", self.host, PORT)
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct EnsembleInner {
    members: Vec<Member>,
    tree: Arc<DataTree>,
    sessions: Arc<SessionTable>,
    // Serializes topology changes
    topology: Mutex<()>,
}

/// Controllable in-process ensemble.
#[derive(Debug, Clone)]
pub struct MemoryEnsemble {
    inner: Arc<EnsembleInner>,
}

impl MemoryEnsemble {
    /// All nodes up, first node leading. At most `MAX_MEMBERS` nodes.
    pub fn new(size: usize) -> Result<Self, RosterError> {
        Self::with_tick(size, Duration::from_millis(2000))
    }

    pub fn with_tick(size: usize, tick: Duration) -> Result<Self, RosterError> {
        let tree = Arc::new(DataTree::new());
        let sessions = Arc::new(SessionTable::new(0));
        let members = (0..size)
            .map(|index| {
                let prefix = u8::try_from(index + 1).map_err(|_| RosterError::TooLarge {
                    size,
                    max: MAX_MEMBERS,
                })?;
                let host = format!("node{}", index + 1);
                let settings = NodeSettings {
                    name: host.clone(),
                    tick,
                    auth_token: None,
                    local_session_prefix: prefix,
                };
                Ok(Member {
                    node: ServerNode::new(
                        settings,
                        QuorumRole::Looking,
                        Arc::clone(&tree),
                        Arc::clone(&sessions),
                    ),
                    host,
                    up: AtomicBool::new(true),
                    suspended: AtomicBool::new(false),
                    requests: AtomicU64::new(0),
                })
            })
            .collect::<Result<Vec<_>, RosterError>>()?;

        let ensemble = Self {
            inner: Arc::new(EnsembleInner {
                members,
                tree,
                sessions,
                topology: Mutex::new(()),
            }),
        };
        ensemble.update_topology(|_| {});
        Ok(ensemble)
    }

    pub fn len(&self) -> usize {
        self.inner.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.members.is_empty()
    }

    /// Roster listing every node.
    pub fn roster(&self) -> Result<ServerRoster, RosterError> {
        let endpoints = self
            .inner
            .members
            .iter()
            .map(|member| ServerEndpoint::new(member.host.clone(), PORT))
            .collect();
        ServerRoster::new(endpoints)
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            inner: Arc::clone(&self.inner),
        }
    }

    /// `host:port` of a node.
    pub fn address(&self, index: usize) -> Option<String> {
        self.inner.members.get(index).map(Member::address)
    }

    pub fn node(&self, index: usize) -> Option<&ServerNode> {
        self.inner.members.get(index).map(|member| &member.node)
    }

    pub fn role(&self, index: usize) -> Option<QuorumRole> {
        self.node(index).map(ServerNode::role)
    }

    pub fn tree(&self) -> &Arc<DataTree> {
        &self.inner.tree
    }

    pub fn stop(&self, index: usize) {
        self.stop_many(&[index]);
    }

    pub fn start(&self, index: usize) {
        self.start_many(&[index]);
    }

    /// Stop several nodes as one topology change.
    pub fn stop_many(&self, indices: &[usize]) {
        self.update_topology(|members| {
            for &index in indices {
                if let Some(member) = members.get(index) {
                    member.up.store(false, Ordering::Release);
                }
            }
        });
        for &index in indices {
            if let Some(member) = self.inner.members.get(index) {
                member.node.drop_connections();
            }
        }
    }

    /// Start several nodes as one topology change.
    pub fn start_many(&self, indices: &[usize]) {
        self.update_topology(|members| {
            for &index in indices {
                if let Some(member) = members.get(index) {
                    member.up.store(true, Ordering::Release);
                }
            }
        });
    }

    /// Keep a node reachable but out of any quorum.
    pub fn suspend(&self, index: usize) {
        self.update_topology(|members| {
            if let Some(member) = members.get(index) {
                member.suspended.store(true, Ordering::Release);
            }
        });
    }

    pub fn resume(&self, index: usize) {
        self.update_topology(|members| {
            if let Some(member) = members.get(index) {
                member.suspended.store(false, Ordering::Release);
            }
        });
    }

    /// Expire a session everywhere and drop all connections so its owner
    /// finds out on reconnect.
    pub fn expire_session(&self, session_id: u64) -> bool {
        let mut expired = self.inner.sessions.retire(session_id);
        for member in &self.inner.members {
            expired |= member.node.expire_session(session_id);
        }
        for member in &self.inner.members {
            member.node.drop_connections();
        }
        expired
    }

    /// Require `token` on every handshake (`None` disables).
    pub fn require_auth(&self, token: Option<String>) {
        for member in &self.inner.members {
            member.node.require_auth(token.clone());
        }
    }

    /// Requests that reached a node, handshakes excluded.
    pub fn requests_served(&self, index: usize) -> u64 {
        self.inner
            .members
            .get(index)
            .map_or(0, |member| member.requests.load(Ordering::Relaxed))
    }

    pub fn total_requests_served(&self) -> u64 {
        self.inner
            .members
            .iter()
            .map(|member| member.requests.load(Ordering::Relaxed))
            .sum()
    }

    /// Apply a change and recompute every role.
    fn update_topology(&self, change: impl FnOnce(&[Member])) {
        let _guard = self
            .inner
            .topology
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let members = &self.inner.members;
        change(members);

        let active: Vec<usize> = members
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_up() && !m.suspended.load(Ordering::Acquire))
            .map(|(index, _)| index)
            .collect();
        let has_quorum = active.len() * 2 > members.len();

        for (index, member) in members.iter().enumerate() {
            let role = if has_quorum && active.first() == Some(&index) {
                QuorumRole::Leading
            } else if has_quorum && active.contains(&index) {
                QuorumRole::Following {
                    leader_active: true,
                }
            } else {
                QuorumRole::Looking
            };
            member.node.set_role(role);
        }
    }
}

/// `Connector` for a `MemoryEnsemble`.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    inner: Arc<EnsembleInner>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn handshake(
        &self,
        endpoint: &ServerEndpoint,
        request: ConnectRequest,
    ) -> TransportResult<HandshakeOutcome> {
        let address = endpoint.address();
        let member = self
            .inner
            .members
            .iter()
            .position(|member| member.address() == address)
            .ok_or_else(|| TransportError::Refused(format!("{}: unknown host", address)))?;
        let node = &self.inner.members[member];
        if !node.is_up() {
            return Err(TransportError::Refused(format!("{}: node is down", address)));
        }

        let mut epoch = node.node.subscribe_epoch();
        let connected_epoch = *epoch.borrow_and_update();
        match node.node.handshake(&request) {
            Ok(admission) => {
                let (replies_tx, replies) = mpsc::unbounded_channel();
                Ok(HandshakeOutcome::Accepted {
                    response: admission.response,
                    connection: Box::new(MemoryConnection {
                        inner: Arc::clone(&self.inner),
                        member,
                        session: admission.session,
                        epoch,
                        connected_epoch,
                        replies_tx,
                        replies,
                        released: false,
                    }),
                })
            }
            Err(rejection) => Ok(HandshakeOutcome::Rejected(rejection)),
        }
    }
}

struct MemoryConnection {
    inner: Arc<EnsembleInner>,
    member: usize,
    session: AttachedSession,
    epoch: watch::Receiver<u64>,
    connected_epoch: u64,
    replies_tx: mpsc::UnboundedSender<Reply>,
    replies: mpsc::UnboundedReceiver<Reply>,
    released: bool,
}

impl MemoryConnection {
    fn member(&self) -> &Member {
        &self.inner.members[self.member]
    }

    fn is_open(&self) -> bool {
        !self.released
            && self.member().is_up()
            && *self.epoch.borrow() == self.connected_epoch
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.members[self.member].node.release(&self.session);
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&mut self, request: Request) -> TransportResult<()> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let member = self.member();
        member.requests.fetch_add(1, Ordering::Relaxed);
        let reply = member.node.process(&self.session, request);
        self.replies_tx
            .send(reply)
            .map_err(|_| TransportError::Closed)
    }

    async fn receive(&mut self) -> TransportResult<Reply> {
        loop {
            if !self.is_open() {
                return Err(TransportError::Closed);
            }
            tokio::select! {
                biased;
                changed = self.epoch.changed() => {
                    if changed.is_err() {
                        return Err(TransportError::Closed);
                    }
                }
                reply = self.replies.recv() => {
                    return reply.ok_or(TransportError::Closed);
                }
            }
        }
    }

    async fn cancel(&mut self) {
        self.release();
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorCode, HandshakeRejection, OpResult, Operation};

    fn endpoint(ensemble: &MemoryEnsemble, index: usize) -> ServerEndpoint {
        ServerEndpoint::parse(&ensemble.address(index).unwrap()).unwrap()
    }

    #[test]
    fn test_full_ensemble_has_one_leader() {
        let ensemble = MemoryEnsemble::new(3).unwrap();
        assert_eq!(ensemble.role(0), Some(QuorumRole::Leading));
        assert_eq!(
            ensemble.role(1),
            Some(QuorumRole::Following {
                leader_active: true
            })
        );
        assert_eq!(ensemble.address(2).as_deref(), Some("node3:2181"));
    }

    #[test]
    fn test_oversize_ensemble_rejected() {
        assert!(MemoryEnsemble::new(MAX_MEMBERS).is_ok());
        assert!(matches!(
            MemoryEnsemble::new(MAX_MEMBERS + 1),
            Err(RosterError::TooLarge { size: 256, max: 255 })
        ));
    }

    #[test]
    fn test_minority_is_looking() {
        let ensemble = MemoryEnsemble::new(3).unwrap();
        ensemble.stop_many(&[1, 2]);
        assert_eq!(ensemble.role(0), Some(QuorumRole::Looking));

        ensemble.start(1);
        assert_eq!(ensemble.role(0), Some(QuorumRole::Leading));
    }

    #[test]
    fn test_suspended_node_stays_out_of_quorum() {
        let ensemble = MemoryEnsemble::new(3).unwrap();
        ensemble.suspend(0);
        assert_eq!(ensemble.role(0), Some(QuorumRole::Looking));
        assert_eq!(ensemble.role(1), Some(QuorumRole::Leading));

        ensemble.stop(2);
        assert_eq!(ensemble.role(1), Some(QuorumRole::Looking));
    }

    #[tokio::test]
    async fn test_stopped_node_refuses() {
        let ensemble = MemoryEnsemble::new(3).unwrap();
        ensemble.stop(1);
        let result = ensemble
            .connector()
            .handshake(&endpoint(&ensemble, 1), ConnectRequest::fresh(30_000, true))
            .await;
        assert!(matches!(result, Err(TransportError::Refused(_))));
    }

    #[tokio::test]
    async fn test_read_only_handshake_and_server_side_rejection() {
        let ensemble = MemoryEnsemble::new(3).unwrap();
        ensemble.stop_many(&[1, 2]);
        let connector = ensemble.connector();

        let refused = connector
            .handshake(&endpoint(&ensemble, 0), ConnectRequest::fresh(30_000, false))
            .await
            .unwrap();
        assert!(matches!(
            refused,
            HandshakeOutcome::Rejected(HandshakeRejection::ReadOnlyRefused)
        ));

        let outcome = connector
            .handshake(&endpoint(&ensemble, 0), ConnectRequest::fresh(30_000, true))
            .await
            .unwrap();
        let HandshakeOutcome::Accepted {
            response,
            mut connection,
        } = outcome
        else {
            panic!("expected read-only accept");
        };
        assert!(response.read_only);

        connection
            .send(Request {
                xid: 1,
                op: Operation::create("/x", Vec::new()),
            })
            .await
            .unwrap();
        let reply = connection.receive().await.unwrap();
        assert_eq!(reply.result, Err(ErrorCode::NotReadOnly));
        assert_eq!(ensemble.requests_served(0), 1);
    }

    #[tokio::test]
    async fn test_losing_quorum_closes_connections() {
        let ensemble = MemoryEnsemble::new(3).unwrap();
        let outcome = ensemble
            .connector()
            .handshake(&endpoint(&ensemble, 0), ConnectRequest::fresh(30_000, false))
            .await
            .unwrap();
        let HandshakeOutcome::Accepted { mut connection, .. } = outcome else {
            panic!("expected accept");
        };

        connection
            .send(Request {
                xid: 1,
                op: Operation::get_children("/"),
            })
            .await
            .unwrap();
        assert_eq!(
            connection.receive().await.unwrap().result,
            Ok(OpResult::Children(vec![]))
        );

        ensemble.stop_many(&[1, 2]);
        assert_eq!(connection.receive().await, Err(TransportError::Closed));
        assert_eq!(
            connection
                .send(Request {
                    xid: 2,
                    op: Operation::Ping
                })
                .await,
            Err(TransportError::Closed)
        );
    }
}
