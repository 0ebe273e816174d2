//! Read-only gate
//!
//! Decides, per handshake, whether a node accepts a connection read-write,
//! read-only, or not at all, and which requests an accepted connection may
//! issue.
//!
//! - A node inside an established quorum accepts read-write.
//! - A node outside quorum accepts read-only only if the client allows it.
//! - Read-only connections, and any connection on a node currently outside
//!   quorum, never execute mutating requests.
//!
//! The quorum role is pushed in from outside (`set_role`). The gate never
//! drops connections itself.

use std::sync::{PoisonError, RwLock};

use crate::protocol::{ErrorCode, Operation};

/// Node role as reported by the consensus module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumRole {
    /// Leader of an established quorum
    Leading,
    /// Follower; serves writes only while its leader is active
    Following { leader_active: bool },
    /// Searching for a quorum
    Looking,
}

impl QuorumRole {
    /// True if the node takes part in an established quorum.
    pub fn in_quorum(&self) -> bool {
        match self {
            QuorumRole::Leading => true,
            QuorumRole::Following { leader_active } => *leader_active,
            QuorumRole::Looking => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QuorumRole::Leading => "leading",
            QuorumRole::Following { leader_active: true } => "following",
            QuorumRole::Following {
                leader_active: false,
            } => "following_without_leader",
            QuorumRole::Looking => "looking",
        }
    }
}

/// Mode a connection was accepted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    ReadWrite,
    ReadOnly,
}

/// Handshake decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    AcceptReadWrite,
    AcceptReadOnly,
    /// No quorum and the client did not allow read-only mode
    Refuse,
}

impl GateDecision {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, GateDecision::Refuse)
    }

    /// Connection mode for accepted handshakes.
    pub fn mode(&self) -> Option<ConnectionMode> {
        match self {
            GateDecision::AcceptReadWrite => Some(ConnectionMode::ReadWrite),
            GateDecision::AcceptReadOnly => Some(ConnectionMode::ReadOnly),
            GateDecision::Refuse => None,
        }
    }
}

/// Request admission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAdmission {
    Admitted,
    /// Mutating request on a connection accepted read-only
    RejectedReadOnlyConnection,
    /// Mutating request on a node that has lost quorum
    RejectedOutsideQuorum,
}

impl RequestAdmission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, RequestAdmission::Admitted)
    }

    /// Both rejections surface as `NotReadOnly`.
    pub fn to_result(&self) -> Result<(), ErrorCode> {
        match self {
            RequestAdmission::Admitted => Ok(()),
            RequestAdmission::RejectedReadOnlyConnection
            | RequestAdmission::RejectedOutsideQuorum => Err(ErrorCode::NotReadOnly),
        }
    }
}

/// Evaluate a handshake against the node's role.
pub fn evaluate_handshake(role: QuorumRole, allow_read_only: bool) -> GateDecision {
    if role.in_quorum() {
        GateDecision::AcceptReadWrite
    } else if allow_read_only {
        GateDecision::AcceptReadOnly
    } else {
        GateDecision::Refuse
    }
}

/// Check whether a request may run on a connection.
pub fn check_request_admission(
    role: QuorumRole,
    mode: ConnectionMode,
    op: &Operation,
) -> RequestAdmission {
    if !op.is_mutating() {
        return RequestAdmission::Admitted;
    }
    match mode {
        ConnectionMode::ReadOnly => RequestAdmission::RejectedReadOnlyConnection,
        ConnectionMode::ReadWrite if !role.in_quorum() => RequestAdmission::RejectedOutsideQuorum,
        ConnectionMode::ReadWrite => RequestAdmission::Admitted,
    }
}

/// Gate state for one node.
#[derive(Debug)]
pub struct ReadOnlyGate {
    role: RwLock<QuorumRole>,
}

impl ReadOnlyGate {
    pub fn new(role: QuorumRole) -> Self {
        Self {
            role: RwLock::new(role),
        }
    }

    pub fn role(&self) -> QuorumRole {
        *self.role.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the role, returning the previous one.
    pub fn set_role(&self, role: QuorumRole) -> QuorumRole {
        let mut guard = self.role.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, role)
    }

    pub fn evaluate(&self, allow_read_only: bool) -> GateDecision {
        evaluate_handshake(self.role(), allow_read_only)
    }

    pub fn admit(&self, mode: ConnectionMode, op: &Operation) -> RequestAdmission {
        check_request_admission(self.role(), mode, op)
    }
}
