//! Serving side
//!
//! - `gate`: read-only admission for handshakes and requests
//! - `node`: a serving node (gate + data tree + sessions)
//! - `listener`: TCP accept loop for a node
//! - `tree`, `sessions`: minimal stand-ins for storage and session tracking
//!
//! The quorum role is an input. Nothing here implements consensus.

mod config;
mod errors;
pub mod gate;
mod listener;
mod node;
mod sessions;
mod tree;

pub use config::NodeConfig;
pub use errors::{ServerError, ServerErrorKind, ServerResult};
pub use gate::{
    check_request_admission, evaluate_handshake, ConnectionMode, GateDecision, QuorumRole,
    ReadOnlyGate, RequestAdmission,
};
pub use listener::NodeServer;
pub use node::{Admission, AttachedSession, NodeSettings, ServerNode, SessionScope};
pub use sessions::{SessionGrant, SessionIdAllocator, SessionTable};
pub use tree::DataTree;
