//! Transport capability interface
//!
//! The session core talks to servers only through `Connector` and
//! `Connection`. Two implementations ship with the crate:
//!
//! - `memory`: an in-process ensemble with controllable reachability and
//!   quorum, used by tests and demos
//! - `tcp`: JSON-lines framing over TCP, served by `server::NodeServer`

mod framing;
pub mod memory;
pub mod tcp;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::{ConnectRequest, ConnectResponse, HandshakeRejection, Reply, Request};
use crate::roster::ServerEndpoint;

pub use framing::{decode_frame, write_frame};
pub use memory::{MemoryConnector, MemoryEnsemble};
pub use tcp::TcpConnector;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Transport failures. None of these is terminal for a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Endpoint not reachable
    #[error("connection refused: {0}")]
    Refused(String),

    /// No answer in time
    #[error("transport timeout")]
    Timeout,

    /// Peer closed the connection, or it was dropped
    #[error("connection closed")]
    Closed,

    /// Malformed or unexpected frame
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket failure
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::ConnectionRefused => TransportError::Refused(e.to_string()),
            std::io::ErrorKind::TimedOut => TransportError::Timeout,
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => TransportError::Closed,
            _ => TransportError::Io(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Protocol(e.to_string())
    }
}

/// Result of a handshake that reached the server.
pub enum HandshakeOutcome {
    Accepted {
        response: ConnectResponse,
        connection: Box<dyn Connection>,
    },
    Rejected(HandshakeRejection),
}

impl fmt::Debug for HandshakeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeOutcome::Accepted { response, .. } => f
                .debug_struct("Accepted")
                .field("response", response)
                .finish_non_exhaustive(),
            HandshakeOutcome::Rejected(reason) => f.debug_tuple("Rejected").field(reason).finish(),
        }
    }
}

/// Opens connections to endpoints.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect and perform the session handshake.
    async fn handshake(
        &self,
        endpoint: &ServerEndpoint,
        request: ConnectRequest,
    ) -> TransportResult<HandshakeOutcome>;
}

/// An established session connection.
#[async_trait]
pub trait Connection: Send {
    /// Write one request. Replies arrive through `receive` in request order.
    async fn send(&mut self, request: Request) -> TransportResult<()>;

    /// Next reply. Must be cancel-safe: it is raced against other work and
    /// a dropped call must not lose a reply.
    async fn receive(&mut self) -> TransportResult<Reply>;

    /// Tear the connection down. Further calls fail with `Closed`.
    async fn cancel(&mut self);
}
