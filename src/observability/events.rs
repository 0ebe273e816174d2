//! Observable lifecycle events
//!
//! Every structured log line carries one of these names in its `event`
//! field. Events are explicit and typed.

use std::fmt;

use super::logger::Severity;

/// Observable events for client sessions and serving nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Client session lifecycle
    /// Session task started connecting
    SessionConnecting,
    /// A single connection attempt did not produce a session
    ConnectAttemptFailed,
    /// A server refused the handshake
    HandshakeRejected,
    /// Handshake completed
    SessionEstablished,
    /// The server handed out a different session id than the one presented
    SessionIdChanged,
    /// Live connection lost
    ConnectionLost,
    /// Every roster entry failed this pass; backing off
    RosterExhausted,
    /// Session was accepted in read-only mode
    ReadOnlyModeEntered,
    /// Session expired (terminal)
    SessionExpired,
    /// Authentication failed (terminal)
    AuthFailed,
    /// Session closed by the application
    SessionClosed,
    /// Mutating operation refused because the session is read-only
    WriteRejectedReadOnly,
    /// The session task attempted a transition its state does not allow
    IllegalTransition,

    // Majority probing
    /// Prober started
    ProbeStarted,
    /// A read-write server was found while connected read-only
    MajorityServerFound,
    /// Prober stopped
    ProbeStopped,

    // Watchers
    /// A watcher panicked while processing an event
    WatcherPanicked,

    // Serving node
    /// Node accepting connections
    NodeServing,
    /// Quorum role changed
    NodeRoleChanged,
    /// Handshake accepted
    ConnectionAccepted,
    /// Handshake refused
    ConnectionRefused,
    /// Connection ended
    ConnectionClosed,
    /// Idle sessions expired by a sweep
    SessionsExpired,
    /// Node stopped serving
    NodeShutdown,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::SessionConnecting => "SESSION_CONNECTING",
            Event::ConnectAttemptFailed => "CONNECT_ATTEMPT_FAILED",
            Event::HandshakeRejected => "HANDSHAKE_REJECTED",
            Event::SessionEstablished => "SESSION_ESTABLISHED",
            Event::SessionIdChanged => "SESSION_ID_CHANGED",
            Event::ConnectionLost => "CONNECTION_LOST",
            Event::RosterExhausted => "ROSTER_EXHAUSTED",
            Event::ReadOnlyModeEntered => "READ_ONLY_MODE_ENTERED",
            Event::SessionExpired => "SESSION_EXPIRED",
            Event::AuthFailed => "AUTH_FAILED",
            Event::SessionClosed => "SESSION_CLOSED",
            Event::WriteRejectedReadOnly => "WRITE_REJECTED_READ_ONLY",
            Event::IllegalTransition => "ILLEGAL_TRANSITION",

            Event::ProbeStarted => "PROBE_STARTED",
            Event::MajorityServerFound => "MAJORITY_SERVER_FOUND",
            Event::ProbeStopped => "PROBE_STOPPED",

            Event::WatcherPanicked => "WATCHER_PANICKED",

            Event::NodeServing => "NODE_SERVING",
            Event::NodeRoleChanged => "NODE_ROLE_CHANGED",
            Event::ConnectionAccepted => "CONNECTION_ACCEPTED",
            Event::ConnectionRefused => "CONNECTION_REFUSED",
            Event::ConnectionClosed => "CONNECTION_CLOSED",
            Event::SessionsExpired => "SESSIONS_EXPIRED",
            Event::NodeShutdown => "NODE_SHUTDOWN",
        }
    }

    /// Severity the event is logged at
    pub fn severity(&self) -> Severity {
        match self {
            Event::ConnectAttemptFailed
            | Event::HandshakeRejected
            | Event::ConnectionLost
            | Event::RosterExhausted
            | Event::ReadOnlyModeEntered
            | Event::ConnectionRefused => Severity::Warn,

            Event::SessionExpired
            | Event::AuthFailed
            | Event::WatcherPanicked
            | Event::IllegalTransition => Severity::Error,

            Event::WriteRejectedReadOnly | Event::ConnectionClosed => Severity::Trace,

            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
