//! Session state machine
//!
//! ```text
//! Init -> Connecting -> Connected | ConnectedReadOnly -> Closed
//!            ^               |            |
//!            +---------------+------------+   (disconnect)
//! Connecting -> Expired | AuthFailed          (terminal)
//! ```
//!
//! Transitions consume the current state and return the next one, or
//! `IllegalTransition`. The session task is the only writer.

use std::time::Duration;

use crate::protocol::{ConnectRequest, ConnectResponse, Zxid, NO_SESSION};

use super::config::ClientConfig;
use super::errors::{ClientError, ClientResult};

/// Client session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no connection attempted yet
    Init,
    /// Looking for a server
    Connecting,
    /// Connected to a quorum member
    Connected,
    /// Connected to a node without quorum; writes are refused
    ConnectedReadOnly,
    /// Closed by the application
    Closed,
    /// Session expired (terminal)
    Expired,
    /// Authentication failed (terminal)
    AuthFailed,
}

impl SessionState {
    /// Start or restart connecting.
    pub fn begin_connecting(self) -> ClientResult<Self> {
        match self {
            Self::Init | Self::Connecting | Self::Connected | Self::ConnectedReadOnly => {
                Ok(Self::Connecting)
            }
            other => Err(other.illegal(Self::Connecting)),
        }
    }

    /// Handshake accepted.
    pub fn established(self, read_only: bool) -> ClientResult<Self> {
        let next = if read_only {
            Self::ConnectedReadOnly
        } else {
            Self::Connected
        };
        match self {
            Self::Connecting => Ok(next),
            other => Err(other.illegal(next)),
        }
    }

    /// Handshake rejected with an expired session.
    pub fn expire(self) -> ClientResult<Self> {
        match self {
            Self::Connecting | Self::Connected | Self::ConnectedReadOnly => Ok(Self::Expired),
            other => Err(other.illegal(Self::Expired)),
        }
    }

    /// Handshake rejected for bad credentials.
    pub fn auth_failed(self) -> ClientResult<Self> {
        match self {
            Self::Connecting => Ok(Self::AuthFailed),
            other => Err(other.illegal(Self::AuthFailed)),
        }
    }

    /// Close. Terminal states stay as they are.
    pub fn close(self) -> Self {
        if self.is_terminal() {
            self
        } else {
            Self::Closed
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::ConnectedReadOnly)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Expired | Self::AuthFailed)
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::ConnectedReadOnly => "CONNECTED_READONLY",
            Self::Closed => "CLOSED",
            Self::Expired => "EXPIRED",
            Self::AuthFailed => "AUTH_FAILED",
        }
    }

    fn illegal(self, to: Self) -> ClientError {
        ClientError::IllegalTransition {
            from: self.state_name(),
            to: to.state_name(),
        }
    }
}

/// Connection state delivered to watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeeperState {
    SyncConnected,
    ConnectedReadOnly,
    Disconnected,
    Expired,
    AuthFailed,
}

impl KeeperState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SyncConnected => "SyncConnected",
            Self::ConnectedReadOnly => "ConnectedReadOnly",
            Self::Disconnected => "Disconnected",
            Self::Expired => "Expired",
            Self::AuthFailed => "AuthFailed",
        }
    }
}

/// What a successful handshake did to the session identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeEffect {
    /// First session of this client
    Established,
    /// Same id as before
    Resumed,
    /// Server handed out a different id
    Replaced { previous: u64 },
}

/// Session identity, owned by the session task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: u64,
    secret: Vec<u8>,
    negotiated_timeout: Duration,
    last_zxid: Zxid,
    read_only: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: NO_SESSION,
            secret: Vec::new(),
            negotiated_timeout: Duration::ZERO,
            last_zxid: 0,
            read_only: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn negotiated_timeout(&self) -> Duration {
        self.negotiated_timeout
    }

    pub fn last_zxid(&self) -> Zxid {
        self.last_zxid
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Handshake request presenting this session.
    pub fn connect_request(&self, config: &ClientConfig) -> ConnectRequest {
        ConnectRequest {
            last_session_id: self.id,
            session_secret: self.secret.clone(),
            timeout_hint_ms: config.session_timeout_ms,
            allow_read_only: config.allow_read_only,
            last_zxid_seen: self.last_zxid,
            auth: config.auth.clone(),
        }
    }

    pub fn apply_handshake(&mut self, response: &ConnectResponse) -> HandshakeEffect {
        let previous = self.id;
        self.id = response.session_id;
        self.secret = response.session_secret.clone();
        self.negotiated_timeout = Duration::from_millis(response.negotiated_timeout_ms);
        self.read_only = response.read_only;

        if previous == NO_SESSION {
            HandshakeEffect::Established
        } else if previous == response.session_id {
            HandshakeEffect::Resumed
        } else {
            HandshakeEffect::Replaced { previous }
        }
    }

    pub fn observe_zxid(&mut self, zxid: Zxid) {
        self.last_zxid = self.last_zxid.max(zxid);
    }
}

/// Published view of the session, readable without the session task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub session_id: u64,
    pub read_only: bool,
    pub negotiated_timeout: Duration,
    /// Endpoint of the active connection
    pub endpoint: Option<String>,
}

impl SessionStatus {
    pub fn initial() -> Self {
        Self {
            state: SessionState::Init,
            session_id: NO_SESSION,
            read_only: false,
            negotiated_timeout: Duration::ZERO,
            endpoint: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(id: u64, read_only: bool) -> ConnectResponse {
        ConnectResponse {
            session_id: id,
            session_secret: vec![7; 16],
            negotiated_timeout_ms: 30_000,
            read_only,
        }
    }

    #[test]
    fn test_happy_path() {
        let state = SessionState::Init.begin_connecting().unwrap();
        let state = state.established(false).unwrap();
        assert_eq!(state, SessionState::Connected);
        assert!(state.is_connected());
        assert_eq!(state.close(), SessionState::Closed);
    }

    #[test]
    fn test_read_only_round_trip() {
        let state = SessionState::Connecting.established(true).unwrap();
        assert_eq!(state, SessionState::ConnectedReadOnly);
        let state = state.begin_connecting().unwrap();
        assert_eq!(state.established(false).unwrap(), SessionState::Connected);
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let expired = SessionState::Connecting.expire().unwrap();
        assert!(expired.is_terminal());
        assert!(expired.begin_connecting().is_err());
        assert_eq!(expired.close(), SessionState::Expired);

        let closed = SessionState::Connected.close();
        assert!(matches!(
            closed.established(false),
            Err(ClientError::IllegalTransition {
                from: "CLOSED",
                to: "CONNECTED"
            })
        ));
    }

    #[test]
    fn test_cannot_establish_without_connecting() {
        assert!(SessionState::Init.established(false).is_err());
        assert!(SessionState::Connected.established(true).is_err());
        assert!(SessionState::Init.auth_failed().is_err());
    }

    #[test]
    fn test_session_identity_effects() {
        let mut session = Session::new();
        assert_eq!(
            session.apply_handshake(&response(10, true)),
            HandshakeEffect::Established
        );
        assert!(session.read_only());
        assert_eq!(
            session.apply_handshake(&response(10, false)),
            HandshakeEffect::Resumed
        );
        assert_eq!(
            session.apply_handshake(&response(11, false)),
            HandshakeEffect::Replaced { previous: 10 }
        );
        assert!(!session.read_only());
    }

    #[test]
    fn test_connect_request_presents_session() {
        let mut session = Session::new();
        let config = ClientConfig::default().with_allow_read_only(true);
        assert!(session.connect_request(&config).is_fresh());

        session.apply_handshake(&response(42, false));
        session.observe_zxid(9);
        session.observe_zxid(3);

        let request = session.connect_request(&config);
        assert_eq!(request.last_session_id, 42);
        assert_eq!(request.session_secret, vec![7; 16]);
        assert_eq!(request.last_zxid_seen, 9);
        assert!(request.allow_read_only);
    }
}
