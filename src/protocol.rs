//! Wire-level types shared by clients, transports and serving nodes.
//!
//! Plain data only. How the values travel is up to the transport: the
//! in-process ensemble passes them by value, the TCP transport frames them as
//! JSON lines (`ClientFrame` / `ServerFrame`).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transaction id. Advanced by every committed write.
pub type Zxid = i64;

/// Session id presented by a client that holds no session yet.
pub const NO_SESSION: u64 = 0;

/// Version wildcard for `SetData` / `Delete`.
pub const ANY_VERSION: i32 = -1;

/// Handshake request sent when a connection is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Session the client wants to resume, or `NO_SESSION`
    pub last_session_id: u64,
    /// Secret issued together with `last_session_id`
    pub session_secret: Vec<u8>,
    /// Requested session timeout in milliseconds
    pub timeout_hint_ms: u64,
    /// Whether the client accepts a read-only connection
    pub allow_read_only: bool,
    /// Highest zxid the client has observed
    pub last_zxid_seen: Zxid,
    /// Opaque authentication token
    #[serde(default)]
    pub auth: Option<String>,
}

impl ConnectRequest {
    /// Request for a brand new session.
    pub fn fresh(timeout_hint_ms: u64, allow_read_only: bool) -> Self {
        Self {
            last_session_id: NO_SESSION,
            session_secret: Vec::new(),
            timeout_hint_ms,
            allow_read_only,
            last_zxid_seen: 0,
            auth: None,
        }
    }

    /// Attach an authentication token.
    pub fn with_auth(mut self, auth: Option<String>) -> Self {
        self.auth = auth;
        self
    }

    /// True when no session is being resumed.
    pub fn is_fresh(&self) -> bool {
        self.last_session_id == NO_SESSION
    }
}

/// Successful handshake response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub session_id: u64,
    pub session_secret: Vec<u8>,
    pub negotiated_timeout_ms: u64,
    /// The server accepted this connection in read-only mode
    pub read_only: bool,
}

/// Reasons a server refuses a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeRejection {
    /// The presented session is gone and cannot be resumed
    SessionExpired,
    /// Authentication failed
    AuthFailed,
    /// The node has no quorum and the client did not allow read-only mode
    ReadOnlyRefused,
}

impl HandshakeRejection {
    /// Terminal rejections end the client session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SessionExpired | Self::AuthFailed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionExpired => "session_expired",
            Self::AuthFailed => "auth_failed",
            Self::ReadOnlyRefused => "read_only_refused",
        }
    }
}

impl fmt::Display for HandshakeRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requests a session can issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    GetData { path: String },
    Exists { path: String },
    GetChildren { path: String },
    Create { path: String, data: Vec<u8> },
    SetData { path: String, data: Vec<u8>, version: i32 },
    Delete { path: String, version: i32 },
    Sync { path: String },
    /// Heartbeat, issued by the session itself
    Ping,
    /// Close notification, issued by the session itself
    CloseSession,
}

impl Operation {
    pub fn get_data(path: impl Into<String>) -> Self {
        Self::GetData { path: path.into() }
    }

    pub fn exists(path: impl Into<String>) -> Self {
        Self::Exists { path: path.into() }
    }

    pub fn get_children(path: impl Into<String>) -> Self {
        Self::GetChildren { path: path.into() }
    }

    pub fn create(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::Create {
            path: path.into(),
            data: data.into(),
        }
    }

    pub fn set_data(path: impl Into<String>, data: impl Into<Vec<u8>>, version: i32) -> Self {
        Self::SetData {
            path: path.into(),
            data: data.into(),
            version,
        }
    }

    pub fn delete(path: impl Into<String>, version: i32) -> Self {
        Self::Delete {
            path: path.into(),
            version,
        }
    }

    pub fn sync(path: impl Into<String>) -> Self {
        Self::Sync { path: path.into() }
    }

    /// Operations that change the data tree.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::Create { .. } | Self::SetData { .. } | Self::Delete { .. }
        )
    }

    /// Operations issued internally by the session, never by callers.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Ping | Self::CloseSession)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::GetData { .. } => "get_data",
            Self::Exists { .. } => "exists",
            Self::GetChildren { .. } => "get_children",
            Self::Create { .. } => "create",
            Self::SetData { .. } => "set_data",
            Self::Delete { .. } => "delete",
            Self::Sync { .. } => "sync",
            Self::Ping => "ping",
            Self::CloseSession => "close_session",
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            Self::GetData { path }
            | Self::Exists { path }
            | Self::GetChildren { path }
            | Self::Create { path, .. }
            | Self::SetData { path, .. }
            | Self::Delete { path, .. }
            | Self::Sync { path } => Some(path),
            Self::Ping | Self::CloseSession => None,
        }
    }
}

/// Node metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Stat {
    pub version: i32,
    pub czxid: Zxid,
    pub mzxid: Zxid,
    pub num_children: u32,
}

/// Successful operation results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpResult {
    Data { data: Vec<u8>, stat: Stat },
    Stat(Option<Stat>),
    Children(Vec<String>),
    Created(String),
    Done,
}

/// Operation failure codes. Numeric values follow the classic coordination
/// service error numbering so logs stay familiar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NoNode,
    NodeExists,
    BadVersion,
    NotEmpty,
    /// Write attempted against a read-only connection or a node without quorum
    NotReadOnly,
    SessionExpired,
    BadArguments,
    Unimplemented,
}

impl ErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            Self::Unimplemented => -6,
            Self::BadArguments => -8,
            Self::NoNode => -101,
            Self::BadVersion => -103,
            Self::NodeExists => -110,
            Self::NotEmpty => -111,
            Self::SessionExpired => -112,
            Self::NotReadOnly => -119,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoNode => "NO_NODE",
            Self::NodeExists => "NODE_EXISTS",
            Self::BadVersion => "BAD_VERSION",
            Self::NotEmpty => "NOT_EMPTY",
            Self::NotReadOnly => "NOT_READ_ONLY",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::BadArguments => "BAD_ARGUMENTS",
            Self::Unimplemented => "UNIMPLEMENTED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

/// A request tagged with the client-assigned transaction slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub xid: i32,
    pub op: Operation,
}

/// Server answer to a `Request`. Replies arrive in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub xid: i32,
    /// Zxid the request was served at
    pub zxid: Zxid,
    pub result: Result<OpResult, ErrorCode>,
}

/// Frames written by clients on stream transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Connect(ConnectRequest),
    Request(Request),
}

/// Frames written by servers on stream transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected(ConnectResponse),
    Rejected { reason: HandshakeRejection },
    Reply(Reply),
}
