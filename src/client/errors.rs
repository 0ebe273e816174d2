//! # Client Errors
//!
//! Errors surfaced to callers of `Client`. Transport failures never appear
//! here directly; the session task absorbs them and reconnects.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::ErrorCode;

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Client errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    // ==================
    // Connection Errors
    // ==================
    /// Not connected when the operation deadline passed
    #[error("connection loss")]
    ConnectionLoss,

    /// Connected, but no reply before the deadline
    #[error("operation timed out after {0:?}")]
    OperationTimeout(Duration),

    // ==================
    // Session Errors
    // ==================
    /// Session expired; the client is unusable
    #[error("session expired")]
    SessionExpired,

    /// Authentication failed; the client is unusable
    #[error("authentication failed")]
    AuthFailed,

    /// Session closed by the application
    #[error("session closed")]
    SessionClosed,

    // ==================
    // Operation Errors
    // ==================
    /// Mutating operation while connected read-only
    #[error("not allowed in read-only mode")]
    NotReadOnly,

    /// Server rejected the operation
    #[error("operation failed: {0}")]
    Operation(ErrorCode),

    /// Operation may not be submitted by callers
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// Reply does not match the operation
    #[error("unexpected reply to {0}")]
    UnexpectedReply(&'static str),

    // ==================
    // Internal Errors
    // ==================
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Illegal session state transition
    #[error("illegal transition from {from} to {to}")]
    IllegalTransition {
        from: &'static str,
        to: &'static str,
    },
}

impl ClientError {
    /// Stable error code string
    pub fn code(&self) -> &'static str {
        match self {
            ClientError::ConnectionLoss => "ENSEMBLE_CLIENT_CONNECTION_LOSS",
            ClientError::OperationTimeout(_) => "ENSEMBLE_CLIENT_OPERATION_TIMEOUT",
            ClientError::SessionExpired => "ENSEMBLE_CLIENT_SESSION_EXPIRED",
            ClientError::AuthFailed => "ENSEMBLE_CLIENT_AUTH_FAILED",
            ClientError::SessionClosed => "ENSEMBLE_CLIENT_SESSION_CLOSED",
            ClientError::NotReadOnly => "ENSEMBLE_CLIENT_NOT_READ_ONLY",
            ClientError::Operation(_) => "ENSEMBLE_CLIENT_OPERATION_FAILED",
            ClientError::InvalidOperation(_) => "ENSEMBLE_CLIENT_INVALID_OPERATION",
            ClientError::UnexpectedReply(_) => "ENSEMBLE_CLIENT_UNEXPECTED_REPLY",
            ClientError::Config(_) => "ENSEMBLE_CLIENT_CONFIG_ERROR",
            ClientError::IllegalTransition { .. } => "ENSEMBLE_CLIENT_ILLEGAL_TRANSITION",
        }
    }

    /// The session can no longer be used.
    pub fn is_session_terminal(&self) -> bool {
        matches!(
            self,
            ClientError::SessionExpired | ClientError::AuthFailed | ClientError::SessionClosed
        )
    }

    /// Map a server error code.
    pub fn from_error_code(code: ErrorCode) -> Self {
        match code {
            ErrorCode::NotReadOnly => ClientError::NotReadOnly,
            ErrorCode::SessionExpired => ClientError::SessionExpired,
            other => ClientError::Operation(other),
        }
    }
}
