//! Serving node error types
//!
//! Every error carries a kind, a message and a stable numeric code.
//! Configuration and bind failures stop the node. Protocol violations,
//! refused handshakes and socket failures on an accepted connection end that
//! connection only.

use std::fmt;

use crate::transport::TransportError;

/// Serving node error
#[derive(Debug, Clone)]
pub struct ServerError {
    /// Error kind
    pub kind: ServerErrorKind,
    /// Error message
    pub message: String,
}

/// Serving node error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorKind {
    /// Invalid node configuration
    Config,

    /// Socket bind or accept failure
    Io,

    /// Client violated the wire protocol
    Protocol,

    /// Handshake refused by the node
    Refused,
}

impl ServerError {
    pub fn new(kind: ServerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ServerErrorKind::Config, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ServerErrorKind::Io, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ServerErrorKind::Protocol, message)
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::new(ServerErrorKind::Refused, message)
    }

    /// Numeric code, stable across releases.
    pub fn error_code(&self) -> i32 {
        match self.kind {
            ServerErrorKind::Config => 1,
            ServerErrorKind::Io => 2,
            ServerErrorKind::Protocol => 3,
            ServerErrorKind::Refused => 4,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ServerError({:?}, code {}): {}",
            self.kind,
            self.error_code(),
            self.message
        )
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

impl From<TransportError> for ServerError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Protocol(message) => Self::protocol(message),
            other => Self::io(other.to_string()),
        }
    }
}

/// Result type for serving node operations
pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_kind_and_code() {
        let error = ServerError::refused("READ_ONLY_REFUSED");
        assert_eq!(
            error.to_string(),
            "ServerError(Refused, code 4): READ_ONLY_REFUSED"
        );
    }

    #[test]
    fn test_io_error_maps_to_io() {
        let error: ServerError =
            std::io::Error::new(std::io::ErrorKind::Other, "too many open files").into();
        assert_eq!(error.kind, ServerErrorKind::Io);
    }

    #[test]
    fn test_codes_are_distinct() {
        let codes = [
            ServerError::config("").error_code(),
            ServerError::io("").error_code(),
            ServerError::protocol("").error_code(),
            ServerError::refused("").error_code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_transport_protocol_error_maps_to_protocol() {
        let error: ServerError = TransportError::Protocol("garbage".into()).into();
        assert_eq!(error.kind, ServerErrorKind::Protocol);
        let error: ServerError = TransportError::Closed.into();
        assert_eq!(error.kind, ServerErrorKind::Io);
    }
}
