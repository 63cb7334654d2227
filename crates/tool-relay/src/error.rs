//! Error taxonomy for the relay and the peer multiplexer.
//!
//! A single tagged [`ErrorKind`] discriminator rather than a class
//! hierarchy: compare by kind, not by type.

use crate::protocol::ErrorObject;

/// The ten stable error kinds of the error registry (spec §4.1, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    Internal,
    Connection,
    Timeout,
    Session,
    Execution,
    ToolNotFound,
    Validation,
    Permission,
}

impl ErrorKind {
    /// Numeric code from the reserved JSON-RPC range or the application
    /// range (spec §6).
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Parse => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::Internal => -32603,
            Self::Connection => -32000,
            Self::Timeout => -32001,
            Self::Session => -32002,
            Self::Execution => -32003,
            Self::ToolNotFound => -32004,
            Self::Validation => -32005,
            Self::Permission => -32006,
        }
    }

    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            -32700 => Self::Parse,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParams,
            -32000 => Self::Connection,
            -32001 => Self::Timeout,
            -32002 => Self::Session,
            -32003 => Self::Execution,
            -32004 => Self::ToolNotFound,
            -32005 => Self::Validation,
            -32006 => Self::Permission,
            _ => Self::Internal,
        }
    }
}

/// Error raised inside the relay (routing, session, timeout failures).
#[derive(thiserror::Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct RelayError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RelayError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    #[must_use]
    pub fn session(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Session, message)
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    #[must_use]
    pub fn tool_not_found(name: &str) -> Self {
        Self::new(ErrorKind::ToolNotFound, format!("tool not found: {name}"))
    }

    #[must_use]
    pub fn to_error_object(&self) -> ErrorObject {
        ErrorObject::new(self.kind.code(), self.message.clone())
    }
}

/// Error raised inside the peer multiplexer (attach, request, dispatch
/// failures).
#[derive(thiserror::Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct PeerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PeerError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution, message)
    }

    #[must_use]
    pub fn from_error_object(err: &ErrorObject) -> Self {
        Self::new(ErrorKind::from_code(err.code), err.message.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_codes_match_registry() {
        assert_eq!(ErrorKind::Parse.code(), -32700);
        assert_eq!(ErrorKind::Session.code(), -32002);
        assert_eq!(ErrorKind::ToolNotFound.code(), -32004);
        assert_eq!(ErrorKind::Permission.code(), -32006);
    }

    #[test]
    fn peer_error_roundtrips_through_error_object() {
        let relay_err = RelayError::timeout("forward timeout");
        let obj = relay_err.to_error_object();
        let peer_err = PeerError::from_error_object(&obj);
        assert_eq!(peer_err.kind, ErrorKind::Timeout);
    }
}
