//! Error types shared by the client and the server.

use std::io;

use thiserror::Error;

use crate::protocol::MessageKind;

/// A message could not be built or decoded.
///
/// On the server these never produce a reply: the offending session is
/// dropped. On the client they surface before anything is sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("message truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("unknown message type {0}")]
    UnknownKind(u32),

    #[error("at least one line must be specified")]
    NoLines,

    #[error("can only handle up to {max} lines, got {count}")]
    TooManyLines { count: usize, max: usize },

    #[error("line offset {0} specified more than once")]
    DuplicateOffset(u32),

    #[error("expected {expected} output values, got {actual}")]
    ValueCount { expected: usize, actual: usize },

    #[error("invalid output value {0}, must be 0 or 1")]
    InvalidValue(u8),

    #[error("unknown request flags {0:#04x}")]
    InvalidFlags(u8),

    #[error("{field} exceeds {max} bytes")]
    FieldTooLong { field: &'static str, max: usize },

    #[error("{field} is not a valid string")]
    InvalidString { field: &'static str },
}

impl From<ProtocolError> for io::Error {
    fn from(err: ProtocolError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

/// Failure of a single client/server exchange.
///
/// Every variant is fatal to the CLI invocation that hit it.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to server")]
    Connect(#[source] io::Error),

    #[error("timeout while waiting for server to respond")]
    Timeout,

    #[error("server closed the connection without responding")]
    Disconnected,

    #[error("internal server error: {0}")]
    Server(io::Error),

    #[error("server responded with unexpected message type: {0}")]
    UnexpectedReply(MessageKind),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("failed to exchange data with server")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// OS error code carried by an ERROR reply, if that is what this is.
    pub fn errno(&self) -> Option<i32> {
        match self {
            ClientError::Server(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_keeps_errno() {
        let err = ClientError::Server(io::Error::from_raw_os_error(libc::EBUSY));
        assert_eq!(err.errno(), Some(libc::EBUSY));
        assert!(err.to_string().starts_with("internal server error"));
    }

    #[test]
    fn test_protocol_error_into_io() {
        let err: io::Error = ProtocolError::UnknownKind(42).into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("42"));
    }
}
