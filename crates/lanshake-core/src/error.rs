//! Error types for Lanshake.
//!
//! This module provides a unified error type for all Lanshake operations,
//! with specific error variants for each failure mode of the handshake and
//! transfer protocols.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// A specialized `Result` type for Lanshake operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Lanshake.
#[derive(Error, Debug)]
pub enum Error {
    /// Peer unreachable or connect timed out (E001)
    #[error("unable to connect to {addr}: {reason}")]
    ConnectFailure {
        /// Address that was dialed
        addr: SocketAddr,
        /// Why the connection failed
        reason: String,
    },

    /// Payload decoded but is semantically incomplete (E002)
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Payload is not a valid keyed message (E003)
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Required field absent from a message (E004)
    #[error("missing field '{0}'")]
    MissingField(String),

    /// Counterpart is not allowed to transfer (E005)
    #[error("device '{0}' is not allowed to transfer")]
    Unauthorized(String),

    /// Operation timed out (E006)
    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    /// Operation was cancelled and its socket closed (E007)
    #[error("operation interrupted")]
    Interrupted,

    /// Unknown device or transfer group
    #[error("not found: {0}")]
    NotFound(String),

    /// Peer already holds a group with this id
    #[error("transfer group {0} already exists on the peer")]
    GroupExists(u64),

    /// Transfer rejected by the peer
    #[error("transfer rejected by peer")]
    TransferRejected,

    /// Transfer group is not in a state that permits the operation
    #[error("transfer group {group_id} cannot move from {from} to {to}")]
    InvalidState {
        /// Group id
        group_id: u64,
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Persistence engine failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid user input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the error code associated with this error, if any.
    ///
    /// Error codes follow the pattern EXXX where XXX is a 3-digit number.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::ConnectFailure { .. } => Some("E001"),
            Self::ProtocolViolation(_) => Some("E002"),
            Self::MalformedMessage(_) => Some("E003"),
            Self::MissingField(_) => Some("E004"),
            Self::Unauthorized(_) => Some("E005"),
            Self::Timeout(_) => Some("E006"),
            Self::Interrupted => Some("E007"),
            _ => None,
        }
    }

    /// Returns whether this error is recoverable (can be retried by the caller).
    ///
    /// Nothing in this crate retries on its own; this only informs caller policy.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailure { .. } | Self::Timeout(_) | Self::Io(_)
        )
    }

    /// Returns whether this error came from the wire codec.
    #[must_use]
    pub const fn is_codec(&self) -> bool {
        matches!(self, Self::MalformedMessage(_) | Self::MissingField(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Interrupted.code(), Some("E007"));
        assert_eq!(Error::MissingField("appInfo".into()).code(), Some("E004"));
        assert_eq!(Error::TransferRejected.code(), None);
    }

    #[test]
    fn test_never_retried() {
        assert!(!Error::Unauthorized("abc".into()).is_recoverable());
        assert!(!Error::ProtocolViolation("x".into()).is_recoverable());
        assert!(Error::Timeout(5000).is_recoverable());
    }

    #[test]
    fn test_missing_field_display() {
        let err = Error::MissingField("appInfo".to_string());
        assert_eq!(err.to_string(), "missing field 'appInfo'");
    }
}
