//! Error types for the client.

use std::io;

use dsplink_protocol::{DecodeError, ProtocolError};
use serde::Serialize;
use thiserror::Error;

use crate::supervisor::FailureRecord;

/// Errors raised while opening or using the device socket.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket I/O failed or timed out.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS context could not be configured.
    #[error("TLS setup failed: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    /// TLS handshake with the device failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// Host name did not resolve to any address.
    #[error("could not resolve {0}")]
    Resolve(String),

    /// The socket is closed.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Whether this is a read/write timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Io(e) if is_timeout(e))
    }
}

/// Whether an I/O error is a socket timeout. Platforms report either kind.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A frame failed validation.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The socket or TLS layer failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A command needing credentials was issued before sign-in completed.
    #[error("not authenticated: sign-in has not completed")]
    NotAuthenticated,

    /// The device answered with a nonzero result code.
    #[error("device returned error code {code}: {message}")]
    Device {
        /// Result code.
        code: i64,
        /// Device-supplied message.
        message: String,
    },

    /// A reply parsed as JSON but lacked fields the client needs.
    #[error("malformed {command} reply: {reason}")]
    MalformedReply {
        /// Command the reply belongs to.
        command: String,
        /// What was missing or wrong.
        reason: String,
    },

    /// A reply was not valid JSON, or a command failed to serialize.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Socket index outside the model's range.
    #[error("socket {index} does not exist (device has {count})")]
    InvalidSocket {
        /// Requested 1-based index.
        index: u8,
        /// Sockets on the model.
        count: u8,
    },

    /// Too many consecutive connection failures; the device is unavailable.
    #[error("device unavailable after {failures} consecutive connection failures")]
    PollFailed {
        /// Consecutive failure count.
        failures: u32,
        /// The most recent failures, oldest first.
        history: Vec<FailureRecord>,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<DecodeError> for ClientError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Io(e) => ClientError::Transport(TransportError::Io(e)),
            DecodeError::Protocol(e) => ClientError::Protocol(e),
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        ClientError::Transport(TransportError::Io(err))
    }
}

/// Coarse error classification kept in the failure history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// [`ClientError::Protocol`]
    Protocol,
    /// [`ClientError::Transport`]
    Transport,
    /// [`ClientError::NotAuthenticated`]
    NotAuthenticated,
    /// [`ClientError::Device`]
    Device,
    /// [`ClientError::MalformedReply`]
    MalformedReply,
    /// [`ClientError::Json`]
    Json,
    /// [`ClientError::InvalidSocket`]
    InvalidSocket,
    /// [`ClientError::PollFailed`]
    PollFailed,
    /// [`ClientError::Config`]
    Config,
}

impl ClientError {
    /// The error's kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Protocol(_) => ErrorKind::Protocol,
            ClientError::Transport(_) => ErrorKind::Transport,
            ClientError::NotAuthenticated => ErrorKind::NotAuthenticated,
            ClientError::Device { .. } => ErrorKind::Device,
            ClientError::MalformedReply { .. } => ErrorKind::MalformedReply,
            ClientError::Json(_) => ErrorKind::Json,
            ClientError::InvalidSocket { .. } => ErrorKind::InvalidSocket,
            ClientError::PollFailed { .. } => ErrorKind::PollFailed,
            ClientError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether the failure is attributable to the network rather than the device.
    ///
    /// Transport failures always count; otherwise the message is checked for
    /// "connection" or "timeout". Device rejections never count.
    pub fn is_connection_error(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Device { .. }
            | ClientError::InvalidSocket { .. }
            | ClientError::Config(_) => false,
            other => {
                let message = other.to_string().to_lowercase();
                message.contains("connection") || message.contains("timeout")
            }
        }
    }

    /// Whether a reconnect and retry could plausibly help.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ClientError::Device { .. }
                | ClientError::InvalidSocket { .. }
                | ClientError::Config(_)
                | ClientError::PollFailed { .. }
        )
    }
}

/// Result type alias using ClientError.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_connection_class() {
        let err = ClientError::from(io::Error::new(io::ErrorKind::TimedOut, "read"));
        assert!(err.is_connection_error());
        assert!(err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(TransportError::Io(io::Error::from(io::ErrorKind::WouldBlock)).is_timeout());
    }

    #[test]
    fn test_device_errors_are_not_connection_class() {
        let err = ClientError::Device {
            code: 7,
            message: "connection refused by policy".into(),
        };
        assert!(!err.is_connection_error());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_message_heuristic() {
        let err = ClientError::MalformedReply {
            command: "sign_in".into(),
            reason: "connection reset mid-reply".into(),
        };
        assert!(err.is_connection_error());

        let err = ClientError::Protocol(ProtocolError::BadOpcode { opcode: 3 });
        assert!(!err.is_connection_error());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_decode_error_mapping() {
        let err: ClientError = DecodeError::Io(io::Error::from(io::ErrorKind::UnexpectedEof)).into();
        assert_eq!(err.kind(), ErrorKind::Transport);

        let err: ClientError = DecodeError::Protocol(ProtocolError::BadLength { length: 1 }).into();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }
}
