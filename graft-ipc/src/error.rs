//! IPC error types

use graft_core::CodecError;
use thiserror::Error;

/// IPC error types
#[derive(Debug, Error)]
pub enum IpcError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Peer closed the connection
    #[error("Connection closed")]
    ConnectionClosed,

    /// Frame that cannot be read as a message; the stream is out of step
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Endpoint address could not be parsed
    #[error("Invalid address '{0}', expected tcp://host:port")]
    InvalidAddress(String),

    /// Transport used after it was closed
    #[error("Transport not connected")]
    NotConnected,
}

impl IpcError {
    /// Check if this error indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IpcError::ConnectionClosed
                | IpcError::InvalidMessage(_)
                | IpcError::DeserializationError(_)
                | IpcError::NotConnected
        )
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted => IpcError::ConnectionClosed,
            _ => IpcError::IoError(err.to_string()),
        }
    }
}

impl From<CodecError> for IpcError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Serialization(msg) => IpcError::SerializationError(msg),
            other => IpcError::DeserializationError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_fatal() {
        assert!(IpcError::ConnectionClosed.is_fatal());
        assert!(IpcError::InvalidMessage("bad format".to_string()).is_fatal());
        assert!(IpcError::NotConnected.is_fatal());
        assert!(!IpcError::IoError("network error".to_string()).is_fatal());
        assert!(!IpcError::SerializationError("too big".to_string()).is_fatal());
    }

    #[test]
    fn test_io_error_mapping() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(IpcError::from(eof), IpcError::ConnectionClosed));
        let other = std::io::Error::other("boom");
        assert!(matches!(IpcError::from(other), IpcError::IoError(_)));
    }
}
