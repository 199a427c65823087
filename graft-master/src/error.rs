//! Error types for the master side

use std::fmt;

use graft_config::ConfigError;
use graft_core::CodecError;
use graft_ipc::{identifiers, ErrorReply, IpcError, StackFrame};
use thiserror::Error;

use crate::trace::render_trace;

/// Result alias used throughout the master
pub type GraftResult<T> = Result<T, GraftError>;

/// Master-side errors
#[derive(Error, Debug)]
pub enum GraftError {
    /// The remote evaluated the request and raised
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote process died while a call was outstanding (status: {status})")]
    RemoteDied { status: String },

    /// The caller interrupted a call; the channel was drained before returning
    #[error("Call interrupted")]
    Interrupted,

    #[error("Session is closed")]
    Closed,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Failed to launch remote: {0}")]
    Launch(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl GraftError {
    /// The session cannot be used after this error
    pub fn is_fatal(&self) -> bool {
        match self {
            GraftError::Protocol(_) | GraftError::RemoteDied { .. } | GraftError::Closed => true,
            GraftError::Ipc(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// A remote lookup of a variable, function, property or handle failed
    pub fn is_lookup(&self) -> bool {
        matches!(self, GraftError::Remote(e) if e.is_lookup())
    }

    /// Identifier of a remote error
    pub fn identifier(&self) -> Option<&str> {
        match self {
            GraftError::Remote(e) => Some(&e.identifier),
            _ => None,
        }
    }
}

/// Error raised by the remote, reconstructed locally
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub message: String,
    pub identifier: String,
    /// Innermost frame first
    pub stack: Vec<StackFrame>,
    /// Message as the remote produced it, before any translation
    pub original_message: String,
    /// Rendered traceback, empty when there are no frames
    pub trace: String,
}

impl RemoteError {
    /// Error raised locally in the vocabulary of remote errors
    pub fn new(identifier: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            original_message: message.clone(),
            message,
            identifier: identifier.into(),
            stack: Vec::new(),
            trace: String::new(),
        }
    }

    /// Rebuild an `error` reply, rendering its traceback
    pub fn from_reply(reply: ErrorReply, source_extensions: &[String]) -> Self {
        let trace = render_trace(&reply.stack, source_extensions);
        Self {
            original_message: reply
                .original_message
                .unwrap_or_else(|| reply.message.clone()),
            message: reply.message,
            identifier: reply.identifier,
            stack: reply.stack,
            trace,
        }
    }

    pub fn is_lookup(&self) -> bool {
        identifiers::is_lookup(&self.identifier)
    }

    pub fn is_interrupt(&self) -> bool {
        self.identifier == identifiers::INTERRUPTED
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.identifier.is_empty() {
            write!(f, "{}", self.message)?;
        } else {
            write!(f, "{} ({})", self.message, self.identifier)?;
        }
        if !self.trace.is_empty() {
            write!(f, "\n{}", self.trace)?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}
