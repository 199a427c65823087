//! Remote-side error types

use std::panic::Location;

use graft_core::{CodecError, Handle};
use graft_ipc::{identifiers, ErrorReply, StackFrame};
use thiserror::Error;

/// Result of evaluating anything on behalf of the master
pub type RemoteResult<T> = Result<T, RemoteFailure>;

/// An evaluation error, sent back to the master as an `error` reply
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} ({identifier})")]
pub struct RemoteFailure {
    pub identifier: String,
    pub message: String,
    /// Innermost frame first
    pub stack: Vec<StackFrame>,
}

impl RemoteFailure {
    /// New failure whose innermost frame is the caller's source location
    #[track_caller]
    pub fn new(identifier: impl Into<String>, message: impl Into<String>) -> Self {
        let location = Location::caller();
        Self {
            identifier: identifier.into(),
            message: message.into(),
            stack: vec![StackFrame::new(
                Some(location.file().to_string()),
                i64::from(location.line()),
                "",
            )],
        }
    }

    #[track_caller]
    pub fn no_variable(name: &str) -> Self {
        Self::new(
            identifiers::NO_VARIABLE,
            format!("Undefined variable '{}'", name),
        )
    }

    #[track_caller]
    pub fn no_function(name: &str) -> Self {
        Self::new(
            identifiers::NO_FUNCTION,
            format!("Undefined function '{}'", name),
        )
    }

    #[track_caller]
    pub fn bad_argument(message: impl Into<String>) -> Self {
        Self::new(identifiers::BAD_ARGUMENT, message)
    }

    #[track_caller]
    pub fn interrupted() -> Self {
        Self::new(identifiers::INTERRUPTED, "Operation terminated by user")
    }

    /// Name the unnamed frames after the routine they were raised in
    pub fn in_routine(mut self, routine: &str) -> Self {
        for frame in self.stack.iter_mut().filter(|f| f.name.is_empty()) {
            frame.name = routine.to_string();
        }
        self
    }

    /// Record an outer frame
    #[track_caller]
    pub fn called_from(mut self, routine: &str) -> Self {
        let location = Location::caller();
        self.stack.push(StackFrame::new(
            Some(location.file().to_string()),
            i64::from(location.line()),
            routine,
        ));
        self
    }

    pub fn into_reply(self) -> ErrorReply {
        ErrorReply::new(self.identifier, self.message).with_stack(self.stack)
    }
}

impl From<HandleError> for RemoteFailure {
    #[track_caller]
    fn from(err: HandleError) -> Self {
        RemoteFailure::new(identifiers::INVALID_HANDLE, err.to_string())
    }
}

impl From<CodecError> for RemoteFailure {
    #[track_caller]
    fn from(err: CodecError) -> Self {
        let identifier = match err {
            CodecError::Reference(_) => identifiers::INVALID_HANDLE,
            _ => identifiers::BAD_VALUE,
        };
        RemoteFailure::new(identifier, err.to_string())
    }
}

/// Handle table misuse
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    #[error("Handle {0} was never allocated")]
    Unknown(Handle),

    #[error("Handle {0} has already been released")]
    Released(Handle),

    #[error("Handle {handle} refers to a {actual}, expected a {expected}")]
    WrongKind {
        handle: Handle,
        expected: &'static str,
        actual: &'static str,
    },
}
