//! Inter-process communication for graft
//!
//! This crate provides the request/response protocol and the framed
//! transport used between the master and the remote engine.

pub mod error;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use error::IpcError;
pub use protocol::{identifiers, CallTarget, ErrorReply, Request, Response, StackFrame, AUTO_NARGOUT};
pub use transport::{format_address, parse_address, FramedTransport, IpcTransport, TcpTransport};
