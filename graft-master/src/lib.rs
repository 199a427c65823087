//! Master side of graft
//!
//! This crate launches a remote engine, keeps the request/reply channel to
//! it in step, and exposes remote objects and functions as local proxies.

pub mod error;
pub mod function;
pub mod launch;
pub mod peer;
pub mod proxy;
pub mod session;
pub mod trace;

// Re-export main types
pub use error::{GraftError, GraftResult, RemoteError};
pub use function::{Invocable, Namespace, RemoteFunction};
pub use peer::{ChildPeer, OutputEcho, PeerProcess, TaskPeer};
pub use proxy::{strip_markup, BoundMethod, Capability, Member, ProxyObject};
pub use session::{ChannelState, Global, InterruptHandle, MasterKwargs, MasterValue, PeerStream, Session};
pub use trace::render_trace;
