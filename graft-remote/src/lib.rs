//! Remote side of graft
//!
//! The remote process connects back to the master, then answers requests
//! against an [`Engine`]. Objects handed to the master stay pinned in a
//! handle table until the master releases them.

pub mod builtin;
pub mod engine;
pub mod error;
pub mod handle_table;
pub mod runtime;

pub use builtin::{BuiltinEngine, Counter};
pub use engine::{
    class_of, render, CallContext, Engine, FunctionRef, InterruptFlag, Kwargs, NativeObject, ObjectRef, OutputSink,
    RemoteValue,
};
pub use error::{HandleError, RemoteFailure, RemoteResult};
pub use handle_table::HandleTable;
pub use runtime::{run, RemoteRuntime};
