//! Tracing initialisation for graft
//!
//! The master configures logging from [`graft_config::LoggingConfig`]; the
//! remote engine logs to stderr only, since its stdout is the echoed
//! side channel.

pub mod init;

pub use init::{init_logging_from_config, init_remote_tracing, init_simple_tracing};
