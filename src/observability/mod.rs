//! Observability
//!
//! Structured logging for the replication subsystem.

mod logger;

pub use logger::{Logger, Severity};
