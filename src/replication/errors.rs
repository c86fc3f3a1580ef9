//! Replication Error Types
//!
//! One taxonomy for the whole subsystem:
//! - Connection failures are retried by the orchestration layer, never here
//! - Auth rejections are surfaced and not auto-retried
//! - Logic errors indicate an upstream bug and must never be absorbed

use thiserror::Error;

/// Result type for replication operations
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Replication and applier errors
///
/// `Clone` is deliberate: the reader task captures its terminal error on the
/// applier for the reporting layer while the same error is rethrown from
/// `wait()`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplicationError {
    // ==================
    // Network
    // ==================
    /// Connect timeout, refused, reset, or peer close
    #[error("connection error: {0}")]
    Connection(String),

    // ==================
    // Handshake
    // ==================
    /// Master rejected our credentials
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Malformed or unexpected message; fatal to the connection
    #[error("protocol error: {0}")]
    Protocol(String),

    // ==================
    // Local
    // ==================
    /// Resource limits hit during construction
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// Invariant violation (vclock regress, illegal state transition)
    #[error("logic error: {0}")]
    Logic(String),

    /// Invalid replication configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl ReplicationError {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create an authentication error.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a resource exhaustion error.
    pub fn resource_exhaustion(msg: impl Into<String>) -> Self {
        Self::ResourceExhaustion(msg.into())
    }

    /// Create a logic error.
    pub fn logic(msg: impl Into<String>) -> Self {
        Self::Logic(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the orchestration layer may retry the connection.
    ///
    /// Only plain connection failures qualify. Auth rejections are excluded
    /// so a bad password does not hammer the master.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Whether this error indicates a local bug or hard limit rather than a
    /// condition of the remote peer.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhaustion(_) | Self::Logic(_) | Self::Config(_)
        )
    }

    /// Stable code for the reporting layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "CONNECTION",
            Self::Auth(_) => "AUTH",
            Self::Protocol(_) => "PROTOCOL",
            Self::ResourceExhaustion(_) => "RESOURCE_EXHAUSTION",
            Self::Logic(_) => "LOGIC",
            Self::Config(_) => "CONFIGURATION",
        }
    }
}

impl From<std::io::Error> for ReplicationError {
    fn from(e: std::io::Error) -> Self {
        Self::Connection(e.to_string())
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_errors_are_retriable() {
        assert!(ReplicationError::connection("timed out").is_retriable());
        assert!(!ReplicationError::auth("bad password").is_retriable());
        assert!(!ReplicationError::protocol("garbage").is_retriable());
        assert!(!ReplicationError::logic("lsn regress").is_retriable());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(ReplicationError::resource_exhaustion("source too long").is_fatal());
        assert!(ReplicationError::logic("lsn regress").is_fatal());
        assert!(ReplicationError::config("no sources").is_fatal());
        assert!(!ReplicationError::connection("reset").is_fatal());
        assert!(!ReplicationError::auth("rejected").is_fatal());
    }

    #[test]
    fn test_io_error_maps_to_connection() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: ReplicationError = io.into();
        assert!(matches!(err, ReplicationError::Connection(_)));
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ReplicationError::auth("x").code(), "AUTH");
        assert_eq!(ReplicationError::connection("x").code(), "CONNECTION");
    }
}
