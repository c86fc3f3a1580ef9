//! Replication Configuration
//!
//! The replication section of node configuration. Configured externally,
//! immutable after startup; default is disabled, which leaves the node a
//! standalone instance with no outbound connections.

use std::time::Duration;

use uuid::Uuid;

use super::applier::Applier;
use super::errors::{ReplicationError, ReplicationResult};
use super::protocol::TcpMasterConnector;
use super::source::ReplicaSource;

/// Default connect timeout per source.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default keepalive interval while following.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Replication settings for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationConfig {
    /// Whether any appliers are started at all.
    pub enabled: bool,

    /// Master sources, one applier each. `[user[:pass]@]host:port`.
    pub sources: Vec<String>,

    /// Connect timeout applied to each source.
    pub connect_timeout: Duration,

    /// Idle interval after which the applier sends a keepalive.
    pub heartbeat_interval: Duration,
}

impl ReplicationConfig {
    /// Disabled configuration: the default-safe path.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            sources: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    /// Enabled configuration replicating from `sources`.
    pub fn with_sources(sources: Vec<String>) -> Self {
        Self {
            enabled: true,
            sources,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ReplicationResult<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.connect_timeout.is_zero() {
            return Err(ReplicationError::config("connect timeout must be non-zero"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ReplicationError::config(
                "heartbeat interval must be non-zero",
            ));
        }

        for source in &self.sources {
            // Surfaces bad URIs and over-long sources at startup, redacted
            ReplicaSource::parse(source)?;
        }
        Ok(())
    }

    /// Parse every configured source.
    pub fn parsed_sources(&self) -> ReplicationResult<Vec<ReplicaSource>> {
        self.sources
            .iter()
            .map(|s| ReplicaSource::parse(s))
            .collect()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The TCP connector configured with this node's connect timeout.
    pub fn connector(&self) -> TcpMasterConnector {
        TcpMasterConnector::new(self.connect_timeout)
    }

    /// Construct one unstarted applier per configured source. Empty when
    /// replication is disabled.
    pub fn build_appliers(&self, instance_uuid: Uuid) -> ReplicationResult<Vec<Applier>> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        self.validate()?;
        self.sources
            .iter()
            .map(|s| Applier::new(s, instance_uuid, self.heartbeat_interval))
            .collect()
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self::disabled()
    }
}
