//! Replication Subsystem
//!
//! The intake half of multi-master replication:
//! - one applier per configured master, each owning one connection and one
//!   vector clock
//! - the cluster registry maps replica id/UUID to applier/relay pairs and
//!   feeds the reporting layer
//! - errors never cross a task boundary except through an explicit join

mod applier;
mod config;
mod connection;
mod errors;
mod protocol;
mod registry;
mod relay;
mod source;
mod status;

pub use applier::{Applier, ApplierState, ReplicaStore};
pub use config::{
    ReplicationConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL,
};
pub use connection::MasterConnection;
pub use errors::{ReplicationError, ReplicationResult};
pub use protocol::{
    ClientMessage, Greeting, MasterConnector, MasterMessage, MasterSession, ReplicationRow,
    TcpMasterConnector, TcpMasterSession, ERROR_CODE_AUTH,
};
pub use registry::ClusterRegistry;
pub use relay::Relay;
pub use source::{ReplicaSource, SOURCE_MAX_LEN};
pub use status::{ApplierStatus, ReplicaStatus, SyncDirection};
