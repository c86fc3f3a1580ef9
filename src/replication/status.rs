//! Status Projection
//!
//! Immutable snapshots handed to the reporting layer. Building one never
//! mutates core state and never fails, even for an errored applier.

use serde::Serialize;
use uuid::Uuid;

use crate::vclock::{ReplicaId, VectorClock};

/// Observable state of one applier.
#[derive(Debug, Clone, Serialize)]
pub struct ApplierStatus {
    /// Lowercase lifecycle state name
    pub status: String,

    /// Origin-to-application delay of the last row, seconds; absent until a
    /// row has been applied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lag: Option<f64>,

    /// Seconds since the last applied row; absent until a row has been
    /// applied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle: Option<f64>,

    /// Last captured error, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// This applier's vector clock
    pub vclock: VectorClock,
}

/// How a registry entry participates in replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    /// Inbound only: we apply their stream
    Follow,
    /// Outbound only: we serve them a stream
    Relay,
    /// Both directions at once
    Bidirectional,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follow => "follow",
            Self::Relay => "relay",
            Self::Bidirectional => "bidirectional",
        }
    }
}

/// Observable state of one registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaStatus {
    /// Assigned replica id
    pub id: ReplicaId,

    /// Replica instance UUID
    pub uuid: Uuid,

    /// Direction classification
    pub status: SyncDirection,

    /// For bidirectional entries, the per-id max of the applier's and the
    /// relay's clocks; otherwise the clock of whichever side exists
    pub vclock: VectorClock,

    /// Applier detail, absent for relay-only entries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applier: Option<ApplierStatus>,
}
