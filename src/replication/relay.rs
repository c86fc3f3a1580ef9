//! Relay Handle
//!
//! The relay is the outbound counterpart of the applier: it serves our
//! transaction stream to another replica. Its internals live with the
//! server; the registry only needs the clock it has confirmed to the peer,
//! read-only, for status merging. Neither side owns the other; the registry
//! owns both.

use std::sync::RwLock;

use crate::vclock::{Lsn, ReplicaId, VectorClock};

use super::errors::{ReplicationError, ReplicationResult};

/// Progress of one outbound relay, as far as the peer has acknowledged.
#[derive(Debug, Default)]
pub struct Relay {
    vclock: RwLock<VectorClock>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time snapshot of the confirmed clock.
    pub fn vclock(&self) -> VectorClock {
        self.vclock
            .read()
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Record that the peer confirmed `lsn` for `id`.
    pub fn confirm(&self, id: ReplicaId, lsn: Lsn) -> ReplicationResult<()> {
        let mut vclock = self
            .vclock
            .write()
            .map_err(|_| ReplicationError::logic("relay clock lock poisoned"))?;
        vclock.follow(id, lsn)
    }
}
