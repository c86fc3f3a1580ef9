//! Cluster Registry
//!
//! The set of known replicas, indexed by assigned id and by UUID for the
//! window before an id exists. Each entry pairs at most one inbound applier
//! with at most one outbound relay; the registry is the sole owner of both,
//! so neither needs a reference to the other.
//!
//! An explicitly constructed instance is passed to whoever needs it; there
//! is no process-wide registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::vclock::{ReplicaId, VectorClock};

use super::applier::Applier;
use super::errors::{ReplicationError, ReplicationResult};
use super::relay::Relay;
use super::status::{ReplicaStatus, SyncDirection};

#[derive(Debug)]
struct ReplicaEntry {
    uuid: Uuid,
    id: Option<ReplicaId>,
    applier: Option<Arc<Applier>>,
    relay: Option<Arc<Relay>>,
}

impl ReplicaEntry {
    fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            id: None,
            applier: None,
            relay: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.applier.is_none() && self.relay.is_none()
    }

    fn direction(&self) -> Option<SyncDirection> {
        match (&self.applier, &self.relay) {
            (Some(_), Some(_)) => Some(SyncDirection::Bidirectional),
            (Some(_), None) => Some(SyncDirection::Follow),
            (None, Some(_)) => Some(SyncDirection::Relay),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    replicas: HashMap<Uuid, ReplicaEntry>,
    by_id: BTreeMap<ReplicaId, Uuid>,
}

/// Registry of known replicas and their applier/relay pairs.
#[derive(Debug, Default)]
pub struct ClusterRegistry {
    inner: RwLock<RegistryInner>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `uuid` exists. Idempotent; called on handshake or when
    /// configuration names a peer before any connection succeeds.
    pub fn ensure_replica(&self, uuid: Uuid) {
        if let Ok(mut inner) = self.inner.write() {
            inner
                .replicas
                .entry(uuid)
                .or_insert_with(|| ReplicaEntry::new(uuid));
        }
    }

    /// Assign a dense replica id to `uuid`.
    ///
    /// An id can be bound to one UUID only, and a UUID cannot change id;
    /// either conflict is an upstream bug.
    pub fn assign_id(&self, uuid: Uuid, id: ReplicaId) -> ReplicationResult<()> {
        let mut inner = self.write_inner()?;

        if let Some(owner) = inner.by_id.get(&id) {
            if *owner != uuid {
                return Err(ReplicationError::logic(format!(
                    "replica id {} already assigned to {}",
                    id, owner
                )));
            }
        }

        let entry = inner
            .replicas
            .entry(uuid)
            .or_insert_with(|| ReplicaEntry::new(uuid));
        match entry.id {
            Some(existing) if existing != id => {
                return Err(ReplicationError::logic(format!(
                    "replica {} already has id {}, cannot reassign to {}",
                    uuid, existing, id
                )));
            }
            _ => entry.id = Some(id),
        }
        if let Some(applier) = &entry.applier {
            applier.set_replica_id(id);
        }

        inner.by_id.insert(id, uuid);
        Ok(())
    }

    /// Attach the inbound applier for `uuid`.
    pub fn set_applier(&self, uuid: Uuid, applier: Arc<Applier>) -> ReplicationResult<()> {
        let mut inner = self.write_inner()?;
        let entry = inner
            .replicas
            .entry(uuid)
            .or_insert_with(|| ReplicaEntry::new(uuid));
        if entry.applier.is_some() {
            return Err(ReplicationError::logic(format!(
                "replica {} already has an applier",
                uuid
            )));
        }
        if let Some(id) = entry.id {
            applier.set_replica_id(id);
        }
        entry.applier = Some(applier);
        Ok(())
    }

    /// Attach the outbound relay for `uuid`.
    pub fn set_relay(&self, uuid: Uuid, relay: Arc<Relay>) -> ReplicationResult<()> {
        let mut inner = self.write_inner()?;
        let entry = inner
            .replicas
            .entry(uuid)
            .or_insert_with(|| ReplicaEntry::new(uuid));
        if entry.relay.is_some() {
            return Err(ReplicationError::logic(format!(
                "replica {} already has a relay",
                uuid
            )));
        }
        entry.relay = Some(relay);
        Ok(())
    }

    /// Detach the applier; the entry disappears once both sides are gone.
    pub fn clear_applier(&self, uuid: Uuid) -> Option<Arc<Applier>> {
        let mut inner = self.inner.write().ok()?;
        let entry = inner.replicas.get_mut(&uuid)?;
        let applier = entry.applier.take();
        Self::prune(&mut inner, uuid);
        applier
    }

    /// Detach the relay; the entry disappears once both sides are gone.
    pub fn clear_relay(&self, uuid: Uuid) -> Option<Arc<Relay>> {
        let mut inner = self.inner.write().ok()?;
        let entry = inner.replicas.get_mut(&uuid)?;
        let relay = entry.relay.take();
        Self::prune(&mut inner, uuid);
        relay
    }

    fn prune(inner: &mut RegistryInner, uuid: Uuid) {
        let remove = inner
            .replicas
            .get(&uuid)
            .map(|e| e.is_empty())
            .unwrap_or(false);
        if remove {
            if let Some(entry) = inner.replicas.remove(&uuid) {
                if let Some(id) = entry.id {
                    inner.by_id.remove(&id);
                }
            }
        }
    }

    /// Assigned id for `uuid`, if any.
    pub fn id_of(&self, uuid: Uuid) -> Option<ReplicaId> {
        self.inner
            .read()
            .ok()?
            .replicas
            .get(&uuid)
            .and_then(|e| e.id)
    }

    /// UUID bound to `id`, if any.
    pub fn uuid_of(&self, id: ReplicaId) -> Option<Uuid> {
        self.inner.read().ok()?.by_id.get(&id).copied()
    }

    /// Applier attached to `uuid`, if any.
    pub fn applier_of(&self, uuid: Uuid) -> Option<Arc<Applier>> {
        self.inner
            .read()
            .ok()?
            .replicas
            .get(&uuid)
            .and_then(|e| e.applier.clone())
    }

    /// Number of known replicas, including those not yet assigned an id.
    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.replicas.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Status snapshot of every surfaced entry, in ascending id order.
    ///
    /// Entries without an assigned id, and entries with neither applier nor
    /// relay, are not surfaced. For bidirectional entries the reported
    /// clock is the per-id max of both sides: due to propagation delay each
    /// side may lead on different id subsets.
    pub fn enumerate(&self) -> Vec<ReplicaStatus> {
        let inner = match self.inner.read() {
            Ok(inner) => inner,
            Err(_) => return Vec::new(),
        };

        let mut statuses = Vec::new();
        for (&id, uuid) in &inner.by_id {
            let entry = match inner.replicas.get(uuid) {
                Some(entry) => entry,
                None => continue,
            };
            let direction = match entry.direction() {
                Some(direction) => direction,
                None => continue,
            };

            let applier_clock = entry.applier.as_ref().map(|a| a.vclock_snapshot());
            let relay_clock = entry.relay.as_ref().map(|r| r.vclock());
            let vclock = match (applier_clock, relay_clock) {
                (Some(a), Some(r)) => VectorClock::merge_max(&a, &r),
                (Some(a), None) => a,
                (None, Some(r)) => r,
                (None, None) => VectorClock::new(),
            };

            statuses.push(ReplicaStatus {
                id,
                uuid: entry.uuid,
                status: direction,
                vclock,
                applier: entry.applier.as_ref().map(|a| a.status()),
            });
        }
        statuses
    }

    /// Stop every attached applier. Used at registry teardown.
    pub async fn stop_all(&self) {
        let appliers: Vec<Arc<Applier>> = match self.inner.read() {
            Ok(inner) => inner
                .replicas
                .values()
                .filter_map(|e| e.applier.clone())
                .collect(),
            Err(_) => Vec::new(),
        };
        for applier in appliers {
            applier.stop().await;
        }
    }

    fn write_inner(&self) -> ReplicationResult<std::sync::RwLockWriteGuard<'_, RegistryInner>> {
        self.inner
            .write()
            .map_err(|_| ReplicationError::logic("registry lock poisoned"))
    }
}
