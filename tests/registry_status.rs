//! Registry and Status Aggregation Tests
//!
//! Classification of registry entries, vclock merging for bidirectional
//! peers, and the JSON projection handed to the reporting layer.

mod common;

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use emberdb::replication::{
    Applier, ApplierState, ClusterRegistry, Relay, ReplicaStore, SyncDirection,
};

use common::{row, wait_until, MasterScript, MemoryStore};

const HEARTBEAT: Duration = Duration::from_millis(50);
const DEADLINE: Duration = Duration::from_secs(2);

/// Run an applier against a scripted master until its clock reaches the
/// follow rows, and leave it streaming.
async fn running_applier(follow_rows: Vec<(u32, u64)>, seed: &[(u32, u64)]) -> Arc<Applier> {
    let mut script = MasterScript::new();
    script.follow_rows = follow_rows.iter().map(|&(id, lsn)| row(id, lsn)).collect();
    let (connector, _) = script.into_connector();

    let store = MemoryStore::seeded(seed);
    let applier =
        Arc::new(Applier::new("master:3301", Uuid::new_v4(), HEARTBEAT).unwrap());
    applier
        .start(connector, store as Arc<dyn ReplicaStore>)
        .unwrap();

    let expected = follow_rows.last().copied();
    assert!(
        wait_until(DEADLINE, || {
            match expected {
                Some((id, lsn)) => applier.vclock_snapshot().get(id) == Some(lsn),
                None => applier.state() == ApplierState::Follow,
            }
        })
        .await
    );
    applier
}

// =============================================================================
// Classification
// =============================================================================

/// An entry with only an inbound applier classifies as "follow".
#[tokio::test]
async fn test_applier_only_is_follow() {
    let registry = ClusterRegistry::new();
    let uuid = Uuid::new_v4();
    let applier = running_applier(vec![(1, 10)], &[(1, 2)]).await;

    registry.assign_id(uuid, 1).unwrap();
    registry.set_applier(uuid, Arc::clone(&applier)).unwrap();

    let statuses = registry.enumerate();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].status, SyncDirection::Follow);
    assert_eq!(statuses[0].vclock.get(1), Some(10));

    let detail = statuses[0].applier.as_ref().unwrap();
    assert_eq!(detail.status, "follow");
    assert!(detail.lag.unwrap() >= 0.0);

    registry.stop_all().await;
}

/// Both sides present: "bidirectional", with the reported clock being the
/// per-id max across the applier's and the relay's clocks.
#[tokio::test]
async fn test_bidirectional_merges_clocks() {
    let registry = ClusterRegistry::new();
    let uuid = Uuid::new_v4();

    // Applier has seen {1:10}; relay has confirmed {1:7, 2:3}
    let applier = running_applier(vec![(1, 10)], &[(1, 2)]).await;
    let relay = Arc::new(Relay::new());
    relay.confirm(1, 7).unwrap();
    relay.confirm(2, 3).unwrap();

    registry.assign_id(uuid, 1).unwrap();
    registry.set_applier(uuid, Arc::clone(&applier)).unwrap();
    registry.set_relay(uuid, relay).unwrap();

    let statuses = registry.enumerate();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].status, SyncDirection::Bidirectional);
    assert_eq!(statuses[0].vclock.get(1), Some(10));
    assert_eq!(statuses[0].vclock.get(2), Some(3));

    registry.stop_all().await;
}

/// Assigning an id through the registry reaches the attached applier.
#[tokio::test]
async fn test_assigned_id_propagates_to_applier() {
    let registry = ClusterRegistry::new();
    let uuid = Uuid::new_v4();
    let applier = running_applier(vec![(1, 10)], &[(1, 2)]).await;

    registry.set_applier(uuid, Arc::clone(&applier)).unwrap();
    assert_eq!(applier.replica_id(), None);

    registry.assign_id(uuid, 4).unwrap();
    assert_eq!(applier.replica_id(), Some(4));

    registry.stop_all().await;
}

// =============================================================================
// Projection
// =============================================================================

/// The serialized entry matches the documented reporting shape.
#[tokio::test]
async fn test_status_json_shape() {
    let registry = ClusterRegistry::new();
    let uuid = Uuid::new_v4();
    let applier = running_applier(vec![(1, 10)], &[(1, 2)]).await;

    registry.assign_id(uuid, 1).unwrap();
    registry.set_applier(uuid, Arc::clone(&applier)).unwrap();

    let statuses = registry.enumerate();
    let json = serde_json::to_value(&statuses[0]).unwrap();

    assert_eq!(json["uuid"], uuid.to_string());
    assert_eq!(json["status"], "follow");
    assert_eq!(json["vclock"]["1"], 10);
    assert_eq!(json["applier"]["status"], "follow");
    assert_eq!(json["applier"]["vclock"]["1"], 10);
    assert!(json["applier"]["lag"].is_number());
    // No captured error, so no message field at all
    assert!(json["applier"].get("message").is_none());

    registry.stop_all().await;
}

/// An errored applier still yields a complete, never-failing projection.
#[tokio::test]
async fn test_projection_survives_errored_applier() {
    let registry = ClusterRegistry::new();
    let uuid = Uuid::new_v4();

    let connector =
        common::ScriptedConnector::failing(emberdb::replication::ReplicationError::connection(
            "connect timed out",
        ));
    let applier =
        Arc::new(Applier::new("master:3301", Uuid::new_v4(), HEARTBEAT).unwrap());
    applier.start(connector, MemoryStore::new()).unwrap();
    let _ = applier.wait().await;

    registry.assign_id(uuid, 1).unwrap();
    registry.set_applier(uuid, applier).unwrap();

    let statuses = registry.enumerate();
    assert_eq!(statuses[0].status, SyncDirection::Follow);
    let detail = statuses[0].applier.as_ref().unwrap();
    assert_eq!(detail.status, "disconnected");
    assert!(detail.message.as_ref().unwrap().contains("connect timed out"));
}

// =============================================================================
// Teardown
// =============================================================================

/// stop_all stops every attached applier.
#[tokio::test]
async fn test_stop_all_stops_appliers() {
    let registry = ClusterRegistry::new();

    let first = running_applier(vec![(1, 10)], &[(1, 2)]).await;
    let second = running_applier(vec![(2, 4)], &[(2, 1)]).await;

    let uuid_a = Uuid::new_v4();
    let uuid_b = Uuid::new_v4();
    registry.assign_id(uuid_a, 1).unwrap();
    registry.assign_id(uuid_b, 2).unwrap();
    registry.set_applier(uuid_a, Arc::clone(&first)).unwrap();
    registry.set_applier(uuid_b, Arc::clone(&second)).unwrap();

    registry.stop_all().await;
    assert_eq!(first.state(), ApplierState::Stopped);
    assert_eq!(second.state(), ApplierState::Stopped);
}
