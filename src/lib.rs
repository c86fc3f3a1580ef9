//! emberdb - a replicated, deterministic in-memory database
//!
//! Phase 6: Multi-Master Replication Intake
//!
//! This crate hosts the replication subsystem: the applier (client side of
//! one outbound master connection), the vector clock tracking replication
//! progress, and the cluster registry consumed by the reporting layer.

pub mod observability;
pub mod replication;
pub mod vclock;
