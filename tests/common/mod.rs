//! Shared test doubles: a scripted master session, a scripted connector,
//! and an in-memory replica store.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use emberdb::replication::{
    Greeting, MasterConnector, MasterSession, ReplicaSource, ReplicaStore, ReplicationError,
    ReplicationResult, ReplicationRow,
};
use emberdb::vclock::{Lsn, ReplicaId, VectorClock};

/// A replicated row with an origin timestamp of "now".
pub fn row(replica_id: ReplicaId, lsn: Lsn) -> ReplicationRow {
    ReplicationRow {
        replica_id,
        lsn,
        origin_ts: Utc::now(),
        payload: json!({"op": "insert", "lsn": lsn}),
    }
}

/// What a scripted follow stream does once its rows run out.
pub enum FollowEnd {
    /// Keep the stream open until the applier is stopped
    Pend,
    /// Fail with this error
    Fail(ReplicationError),
}

/// Everything the master observed, for assertions.
#[derive(Default)]
pub struct MasterObserved {
    pub auth_attempts: usize,
    pub join_requested: bool,
    pub subscribe_vclock: Option<VectorClock>,
    pub heartbeats: usize,
    pub closed: bool,
}

/// Script for one master connection.
pub struct MasterScript {
    pub uuid: Uuid,
    pub auth_error: Option<ReplicationError>,
    pub join_rows: Vec<ReplicationRow>,
    pub follow_rows: Vec<ReplicationRow>,
    pub follow_end: FollowEnd,
}

impl MasterScript {
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            auth_error: None,
            join_rows: Vec::new(),
            follow_rows: Vec::new(),
            follow_end: FollowEnd::Pend,
        }
    }

    /// Build a connector serving exactly one session from this script.
    pub fn into_connector(self) -> (Arc<ScriptedConnector>, Arc<Mutex<MasterObserved>>) {
        let observed = Arc::new(Mutex::new(MasterObserved::default()));
        let session = ScriptedSession {
            greeting: Greeting {
                instance_uuid: self.uuid,
                version: "0.1.0-test".to_string(),
            },
            auth_error: self.auth_error,
            join_rows: self.join_rows.into(),
            follow_rows: self.follow_rows.into(),
            follow_end: self.follow_end,
            joining: false,
            observed: Arc::clone(&observed),
        };
        let connector = Arc::new(ScriptedConnector {
            script: ConnectScript::Session(Mutex::new(Some(session))),
        });
        (connector, observed)
    }
}

pub struct ScriptedSession {
    greeting: Greeting,
    auth_error: Option<ReplicationError>,
    join_rows: VecDeque<ReplicationRow>,
    follow_rows: VecDeque<ReplicationRow>,
    follow_end: FollowEnd,
    joining: bool,
    observed: Arc<Mutex<MasterObserved>>,
}

#[async_trait]
impl MasterSession for ScriptedSession {
    fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    fn is_localhost(&self) -> bool {
        true
    }

    async fn authenticate(
        &mut self,
        _username: &str,
        _password: Option<&str>,
    ) -> ReplicationResult<()> {
        self.observed.lock().unwrap().auth_attempts += 1;
        match &self.auth_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn request_join(&mut self) -> ReplicationResult<()> {
        self.observed.lock().unwrap().join_requested = true;
        self.joining = true;
        Ok(())
    }

    async fn request_subscribe(&mut self, vclock: &VectorClock) -> ReplicationResult<()> {
        self.observed.lock().unwrap().subscribe_vclock = Some(vclock.clone());
        self.joining = false;
        Ok(())
    }

    async fn next_row(&mut self) -> ReplicationResult<Option<ReplicationRow>> {
        if self.joining {
            match self.join_rows.pop_front() {
                Some(row) => return Ok(Some(row)),
                None => {
                    self.joining = false;
                    return Ok(None);
                }
            }
        }
        match self.follow_rows.pop_front() {
            Some(row) => Ok(Some(row)),
            None => match &self.follow_end {
                FollowEnd::Pend => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                FollowEnd::Fail(e) => Err(e.clone()),
            },
        }
    }

    async fn send_heartbeat(&mut self) -> ReplicationResult<()> {
        self.observed.lock().unwrap().heartbeats += 1;
        Ok(())
    }

    async fn close(&mut self) {
        self.observed.lock().unwrap().closed = true;
    }
}

enum ConnectScript {
    Fail(ReplicationError),
    Session(Mutex<Option<ScriptedSession>>),
}

pub struct ScriptedConnector {
    script: ConnectScript,
}

impl ScriptedConnector {
    /// A connector whose connect attempt always fails with `error`.
    pub fn failing(error: ReplicationError) -> Arc<Self> {
        Arc::new(Self {
            script: ConnectScript::Fail(error),
        })
    }
}

#[async_trait]
impl MasterConnector for ScriptedConnector {
    async fn connect(&self, _source: &ReplicaSource) -> ReplicationResult<Box<dyn MasterSession>> {
        match &self.script {
            ConnectScript::Fail(e) => Err(e.clone()),
            ConnectScript::Session(slot) => slot
                .lock()
                .unwrap()
                .take()
                .map(|s| Box::new(s) as Box<dyn MasterSession>)
                .ok_or_else(|| ReplicationError::connection("scripted session already consumed")),
        }
    }
}

/// In-memory replica store tracking applied rows and a durable clock.
#[derive(Default)]
pub struct MemoryStore {
    vclock: Mutex<VectorClock>,
    rows: Mutex<Vec<ReplicationRow>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A store that already holds history up to `entries`.
    pub fn seeded(entries: &[(ReplicaId, Lsn)]) -> Arc<Self> {
        let store = Self::default();
        *store.vclock.lock().unwrap() = entries.iter().copied().collect();
        Arc::new(store)
    }

    pub fn applied_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn applied_lsns(&self) -> Vec<(ReplicaId, Lsn)> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .map(|r| (r.replica_id, r.lsn))
            .collect()
    }
}

impl ReplicaStore for MemoryStore {
    fn local_vclock(&self) -> VectorClock {
        self.vclock.lock().unwrap().clone()
    }

    fn apply_row(&self, row: &ReplicationRow) -> ReplicationResult<()> {
        let mut vclock = self.vclock.lock().unwrap();
        vclock.follow(row.replica_id, row.lsn)?;
        self.rows.lock().unwrap().push(row.clone());
        Ok(())
    }
}

/// Poll `cond` until it holds or `deadline` passes.
pub async fn wait_until<F: Fn() -> bool>(deadline: Duration, cond: F) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
