//! Applier State Machine
//!
//! The client side of one outbound replication connection:
//! - one reader task owns the connection and drives every transition
//!   except explicit stop
//! - the vector clock and observable state are mutated only by that reader,
//!   with no await point inside a mutation
//! - errors are captured on the applier and rethrown through `wait()`;
//!   retrying after DISCONNECTED is the orchestration layer's decision

use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::observability::Logger;
use crate::vclock::{ReplicaId, VectorClock};

use super::errors::{ReplicationError, ReplicationResult};
use super::protocol::{MasterConnector, MasterSession, ReplicationRow};
use super::source::ReplicaSource;
use super::status::ApplierStatus;

/// Storage-engine boundary: applies replicated rows and owns the durable
/// local vector clock that decides bootstrap vs follow.
pub trait ReplicaStore: Send + Sync {
    /// Current durable vector clock of this instance.
    fn local_vclock(&self) -> VectorClock;

    /// Apply one replicated transaction.
    fn apply_row(&self, row: &ReplicationRow) -> ReplicationResult<()>;
}

/// Lifecycle states of an applier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplierState {
    /// Never started
    Off,
    /// Establishing the socket
    Connect,
    /// Presenting credentials
    Auth,
    /// Handshake complete, stream not yet chosen
    Connected,
    /// Receiving the full-data join stream
    Bootstrap,
    /// Steady-state incremental streaming
    Follow,
    /// Explicitly stopped; no automatic exit
    Stopped,
    /// Reader exited on an error; retry is an orchestration decision
    Disconnected,
}

impl ApplierState {
    /// Lowercase name for the reporting layer.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Connect => "connect",
            Self::Auth => "auth",
            Self::Connected => "connected",
            Self::Bootstrap => "bootstrap",
            Self::Follow => "follow",
            Self::Stopped => "stopped",
            Self::Disconnected => "disconnected",
        }
    }

    /// Whether a transition to `next` is legal.
    ///
    /// Explicit stop may land `Stopped` from any non-terminal state because
    /// cancellation is observed at whatever suspension point comes next.
    pub fn can_transition(self, next: ApplierState) -> bool {
        use ApplierState::*;
        match (self, next) {
            (Off, Connect) => true,
            (Connect, Auth) => true,
            (Auth, Connected) => true,
            (Connected, Bootstrap) | (Connected, Follow) => true,
            (Bootstrap, Follow) => true,
            (Connect | Auth | Connected | Bootstrap | Follow, Disconnected) => true,
            // Retry after an error, driven from outside
            (Disconnected, Connect) => true,
            // Cooperative stop
            (state, Stopped) => state != Stopped,
            _ => false,
        }
    }

    /// Validated transition; an illegal one is an upstream bug.
    pub fn transition(self, next: ApplierState) -> ReplicationResult<ApplierState> {
        if self.can_transition(next) {
            Ok(next)
        } else {
            Err(ReplicationError::logic(format!(
                "illegal applier transition {} -> {}",
                self.as_str(),
                next.as_str()
            )))
        }
    }
}

/// Observable fields, mutated only by the reader task. Readers take
/// point-in-time snapshots; no lock is ever held across an await.
#[derive(Debug)]
struct ApplierShared {
    state: ApplierState,
    vclock: VectorClock,
    lag: Option<f64>,
    last_row_time: Option<DateTime<Utc>>,
    connected: bool,
    localhost: bool,
    replica_id: Option<ReplicaId>,
    master_uuid: Option<Uuid>,
    last_error: Option<ReplicationError>,
}

impl ApplierShared {
    fn new() -> Self {
        Self {
            state: ApplierState::Off,
            vclock: VectorClock::new(),
            lag: None,
            last_row_time: None,
            connected: false,
            localhost: false,
            replica_id: None,
            master_uuid: None,
            last_error: None,
        }
    }
}

enum FollowEvent {
    Row(Option<ReplicationRow>),
    Shutdown,
}

/// One replication client, bound to one master source.
pub struct Applier {
    source: ReplicaSource,
    instance_uuid: Uuid,
    heartbeat_interval: Duration,
    shared: RwLock<ApplierShared>,
    shutdown: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<ReplicationResult<()>>>>,
}

impl Applier {
    /// Construct an applier for `source`.
    ///
    /// Fails immediately on invalid input or exceeded bounds; a partially
    /// constructed applier is never returned.
    pub fn new(
        source: &str,
        instance_uuid: Uuid,
        heartbeat_interval: Duration,
    ) -> ReplicationResult<Self> {
        let source = ReplicaSource::parse(source)?;
        if heartbeat_interval.is_zero() {
            return Err(ReplicationError::config(
                "heartbeat interval must be non-zero",
            ));
        }
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            source,
            instance_uuid,
            heartbeat_interval,
            shared: RwLock::new(ApplierShared::new()),
            shutdown,
            reader: Mutex::new(None),
        })
    }

    /// The configured source, always in redacted display form.
    pub fn source(&self) -> &ReplicaSource {
        &self.source
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ApplierState {
        self.shared
            .read()
            .map(|s| s.state)
            .unwrap_or(ApplierState::Disconnected)
    }

    /// Snapshot of this applier's vector clock.
    pub fn vclock_snapshot(&self) -> VectorClock {
        self.shared
            .read()
            .map(|s| s.vclock.clone())
            .unwrap_or_default()
    }

    /// Origin-to-application delay of the last applied row, in seconds.
    pub fn lag(&self) -> Option<f64> {
        self.shared.read().ok().and_then(|s| s.lag)
    }

    /// Seconds since the last applied row.
    pub fn idle(&self) -> Option<f64> {
        let last = self.shared.read().ok().and_then(|s| s.last_row_time)?;
        Some(duration_seconds(Utc::now(), last))
    }

    /// Whether the connection to the master is currently established.
    pub fn is_connected(&self) -> bool {
        self.shared.read().map(|s| s.connected).unwrap_or(false)
    }

    /// Whether the master is reached over loopback.
    pub fn is_localhost(&self) -> bool {
        self.shared.read().map(|s| s.localhost).unwrap_or(false)
    }

    /// The master's instance UUID, known after the handshake.
    pub fn master_uuid(&self) -> Option<Uuid> {
        self.shared.read().ok().and_then(|s| s.master_uuid)
    }

    /// Replica id of the master, once the cluster has assigned one.
    pub fn replica_id(&self) -> Option<ReplicaId> {
        self.shared.read().ok().and_then(|s| s.replica_id)
    }

    /// Record the master's replica id. Called by the registry on discovery.
    pub fn set_replica_id(&self, id: ReplicaId) {
        if let Ok(mut shared) = self.shared.write() {
            shared.replica_id = Some(id);
        }
    }

    /// The last error captured by the reader, if any.
    pub fn last_error(&self) -> Option<ReplicationError> {
        self.shared.read().ok().and_then(|s| s.last_error.clone())
    }

    /// Read-only projection for the reporting layer.
    ///
    /// All fields come from one lock acquisition, so the snapshot cannot
    /// mix values from before and after a concurrently applied row.
    pub fn status(&self) -> ApplierStatus {
        let (state, vclock, lag, idle, message) = self
            .shared
            .read()
            .map(|s| {
                (
                    s.state,
                    s.vclock.clone(),
                    s.lag,
                    s.last_row_time.map(|t| duration_seconds(Utc::now(), t)),
                    s.last_error.as_ref().map(|e| e.to_string()),
                )
            })
            .unwrap_or((
                ApplierState::Disconnected,
                VectorClock::new(),
                None,
                None,
                None,
            ));

        ApplierStatus {
            status: state.as_str().to_string(),
            lag,
            idle,
            message,
            vclock,
        }
    }

    /// Spawn the reader task and begin the lifecycle.
    ///
    /// Legal from OFF and, for orchestration-driven retry, DISCONNECTED.
    pub fn start(
        self: &Arc<Self>,
        connector: Arc<dyn MasterConnector>,
        store: Arc<dyn ReplicaStore>,
    ) -> ReplicationResult<()> {
        {
            let mut reader = self.lock_reader()?;
            if reader.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
                return Err(ReplicationError::logic("applier reader already running"));
            }

            {
                let mut shared = self.write_shared()?;
                shared.state = shared.state.transition(ApplierState::Connect)?;
                shared.last_error = None;
            }

            self.shutdown.send_replace(false);
            // Subscribe before spawning: a stop() issued right after start()
            // must be visible to a reader that has not been polled yet
            let shutdown = self.shutdown.subscribe();
            let this = Arc::clone(self);
            *reader = Some(tokio::spawn(async move {
                this.run_reader(connector, store, shutdown).await
            }));
        }

        let src = self.source.to_string();
        Logger::info("REPLICATION_START", &[("source", src.as_str())]);
        Ok(())
    }

    /// Request a cooperative stop and join the reader.
    ///
    /// Safe from any state and idempotent; the connection is closed by the
    /// reader on its way out.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);

        let handle = self.lock_reader().ok().and_then(|mut r| r.take());
        if let Some(handle) = handle {
            // The reader's result was already captured on the applier
            let _ = handle.await;
        }

        if let Ok(mut shared) = self.shared.write() {
            if shared.state != ApplierState::Stopped {
                shared.state = ApplierState::Stopped;
                shared.connected = false;
            }
        }

        let src = self.source.to_string();
        Logger::info("REPLICATION_STOPPED", &[("source", src.as_str())]);
    }

    /// Block until the reader exits and rethrow its captured error.
    ///
    /// Returns `Ok(())` if the reader stopped cleanly or was already joined.
    pub async fn wait(&self) -> ReplicationResult<()> {
        let handle = self.lock_reader()?.take();
        match handle {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(ReplicationError::logic(format!(
                    "replication reader panicked: {}",
                    e
                ))),
            },
            None => Ok(()),
        }
    }

    async fn run_reader(
        self: Arc<Self>,
        connector: Arc<dyn MasterConnector>,
        store: Arc<dyn ReplicaStore>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ReplicationResult<()> {
        let result = self
            .replicate(connector.as_ref(), store.as_ref(), &mut shutdown)
            .await;

        let src = self.source.to_string();
        match &result {
            Ok(()) => {
                self.finish(ApplierState::Stopped, None);
            }
            Err(e) => {
                // Stop may race with an in-flight error; the explicit stop
                // wins so the operator sees what they asked for.
                let stopping = *shutdown.borrow();
                let terminal = if stopping {
                    ApplierState::Stopped
                } else {
                    ApplierState::Disconnected
                };
                self.finish(terminal, Some(e.clone()));
                Logger::error(
                    "REPLICATION_DISCONNECTED",
                    &[("source", src.as_str()), ("error", &e.to_string())],
                );
            }
        }
        result
    }

    async fn replicate(
        &self,
        connector: &dyn MasterConnector,
        store: &dyn ReplicaStore,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ReplicationResult<()> {
        let mut session = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            result = connector.connect(&self.source) => result?,
        };

        let result = self
            .replicate_on_session(session.as_mut(), store, shutdown)
            .await;
        session.close().await;
        result
    }

    async fn replicate_on_session(
        &self,
        session: &mut dyn MasterSession,
        store: &dyn ReplicaStore,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ReplicationResult<()> {
        let greeting = session.greeting().clone();
        if greeting.instance_uuid == self.instance_uuid {
            return Err(ReplicationError::config(
                "replication source points back at this instance",
            ));
        }

        {
            let mut shared = self.write_shared()?;
            shared.connected = true;
            shared.localhost = session.is_localhost();
            shared.master_uuid = Some(greeting.instance_uuid);
        }
        let src = self.source.to_string();
        Logger::info(
            "REPLICATION_CONNECTED",
            &[
                ("source", src.as_str()),
                ("master_uuid", &greeting.instance_uuid.to_string()),
            ],
        );

        self.enter_state(ApplierState::Auth)?;
        if let Some(username) = self.source.username() {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                result = session.authenticate(username, self.source.password()) => result?,
            }
        }
        self.enter_state(ApplierState::Connected)?;

        // A replica with no durable history bootstraps; everything else
        // resumes incrementally from its local clock.
        if store.local_vclock().is_empty() {
            self.enter_state(ApplierState::Bootstrap)?;
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                result = session.request_join() => result?,
            }
            loop {
                let row = tokio::select! {
                    _ = shutdown.changed() => return Ok(()),
                    row = session.next_row() => row?,
                };
                match row {
                    Some(row) => self.apply_row(store, &row)?,
                    None => break,
                }
            }
            Logger::info(
                "REPLICATION_BOOTSTRAP_DONE",
                &[
                    ("source", src.as_str()),
                    ("signature", &self.vclock_snapshot().sum().to_string()),
                ],
            );
        }

        self.enter_state(ApplierState::Follow)?;
        let local = store.local_vclock();
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            result = session.request_subscribe(&local) => result?,
        }

        loop {
            // Heartbeats interleave into the reader: one is sent whenever
            // the stream has been idle for a full interval.
            let event = tokio::time::timeout(self.heartbeat_interval, async {
                tokio::select! {
                    _ = shutdown.changed() => Ok(FollowEvent::Shutdown),
                    row = session.next_row() => row.map(FollowEvent::Row),
                }
            })
            .await;

            match event {
                Err(_idle) => session.send_heartbeat().await?,
                Ok(Ok(FollowEvent::Shutdown)) => return Ok(()),
                Ok(Ok(FollowEvent::Row(Some(row)))) => self.apply_row(store, &row)?,
                Ok(Ok(FollowEvent::Row(None))) => {
                    return Err(ReplicationError::protocol(
                        "join terminator received outside bootstrap",
                    ));
                }
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    /// Apply one row: storage first, then vclock, last-row time, and lag,
    /// in that order, under one short lock with no suspension point.
    fn apply_row(&self, store: &dyn ReplicaStore, row: &ReplicationRow) -> ReplicationResult<()> {
        store.apply_row(row)?;

        let now = Utc::now();
        let mut shared = self.write_shared()?;
        shared.vclock.follow(row.replica_id, row.lsn)?;
        shared.last_row_time = Some(now);
        shared.lag = Some(duration_seconds(now, row.origin_ts));
        Ok(())
    }

    fn enter_state(&self, next: ApplierState) -> ReplicationResult<()> {
        let mut shared = self.write_shared()?;
        shared.state = shared.state.transition(next)?;
        Ok(())
    }

    /// Terminal states are set directly: the transition table admits them
    /// from every phase the reader can be in.
    fn finish(&self, terminal: ApplierState, error: Option<ReplicationError>) {
        if let Ok(mut shared) = self.shared.write() {
            shared.state = terminal;
            shared.connected = false;
            if let Some(error) = error {
                shared.last_error = Some(error);
            }
        }
    }

    fn write_shared(&self) -> ReplicationResult<RwLockWriteGuard<'_, ApplierShared>> {
        self.shared
            .write()
            .map_err(|_| ReplicationError::logic("applier state lock poisoned"))
    }

    fn lock_reader(
        &self,
    ) -> ReplicationResult<std::sync::MutexGuard<'_, Option<JoinHandle<ReplicationResult<()>>>>>
    {
        self.reader
            .lock()
            .map_err(|_| ReplicationError::logic("applier reader lock poisoned"))
    }
}

impl std::fmt::Debug for Applier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Applier")
            .field("source", &self.source.to_string())
            .field("state", &self.state())
            .finish()
    }
}

/// Signed difference `now - earlier` in seconds, floored at zero: clock
/// skew between instances must never produce negative lag or idle.
fn duration_seconds(now: DateTime<Utc>, earlier: DateTime<Utc>) -> f64 {
    let millis = (now - earlier).num_milliseconds();
    (millis as f64 / 1000.0).max(0.0)
}
