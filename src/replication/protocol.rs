//! Replication Protocol Session
//!
//! The message vocabulary between an applier and its master, and the
//! session seam the applier drives. The applier itself never touches the
//! socket: it talks to a `MasterSession`, so tests can script a master
//! without any networking.
//!
//! Handshake shape: the master greets with its instance UUID, the client
//! optionally authenticates, then requests either JOIN (full bootstrap
//! stream, terminated by `JoinDone`) or SUBSCRIBE (endless follow stream)
//! over the same connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::vclock::{Lsn, ReplicaId, VectorClock};

use super::connection::MasterConnection;
use super::errors::{ReplicationError, ReplicationResult};
use super::source::ReplicaSource;

/// One replicated transaction as seen by the applier: the byte layout of
/// the payload is the storage layer's business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationRow {
    /// Id of the replica that originated the transaction
    pub replica_id: ReplicaId,
    /// LSN the transaction reached on its origin
    pub lsn: Lsn,
    /// Commit timestamp on the origin; drives lag measurement
    pub origin_ts: DateTime<Utc>,
    /// Opaque transaction body
    pub payload: serde_json::Value,
}

/// First message on every connection, master to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Greeting {
    /// The master's instance UUID; equality with our own UUID means
    /// self-replication
    pub instance_uuid: Uuid,
    /// Master server version string
    pub version: String,
}

/// Client-to-master messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Present credentials
    Auth {
        username: String,
        #[serde(default)]
        password: Option<String>,
    },

    /// Request the full bootstrap stream
    Join,

    /// Request the incremental stream from a vclock position
    Subscribe { vclock: VectorClock },

    /// Keepalive
    Heartbeat,
}

/// Master-to-client messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MasterMessage {
    /// Connection banner
    Greeting(Greeting),

    /// Previous request accepted
    Ok,

    /// Previous request rejected
    Error { code: String, message: String },

    /// One replicated transaction
    Row(ReplicationRow),

    /// Bootstrap stream complete
    JoinDone,

    /// Keepalive
    Heartbeat,
}

/// Error code carried by `MasterMessage::Error` for credential rejection.
pub const ERROR_CODE_AUTH: &str = "auth";

/// One live protocol session with a master.
///
/// `next_row` returns `Ok(None)` exactly once, at the end of a JOIN stream;
/// in SUBSCRIBE the stream has no legitimate end, so a peer close surfaces
/// as a `Connection` error.
#[async_trait]
pub trait MasterSession: Send {
    /// The greeting received when the session was established.
    fn greeting(&self) -> &Greeting;

    /// Whether the peer is reached over loopback.
    fn is_localhost(&self) -> bool;

    /// Present credentials; `Auth` error on rejection.
    async fn authenticate(&mut self, username: &str, password: Option<&str>)
        -> ReplicationResult<()>;

    /// Ask the master for the full bootstrap stream.
    async fn request_join(&mut self) -> ReplicationResult<()>;

    /// Ask the master for the incremental stream past `vclock`.
    async fn request_subscribe(&mut self, vclock: &VectorClock) -> ReplicationResult<()>;

    /// Receive the next replicated row of the current stream.
    async fn next_row(&mut self) -> ReplicationResult<Option<ReplicationRow>>;

    /// Send a keepalive.
    async fn send_heartbeat(&mut self) -> ReplicationResult<()>;

    /// Close the underlying connection. Idempotent.
    async fn close(&mut self);
}

/// Establishes sessions. Injected into the applier so orchestration decides
/// the concrete transport and tests can substitute a scripted master.
#[async_trait]
pub trait MasterConnector: Send + Sync {
    async fn connect(&self, source: &ReplicaSource) -> ReplicationResult<Box<dyn MasterSession>>;
}

/// The production session: newline-delimited JSON over one TCP connection.
pub struct TcpMasterSession {
    conn: MasterConnection,
    greeting: Greeting,
    joining: bool,
}

impl TcpMasterSession {
    /// Complete the greeting exchange on a freshly connected endpoint.
    pub async fn establish(mut conn: MasterConnection) -> ReplicationResult<Self> {
        let message = conn.read_message::<MasterMessage>().await?;
        match message {
            Some(MasterMessage::Greeting(greeting)) => Ok(Self {
                conn,
                greeting,
                joining: false,
            }),
            Some(other) => Err(ReplicationError::protocol(format!(
                "expected greeting, got {:?}",
                other
            ))),
            None => Err(ReplicationError::connection(
                "master closed connection before greeting",
            )),
        }
    }

    /// Read one response, mapping `Error` messages into the taxonomy.
    async fn expect_ok(&mut self) -> ReplicationResult<()> {
        match self.conn.read_message::<MasterMessage>().await? {
            Some(MasterMessage::Ok) => Ok(()),
            Some(MasterMessage::Error { code, message }) => Err(map_master_error(&code, message)),
            Some(other) => Err(ReplicationError::protocol(format!(
                "expected ok, got {:?}",
                other
            ))),
            None => Err(ReplicationError::connection(
                "master closed connection during handshake",
            )),
        }
    }
}

fn map_master_error(code: &str, message: String) -> ReplicationError {
    if code == ERROR_CODE_AUTH {
        ReplicationError::Auth(message)
    } else {
        ReplicationError::Protocol(format!("{}: {}", code, message))
    }
}

#[async_trait]
impl MasterSession for TcpMasterSession {
    fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    fn is_localhost(&self) -> bool {
        self.conn.is_localhost()
    }

    async fn authenticate(
        &mut self,
        username: &str,
        password: Option<&str>,
    ) -> ReplicationResult<()> {
        self.conn
            .write_message(&ClientMessage::Auth {
                username: username.to_string(),
                password: password.map(str::to_string),
            })
            .await?;
        self.expect_ok().await
    }

    async fn request_join(&mut self) -> ReplicationResult<()> {
        self.conn.write_message(&ClientMessage::Join).await?;
        self.expect_ok().await?;
        self.joining = true;
        Ok(())
    }

    async fn request_subscribe(&mut self, vclock: &VectorClock) -> ReplicationResult<()> {
        self.conn
            .write_message(&ClientMessage::Subscribe {
                vclock: vclock.clone(),
            })
            .await?;
        self.expect_ok().await?;
        self.joining = false;
        Ok(())
    }

    async fn next_row(&mut self) -> ReplicationResult<Option<ReplicationRow>> {
        loop {
            match self.conn.read_message::<MasterMessage>().await? {
                Some(MasterMessage::Row(row)) => return Ok(Some(row)),
                // Master keepalives interleave with rows; skip them
                Some(MasterMessage::Heartbeat) => continue,
                Some(MasterMessage::JoinDone) if self.joining => {
                    self.joining = false;
                    return Ok(None);
                }
                Some(MasterMessage::Error { code, message }) => {
                    return Err(map_master_error(&code, message));
                }
                Some(other) => {
                    return Err(ReplicationError::protocol(format!(
                        "unexpected message in row stream: {:?}",
                        other
                    )));
                }
                None => {
                    return Err(ReplicationError::connection("master closed connection"));
                }
            }
        }
    }

    async fn send_heartbeat(&mut self) -> ReplicationResult<()> {
        self.conn.write_message(&ClientMessage::Heartbeat).await
    }

    async fn close(&mut self) {
        self.conn.close().await;
    }
}

/// Production connector: TCP with a connect timeout.
#[derive(Debug, Clone)]
pub struct TcpMasterConnector {
    connect_timeout: std::time::Duration,
}

impl TcpMasterConnector {
    pub fn new(connect_timeout: std::time::Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl MasterConnector for TcpMasterConnector {
    async fn connect(&self, source: &ReplicaSource) -> ReplicationResult<Box<dyn MasterSession>> {
        let conn = MasterConnection::connect(source, self.connect_timeout).await?;
        let session = TcpMasterSession::establish(conn).await?;
        Ok(Box::new(session))
    }
}
