//! Master Connection Endpoint
//!
//! One buffered TCP connection to one master. The same endpoint survives the
//! whole applier lifecycle: handshake, auth, bootstrap transfer, and the
//! follow stream all reuse this socket so a replica never reconnects between
//! the initial join and steady-state streaming.

use std::net::SocketAddr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

use super::errors::{ReplicationError, ReplicationResult};
use super::source::ReplicaSource;

/// A buffered, message-oriented connection to a replication master.
///
/// Messages are newline-delimited JSON; the payload of replicated rows is
/// opaque to this layer. Partially received lines are kept on the
/// connection, so `read_message` may be raced against a timer and called
/// again without losing bytes.
#[derive(Debug)]
pub struct MasterConnection {
    stream: Option<BufStream<TcpStream>>,
    partial: Vec<u8>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl MasterConnection {
    /// Connect to `source` within `timeout`.
    ///
    /// Timeout, refusal, and reset all surface as `Connection` errors; the
    /// decision to retry belongs to the orchestration layer.
    pub async fn connect(source: &ReplicaSource, timeout: Duration) -> ReplicationResult<Self> {
        let connect = TcpStream::connect((source.host(), source.port()));
        let stream = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| {
                ReplicationError::connection(format!("connect to {} timed out", source))
            })?
            .map_err(|e| {
                ReplicationError::connection(format!("connect to {} failed: {}", source, e))
            })?;

        // Replication rows are small and latency-sensitive
        let _ = stream.set_nodelay(true);

        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;

        Ok(Self {
            stream: Some(BufStream::new(stream)),
            partial: Vec::new(),
            local_addr,
            peer_addr,
        })
    }

    /// Local address of the socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address of the master.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether the peer is reached over a loopback address.
    ///
    /// This is only a hint; same-process detection is completed at handshake
    /// level by comparing instance UUIDs.
    pub fn is_localhost(&self) -> bool {
        self.peer_addr.ip().is_loopback()
    }

    /// Whether the connection is still open.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Serialize and send one message, flushing the write buffer.
    pub async fn write_message<T: Serialize>(&mut self, message: &T) -> ReplicationResult<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let stream = self.stream_mut()?;
        stream.write_all(&line).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read one message. `Ok(None)` means the peer closed the connection.
    ///
    /// Cancellation-safe: dropping the returned future mid-line keeps the
    /// bytes received so far in `partial`, and the next call resumes where
    /// the cancelled one left off.
    pub async fn read_message<T: DeserializeOwned>(&mut self) -> ReplicationResult<Option<T>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ReplicationError::connection("connection is closed"))?;

        loop {
            if let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.partial.drain(..=pos).collect();
                let text = String::from_utf8(line)
                    .map_err(|_| ReplicationError::protocol("message is not valid utf-8"))?;
                let message = serde_json::from_str(text.trim_end())?;
                return Ok(Some(message));
            }

            // The only await; fill_buf consumes nothing, and the copy into
            // `partial` plus `consume` run without a suspension point
            let chunk = stream.fill_buf().await?;
            if chunk.is_empty() {
                if !self.partial.is_empty() {
                    return Err(ReplicationError::connection(
                        "master closed connection mid-message",
                    ));
                }
                return Ok(None);
            }
            let n = chunk.len();
            self.partial.extend_from_slice(chunk);
            stream.consume(n);
        }
    }

    /// Close the connection. Idempotent: closing twice is a no-op.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.partial.clear();
    }

    fn stream_mut(&mut self) -> ReplicationResult<&mut BufStream<TcpStream>> {
        self.stream
            .as_mut()
            .ok_or_else(|| ReplicationError::connection("connection is closed"))
    }
}
