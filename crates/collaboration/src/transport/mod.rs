/// Transports and discovery
///
/// Every transport yields the same [`Channel`]: a pair of message queues
/// pumped by background tasks. Sessions never know which path produced it.
/// - In-memory (tests, loopback)
/// - WebSocket, direct or through a relay
/// - LAN discovery by UDP beacon, connecting over WebSocket
pub mod lan;
pub mod memory;
pub mod websocket;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use lan::{Beacon, LanTransport};
pub use memory::{MemoryListener, MemoryNetwork, MemoryTransport};
pub use websocket::{WebSocketListener, WebSocketTransport};

use crate::{CollaborationError, Result, SyncMessage};

/// Connection strategy, in the order they are attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Memory,
    Lan,
    Direct,
    Relay,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Lan => write!(f, "lan"),
            Self::Direct => write!(f, "direct"),
            Self::Relay => write!(f, "relay"),
        }
    }
}

/// Where a peer can be reached
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub kind: TransportKind,
    pub endpoint: String,
}

impl PeerAddress {
    pub fn new(kind: TransportKind, endpoint: impl Into<String>) -> Self {
        Self {
            kind,
            endpoint: endpoint.into(),
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.endpoint)
    }
}

/// How long [`Channel::close`] waits for queued frames to go out
const CLOSE_FLUSH: Duration = Duration::from_millis(500);

/// An established, confidential connection to one peer.
/// Dropping it stops its pump tasks.
pub struct Channel {
    remote: PeerAddress,
    outgoing: mpsc::UnboundedSender<SyncMessage>,
    incoming: mpsc::UnboundedReceiver<SyncMessage>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl Channel {
    pub fn new(
        remote: PeerAddress,
        outgoing: mpsc::UnboundedSender<SyncMessage>,
        incoming: mpsc::UnboundedReceiver<SyncMessage>,
    ) -> Self {
        Self {
            remote,
            outgoing,
            incoming,
            writer: None,
            reader: None,
        }
    }

    /// Attach the tasks moving frames between the queues and a socket
    pub(crate) fn with_pumps(mut self, writer: JoinHandle<()>, reader: JoinHandle<()>) -> Self {
        self.writer = Some(writer);
        self.reader = Some(reader);
        self
    }

    pub fn remote(&self) -> &PeerAddress {
        &self.remote
    }

    pub fn send(&self, message: SyncMessage) -> Result<()> {
        self.outgoing
            .send(message)
            .map_err(|_| CollaborationError::NetworkError(format!("channel to {} closed", self.remote)))
    }

    /// Next message, or `None` once the peer is gone
    pub async fn recv(&mut self) -> Option<SyncMessage> {
        self.incoming.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.outgoing.is_closed()
    }

    /// Close after the frames already sent have been written
    pub async fn close(mut self) {
        let (closed, _) = mpsc::unbounded_channel();
        drop(std::mem::replace(&mut self.outgoing, closed));
        if let Some(writer) = self.writer.take() {
            let _ = tokio::time::timeout(CLOSE_FLUSH, writer).await;
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        for task in [&self.writer, &self.reader].into_iter().flatten() {
            task.abort();
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("remote", &self.remote).finish()
    }
}

/// Two connected in-memory channel ends
pub fn pipe(a: PeerAddress, b: PeerAddress) -> (Channel, Channel) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (Channel::new(b, a_tx, a_rx), Channel::new(a, b_tx, b_rx))
}

/// Discovery plus connection for one strategy
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Peers this transport can currently see; may never end
    fn discover_peers(&self) -> BoxStream<'static, PeerAddress>;

    async fn connect(&self, address: &PeerAddress) -> Result<Channel>;
}
