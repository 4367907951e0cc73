/// In-process transport
/// Peers register under a name on a shared [`MemoryNetwork`]; connecting to
/// a name hands the listener the other end of a [`pipe`](super::pipe).
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{pipe, Channel, PeerAddress, Transport, TransportKind};
use crate::{CollaborationError, Result};

#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Channel>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept connections addressed to `name`; replaces an earlier listener
    pub fn listen(&self, name: impl Into<String>) -> MemoryListener {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().insert(name.clone(), tx);
        MemoryListener { name, incoming: rx }
    }

    /// A transport dialing out as `name`
    pub fn transport(&self, name: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            name: name.into(),
        }
    }

    /// Stop accepting connections for `name`
    pub fn unlisten(&self, name: &str) {
        self.listeners.lock().remove(name);
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.listeners.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

pub struct MemoryListener {
    name: String,
    incoming: mpsc::UnboundedReceiver<Channel>,
}

impl MemoryListener {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn accept(&mut self) -> Option<Channel> {
        self.incoming.recv().await
    }
}

#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    name: String,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    fn discover_peers(&self) -> BoxStream<'static, PeerAddress> {
        let own = self.name.clone();
        let peers: Vec<PeerAddress> = self
            .network
            .names()
            .into_iter()
            .filter(|name| *name != own)
            .map(|name| PeerAddress::new(TransportKind::Memory, name))
            .collect();
        stream::iter(peers).boxed()
    }

    async fn connect(&self, address: &PeerAddress) -> Result<Channel> {
        let listener = self
            .network
            .listeners
            .lock()
            .get(&address.endpoint)
            .cloned()
            .ok_or_else(|| {
                CollaborationError::NetworkError(format!("no peer listening at {}", address))
            })?;

        let (ours, theirs) = pipe(
            PeerAddress::new(TransportKind::Memory, self.name.clone()),
            address.clone(),
        );
        listener.send(theirs).map_err(|_| {
            CollaborationError::NetworkError(format!("peer at {} stopped listening", address))
        })?;
        // `ours` talks to `address`; `theirs` reports us as its remote
        Ok(ours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncMessage;

    #[tokio::test]
    async fn test_connect_reaches_listener() {
        let network = MemoryNetwork::new();
        let mut listener = network.listen("bob");
        let ada = network.transport("ada");

        let discovered: Vec<PeerAddress> = ada.discover_peers().collect().await;
        assert_eq!(discovered, vec![PeerAddress::new(TransportKind::Memory, "bob")]);

        let mut outbound = ada.connect(&discovered[0]).await.unwrap();
        let mut inbound = listener.accept().await.unwrap();
        assert_eq!(inbound.remote().endpoint, "ada");
        assert_eq!(outbound.remote().endpoint, "bob");

        outbound.send(SyncMessage::Ping).unwrap();
        assert_eq!(inbound.recv().await, Some(SyncMessage::Ping));
        inbound.send(SyncMessage::Pong).unwrap();
        assert_eq!(outbound.recv().await, Some(SyncMessage::Pong));
    }

    #[tokio::test]
    async fn test_connect_to_unknown_peer_fails() {
        let network = MemoryNetwork::new();
        let ada = network.transport("ada");

        let result = ada
            .connect(&PeerAddress::new(TransportKind::Memory, "nobody"))
            .await;
        assert!(matches!(result, Err(CollaborationError::NetworkError(_))));
    }
}
