/// WebSocket transport
/// Direct connections dial the peer's own listener; relay connections dial a
/// shared relay that pairs peers of the same project.
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use replica::{ActorId, ProjectId};

use super::{Channel, PeerAddress, Transport, TransportKind};
use crate::{CollaborationError, Result, SyncMessage};

fn network_error(e: impl std::fmt::Display) -> CollaborationError {
    CollaborationError::NetworkError(e.to_string())
}

/// Wrap an upgraded socket into a [`Channel`] with a writer and a reader task
pub(crate) fn ws_channel<S>(socket: WebSocketStream<S>, remote: PeerAddress) -> Channel
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SyncMessage>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<SyncMessage>();

    let peer = remote.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let text = match message.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!(%peer, "dropping unencodable {}: {}", message.kind(), e);
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(Message::Text(text)).await {
                debug!(%peer, "websocket write failed: {}", e);
                return;
            }
        }
        let _ = ws_tx.close().await;
    });

    let peer = remote.clone();
    let reader = tokio::spawn(async move {
        while let Some(frame) = ws_rx.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!(%peer, "ignoring non-UTF-8 binary frame");
                        continue;
                    }
                },
                Ok(Message::Close(_)) => break,
                // Control frames are answered by tungstenite itself
                Ok(_) => continue,
                Err(e) => {
                    debug!(%peer, "websocket read failed: {}", e);
                    break;
                }
            };
            match SyncMessage::decode(&text) {
                Ok(message) => {
                    if in_tx.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(%peer, "{}", e),
            }
        }
        debug!(%peer, "websocket closed");
    });

    Channel::new(remote, out_tx, in_rx).with_pumps(writer, reader)
}

/// Dials `ws://` endpoints, either peers directly or a relay
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    kind: TransportKind,
    peers: Vec<PeerAddress>,
    relay_identity: Option<(ProjectId, ActorId)>,
}

impl WebSocketTransport {
    /// Direct connections to statically configured peers
    pub fn direct(endpoints: impl IntoIterator<Item = String>) -> Self {
        Self {
            kind: TransportKind::Direct,
            peers: endpoints
                .into_iter()
                .map(|e| PeerAddress::new(TransportKind::Direct, e))
                .collect(),
            relay_identity: None,
        }
    }

    /// A relay that forwards frames to the other peers of `project`
    pub fn relay(url: impl Into<String>, project: ProjectId, peer: ActorId) -> Self {
        Self {
            kind: TransportKind::Relay,
            peers: vec![PeerAddress::new(TransportKind::Relay, url)],
            relay_identity: Some((project, peer)),
        }
    }

    fn url_for(&self, address: &PeerAddress) -> String {
        match (address.kind, self.relay_identity) {
            (TransportKind::Relay, Some((project, peer))) => {
                let separator = if address.endpoint.contains('?') { '&' } else { '?' };
                format!(
                    "{}{}project={}&peer={}",
                    address.endpoint, separator, project, peer.0
                )
            }
            _ => address.endpoint.clone(),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn discover_peers(&self) -> BoxStream<'static, PeerAddress> {
        stream::iter(self.peers.clone()).boxed()
    }

    async fn connect(&self, address: &PeerAddress) -> Result<Channel> {
        let url = self.url_for(address);
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(network_error)?;
        debug!(%address, "websocket connected");
        Ok(ws_channel(socket, address.clone()))
    }
}

/// Accepts direct WebSocket connections from peers
pub struct WebSocketListener {
    listener: TcpListener,
}

impl WebSocketListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(network_error)?;
        info!("listening for peers on {}", listener.local_addr().map_err(network_error)?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(network_error)
    }

    /// Wait for the next peer and complete its WebSocket upgrade
    pub async fn accept(&self) -> Result<Channel> {
        let (stream, addr) = self.listener.accept().await.map_err(network_error)?;
        let socket = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(network_error)?;
        debug!("accepted websocket from {}", addr);
        Ok(ws_channel(
            socket,
            PeerAddress::new(TransportKind::Direct, format!("ws://{}", addr)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_url_carries_identity() {
        let project = ProjectId::new();
        let peer = ActorId::new();
        let relay = WebSocketTransport::relay("ws://relay.local/sync", project, peer);

        let url = relay.url_for(&PeerAddress::new(TransportKind::Relay, "ws://relay.local/sync"));
        assert_eq!(
            url,
            format!("ws://relay.local/sync?project={}&peer={}", project, peer.0)
        );

        let direct = WebSocketTransport::direct(vec!["ws://10.0.0.2:7420".to_string()]);
        assert_eq!(direct.kind(), TransportKind::Direct);
        assert_eq!(direct.url_for(&direct.peers[0]), "ws://10.0.0.2:7420");
    }

    #[tokio::test]
    async fn test_websocket_round_trip() {
        let listener = WebSocketListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());

        let accept = tokio::spawn(async move { listener.accept().await });
        let transport = WebSocketTransport::direct(vec![endpoint.clone()]);
        let mut client = transport
            .connect(&PeerAddress::new(TransportKind::Direct, endpoint))
            .await
            .unwrap();
        let mut server = accept.await.unwrap().unwrap();

        client.send(SyncMessage::Ping).unwrap();
        assert_eq!(server.recv().await, Some(SyncMessage::Ping));
        server.send(SyncMessage::Pong).unwrap();
        assert_eq!(client.recv().await, Some(SyncMessage::Pong));

        client.close().await;
        assert_eq!(server.recv().await, None);
    }
}
