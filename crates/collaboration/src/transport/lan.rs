/// LAN discovery
/// Peers announce themselves with a small UDP broadcast beacon and are then
/// reached over WebSocket at the advertised port.
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use replica::{ActorId, ProjectId};

use super::websocket::ws_channel;
use super::{Channel, PeerAddress, Transport, TransportKind};
use crate::{CollaborationError, Result};

pub const DEFAULT_BEACON_PORT: u16 = 7421;

/// Announcement broadcast by every peer on the local network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub project_id: ProjectId,
    pub peer_id: ActorId,
    pub ws_port: u16,
}

impl Beacon {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }

    /// WebSocket address of the peer that sent this beacon from `from`
    pub fn address(&self, from: SocketAddr) -> PeerAddress {
        PeerAddress::new(
            TransportKind::Lan,
            format!("ws://{}:{}", from.ip(), self.ws_port),
        )
    }
}

#[derive(Debug, Clone)]
pub struct LanTransport {
    beacon: Beacon,
    beacon_port: u16,
    interval: Duration,
}

impl LanTransport {
    pub fn new(project_id: ProjectId, peer_id: ActorId, ws_port: u16) -> Self {
        Self {
            beacon: Beacon {
                project_id,
                peer_id,
                ws_port,
            },
            beacon_port: DEFAULT_BEACON_PORT,
            interval: Duration::from_secs(2),
        }
    }

    pub fn with_beacon_port(mut self, port: u16) -> Self {
        self.beacon_port = port;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Whether a received beacon names another peer of our project
    fn accepts(&self, beacon: &Beacon) -> bool {
        beacon.project_id == self.beacon.project_id && beacon.peer_id != self.beacon.peer_id
    }

    /// Broadcast our beacon periodically until the task is aborted
    pub fn spawn_announcer(&self) -> JoinHandle<()> {
        let beacon = self.beacon;
        let port = self.beacon_port;
        let interval = self.interval;
        tokio::spawn(async move {
            let payload = match beacon.encode() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("cannot encode beacon: {}", e);
                    return;
                }
            };
            let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
                Ok(socket) => socket,
                Err(e) => {
                    warn!("LAN announcer disabled: {}", e);
                    return;
                }
            };
            if let Err(e) = socket.set_broadcast(true) {
                warn!("LAN announcer disabled: {}", e);
                return;
            }

            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = socket.send_to(&payload, (Ipv4Addr::BROADCAST, port)).await {
                    debug!("beacon send failed: {}", e);
                }
            }
        })
    }
}

#[async_trait]
impl Transport for LanTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Lan
    }

    fn discover_peers(&self) -> BoxStream<'static, PeerAddress> {
        let port = self.beacon_port;
        let this = self.clone();

        stream::once(async move { UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await })
            .filter_map(|bound| async move {
                match bound {
                    Ok(socket) => Some(socket),
                    Err(e) => {
                        warn!("LAN discovery disabled: {}", e);
                        None
                    }
                }
            })
            .flat_map(|socket| {
                stream::unfold(socket, |socket| async move {
                    let mut buf = [0u8; 512];
                    match socket.recv_from(&mut buf).await {
                        Ok((n, from)) => Some(((buf[..n].to_vec(), from), socket)),
                        Err(e) => {
                            debug!("beacon receive failed: {}", e);
                            None
                        }
                    }
                })
            })
            .filter_map(move |(bytes, from)| {
                let found = Beacon::decode(&bytes)
                    .filter(|beacon| this.accepts(beacon))
                    .map(|beacon| beacon.address(from));
                async move { found }
            })
            .boxed()
    }

    async fn connect(&self, address: &PeerAddress) -> Result<Channel> {
        let (socket, _) = tokio_tungstenite::connect_async(address.endpoint.as_str())
            .await
            .map_err(|e| CollaborationError::NetworkError(e.to_string()))?;
        Ok(ws_channel(socket, address.clone()))
    }
}
