/// Connection strategy
/// Addresses are tried LAN first, then direct, then through a relay; each
/// strategy gets a bounded number of attempts with exponential backoff.
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{Channel, CollaborationError, PeerAddress, Result, SyncConfig, Transport, Workspace};

pub struct Connector {
    transports: Vec<Arc<dyn Transport>>,
    config: SyncConfig,
    /// Addresses whose peer refused our handshake
    rejected: Mutex<HashSet<PeerAddress>>,
}

impl Connector {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            transports: Vec::new(),
            config,
            rejected: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn transport_for(&self, address: &PeerAddress) -> Option<&Arc<dyn Transport>> {
        self.transports.iter().find(|t| t.kind() == address.kind)
    }

    pub fn mark_rejected(&self, address: &PeerAddress) {
        self.rejected.lock().insert(address.clone());
    }

    pub fn is_rejected(&self, address: &PeerAddress) -> bool {
        self.rejected.lock().contains(address)
    }

    /// Peers announced by every transport, merged into one stream
    pub fn discover(&self) -> BoxStream<'static, PeerAddress> {
        stream::select_all(self.transports.iter().map(|t| t.discover_peers())).boxed()
    }

    /// First channel any strategy can open to one of `addresses`
    pub async fn connect(&self, addresses: &[PeerAddress]) -> Result<Channel> {
        let mut ordered: Vec<&PeerAddress> = addresses.iter().collect();
        ordered.sort_by_key(|a| a.kind);

        let mut last_error = None;
        for address in ordered {
            if self.is_rejected(address) {
                debug!(%address, "skipping peer that rejected us");
                continue;
            }
            let Some(transport) = self.transport_for(address) else {
                debug!(%address, "no transport for address");
                continue;
            };

            for attempt in 0..self.config.connect_attempts.max(1) {
                if attempt > 0 {
                    tokio::time::sleep(self.config.backoff(attempt - 1)).await;
                }
                let timeout = self.config.connect_timeout();
                match tokio::time::timeout(timeout, transport.connect(address)).await {
                    Ok(Ok(channel)) => {
                        debug!(%address, attempt, "connected");
                        return Ok(channel);
                    }
                    Ok(Err(e)) => {
                        debug!(%address, attempt, "connect failed: {}", e);
                        last_error = Some(e);
                    }
                    Err(_) => {
                        debug!(%address, attempt, "connect timed out");
                        last_error = Some(CollaborationError::Timeout(format!(
                            "connecting to {}",
                            address
                        )));
                    }
                }
            }
            debug!(%address, "falling back to the next strategy");
        }

        Err(last_error.unwrap_or_else(|| {
            CollaborationError::NetworkError("no usable address for peer".into())
        }))
    }

    /// Keep a session with the peer at `addresses` alive, reconnecting with
    /// backoff after every drop. Returns when the peer rejects us.
    pub async fn maintain(&self, workspace: Workspace, addresses: Vec<PeerAddress>) -> Result<()> {
        let mut failures: u32 = 0;
        loop {
            match self.connect(&addresses).await {
                Ok(channel) => {
                    let address = channel.remote().clone();
                    match workspace.attach(channel).await {
                        Ok(end) => {
                            debug!(%address, ?end, "session over, reconnecting");
                            failures = 0;
                        }
                        Err(e @ (CollaborationError::Rejected(_) | CollaborationError::ProjectMismatch { .. })) => {
                            self.mark_rejected(&address);
                            if addresses.iter().all(|a| self.is_rejected(a)) {
                                warn!(%address, "giving up on peer: {}", e);
                                return Err(e);
                            }
                        }
                        Err(e) => {
                            debug!(%address, "session failed: {}", e);
                            failures = failures.saturating_add(1);
                        }
                    }
                }
                Err(e) => {
                    if addresses.iter().all(|a| self.is_rejected(a)) {
                        return Err(e);
                    }
                    failures = failures.saturating_add(1);
                    if failures == 1 {
                        info!("peer unreachable, will keep retrying: {}", e);
                    }
                }
            }
            tokio::time::sleep(self.config.backoff(failures)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryNetwork, TransportKind};
    use crate::SyncMessage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails a fixed number of times before handing out a pipe
    struct Flaky {
        kind: TransportKind,
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for Flaky {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn discover_peers(&self) -> BoxStream<'static, PeerAddress> {
            stream::empty().boxed()
        }

        async fn connect(&self, address: &PeerAddress) -> Result<Channel> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(CollaborationError::NetworkError("refused".into()));
            }
            let (ours, _theirs) = crate::transport::pipe(
                PeerAddress::new(self.kind, "self"),
                address.clone(),
            );
            Ok(ours)
        }
    }

    fn flaky(kind: TransportKind, failures: usize) -> Arc<Flaky> {
        Arc::new(Flaky {
            kind,
            failures,
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_relay() {
        let direct = flaky(TransportKind::Direct, usize::MAX);
        let relay = flaky(TransportKind::Relay, 0);
        let connector = Connector::new(SyncConfig::default())
            .with_transport(relay.clone())
            .with_transport(direct.clone());

        let channel = connector
            .connect(&[
                PeerAddress::new(TransportKind::Relay, "ws://relay"),
                PeerAddress::new(TransportKind::Direct, "ws://peer"),
            ])
            .await
            .unwrap();

        assert_eq!(channel.remote().kind, TransportKind::Relay);
        assert_eq!(direct.calls.load(Ordering::SeqCst), 3);
        assert_eq!(relay.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_backoff() {
        let direct = flaky(TransportKind::Direct, 2);
        let connector = Connector::new(SyncConfig::default()).with_transport(direct.clone());
        let address = PeerAddress::new(TransportKind::Direct, "ws://peer");

        let started = tokio::time::Instant::now();
        connector.connect(&[address.clone()]).await.unwrap();
        // 200 ms then 400 ms between the three attempts
        assert!(started.elapsed() >= std::time::Duration::from_millis(600));

        connector.mark_rejected(&address);
        assert!(connector.connect(&[address]).await.is_err());
    }

    #[tokio::test]
    async fn test_discovery_merges_transports() {
        let network = MemoryNetwork::new();
        let _bob = network.listen("bob");
        let _carol = network.listen("carol");
        let connector =
            Connector::new(SyncConfig::default()).with_transport(Arc::new(network.transport("ada")));

        let found: Vec<PeerAddress> = connector.discover().collect().await;
        assert_eq!(found.len(), 2);

        let channel = connector.connect(&found[..1]).await.unwrap();
        assert_eq!(channel.remote().endpoint, "bob");
        tokio_test::assert_ok!(channel.send(SyncMessage::Ping));
    }
}
