//! P2P layer - transport, discovery, and peer tracking
//!
//! The swarm loop (transport) owns the libp2p swarm. The network coordinator
//! consumes its events: it feeds discovery hits into the bounded dial queue,
//! keeps the peer registry current, records membership changes in the
//! ledger, and hands gossip messages to the messaging fabric.

pub mod discovery;
pub mod registry;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::ledger::{Ledger, LedgerEvent};
use crate::messaging::MessageFabric;
use crate::payload;

pub use discovery::{DiscoveryQueue, DiscoveryWorker, PeerCandidate};
pub use registry::{PeerInfo, PeerRegistry};
pub use transport::{build_swarm, short_peer_id, NodeEvent, SwarmCommand, SynodSwarm};

/// Interval between connection status log lines.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Consumes swarm events and keeps the rest of the node informed.
pub struct NetworkCoordinator {
    registry: Arc<PeerRegistry>,
    queue: Arc<DiscoveryQueue>,
    fabric: Arc<MessageFabric>,
    ledger: Ledger,
    local_peer_id: String,
}

impl NetworkCoordinator {
    pub fn new(
        registry: Arc<PeerRegistry>,
        queue: Arc<DiscoveryQueue>,
        fabric: Arc<MessageFabric>,
        ledger: Ledger,
        local_peer_id: String,
    ) -> Self {
        Self {
            registry,
            queue,
            fabric,
            ledger,
            local_peer_id,
        }
    }

    /// Run until cancelled, processing swarm events and emitting a status
    /// line every 30 seconds.
    pub async fn run(self, mut events: mpsc::Receiver<NodeEvent>, cancel: CancellationToken) {
        let mut status_timer = tokio::time::interval(STATUS_INTERVAL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event).await;
                }
                _ = status_timer.tick() => {
                    self.log_status().await;
                }
            }
        }

        info!("Network coordinator stopped");
    }

    async fn handle_event(&self, event: NodeEvent) {
        match event {
            NodeEvent::PeerDiscovered { peer_id, addrs } => {
                let peer_str = peer_id.to_string();
                self.registry
                    .mark_discovered(&peer_str, addrs.iter().map(|a| a.to_string()).collect())
                    .await;
                self.queue.push(PeerCandidate { peer_id, addrs });
            }

            NodeEvent::PeerExpired { peer_id } => {
                // Advertisement lapsed; the connection (if any) may survive.
                self.registry.mark_discovered(&peer_id.to_string(), Vec::new()).await;
            }

            NodeEvent::ConnectionEstablished { peer_id } => {
                let peer_str = peer_id.to_string();
                if peer_str == self.local_peer_id {
                    return;
                }
                self.registry.mark_connected(&peer_str).await;
                let _ = self
                    .ledger
                    .append(LedgerEvent::PeerJoined, payload! { "peer" => peer_str })
                    .await;
            }

            NodeEvent::ConnectionClosed { peer_id } => {
                let peer_str = peer_id.to_string();
                self.registry.mark_disconnected(&peer_str).await;
                let _ = self
                    .ledger
                    .append(LedgerEvent::PeerLeft, payload! { "peer" => peer_str })
                    .await;
            }

            NodeEvent::Message {
                topic,
                source,
                data,
            } => {
                self.fabric
                    .handle_raw(&topic, source.map(|p| p.to_string()), &data)
                    .await;
            }
        }
    }

    async fn log_status(&self) {
        let count = self.registry.connected_count().await;
        let short_ids = self.registry.connected_short_ids().await;
        info!(
            node = short_peer_id(&self.local_peer_id),
            connected_peers = count,
            peers = %short_ids.join(", "),
            "Node status"
        );
    }
}
