//! Peer registry
//!
//! Tracks every peer seen on the local network. Peers are interned by their
//! id string; other subsystems store ids, never handles.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::transport::short_peer_id;

/// Known state of one peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addresses: Vec<String>,
    pub connected: bool,
    pub last_seen: DateTime<Utc>,
}

/// Registry of peers keyed by peer id string. Retained across reconnects.
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, PeerInfo>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn mark_discovered(&self, peer_id: &str, addresses: Vec<String>) {
        let mut peers = self.peers.write().await;
        let entry = peers.entry(peer_id.to_string()).or_insert(PeerInfo {
            addresses: Vec::new(),
            connected: false,
            last_seen: Utc::now(),
        });
        for addr in addresses {
            if !entry.addresses.contains(&addr) {
                entry.addresses.push(addr);
            }
        }
        entry.last_seen = Utc::now();
    }

    pub async fn mark_connected(&self, peer_id: &str) {
        let mut peers = self.peers.write().await;
        let entry = peers.entry(peer_id.to_string()).or_insert(PeerInfo {
            addresses: Vec::new(),
            connected: false,
            last_seen: Utc::now(),
        });
        entry.connected = true;
        entry.last_seen = Utc::now();
    }

    pub async fn mark_disconnected(&self, peer_id: &str) {
        let mut peers = self.peers.write().await;
        if let Some(entry) = peers.get_mut(peer_id) {
            entry.connected = false;
            entry.last_seen = Utc::now();
        }
    }

    pub async fn is_connected(&self, peer_id: &str) -> bool {
        let peers = self.peers.read().await;
        peers.get(peer_id).map(|p| p.connected).unwrap_or(false)
    }

    pub async fn connected_count(&self) -> usize {
        let peers = self.peers.read().await;
        peers.values().filter(|p| p.connected).count()
    }

    /// Short ids of connected peers, for status log lines.
    pub async fn connected_short_ids(&self) -> Vec<String> {
        let peers = self.peers.read().await;
        peers
            .iter()
            .filter(|(_, p)| p.connected)
            .map(|(id, _)| short_peer_id(id).to_string())
            .collect()
    }

    pub async fn get(&self, peer_id: &str) -> Option<PeerInfo> {
        let peers = self.peers.read().await;
        peers.get(peer_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
