//! Ledger replication
//!
//! Peers exchange `{from_index, to_index}` range requests and receive entry
//! ranges in return. A receiver mirrors each remote ledger in a `ReplicaLog`
//! and verifies chain continuity and author signatures before appending.

use std::collections::HashMap;

use libp2p::identity::PublicKey;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{entry_hash, verify_signature, Ledger, LedgerEntry, LedgerError};

/// Request for a slice of a peer's ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RangeRequest {
    pub from_index: u64,
    pub to_index: u64,
}

impl Ledger {
    /// Serve a replication range request from the local chain.
    pub async fn serve_range(&self, req: RangeRequest) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.range(req.from_index, req.to_index).await
    }
}

/// Per-peer replication state.
#[derive(Debug, Clone)]
pub struct ReplicaState {
    /// Highest index acknowledged by the peer
    pub last_acked: u64,
    pub connected: bool,
}

/// Registry of peers replicating this node's ledger.
#[derive(Default)]
pub struct ReplicaSet {
    peers: Mutex<HashMap<String, ReplicaState>>,
}

impl ReplicaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_replicator(&self, peer_id: &str) {
        let mut peers = self.peers.lock().await;
        peers.insert(
            peer_id.to_string(),
            ReplicaState {
                last_acked: 0,
                connected: true,
            },
        );
        info!(peer_id, "Added ledger replicator");
    }

    pub async fn remove_replicator(&self, peer_id: &str) {
        let mut peers = self.peers.lock().await;
        if peers.remove(peer_id).is_some() {
            info!(peer_id, "Removed ledger replicator");
        }
    }

    pub async fn mark_acked(&self, peer_id: &str, index: u64) {
        let mut peers = self.peers.lock().await;
        if let Some(state) = peers.get_mut(peer_id) {
            if index > state.last_acked {
                state.last_acked = index;
            }
        }
    }

    /// Connected replicators and the index each should be caught up from.
    pub async fn pending(&self, head: u64) -> Vec<(String, RangeRequest)> {
        let peers = self.peers.lock().await;
        peers
            .iter()
            .filter(|(_, s)| s.connected && s.last_acked < head)
            .map(|(id, s)| {
                (
                    id.clone(),
                    RangeRequest {
                        from_index: s.last_acked,
                        to_index: head,
                    },
                )
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// In-memory mirror of a remote peer's ledger.
///
/// Entries are only appended after continuity and signature checks against
/// the remote author's public key.
pub struct ReplicaLog {
    author: String,
    author_key: PublicKey,
    entries: Vec<LedgerEntry>,
    head_hash: String,
}

impl ReplicaLog {
    pub fn new(author_key: PublicKey) -> Self {
        Self {
            author: author_key.to_peer_id().to_string(),
            author_key,
            entries: Vec::new(),
            head_hash: String::new(),
        }
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The range request that would catch this mirror up to `remote_head`.
    pub fn catch_up_request(&self, remote_head: u64) -> RangeRequest {
        RangeRequest {
            from_index: self.len(),
            to_index: remote_head,
        }
    }

    /// Verify and append a received entry range.
    ///
    /// The first entry must extend the local tail exactly; every entry must
    /// carry a valid hash, chain link, and author signature. Nothing is
    /// appended if any entry fails.
    pub fn apply_remote_entries(&mut self, entries: &[LedgerEntry]) -> Result<(), LedgerError> {
        let mut expected_index = self.len();
        let mut expected_prev = self.head_hash.clone();

        for entry in entries {
            if entry.index != expected_index || entry.prev_hash != expected_prev {
                return Err(LedgerError::Integrity { index: entry.index });
            }
            if entry.author != self.author {
                return Err(LedgerError::BadSignature { index: entry.index });
            }
            let computed = entry_hash(
                entry.index,
                &entry.timestamp,
                &entry.author,
                &entry.event,
                &entry.payload,
                &entry.prev_hash,
            )?;
            if computed != entry.entry_hash {
                return Err(LedgerError::Integrity { index: entry.index });
            }
            if !verify_signature(entry, &self.author_key) {
                return Err(LedgerError::BadSignature { index: entry.index });
            }
            expected_index += 1;
            expected_prev = entry.entry_hash.clone();
        }

        for entry in entries {
            self.entries.push(entry.clone());
        }
        if let Some(last) = self.entries.last() {
            self.head_hash = last.entry_hash.clone();
        }

        debug!(
            author = %self.author,
            appended = entries.len(),
            head = self.len(),
            "Applied replicated entries"
        );
        Ok(())
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }
}
