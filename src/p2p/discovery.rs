//! Local peer discovery queue and dial worker
//!
//! mDNS hits land in a bounded queue; a worker drains it, skips self and
//! already-connected peers, and dials with a per-peer deadline. When the
//! queue is full the oldest unconsumed entry is dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use libp2p::{Multiaddr, PeerId};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::PeerRegistry;
use super::transport::{short_peer_id, SwarmCommand};

/// Default queue depth for unprocessed discovery hits.
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

/// A peer seen on the local broadcast domain.
#[derive(Debug, Clone)]
pub struct PeerCandidate {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

/// Bounded discovery queue with drop-oldest backpressure.
pub struct DiscoveryQueue {
    inner: Mutex<VecDeque<PeerCandidate>>,
    notify: Notify,
    depth: usize,
    dropped: AtomicU64,
}

impl DiscoveryQueue {
    pub fn new(depth: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(depth)),
            notify: Notify::new(),
            depth: depth.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a candidate, evicting the oldest entry when full.
    pub fn push(&self, candidate: PeerCandidate) {
        let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= self.depth {
            if let Some(evicted) = queue.pop_front() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    peer = short_peer_id(&evicted.peer_id.to_string()),
                    "Discovery queue full, dropping oldest candidate"
                );
            }
        }
        queue.push_back(candidate);
        drop(queue);
        self.notify.notify_one();
    }

    /// Wait for the next candidate.
    pub async fn pop(&self) -> PeerCandidate {
        loop {
            {
                let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(candidate) = queue.pop_front() {
                    return candidate;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Candidates evicted because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drains the discovery queue and dials new peers.
pub struct DiscoveryWorker {
    queue: Arc<DiscoveryQueue>,
    registry: Arc<PeerRegistry>,
    commands: mpsc::Sender<SwarmCommand>,
    local_peer_id: PeerId,
    dial_timeout: Duration,
}

impl DiscoveryWorker {
    pub fn new(
        queue: Arc<DiscoveryQueue>,
        registry: Arc<PeerRegistry>,
        commands: mpsc::Sender<SwarmCommand>,
        local_peer_id: PeerId,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            registry,
            commands,
            local_peer_id,
            dial_timeout,
        }
    }

    /// Run until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let candidate = tokio::select! {
                _ = cancel.cancelled() => break,
                candidate = self.queue.pop() => candidate,
            };
            self.try_connect(candidate).await;
        }
        info!("Discovery worker stopped");
    }

    async fn try_connect(&self, candidate: PeerCandidate) {
        let peer_id = candidate.peer_id;
        if peer_id == self.local_peer_id {
            return;
        }
        let peer_str = peer_id.to_string();
        if self.registry.is_connected(&peer_str).await {
            return;
        }

        debug!(
            peer = short_peer_id(&peer_str),
            "Discovered peer, attempting connection"
        );

        let (reply_tx, reply_rx) = oneshot::channel();
        let command = SwarmCommand::Dial {
            peer_id,
            addrs: candidate.addrs,
            reply: reply_tx,
        };
        if self.commands.send(command).await.is_err() {
            return;
        }

        match tokio::time::timeout(self.dial_timeout, reply_rx).await {
            Ok(Ok(Ok(()))) => {
                info!(peer = short_peer_id(&peer_str), "Connected to peer");
            }
            Ok(Ok(Err(e))) => {
                warn!(peer = short_peer_id(&peer_str), error = %e, "Failed to connect to peer");
            }
            Ok(Err(_)) => {
                // Swarm loop went away; nothing to do.
            }
            Err(_) => {
                warn!(
                    peer = short_peer_id(&peer_str),
                    timeout_secs = self.dial_timeout.as_secs(),
                    "Connection attempt timed out"
                );
            }
        }
    }
}
