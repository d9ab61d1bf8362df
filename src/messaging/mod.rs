//! Messaging fabric
//!
//! Signed gossip pub/sub over the P2P layer. Two static topics (coordination
//! and meta-discussion) plus dynamically joined per-item topics. Decoded
//! envelopes fan out to one bounded dispatch channel per topic class; the
//! meta channel is shared by the static meta topic and every per-item topic.

pub mod envelope;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::p2p::SwarmCommand;

pub use envelope::{Envelope, EnvelopeError, MessageType, MAX_HOPS};

/// Depth of each per-class dispatch channel.
pub const DISPATCH_QUEUE_DEPTH: usize = 256;

/// Maximum envelopes accepted per second before dropping.
pub const THROTTLE_PER_SECOND: u32 = 1024;

/// A decoded envelope delivered to a topic-class handler.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Topic the envelope arrived on
    pub topic: String,
    /// Transport-level sender
    pub source: String,
    pub envelope: Envelope,
}

/// Receiving halves of the two topic-class dispatch channels.
pub struct FabricReceivers {
    pub coordination: mpsc::Receiver<Delivery>,
    pub meta: mpsc::Receiver<Delivery>,
}

#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    #[error("not subscribed to topic {0}")]
    NotSubscribed(String),

    #[error("envelope encode failed: {0}")]
    Encode(#[from] EnvelopeError),

    #[error("swarm loop is gone")]
    SwarmClosed,
}

/// Token bucket limiting inbound envelope validation work.
struct Throttle {
    tokens: f64,
    last_refill: Instant,
}

impl Throttle {
    fn new() -> Self {
        Self {
            tokens: THROTTLE_PER_SECOND as f64,
            last_refill: Instant::now(),
        }
    }

    fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * THROTTLE_PER_SECOND as f64)
            .min(THROTTLE_PER_SECOND as f64);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Pub/sub fabric handle shared across subsystems.
pub struct MessageFabric {
    local_peer_id: String,
    coordination_topic: String,
    meta_topic: String,
    commands: mpsc::Sender<SwarmCommand>,
    coordination_tx: mpsc::Sender<Delivery>,
    meta_tx: mpsc::Sender<Delivery>,
    dynamic_topics: RwLock<HashSet<String>>,
    throttle: Mutex<Throttle>,
    validation_drops: AtomicU64,
    throttle_drops: AtomicU64,
    queue_drops: AtomicU64,
}

impl MessageFabric {
    /// Create the fabric and its dispatch receivers. The static topics are
    /// subscribed immediately.
    pub async fn new(
        local_peer_id: String,
        coordination_topic: String,
        meta_topic: String,
        commands: mpsc::Sender<SwarmCommand>,
    ) -> Result<(Self, FabricReceivers), FabricError> {
        let (coordination_tx, coordination_rx) = mpsc::channel(DISPATCH_QUEUE_DEPTH);
        let (meta_tx, meta_rx) = mpsc::channel(DISPATCH_QUEUE_DEPTH);

        for topic in [&coordination_topic, &meta_topic] {
            commands
                .send(SwarmCommand::Subscribe {
                    topic: topic.clone(),
                })
                .await
                .map_err(|_| FabricError::SwarmClosed)?;
        }

        info!(
            coordination = %coordination_topic,
            meta = %meta_topic,
            "Messaging fabric initialized"
        );

        Ok((
            Self {
                local_peer_id,
                coordination_topic,
                meta_topic,
                commands,
                coordination_tx,
                meta_tx,
                dynamic_topics: RwLock::new(HashSet::new()),
                throttle: Mutex::new(Throttle::new()),
                validation_drops: AtomicU64::new(0),
                throttle_drops: AtomicU64::new(0),
                queue_drops: AtomicU64::new(0),
            },
            FabricReceivers {
                coordination: coordination_rx,
                meta: meta_rx,
            },
        ))
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    pub fn coordination_topic(&self) -> &str {
        &self.coordination_topic
    }

    pub fn meta_topic(&self) -> &str {
        &self.meta_topic
    }

    /// Name of the dynamic per-item topic.
    pub fn item_topic(&self, item_id: i64) -> String {
        format!("{}/item/{}", self.meta_topic, item_id)
    }

    /// Join the per-item topic. Idempotent.
    pub async fn join_item_topic(&self, item_id: i64) -> Result<(), FabricError> {
        let topic = self.item_topic(item_id);
        {
            let mut topics = self.dynamic_topics.write().await;
            if !topics.insert(topic.clone()) {
                return Ok(());
            }
        }
        self.commands
            .send(SwarmCommand::Subscribe {
                topic: topic.clone(),
            })
            .await
            .map_err(|_| FabricError::SwarmClosed)?;
        info!(topic = %topic, "Joined dynamic topic");
        Ok(())
    }

    /// Leave the per-item topic.
    pub async fn leave_item_topic(&self, item_id: i64) {
        let topic = self.item_topic(item_id);
        let removed = {
            let mut topics = self.dynamic_topics.write().await;
            topics.remove(&topic)
        };
        if removed {
            let _ = self
                .commands
                .send(SwarmCommand::Unsubscribe {
                    topic: topic.clone(),
                })
                .await;
            info!(topic = %topic, "Left dynamic topic");
        }
    }

    /// Publish on the coordination topic.
    pub async fn publish_coordination(
        &self,
        kind: MessageType,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), FabricError> {
        self.publish_on(self.coordination_topic.clone(), kind, data)
            .await
    }

    /// Publish on the static meta-discussion topic.
    pub async fn publish_meta(
        &self,
        kind: MessageType,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), FabricError> {
        self.publish_on(self.meta_topic.clone(), kind, data).await
    }

    /// Publish on a per-item topic; fails when the topic was never joined.
    pub async fn publish_to_item(
        &self,
        item_id: i64,
        kind: MessageType,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), FabricError> {
        let topic = self.item_topic(item_id);
        {
            let topics = self.dynamic_topics.read().await;
            if !topics.contains(&topic) {
                return Err(FabricError::NotSubscribed(topic));
            }
        }
        self.publish_on(topic, kind, data).await
    }

    async fn publish_on(
        &self,
        topic: String,
        kind: MessageType,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), FabricError> {
        let envelope = Envelope::new(kind, self.local_peer_id.clone(), data);
        let bytes = envelope.encode()?;
        self.commands
            .send(SwarmCommand::Publish { topic, data: bytes })
            .await
            .map_err(|_| FabricError::SwarmClosed)
    }

    /// Validate, decode, and dispatch a raw gossip message.
    ///
    /// Anything unverifiable, malformed, over the hop limit, over the
    /// throttle budget, or addressed from ourselves is dropped here.
    pub async fn handle_raw(&self, topic: &str, source: Option<String>, data: &[u8]) {
        {
            let mut throttle = self.throttle.lock().unwrap_or_else(|e| e.into_inner());
            if !throttle.try_acquire() {
                self.throttle_drops.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        // Strict-mode gossipsub always carries a verified source; anything
        // else is unauthenticated.
        let Some(source) = source else {
            self.validation_drops.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if source == self.local_peer_id {
            return;
        }

        let envelope = match Envelope::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.validation_drops.fetch_add(1, Ordering::Relaxed);
                debug!(topic, error = %e, "Dropped invalid envelope");
                return;
            }
        };

        // The signed transport source is authoritative; a mismatched `from`
        // is a forgery attempt.
        if envelope.from != source {
            self.validation_drops.fetch_add(1, Ordering::Relaxed);
            warn!(topic, from = %envelope.from, source = %source, "Envelope sender mismatch");
            return;
        }

        let delivery = Delivery {
            topic: topic.to_string(),
            source,
            envelope,
        };

        let target = if topic == self.coordination_topic {
            &self.coordination_tx
        } else {
            // Static meta topic and all per-item topics share one handler.
            &self.meta_tx
        };

        if target.try_send(delivery).is_err() {
            self.queue_drops.fetch_add(1, Ordering::Relaxed);
            warn!(topic, "Dispatch queue full, dropping message");
        }
    }

    /// Messages dropped for failing validation (signature, decode, hop limit,
    /// sender mismatch).
    pub fn validation_drops(&self) -> u64 {
        self.validation_drops.load(Ordering::Relaxed)
    }

    /// Messages dropped by the inbound rate limit.
    pub fn throttle_drops(&self) -> u64 {
        self.throttle_drops.load(Ordering::Relaxed)
    }

    /// Messages dropped because a dispatch queue was full.
    pub fn queue_drops(&self) -> u64 {
        self.queue_drops.load(Ordering::Relaxed)
    }
}
