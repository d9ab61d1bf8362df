//! Topic-class dispatchers
//!
//! One handler task per topic class. The generic handler accepts the whole
//! envelope union and forwards each message to the component that owns its
//! type: claims feed the dependency detector, discussion and help traffic
//! feed the discussion engine, session traffic feeds the coordinator.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::coordination::{DependencyDetector, SessionCoordinator, TaskContext};
use crate::discussion::DiscussionEngine;
use crate::messaging::{Delivery, MessageType};

/// Handle coordination-topic traffic until cancelled.
pub async fn run_coordination_dispatch(
    mut deliveries: mpsc::Receiver<Delivery>,
    detector: Arc<DependencyDetector>,
    cancel: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => break,
            delivery = deliveries.recv() => {
                let Some(delivery) = delivery else { break };
                delivery
            }
        };

        match delivery.envelope.kind {
            MessageType::TaskClaim => {
                // A peer claimed an item; track it for dependency detection.
                let envelope = &delivery.envelope;
                let (Some(project_id), Some(item_id)) =
                    (envelope.data_i64("project_id"), envelope.data_i64("item_id"))
                else {
                    continue;
                };
                let context = TaskContext {
                    project_id,
                    item_id,
                    repository: envelope.data_str("repository").unwrap_or_default().to_string(),
                    title: envelope.data_str("title").unwrap_or_default().to_string(),
                    body: envelope.data_str("body").unwrap_or_default().to_string(),
                    claimant: envelope
                        .data_str("node_id")
                        .unwrap_or(&delivery.source)
                        .to_string(),
                    claimed_at: Utc::now(),
                };
                detector.register(context).await;
            }
            MessageType::CapabilityBroadcast => {
                debug!(from = %delivery.source, "Peer capability broadcast");
            }
            MessageType::AvailabilityBroadcast => {
                debug!(from = %delivery.source, "Peer availability broadcast");
            }
            MessageType::TaskAnnouncement
            | MessageType::TaskProgress
            | MessageType::TaskComplete => {
                debug!(
                    from = %delivery.source,
                    kind = ?delivery.envelope.kind,
                    "Coordination update"
                );
            }
            _ => {}
        }
    }
    info!("Coordination dispatcher stopped");
}

/// Handle meta-class traffic (static meta topic plus every per-item topic)
/// until cancelled.
pub async fn run_meta_dispatch(
    mut deliveries: mpsc::Receiver<Delivery>,
    discussion: Arc<DiscussionEngine>,
    sessions: Arc<SessionCoordinator>,
    cancel: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => break,
            delivery = deliveries.recv() => {
                let Some(delivery) = delivery else { break };
                delivery
            }
        };

        match delivery.envelope.kind {
            MessageType::MetaDiscussion
            | MessageType::TaskHelpRequest
            | MessageType::TaskHelpResponse
            | MessageType::EscalationTrigger => {
                discussion.handle(delivery).await;
            }
            MessageType::CoordinationRequest
            | MessageType::CoordinationResponse
            | MessageType::CoordinationPlan
            | MessageType::CoordinationComplete
            | MessageType::DependencyAlert => {
                sessions.handle(delivery).await;
            }
            _ => {
                debug!(kind = ?delivery.envelope.kind, "Unexpected type on meta topic");
            }
        }
    }
    info!("Meta dispatcher stopped");
}
