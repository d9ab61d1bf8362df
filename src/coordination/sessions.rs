//! Multi-party coordination sessions
//!
//! A detected dependency opens a session between the claimants involved.
//! Sessions are bounded by message count and wall-clock duration; consensus
//! in the recent messages resolves them, and a cleanup loop drops idle or
//! finished sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clients::Reasoner;
use crate::ledger::{Ledger, LedgerEvent};
use crate::messaging::{Delivery, MessageFabric, MessageType};
use crate::payload;

use super::detector::TaskDependency;

/// Messages before a session escalates.
pub const DEFAULT_ESCALATION_THRESHOLD: usize = 10;

/// Wall-clock bound on a session.
pub const DEFAULT_MAX_SESSION_DURATION: Duration = Duration::from_secs(30 * 60);

/// Idle time after which cleanup drops a session.
pub const SESSION_IDLE_EXPIRY: Duration = Duration::from_secs(2 * 60 * 60);

/// Cadence of the cleanup loop.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Phrases counted as agreement during consensus evaluation.
pub const CONSENSUS_PHRASES: [&str; 4] = ["agree", "sounds good", "approved", "looks good"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Dependency,
    Conflict,
    Planning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Resolved,
    Escalated,
    TimedOut,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

/// An agent taking part in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub last_seen: DateTime<Utc>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub from: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// One multi-item coordination context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationSession {
    pub session_id: String,
    pub session_type: SessionType,
    /// Claim keys of the items involved
    pub involved_items: Vec<String>,
    /// Participants keyed by node id
    pub participants: HashMap<String, Participant>,
    pub messages: Vec<SessionMessage>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub resolution: Option<String>,
    pub escalation_reason: Option<String>,
}

/// Outcome of a progress evaluation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionProgress {
    Continue,
    Escalate(String),
    Resolve(String),
}

/// Evaluate a session against its bounds and the consensus rule.
pub fn evaluate_progress(
    session: &CoordinationSession,
    escalation_threshold: usize,
    max_duration: Duration,
) -> SessionProgress {
    if session.messages.len() >= escalation_threshold {
        return SessionProgress::Escalate("Message limit exceeded".to_string());
    }

    let age = Utc::now().signed_duration_since(session.created_at);
    if age.num_seconds() as u64 > max_duration.as_secs() {
        return SessionProgress::Escalate("Duration exceeded".to_string());
    }

    let recent = if session.messages.len() > 3 {
        &session.messages[session.messages.len() - 3..]
    } else {
        &session.messages[..]
    };
    let agreements = recent
        .iter()
        .filter(|m| {
            let content = m.content.to_lowercase();
            CONSENSUS_PHRASES.iter().any(|p| content.contains(p))
        })
        .count();

    if agreements >= session.participants.len().saturating_sub(1) && !recent.is_empty() {
        return SessionProgress::Resolve("Consensus reached among participants".to_string());
    }

    SessionProgress::Continue
}

/// Owns the active-sessions map and its lifecycle rules.
pub struct SessionCoordinator {
    sessions: RwLock<HashMap<String, CoordinationSession>>,
    fabric: Arc<MessageFabric>,
    reasoner: Arc<dyn Reasoner>,
    ledger: Ledger,
    escalation_threshold: usize,
    max_session_duration: Duration,
}

impl SessionCoordinator {
    pub fn new(fabric: Arc<MessageFabric>, reasoner: Arc<dyn Reasoner>, ledger: Ledger) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            fabric,
            reasoner,
            ledger,
            escalation_threshold: DEFAULT_ESCALATION_THRESHOLD,
            max_session_duration: DEFAULT_MAX_SESSION_DURATION,
        }
    }

    pub async fn session(&self, session_id: &str) -> Option<CoordinationSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Register a session built elsewhere (conflict and planning sessions
    /// have no automatic trigger).
    pub async fn open_session(&self, session: CoordinationSession) -> String {
        let session_id = session.session_id.clone();
        let mut sessions = self.sessions.write().await;
        sessions.insert(session_id.clone(), session);
        session_id
    }

    /// Open a dependency session between the two claimants, generate a
    /// coordination plan, and broadcast it.
    pub async fn open_dependency_session(&self, dependency: &TaskDependency) -> String {
        let created_at = Utc::now();
        let session_id = format!(
            "dep-{}-{}-{}",
            dependency.item_a.project_id,
            dependency.item_a.item_id,
            created_at.timestamp()
        );

        let mut participants = HashMap::new();
        for claimant in [&dependency.item_a.claimant, &dependency.item_b.claimant] {
            participants.insert(
                claimant.clone(),
                Participant {
                    last_seen: created_at,
                    active: true,
                },
            );
        }

        let mut session = CoordinationSession {
            session_id: session_id.clone(),
            session_type: SessionType::Dependency,
            involved_items: vec![dependency.item_a.key(), dependency.item_b.key()],
            participants,
            messages: Vec::new(),
            status: SessionStatus::Active,
            created_at,
            last_activity: created_at,
            resolution: None,
            escalation_reason: None,
        };

        info!(
            session_id = %session_id,
            relationship = %dependency.relationship,
            "Opened coordination session"
        );

        let plan = self.generate_plan(dependency).await;
        if let Some(plan) = &plan {
            session.messages.push(SessionMessage {
                from: "coordinator".to_string(),
                content: plan.clone(),
                timestamp: Utc::now(),
            });
        }

        let involved_items = session.involved_items.clone();
        let participant_ids: Vec<String> = session.participants.keys().cloned().collect();
        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(session_id.clone(), session);
        }

        if let Some(plan) = plan {
            let data = payload! {
                "session_id" => session_id.clone(),
                "plan" => plan,
                "relationship" => dependency.relationship.clone(),
                "involved_items" => involved_items,
                "participants" => participant_ids,
            };
            if let Err(e) = self.fabric.publish_meta(MessageType::CoordinationPlan, data).await {
                warn!(session_id = %session_id, error = %e, "Failed to broadcast coordination plan");
            }
        }

        session_id
    }

    async fn generate_plan(&self, dependency: &TaskDependency) -> Option<String> {
        let prompt = format!(
            "You are coordinating a distributed development team.\n\
             A dependency was detected between two work items in different repositories.\n\
             Item 1: {} #{} ({}) claimed by {}\n\
             Item 2: {} #{} ({}) claimed by {}\n\
             Relationship: {}\nReason: {}\n\n\
             Produce a concise coordination plan: what must be shared, in what \
             order the items should land, what conflicts to watch for, and the \
             criteria for coordinated completion.",
            dependency.item_a.repository,
            dependency.item_a.item_id,
            dependency.item_a.title,
            dependency.item_a.claimant,
            dependency.item_b.repository,
            dependency.item_b.item_id,
            dependency.item_b.title,
            dependency.item_b.claimant,
            dependency.relationship,
            dependency.reason,
        );

        match self.reasoner.generate(&prompt, None).await {
            Ok(plan) => Some(plan),
            Err(e) => {
                warn!(error = %e, "Failed to generate coordination plan");
                None
            }
        }
    }

    /// Dispatch a meta-class delivery that belongs to the coordinator.
    pub async fn handle(&self, delivery: Delivery) {
        match delivery.envelope.kind {
            MessageType::CoordinationResponse => self.handle_response(delivery).await,
            MessageType::CoordinationRequest => {
                debug!(from = %delivery.source, "Coordination request received");
            }
            MessageType::CoordinationPlan | MessageType::CoordinationComplete => {
                debug!(from = %delivery.source, kind = ?delivery.envelope.kind, "Session update received");
            }
            MessageType::DependencyAlert => {
                debug!(from = %delivery.source, "Peer dependency alert received");
            }
            _ => {}
        }
    }

    /// Record a participant's response and re-evaluate the session.
    pub async fn handle_response(&self, delivery: Delivery) {
        let envelope = &delivery.envelope;
        let Some(session_id) = envelope.data_str("session_id").map(str::to_string) else {
            return;
        };
        let Some(content) = envelope.data_str("message").map(str::to_string) else {
            return;
        };
        let node_id = envelope
            .data_str("node_id")
            .unwrap_or(&delivery.source)
            .to_string();

        let progress = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(&session_id) else {
                return;
            };
            if session.status != SessionStatus::Active {
                return;
            }

            session.messages.push(SessionMessage {
                from: node_id.clone(),
                content,
                timestamp: Utc::now(),
            });
            session.last_activity = Utc::now();
            if let Some(participant) = session.participants.get_mut(&node_id) {
                participant.last_seen = Utc::now();
            }

            let progress =
                evaluate_progress(session, self.escalation_threshold, self.max_session_duration);
            match &progress {
                SessionProgress::Escalate(reason) => {
                    session.status = SessionStatus::Escalated;
                    session.escalation_reason = Some(reason.clone());
                }
                SessionProgress::Resolve(reason) => {
                    session.status = SessionStatus::Resolved;
                    session.resolution = Some(reason.clone());
                }
                SessionProgress::Continue => {}
            }
            progress
        };

        match progress {
            SessionProgress::Escalate(reason) => self.announce_escalation(&session_id, &reason).await,
            SessionProgress::Resolve(reason) => self.announce_resolution(&session_id, &reason).await,
            SessionProgress::Continue => {
                debug!(session_id = %session_id, "Coordination response recorded");
            }
        }
    }

    async fn announce_escalation(&self, session_id: &str, reason: &str) {
        info!(session_id, reason, "Coordination session escalated");

        let _ = self
            .ledger
            .append(
                LedgerEvent::Escalation,
                payload! {
                    "session_id" => session_id,
                    "reason" => reason,
                },
            )
            .await;

        if let Err(e) = self
            .fabric
            .publish_meta(
                MessageType::EscalationTrigger,
                payload! {
                    "session_id" => session_id,
                    "reason" => reason,
                    "requires_human" => true,
                },
            )
            .await
        {
            warn!(session_id, error = %e, "Failed to announce session escalation");
        }
    }

    async fn announce_resolution(&self, session_id: &str, resolution: &str) {
        info!(session_id, resolution, "Coordination session resolved");

        let _ = self
            .ledger
            .append(
                LedgerEvent::ConsensusReached,
                payload! {
                    "session_id" => session_id,
                    "resolution" => resolution,
                },
            )
            .await;

        if let Err(e) = self
            .fabric
            .publish_meta(
                MessageType::CoordinationComplete,
                payload! {
                    "session_id" => session_id,
                    "resolution" => resolution,
                },
            )
            .await
        {
            warn!(session_id, error = %e, "Failed to announce session resolution");
        }
    }

    /// Drop idle and finished sessions every ten minutes.
    pub async fn run_cleanup(self: Arc<Self>, cancel: CancellationToken) {
        let mut timer = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => self.cleanup_once().await,
            }
        }
        info!("Session cleanup stopped");
    }

    /// One cleanup pass; callable directly from tests.
    pub async fn cleanup_once(&self) {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        sessions.retain(|session_id, session| {
            let idle = now.signed_duration_since(session.last_activity).num_seconds() as u64
                > SESSION_IDLE_EXPIRY.as_secs();
            if idle && session.status == SessionStatus::Active {
                session.status = SessionStatus::TimedOut;
            }
            let keep = !idle && !session.status.is_terminal();
            if !keep {
                info!(session_id = %session_id, status = ?session.status, "Cleaned up session");
            }
            keep
        });
    }
}
