//! Meta-discussion engine
//!
//! Per-item conversations between agents. A claimed item gets a proposed
//! plan published for peer review; every peer response is answered with the
//! full history as context until consensus, completion, or escalation.
//! Escalated conversations are frozen: no further response is ever
//! published for that item.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::clients::{EscalationClient, EscalationNotice, Reasoner, ReasoningError};
use crate::engine::TaskTracker;
use crate::ledger::{Ledger, LedgerEvent};
use crate::messaging::{Delivery, MessageFabric, MessageType};
use crate::payload;
use crate::tasks::{claim_key, WorkItem};

/// One message in a conversation.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub author: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Dialogue for one work item, keyed by `(project_id, item_id)`.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub project_id: i64,
    pub item_id: i64,
    pub title: String,
    pub body: String,
    pub history: Vec<Utterance>,
    pub last_updated: DateTime<Utc>,
    pub escalated: bool,
    /// Peer ids that have spoken
    pub participants: HashSet<String>,
}

impl Conversation {
    fn new(item: &WorkItem) -> Self {
        Self {
            project_id: item.project_id,
            item_id: item.item_id,
            title: item.title.clone(),
            body: item.body.clone(),
            history: Vec::new(),
            last_updated: Utc::now(),
            escalated: false,
            participants: HashSet::new(),
        }
    }

    fn push(&mut self, author: &str, text: &str) {
        self.history.push(Utterance {
            author: author.to_string(),
            text: text.to_string(),
            timestamp: Utc::now(),
        });
        self.participants.insert(author.to_string());
        self.last_updated = Utc::now();
    }

    fn rendered_history(&self) -> String {
        self.history
            .iter()
            .map(|u| format!("{}: {}", u.author, u.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Escalation predicate: keyword hit in the latest response, or a
/// conversation that has grown past the history cap.
pub fn should_escalate(
    response: &str,
    history_len: usize,
    keywords: &[String],
    limit: usize,
) -> bool {
    let lowered = response.to_lowercase();
    if keywords.iter().any(|k| lowered.contains(&k.to_lowercase())) {
        return true;
    }
    history_len >= limit
}

/// Drives plan review and peer dialogue for this node's claims.
pub struct DiscussionEngine {
    conversations: RwLock<HashMap<String, Conversation>>,
    reasoner: Arc<dyn Reasoner>,
    fabric: Arc<MessageFabric>,
    ledger: Ledger,
    escalation: EscalationClient,
    keywords: Vec<String>,
    conversation_limit: usize,
    node_id: String,
    capabilities: Vec<String>,
    tasks: Arc<TaskTracker>,
}

impl DiscussionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reasoner: Arc<dyn Reasoner>,
        fabric: Arc<MessageFabric>,
        ledger: Ledger,
        escalation: EscalationClient,
        keywords: Vec<String>,
        conversation_limit: usize,
        node_id: String,
        capabilities: Vec<String>,
        tasks: Arc<TaskTracker>,
    ) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            reasoner,
            fabric,
            ledger,
            escalation,
            keywords,
            conversation_limit,
            node_id,
            capabilities,
            tasks,
        }
    }

    /// Open an (empty) conversation for a freshly claimed item.
    pub async fn open_conversation(&self, item: &WorkItem) {
        let mut conversations = self.conversations.write().await;
        conversations
            .entry(item.claim_key())
            .or_insert_with(|| Conversation::new(item));
    }

    /// Generate a plan, record it as the conversation's first utterance, and
    /// publish it for peer review on the item topic and the meta topic.
    pub async fn propose_plan(&self, item: &WorkItem) -> Result<String, ReasoningError> {
        let prompt = format!(
            "You are an autonomous software agent. Create a concise, step-by-step \
             plan to resolve this work item.\nTitle: {}\nBody: {}",
            item.title, item.body
        );
        let plan = self.reasoner.generate(&prompt, None).await?;

        self.open_conversation(item).await;
        {
            let mut conversations = self.conversations.write().await;
            if let Some(convo) = conversations.get_mut(&item.claim_key()) {
                convo.push(&self.node_id, &format!("Plan: {}", plan));
            }
        }

        let _ = self
            .ledger
            .append(
                LedgerEvent::PlanProposed,
                payload! {
                    "item_id" => item.item_id,
                    "project_id" => item.project_id,
                    "plan" => plan.clone(),
                },
            )
            .await;

        let data = payload! {
            "item_id" => item.item_id,
            "project_id" => item.project_id,
            "message" => "Here is my proposed plan of action. What are your thoughts?",
            "plan" => plan.clone(),
        };
        if let Err(e) = self
            .fabric
            .publish_to_item(item.item_id, MessageType::MetaDiscussion, data.clone())
            .await
        {
            warn!(item_id = item.item_id, error = %e, "Failed to publish plan to item topic");
        }
        if let Err(e) = self
            .fabric
            .publish_meta(MessageType::MetaDiscussion, data)
            .await
        {
            warn!(item_id = item.item_id, error = %e, "Failed to publish plan to meta topic");
        }

        info!(item_id = item.item_id, "Plan proposed for peer review");
        Ok(plan)
    }

    /// Whether the item's conversation has been escalated.
    pub async fn is_escalated(&self, key: &str) -> bool {
        let conversations = self.conversations.read().await;
        conversations.get(key).map(|c| c.escalated).unwrap_or(false)
    }

    /// Snapshot of a conversation, for diagnostics.
    pub async fn conversation(&self, key: &str) -> Option<Conversation> {
        let conversations = self.conversations.read().await;
        conversations.get(key).cloned()
    }

    /// Dispatch a meta-class delivery to the matching handler.
    pub async fn handle(&self, delivery: Delivery) {
        match delivery.envelope.kind {
            MessageType::MetaDiscussion => self.handle_discussion(delivery).await,
            MessageType::TaskHelpRequest => self.handle_help_request(delivery).await,
            MessageType::TaskHelpResponse => self.handle_help_response(delivery).await,
            MessageType::EscalationTrigger => self.handle_peer_escalation(delivery).await,
            _ => {}
        }
    }

    /// Peer feedback on one of our conversations: append, respond, or
    /// escalate.
    async fn handle_discussion(&self, delivery: Delivery) {
        let envelope = &delivery.envelope;
        let (Some(project_id), Some(item_id)) =
            (envelope.data_i64("project_id"), envelope.data_i64("item_id"))
        else {
            return;
        };
        let Some(message) = envelope.data_str("message") else {
            return;
        };
        let key = claim_key(project_id, item_id);

        // Record the utterance; an unknown or frozen conversation is ignored.
        let (snapshot, history_len) = {
            let mut conversations = self.conversations.write().await;
            let Some(convo) = conversations.get_mut(&key) else {
                return;
            };
            if convo.escalated {
                return;
            }
            convo.push(&delivery.source, message);
            (convo.clone(), convo.history.len())
        };

        debug!(item = %key, "Peer feedback received, generating response");

        let prompt = format!(
            "You are an autonomous software agent collaborating on a work item.\n\
             Title: {}\nBody: {}\nConversation so far:\n{}\n\n\
             Based on the last message, provide a concise and helpful response.",
            snapshot.title,
            snapshot.body,
            snapshot.rendered_history()
        );

        let response = match self.reasoner.generate(&prompt, None).await {
            Ok(response) => response,
            Err(e) => {
                warn!(item = %key, error = %e, "Failed to generate discussion response");
                return;
            }
        };

        if should_escalate(&response, history_len, &self.keywords, self.conversation_limit) {
            self.escalate(&key, &response).await;
            return;
        }

        let data = payload! {
            "item_id" => item_id,
            "project_id" => project_id,
            "message" => response,
        };
        let result = if delivery.topic == self.fabric.meta_topic() {
            self.fabric.publish_meta(MessageType::MetaDiscussion, data).await
        } else {
            self.fabric
                .publish_to_item(item_id, MessageType::MetaDiscussion, data)
                .await
        };
        if let Err(e) = result {
            warn!(item = %key, error = %e, "Failed to publish discussion response");
        }
    }

    /// Freeze the conversation, record the escalation, notify peers, and
    /// fire the human webhook.
    async fn escalate(&self, key: &str, trigger: &str) {
        let snapshot = {
            let mut conversations = self.conversations.write().await;
            let Some(convo) = conversations.get_mut(key) else {
                return;
            };
            if convo.escalated {
                return;
            }
            convo.escalated = true;
            convo.clone()
        };

        info!(item = %key, "Escalating conversation for human review");

        let _ = self
            .ledger
            .append(
                LedgerEvent::Escalation,
                payload! {
                    "item_id" => snapshot.item_id,
                    "project_id" => snapshot.project_id,
                    "reason" => trigger,
                    "conversation_length" => snapshot.history.len(),
                },
            )
            .await;

        if let Err(e) = self
            .fabric
            .publish_meta(
                MessageType::EscalationTrigger,
                payload! {
                    "item_id" => snapshot.item_id,
                    "project_id" => snapshot.project_id,
                    "message" => "This item has been escalated for human review. \
                                  No further automated action will be taken.",
                    "reason" => trigger,
                },
            )
            .await
        {
            warn!(item = %key, error = %e, "Failed to announce escalation");
        }

        // Fire-and-forget; escalation must not block task progress.
        let escalation = self.escalation.clone();
        let notice = EscalationNotice {
            item_id: snapshot.item_id,
            title: snapshot.title.clone(),
            reason: trigger.to_string(),
            history: snapshot
                .history
                .iter()
                .map(|u| format!("{}: {}", u.author, u.text))
                .collect(),
            escalating_node: self.node_id.clone(),
        };
        tokio::spawn(async move {
            escalation.notify(&notice).await;
        });
    }

    /// A peer asked for help on its item. Offer when we have spare capacity.
    async fn handle_help_request(&self, delivery: Delivery) {
        let envelope = &delivery.envelope;
        let Some(item_id) = envelope.data_i64("item_id") else {
            return;
        };
        let reason = envelope.data_str("reason").unwrap_or_default();

        info!(
            item_id,
            from = %delivery.source,
            reason,
            "Help request received"
        );

        if self.tasks.is_saturated() {
            debug!(item_id, "At capacity, not offering help");
            return;
        }

        let _ = self
            .ledger
            .append(
                LedgerEvent::TaskHelpOffered,
                payload! {
                    "item_id" => item_id,
                    "requester" => delivery.source.clone(),
                },
            )
            .await;

        // Make sure we are on the item topic before answering there.
        if let Err(e) = self.fabric.join_item_topic(item_id).await {
            warn!(item_id, error = %e, "Failed to join item topic for help response");
            return;
        }
        if let Err(e) = self
            .fabric
            .publish_to_item(
                item_id,
                MessageType::TaskHelpResponse,
                payload! {
                    "item_id" => item_id,
                    "can_help" => true,
                    "capabilities" => self.capabilities.clone(),
                },
            )
            .await
        {
            warn!(item_id, error = %e, "Failed to publish help response");
        }
    }

    /// A peer offered help on one of our items. Recorded; no forced
    /// delegation.
    async fn handle_help_response(&self, delivery: Delivery) {
        let envelope = &delivery.envelope;
        let Some(item_id) = envelope.data_i64("item_id") else {
            return;
        };
        if envelope.data.get("can_help").and_then(|v| v.as_bool()) != Some(true) {
            return;
        }

        info!(item_id, helper = %delivery.source, "Help offer received");
        let _ = self
            .ledger
            .append(
                LedgerEvent::TaskHelpReceived,
                payload! {
                    "item_id" => item_id,
                    "helper" => delivery.source.clone(),
                },
            )
            .await;
    }

    /// A peer escalated an item; freeze our copy of that conversation.
    async fn handle_peer_escalation(&self, delivery: Delivery) {
        let envelope = &delivery.envelope;
        let (Some(project_id), Some(item_id)) =
            (envelope.data_i64("project_id"), envelope.data_i64("item_id"))
        else {
            return;
        };
        let key = claim_key(project_id, item_id);
        let mut conversations = self.conversations.write().await;
        if let Some(convo) = conversations.get_mut(&key) {
            convo.escalated = true;
            info!(item = %key, "Conversation frozen after peer escalation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keywords() -> Vec<String> {
        crate::config::DEFAULT_ESCALATION_KEYWORDS
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_keyword_triggers_escalation() {
        assert!(should_escalate(
            "I am STUCK on this migration",
            2,
            &keywords(),
            10
        ));
        assert!(should_escalate(
            "this needs manual intervention by an operator",
            2,
            &keywords(),
            10
        ));
    }

    #[test]
    fn test_history_cap_triggers_escalation() {
        assert!(!should_escalate("looks fine", 9, &keywords(), 10));
        assert!(should_escalate("looks fine", 10, &keywords(), 10));
    }
}
