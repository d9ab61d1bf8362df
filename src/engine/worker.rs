//! Per-item worker state machine
//!
//! Each claimed item gets one worker:
//! `claimed → planning → executing → (completing | help_requested | escalated)
//! → (pr_created | abandoned)`. Terminal states record the outcome in the
//! ledger, report it to the tracker, leave the item topic, and release the
//! claim slot.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::clients::WorkTracker;
use crate::discussion::DiscussionEngine;
use crate::ledger::{Ledger, LedgerEvent};
use crate::messaging::{MessageFabric, MessageType};
use crate::payload;
use crate::tasks::WorkItem;

/// States a worker moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Discovered,
    ClaimAttempt,
    Claimed,
    Planning,
    Executing,
    Completing,
    HelpRequested,
    Escalated,
    PrCreated,
    Abandoned,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The runtime cannot handle this item; triggers a help request.
    #[error("insufficient capability: {0}")]
    CapabilityGap(String),

    #[error("execution failed: {0}")]
    Failed(String),
}

/// Result of a successful sandbox run.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Branch the change landed on
    pub branch_name: String,
    /// Opaque details forwarded to the tracker's status endpoint
    pub summary: serde_json::Map<String, serde_json::Value>,
}

/// Opaque seam to the sandboxed execution runtime.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    async fn execute(&self, item: &WorkItem) -> Result<ExecutionOutcome, SandboxError>;
}

/// Worker for one claimed item.
pub struct ItemWorker {
    item: WorkItem,
    tracker: Arc<dyn WorkTracker>,
    fabric: Arc<MessageFabric>,
    ledger: Ledger,
    tasks: Arc<super::TaskTracker>,
    discussion: Arc<DiscussionEngine>,
    sandbox: Arc<dyn SandboxRuntime>,
    agent_id: String,
    state: WorkerState,
}

impl ItemWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        item: WorkItem,
        tracker: Arc<dyn WorkTracker>,
        fabric: Arc<MessageFabric>,
        ledger: Ledger,
        tasks: Arc<super::TaskTracker>,
        discussion: Arc<DiscussionEngine>,
        sandbox: Arc<dyn SandboxRuntime>,
        agent_id: String,
    ) -> Self {
        Self {
            item,
            tracker,
            fabric,
            ledger,
            tasks,
            discussion,
            sandbox,
            agent_id,
            state: WorkerState::Claimed,
        }
    }

    fn transition(&mut self, to: WorkerState) {
        debug!(
            item_id = self.item.item_id,
            from = ?self.state,
            to = ?to,
            "Worker transition"
        );
        self.state = to;
    }

    /// Drive the item to a terminal state.
    pub async fn run(mut self) {
        let key = self.item.claim_key();

        if let Err(e) = self.fabric.join_item_topic(self.item.item_id).await {
            warn!(item = %key, error = %e, "Failed to join item topic");
        }

        let terminal = self.work().await;

        self.fabric.leave_item_topic(self.item.item_id).await;
        self.tasks.release(&key);
        info!(item = %key, state = ?terminal, "Worker finished");
    }

    async fn work(&mut self) -> WorkerState {
        // Planning: propose a plan and open the item's conversation.
        self.transition(WorkerState::Planning);
        if let Err(e) = self.discussion.propose_plan(&self.item).await {
            warn!(
                item_id = self.item.item_id,
                error = %e,
                "Plan generation failed, requesting help"
            );
            self.request_help(&format!("plan generation failed: {}", e))
                .await;
            return self.abandon("abandoned", "insufficient capability for planning").await;
        }

        // Peer review may have escalated the conversation while we waited.
        if self.discussion.is_escalated(&self.item.claim_key()).await {
            self.transition(WorkerState::Escalated);
            let _ = self
                .tracker
                .update_item_status(self.item.project_id, self.item.item_id, "escalated", None)
                .await;
            return WorkerState::Escalated;
        }

        // Executing: hand off to the sandboxed runtime.
        self.transition(WorkerState::Executing);
        match self.sandbox.execute(&self.item).await {
            Ok(outcome) => {
                self.transition(WorkerState::Completing);
                self.complete(outcome).await;
                self.transition(WorkerState::PrCreated);
                WorkerState::PrCreated
            }
            Err(SandboxError::CapabilityGap(reason)) => {
                self.request_help(&reason).await;
                self.abandon("abandoned", &reason).await
            }
            Err(SandboxError::Failed(reason)) => {
                warn!(
                    item_id = self.item.item_id,
                    reason = %reason,
                    "Execution failed"
                );
                self.abandon("failed", &reason).await
            }
        }
    }

    /// Open a pull-request-equivalent via the tracker and record completion.
    async fn complete(&self, outcome: ExecutionOutcome) {
        let _ = self
            .ledger
            .append(
                LedgerEvent::TaskCompleted,
                payload! {
                    "item_id" => self.item.item_id,
                    "project_id" => self.item.project_id,
                    "branch_name" => outcome.branch_name.clone(),
                },
            )
            .await;

        let mut results = outcome.summary.clone();
        results.insert(
            "branch_name".to_string(),
            serde_json::json!(outcome.branch_name),
        );

        if let Err(e) = self
            .tracker
            .update_item_status(
                self.item.project_id,
                self.item.item_id,
                "completed",
                Some(results),
            )
            .await
        {
            warn!(item_id = self.item.item_id, error = %e, "Failed to report completion");
        }

        if let Err(e) = self
            .fabric
            .publish_coordination(
                MessageType::TaskComplete,
                payload! {
                    "item_id" => self.item.item_id,
                    "project_id" => self.item.project_id,
                    "node_id" => self.agent_id.clone(),
                    "branch_name" => outcome.branch_name,
                },
            )
            .await
        {
            warn!(error = %e, "Failed to announce completion");
        }
    }

    /// Publish a help request on the item topic.
    async fn request_help(&mut self, reason: &str) {
        self.transition(WorkerState::HelpRequested);

        let _ = self
            .ledger
            .append(
                LedgerEvent::TaskHelpRequested,
                payload! {
                    "item_id" => self.item.item_id,
                    "reason" => reason,
                },
            )
            .await;

        if let Err(e) = self
            .fabric
            .publish_to_item(
                self.item.item_id,
                MessageType::TaskHelpRequest,
                payload! {
                    "item_id" => self.item.item_id,
                    "repository" => self.item.repository.clone(),
                    "reason" => reason,
                },
            )
            .await
        {
            warn!(item_id = self.item.item_id, error = %e, "Failed to publish help request");
        }
    }

    async fn abandon(&mut self, status: &str, reason: &str) -> WorkerState {
        let _ = self
            .ledger
            .append(
                LedgerEvent::TaskFailed,
                payload! {
                    "item_id" => self.item.item_id,
                    "project_id" => self.item.project_id,
                    "reason" => reason,
                },
            )
            .await;

        if let Err(e) = self
            .tracker
            .update_item_status(self.item.project_id, self.item.item_id, status, None)
            .await
        {
            warn!(item_id = self.item.item_id, error = %e, "Failed to report terminal status");
        }

        self.transition(WorkerState::Abandoned);
        WorkerState::Abandoned
    }
}
