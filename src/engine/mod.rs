//! Work source and claim engine
//!
//! Polls the tracker for candidate items, filters them against this node's
//! capabilities, attempts the atomic claim, and drives a per-item worker for
//! each claim won. Claim exclusivity is the tracker's job; a conflict just
//! means another node got there first.

pub mod worker;

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clients::{ClaimOutcome, WorkTracker};
use crate::coordination::{DependencyDetector, TaskContext};
use crate::discussion::DiscussionEngine;
use crate::ledger::{Ledger, LedgerEvent};
use crate::messaging::{MessageFabric, MessageType};
use crate::payload;
use crate::tasks::{ItemState, Repository, WorkItem};

pub use worker::{ExecutionOutcome, ItemWorker, SandboxError, SandboxRuntime, WorkerState};

/// Cadence of the repository list refresh.
pub const REPOSITORY_SYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Task types any node will take regardless of its capability list.
const WILDCARD_CAPABILITIES: [&str; 2] = ["general", "task-coordination"];

/// Bounded set of claims this node is currently working.
pub struct TaskTracker {
    max_tasks: usize,
    active: Mutex<HashSet<String>>,
}

impl TaskTracker {
    pub fn new(max_tasks: usize) -> Self {
        Self {
            max_tasks,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Reserve a slot for a claim key. Refuses at the max-task bound and on
    /// duplicates.
    pub fn try_reserve(&self, key: &str) -> bool {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.len() >= self.max_tasks {
            return false;
        }
        active.insert(key.to_string())
    }

    pub fn release(&self, key: &str) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(key);
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn max_tasks(&self) -> usize {
        self.max_tasks
    }

    pub fn is_saturated(&self) -> bool {
        self.active_count() >= self.max_tasks
    }

    pub fn active_keys(&self) -> Vec<String> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

/// Drives repository sync, polling, and claims for one node.
pub struct ClaimEngine {
    tracker: Arc<dyn WorkTracker>,
    fabric: Arc<MessageFabric>,
    ledger: Ledger,
    tasks: Arc<TaskTracker>,
    discussion: Arc<DiscussionEngine>,
    detector: Arc<DependencyDetector>,
    sandbox: Arc<dyn SandboxRuntime>,
    agent_id: String,
    capabilities: Vec<String>,
    poll_interval: Duration,
    repositories: RwLock<HashMap<i64, Repository>>,
}

impl ClaimEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tracker: Arc<dyn WorkTracker>,
        fabric: Arc<MessageFabric>,
        ledger: Ledger,
        tasks: Arc<TaskTracker>,
        discussion: Arc<DiscussionEngine>,
        detector: Arc<DependencyDetector>,
        sandbox: Arc<dyn SandboxRuntime>,
        agent_id: String,
        capabilities: Vec<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            tracker,
            fabric,
            ledger,
            tasks,
            discussion,
            detector,
            sandbox,
            agent_id,
            capabilities,
            poll_interval,
            repositories: RwLock::new(HashMap::new()),
        }
    }

    pub fn tasks(&self) -> &Arc<TaskTracker> {
        &self.tasks
    }

    /// Refresh the active repository list every five minutes.
    pub async fn run_repository_sync(self: Arc<Self>, cancel: CancellationToken) {
        let mut timer = tokio::time::interval(REPOSITORY_SYNC_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {
                    if let Err(e) = self.sync_repositories_once().await {
                        warn!(error = %e, "Repository sync failed");
                    }
                }
            }
        }
        info!("Repository sync stopped");
    }

    /// One pass of the repository refresh; callable directly from tests.
    pub async fn sync_repositories_once(&self) -> Result<(), crate::clients::TrackerError> {
        let listed = self.tracker.active_repositories().await?;

        let mut repos = self.repositories.write().await;
        let current: HashSet<i64> = listed.iter().map(|r| r.project_id).collect();

        for repo in listed {
            if !repos.contains_key(&repo.project_id) {
                info!(
                    project_id = repo.project_id,
                    repository = %repo.slug(),
                    "Added repository"
                );
            }
            repos.insert(repo.project_id, repo);
        }

        repos.retain(|project_id, repo| {
            let keep = current.contains(project_id);
            if !keep {
                info!(
                    project_id = *project_id,
                    repository = %repo.slug(),
                    "Removed inactive repository"
                );
            }
            keep
        });

        debug!(active = repos.len(), "Repository sync complete");
        Ok(())
    }

    /// Poll the tracker on the configured interval.
    pub async fn run_polling(self: Arc<Self>, cancel: CancellationToken) {
        let mut timer = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {
                    if let Err(e) = self.clone().poll_once().await {
                        warn!(error = %e, "Polling pass failed");
                    }
                }
            }
        }
        info!("Polling loop stopped");
    }

    /// One polling pass: gather, filter, pick the top candidate, claim it.
    pub async fn poll_once(self: Arc<Self>) -> Result<(), crate::clients::TrackerError> {
        if self.tasks.is_saturated() {
            debug!("At max task count, skipping poll");
            return Ok(());
        }

        let repos: Vec<Repository> = {
            let repos = self.repositories.read().await;
            repos.values().cloned().collect()
        };
        if repos.is_empty() {
            return Ok(());
        }

        let mut candidates: Vec<WorkItem> = Vec::new();
        for repo in &repos {
            match self.tracker.candidate_items(repo.project_id).await {
                Ok(items) => {
                    for mut item in items {
                        if item.repository.is_empty() {
                            item.repository = repo.slug();
                        }
                        candidates.push(item);
                    }
                }
                Err(e) => {
                    warn!(
                        project_id = repo.project_id,
                        repository = %repo.slug(),
                        error = %e,
                        "Failed to list candidate items"
                    );
                }
            }
        }

        candidates.retain(|item| {
            item.state == ItemState::Open
                && item.assignee.is_none()
                && self.can_handle_task_type(&item.task_type)
        });
        if candidates.is_empty() {
            return Ok(());
        }

        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
        let item = candidates.remove(0);
        self.claim_and_start(item).await;
        Ok(())
    }

    /// Capability filter: explicit match, or one of the wildcard tags.
    pub fn can_handle_task_type(&self, task_type: &str) -> bool {
        self.capabilities.iter().any(|capability| {
            capability == task_type
                || WILDCARD_CAPABILITIES.contains(&capability.as_str())
        })
    }

    /// Attempt the atomic claim and start a worker on success.
    pub async fn claim_and_start(self: Arc<Self>, item: WorkItem) {
        let key = item.claim_key();
        if !self.tasks.try_reserve(&key) {
            return;
        }

        match self
            .tracker
            .claim_item(item.project_id, item.item_id, &self.agent_id)
            .await
        {
            Ok(ClaimOutcome::Accepted) => {}
            Ok(ClaimOutcome::Conflict) => {
                // Another node holds the claim; expected, resume polling.
                debug!(item = %key, "Claim conflict, abandoning item");
                self.tasks.release(&key);
                return;
            }
            Err(e) => {
                warn!(item = %key, error = %e, "Claim attempt failed");
                self.tasks.release(&key);
                return;
            }
        }

        info!(
            item_id = item.item_id,
            repository = %item.repository,
            title = %item.title,
            "Claimed work item"
        );

        let _ = self
            .ledger
            .append(
                LedgerEvent::TaskClaimed,
                payload! {
                    "item_id" => item.item_id,
                    "project_id" => item.project_id,
                    "repository" => item.repository.clone(),
                    "title" => item.title.clone(),
                },
            )
            .await;

        if let Err(e) = self
            .fabric
            .publish_coordination(
                MessageType::TaskClaim,
                payload! {
                    "item_id" => item.item_id,
                    "project_id" => item.project_id,
                    "repository" => item.repository.clone(),
                    "title" => item.title.clone(),
                    "body" => item.body.clone(),
                    "node_id" => self.agent_id.clone(),
                },
            )
            .await
        {
            warn!(error = %e, "Failed to announce claim");
        }

        if let Err(e) = self
            .tracker
            .update_item_status(item.project_id, item.item_id, "claimed", None)
            .await
        {
            warn!(item = %key, error = %e, "Failed to report claim status");
        }

        self.detector
            .register(TaskContext {
                project_id: item.project_id,
                item_id: item.item_id,
                repository: item.repository.clone(),
                title: item.title.clone(),
                body: item.body.clone(),
                claimant: self.agent_id.clone(),
                claimed_at: Utc::now(),
            })
            .await;

        let worker = ItemWorker::new(
            item,
            self.tracker.clone(),
            self.fabric.clone(),
            self.ledger.clone(),
            self.tasks.clone(),
            self.discussion.clone(),
            self.sandbox.clone(),
            self.agent_id.clone(),
        );
        tokio::spawn(worker.run());
    }
}
