//! Work item and repository types shared across the engine, discussion,
//! and coordination modules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A repository registered with the external work tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    /// Tracker-side project identifier
    pub project_id: i64,

    /// Display name
    pub name: String,

    /// Clone URL
    #[serde(default)]
    pub git_url: String,

    /// Repository owner
    pub owner: String,

    /// Repository name
    pub repository: String,

    /// Default branch
    #[serde(default)]
    pub branch: String,

    /// Whether items in this repository may currently be claimed
    #[serde(default)]
    pub ready_to_claim: bool,

    /// Whether the repository is private
    #[serde(default)]
    pub private_repo: bool,
}

impl Repository {
    /// `owner/name` slug used in logs and dependency matching.
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.repository)
    }
}

/// Lifecycle state of a work item on the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Open,
    Claimed,
    Closed,
}

/// A unit of work sourced from the external tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Item number, unique within its project
    pub item_id: i64,

    /// Owning project
    pub project_id: i64,

    pub title: String,

    #[serde(default)]
    pub body: String,

    pub state: ItemState,

    #[serde(default)]
    pub labels: Vec<String>,

    #[serde(default)]
    pub assignee: Option<String>,

    /// Task classification used by the capability filter
    #[serde(default)]
    pub task_type: String,

    /// Higher value claims first
    #[serde(default)]
    pub priority: i64,

    #[serde(default)]
    pub requirements: Vec<String>,

    #[serde(default)]
    pub deliverables: Vec<String>,

    /// Opaque tracker-provided context
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,

    /// `owner/name` slug of the repository this item belongs to
    #[serde(default)]
    pub repository: String,
}

impl WorkItem {
    /// Globally unique claim key for this item.
    pub fn claim_key(&self) -> String {
        claim_key(self.project_id, self.item_id)
    }
}

/// Claim key shared by the engine, discussion, and coordination maps.
pub fn claim_key(project_id: i64, item_id: i64) -> String {
    format!("{}:{}", project_id, item_id)
}

/// A claim held by this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub project_id: i64,
    pub item_id: i64,
    pub claimant_node_id: String,
    pub claimed_at: DateTime<Utc>,
}
