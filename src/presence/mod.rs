//! Capability and availability broadcasting
//!
//! Availability is ephemeral and re-broadcast on a fixed cadence; the
//! capability record is persisted to a per-node memo file and re-broadcast
//! only when some axis of it actually changed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clients::ReasoningClient;
use crate::config::AgentConfig;
use crate::engine::TaskTracker;
use crate::ledger::{Ledger, LedgerEvent};
use crate::messaging::{MessageFabric, MessageType};

/// Cadence of availability broadcasts.
pub const AVAILABILITY_INTERVAL: Duration = Duration::from_secs(30);

/// Derived node availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvailabilityStatus {
    Ready,
    Working,
    Busy,
}

/// Ephemeral per-node load snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityRecord {
    pub node_id: String,
    pub status: AvailabilityStatus,
    pub current_task_count: usize,
    pub max_task_count: usize,
    pub available_for_work: bool,
    pub last_activity: i64,
    pub timestamp: i64,
}

impl AvailabilityRecord {
    /// Build the record from current load.
    pub fn derive(node_id: &str, current: usize, max: usize) -> Self {
        let status = if current >= max {
            AvailabilityStatus::Busy
        } else if current > 0 {
            AvailabilityStatus::Working
        } else {
            AvailabilityStatus::Ready
        };
        let now = Utc::now().timestamp();
        Self {
            node_id: node_id.to_string(),
            status,
            current_task_count: current,
            max_task_count: max,
            available_for_work: current < max,
            last_activity: now,
            timestamp: now,
        }
    }
}

/// Why a capability record was re-broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    Startup,
    ModelChange,
    CapabilityChange,
    SpecializationChange,
    UnknownChange,
}

/// Per-node capability snapshot; immutable between broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub node_id: String,
    pub capabilities: Vec<String>,
    pub models: Vec<String>,
    pub specialization: String,
    pub version: String,
}

impl CapabilityRecord {
    pub fn new(node_id: &str, agent: &AgentConfig, models: Vec<String>) -> Self {
        Self {
            node_id: node_id.to_string(),
            capabilities: agent.capabilities.clone(),
            models,
            specialization: agent.specialization.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Determine which axis changed relative to the stored memo.
pub fn change_reason(current: &CapabilityRecord, stored: Option<&CapabilityRecord>) -> ChangeReason {
    let Some(stored) = stored else {
        return ChangeReason::Startup;
    };
    if current.models != stored.models {
        ChangeReason::ModelChange
    } else if current.capabilities != stored.capabilities {
        ChangeReason::CapabilityChange
    } else if current.specialization != stored.specialization {
        ChangeReason::SpecializationChange
    } else {
        ChangeReason::UnknownChange
    }
}

/// Whether any broadcast-relevant field differs from the memo.
pub fn capabilities_changed(current: &CapabilityRecord, stored: Option<&CapabilityRecord>) -> bool {
    match stored {
        None => true,
        Some(stored) => {
            current.capabilities != stored.capabilities
                || current.models != stored.models
                || current.specialization != stored.specialization
        }
    }
}

/// Memo file under the user config directory.
pub fn memo_path(node_id: &str) -> PathBuf {
    let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("synod")
        .join(format!("capabilities-{}.json", node_id))
}

/// Load the last broadcast record, if any.
pub fn load_memo(path: &Path) -> Option<CapabilityRecord> {
    let data = std::fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}

/// Persist the record after a successful broadcast.
pub fn store_memo(path: &Path, record: &CapabilityRecord) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(record)?;
    std::fs::write(path, data)
}

/// Configured models narrowed to what the backend actually has.
///
/// Falls back to the first available model when the intersection is empty.
pub fn effective_models(configured: &[String], available: &[String]) -> Vec<String> {
    let intersection: Vec<String> = configured
        .iter()
        .filter(|m| available.contains(*m))
        .cloned()
        .collect();
    if intersection.is_empty() {
        available.first().cloned().into_iter().collect()
    } else {
        intersection
    }
}

fn to_payload<T: Serialize>(value: &T) -> serde_json::Map<String, serde_json::Value> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    }
}

/// Broadcast the capability record when it differs from the memo.
///
/// Returns whether a broadcast went out; the memo is only rewritten after a
/// successful publish.
pub async fn broadcast_if_changed(
    fabric: &MessageFabric,
    ledger: &Ledger,
    record: &CapabilityRecord,
    memo: &Path,
) -> bool {
    let stored = load_memo(memo);
    if !capabilities_changed(record, stored.as_ref()) {
        info!("Capabilities unchanged since last run");
        return false;
    }

    let reason = change_reason(record, stored.as_ref());
    info!(?reason, "Capabilities changed, broadcasting");

    let mut data = to_payload(record);
    data.insert("reason".to_string(), serde_json::json!(reason));
    data.insert(
        "timestamp".to_string(),
        serde_json::json!(Utc::now().timestamp()),
    );

    if let Err(e) = fabric
        .publish_coordination(MessageType::CapabilityBroadcast, data.clone())
        .await
    {
        warn!(error = %e, "Failed to broadcast capabilities");
        return false;
    }

    let _ = ledger.append(LedgerEvent::CapabilityBroadcast, data).await;

    if let Err(e) = store_memo(memo, record) {
        warn!(error = %e, "Failed to store capability memo");
    }
    true
}

/// Detect available models and broadcast capabilities if they changed.
pub async fn announce_capabilities(
    fabric: &MessageFabric,
    ledger: &Ledger,
    reasoning: &ReasoningClient,
    agent: &AgentConfig,
    node_id: &str,
    memo: &Path,
) -> Vec<String> {
    let models = match reasoning.available_models().await {
        Ok(available) => {
            let models = effective_models(&agent.models, &available);
            if models.is_empty() {
                warn!("Reasoning backend reports no models");
            } else {
                info!(models = ?models, "Available models");
            }
            models
        }
        Err(e) => {
            warn!(error = %e, "Failed to detect models, using configured list");
            agent.models.clone()
        }
    };

    let record = CapabilityRecord::new(node_id, agent, models.clone());
    broadcast_if_changed(fabric, ledger, &record, memo).await;
    models
}

/// Periodic availability broadcaster.
pub struct AvailabilityBroadcaster {
    fabric: Arc<MessageFabric>,
    tasks: Arc<TaskTracker>,
    node_id: String,
}

impl AvailabilityBroadcaster {
    pub fn new(fabric: Arc<MessageFabric>, tasks: Arc<TaskTracker>, node_id: String) -> Self {
        Self {
            fabric,
            tasks,
            node_id,
        }
    }

    /// Publish an availability record every 30 seconds until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut timer = tokio::time::interval(AVAILABILITY_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {
                    let record = AvailabilityRecord::derive(
                        &self.node_id,
                        self.tasks.active_count(),
                        self.tasks.max_tasks(),
                    );
                    if let Err(e) = self
                        .fabric
                        .publish_coordination(
                            MessageType::AvailabilityBroadcast,
                            to_payload(&record),
                        )
                        .await
                    {
                        warn!(error = %e, "Failed to announce availability");
                    }
                }
            }
        }
        info!("Availability broadcaster stopped");
    }
}
