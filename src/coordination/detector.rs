//! Cross-repository dependency detection
//!
//! Every claimed item (local or announced by a peer) is registered here and
//! pairwise-compared against items from other repositories using an ordered
//! rule table. A match publishes a dependency alert and opens a coordination
//! session between the two claimants.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::messaging::{MessageFabric, MessageType};
use crate::payload;
use crate::tasks::claim_key;

use super::sessions::SessionCoordinator;

/// Advisory confidence attached to every detected dependency.
pub const DEPENDENCY_CONFIDENCE: f64 = 0.8;

/// A claimed item with the context needed for dependency matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub project_id: i64,
    pub item_id: i64,
    pub repository: String,
    pub title: String,
    pub body: String,
    pub claimant: String,
    pub claimed_at: DateTime<Utc>,
}

impl TaskContext {
    pub fn key(&self) -> String {
        claim_key(self.project_id, self.item_id)
    }

    fn text(&self) -> String {
        format!("{} {}", self.title, self.body).to_lowercase()
    }
}

/// A detected relationship between two items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDependency {
    pub item_a: TaskContext,
    pub item_b: TaskContext,
    pub relationship: String,
    pub reason: String,
    pub confidence: f64,
    pub detected_at: DateTime<Utc>,
}

/// A named pattern over two items' text.
pub struct DependencyRule {
    pub name: &'static str,
    pub description: &'static str,
    /// Returns the match reason when the rule fires
    pub predicate: fn(&TaskContext, &TaskContext) -> Option<String>,
}

fn mentions_any(text: &str, words: &[&str]) -> bool {
    words.iter().any(|w| text.contains(w))
}

/// The built-in rule table, applied in order.
pub fn default_rules() -> Vec<DependencyRule> {
    vec![
        DependencyRule {
            name: "API_Contract",
            description: "API definition in one repository, implementation in another",
            predicate: |a, b| {
                let (ta, tb) = (a.text(), b.text());
                if (ta.contains("api") && tb.contains("implement"))
                    || (tb.contains("api") && ta.contains("implement"))
                {
                    Some("API definition and implementation dependency".to_string())
                } else {
                    None
                }
            },
        },
        DependencyRule {
            name: "Database_Schema",
            description: "Schema changes affecting multiple services",
            predicate: |a, b| {
                const WORDS: [&str; 4] = ["database", "schema", "migration", "table"];
                if mentions_any(&a.text(), &WORDS) && mentions_any(&b.text(), &WORDS) {
                    Some("Database schema dependency detected".to_string())
                } else {
                    None
                }
            },
        },
        DependencyRule {
            name: "Configuration_Dependency",
            description: "Configuration changes needing coordinated rollout",
            predicate: |a, b| {
                const WORDS: [&str; 2] = ["config", "environment"];
                if mentions_any(&a.text(), &WORDS) && mentions_any(&b.text(), &WORDS) {
                    Some("Configuration dependency, coordinated changes needed".to_string())
                } else {
                    None
                }
            },
        },
        DependencyRule {
            name: "Security_Compliance",
            description: "Security changes requiring coordinated implementation",
            predicate: |a, b| {
                const WORDS: [&str; 4] = ["security", "auth", "permission", "token"];
                if mentions_any(&a.text(), &WORDS) && mentions_any(&b.text(), &WORDS) {
                    Some("Security implementation requires coordination".to_string())
                } else {
                    None
                }
            },
        },
    ]
}

/// Registry of claimed items and the rule table over them.
pub struct DependencyDetector {
    known: RwLock<HashMap<String, TaskContext>>,
    rules: Vec<DependencyRule>,
    fabric: Arc<MessageFabric>,
    sessions: Arc<SessionCoordinator>,
}

impl DependencyDetector {
    pub fn new(fabric: Arc<MessageFabric>, sessions: Arc<SessionCoordinator>) -> Self {
        Self {
            known: RwLock::new(HashMap::new()),
            rules: default_rules(),
            fabric,
            sessions,
        }
    }

    /// Extend the rule table with a project-specific rule.
    pub fn add_rule(&mut self, rule: DependencyRule) {
        self.rules.push(rule);
    }

    pub async fn known_count(&self) -> usize {
        self.known.read().await.len()
    }

    /// Register a claimed item and compare it against everything known.
    pub async fn register(&self, context: TaskContext) {
        let others: Vec<TaskContext> = {
            let mut known = self.known.write().await;
            known.insert(context.key(), context.clone());
            known
                .values()
                .filter(|other| other.key() != context.key())
                .cloned()
                .collect()
        };

        info!(
            item = %context.key(),
            repository = %context.repository,
            "Registered item for dependency detection"
        );

        for other in others {
            // Same-repository relationships are the single-repo flow's job.
            if other.repository == context.repository {
                continue;
            }
            for rule in &self.rules {
                if let Some(reason) = (rule.predicate)(&context, &other) {
                    let dependency = TaskDependency {
                        item_a: context.clone(),
                        item_b: other.clone(),
                        relationship: rule.name.to_string(),
                        reason,
                        confidence: DEPENDENCY_CONFIDENCE,
                        detected_at: Utc::now(),
                    };
                    self.announce(&dependency).await;
                    self.sessions.open_dependency_session(&dependency).await;
                }
            }
        }
    }

    /// Publish the dependency for every agent on the meta topic.
    async fn announce(&self, dependency: &TaskDependency) {
        info!(
            item_a = %dependency.item_a.key(),
            item_b = %dependency.item_b.key(),
            relationship = %dependency.relationship,
            "Dependency detected"
        );

        let data = payload! {
            "relationship" => dependency.relationship.clone(),
            "reason" => dependency.reason.clone(),
            "confidence" => dependency.confidence,
            "item_a" => dependency.item_a.key(),
            "item_b" => dependency.item_b.key(),
            "repositories" => [
                dependency.item_a.repository.clone(),
                dependency.item_b.repository.clone(),
            ],
            "claimants" => [
                dependency.item_a.claimant.clone(),
                dependency.item_b.claimant.clone(),
            ],
            "detected_at" => dependency.detected_at.timestamp(),
        };

        if let Err(e) = self
            .fabric
            .publish_meta(MessageType::DependencyAlert, data)
            .await
        {
            warn!(error = %e, "Failed to announce dependency");
        }
    }
}
