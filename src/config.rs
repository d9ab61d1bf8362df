//! Node configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub reasoning: ReasoningSection,
    #[serde(default)]
    pub p2p: P2pConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Data directory (node key, ledger)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Work tracker integration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub base_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-request deadline in seconds
    #[serde(default = "default_tracker_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
}

/// Agent identity and workload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent identity; derived from the transport peer id when empty
    #[serde(default)]
    pub id: String,

    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,

    #[serde(default = "default_models")]
    pub models: Vec<String>,

    #[serde(default = "default_specialization")]
    pub specialization: String,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
}

/// Reasoning backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningSection {
    #[serde(default = "default_reasoning_url")]
    pub base_url: String,

    /// Remote model-selector webhook; first configured model is used when
    /// unset or unreachable
    #[serde(default)]
    pub model_selection_webhook: Option<String>,
}

/// P2P networking and meta-discussion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    #[serde(default = "default_service_tag")]
    pub service_tag: String,

    #[serde(default = "default_coordination_topic")]
    pub coordination_topic: String,

    #[serde(default = "default_meta_topic")]
    pub meta_topic: String,

    /// Per-peer connect deadline in seconds
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_secs: u64,

    /// Depth of the bounded discovery queue
    #[serde(default = "default_discovery_queue_depth")]
    pub discovery_queue_depth: usize,

    #[serde(default = "default_listen_addrs")]
    pub listen_addrs: Vec<String>,

    /// Human escalation webhook endpoint
    #[serde(default)]
    pub escalation_webhook: Option<String>,

    /// Non-empty list replaces the built-in escalation keywords
    #[serde(default)]
    pub escalation_keywords: Vec<String>,

    /// Conversation length that forces escalation
    #[serde(default = "default_conversation_limit")]
    pub conversation_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// "stdout" or "stderr"
    #[serde(default = "default_log_output")]
    pub output: String,

    #[serde(default)]
    pub structured: bool,
}

// Defaults
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/synod")
}
fn default_tracker_timeout() -> u64 {
    30
}
fn default_retry_count() -> u32 {
    3
}
fn default_capabilities() -> Vec<String> {
    vec![
        "general".to_string(),
        "reasoning".to_string(),
        "task-coordination".to_string(),
    ]
}
fn default_models() -> Vec<String> {
    vec!["phi3".to_string(), "llama3.1".to_string()]
}
fn default_specialization() -> String {
    "general_developer".to_string()
}
fn default_poll_interval() -> u64 {
    30
}
fn default_max_tasks() -> usize {
    3
}
fn default_reasoning_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_service_tag() -> String {
    "synod-peer-discovery".to_string()
}
fn default_coordination_topic() -> String {
    "synod/coordination/v1".to_string()
}
fn default_meta_topic() -> String {
    "synod/meta-discussion/v1".to_string()
}
fn default_discovery_timeout() -> u64 {
    10
}
fn default_discovery_queue_depth() -> usize {
    16
}
fn default_listen_addrs() -> Vec<String> {
    vec![
        "/ip4/0.0.0.0/tcp/0".to_string(),
        "/ip6/::/tcp/0".to_string(),
    ]
}
fn default_conversation_limit() -> usize {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}
fn default_log_output() -> String {
    "stdout".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            timeout_secs: default_tracker_timeout(),
            retry_count: default_retry_count(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            capabilities: default_capabilities(),
            models: default_models(),
            specialization: default_specialization(),
            poll_interval_secs: default_poll_interval(),
            max_tasks: default_max_tasks(),
        }
    }
}

impl Default for ReasoningSection {
    fn default() -> Self {
        Self {
            base_url: default_reasoning_url(),
            model_selection_webhook: None,
        }
    }
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            service_tag: default_service_tag(),
            coordination_topic: default_coordination_topic(),
            meta_topic: default_meta_topic(),
            discovery_timeout_secs: default_discovery_timeout(),
            discovery_queue_depth: default_discovery_queue_depth(),
            listen_addrs: default_listen_addrs(),
            escalation_webhook: None,
            escalation_keywords: Vec::new(),
            conversation_limit: default_conversation_limit(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            output: default_log_output(),
            structured: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            tracker: TrackerConfig::default(),
            agent: AgentConfig::default(),
            reasoning: ReasoningSection::default(),
            p2p: P2pConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Escalation keywords used when the config does not override them.
pub const DEFAULT_ESCALATION_KEYWORDS: [&str; 6] = [
    "stuck",
    "help",
    "human",
    "escalate",
    "clarification needed",
    "manual intervention",
];

impl Config {
    /// Fatal-at-startup validation of mandatory fields.
    pub fn validate(&self) -> Result<(), String> {
        if self.tracker.base_url.is_empty() {
            return Err("tracker.base_url is required".to_string());
        }
        if self.agent.capabilities.is_empty() {
            return Err("agent.capabilities cannot be empty".to_string());
        }
        if self.agent.poll_interval_secs == 0 {
            return Err("agent.poll_interval_secs must be positive".to_string());
        }
        if self.agent.max_tasks == 0 {
            return Err("agent.max_tasks must be positive".to_string());
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.agent.poll_interval_secs)
    }

    pub fn tracker_timeout(&self) -> Duration {
        Duration::from_secs(self.tracker.timeout_secs)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.p2p.discovery_timeout_secs)
    }

    /// Effective escalation keywords: a non-empty config list replaces the
    /// defaults.
    pub fn escalation_keywords(&self) -> Vec<String> {
        if self.p2p.escalation_keywords.is_empty() {
            DEFAULT_ESCALATION_KEYWORDS
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            self.p2p.escalation_keywords.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config: Config = toml::from_str(
            r#"
[tracker]
base_url = "https://tracker.example.net"
"#,
        )
        .unwrap();

        assert_eq!(config.agent.max_tasks, 3);
        assert_eq!(config.agent.poll_interval_secs, 30);
        assert_eq!(config.p2p.coordination_topic, "synod/coordination/v1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_tracker_url_is_fatal() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_keyword_override_replaces_defaults() {
        let mut config = Config::default();
        assert!(config
            .escalation_keywords()
            .contains(&"manual intervention".to_string()));

        config.p2p.escalation_keywords = vec!["blocked".to_string()];
        assert_eq!(config.escalation_keywords(), vec!["blocked".to_string()]);
    }
}
