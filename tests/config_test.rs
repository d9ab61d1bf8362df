//! Config loading and defaults integration tests

use synod_node::config::Config;

/// Verify that a minimal config parses and picks up every default.
#[test]
fn test_minimal_config_uses_defaults() {
    let toml_str = r#"
[tracker]
base_url = "https://workboard.example.net"
"#;

    let config: Config = toml::from_str(toml_str).expect("valid TOML");

    assert_eq!(config.tracker.base_url, "https://workboard.example.net");
    assert_eq!(config.tracker.timeout_secs, 30);
    assert_eq!(config.tracker.retry_count, 3);
    assert_eq!(config.agent.max_tasks, 3);
    assert_eq!(config.agent.poll_interval_secs, 30);
    assert!(config.agent.capabilities.contains(&"general".to_string()));
    assert_eq!(config.p2p.service_tag, "synod-peer-discovery");
    assert_eq!(config.p2p.coordination_topic, "synod/coordination/v1");
    assert_eq!(config.p2p.meta_topic, "synod/meta-discussion/v1");
    assert_eq!(config.p2p.discovery_timeout_secs, 10);
    assert_eq!(config.p2p.conversation_limit, 10);
    assert_eq!(config.logging.level, "info");

    assert!(config.validate().is_ok());
}

#[test]
fn test_config_with_all_fields() {
    let toml_str = r#"
[node]
data_dir = "/tmp/synod-test"

[tracker]
base_url = "https://workboard.example.net"
api_key = "secret123"
timeout_secs = 10
retry_count = 5

[agent]
id = "agent-7"
capabilities = ["rust", "docs"]
models = ["phi3"]
specialization = "backend"
poll_interval_secs = 15
max_tasks = 2

[reasoning]
base_url = "http://127.0.0.1:11434"
model_selection_webhook = "https://selector.example.net/pick"

[p2p]
service_tag = "custom-discovery"
coordination_topic = "custom/coordination/v1"
meta_topic = "custom/meta/v1"
discovery_timeout_secs = 5
escalation_webhook = "https://hooks.example.net/escalate"
escalation_keywords = ["blocked", "defer to human"]
conversation_limit = 6

[logging]
level = "debug"
format = "json"
output = "stderr"
structured = true
"#;

    let config: Config = toml::from_str(toml_str).expect("valid TOML");

    assert_eq!(config.node.data_dir.to_str().unwrap(), "/tmp/synod-test");
    assert_eq!(config.tracker.api_key.as_deref(), Some("secret123"));
    assert_eq!(config.agent.id, "agent-7");
    assert_eq!(config.agent.max_tasks, 2);
    assert_eq!(
        config.reasoning.model_selection_webhook.as_deref(),
        Some("https://selector.example.net/pick")
    );
    assert_eq!(config.p2p.conversation_limit, 6);
    assert_eq!(
        config.p2p.escalation_webhook.as_deref(),
        Some("https://hooks.example.net/escalate")
    );
    assert!(config.logging.structured);

    // Configured keywords replace the defaults entirely.
    let keywords = config.escalation_keywords();
    assert_eq!(keywords, vec!["blocked".to_string(), "defer to human".to_string()]);

    assert!(config.validate().is_ok());
}

#[test]
fn test_validation_rejects_missing_tracker() {
    let config: Config = toml::from_str("").expect("empty config parses");
    let err = config.validate().unwrap_err();
    assert!(err.contains("tracker.base_url"));
}

#[test]
fn test_validation_rejects_zero_bounds() {
    let toml_str = r#"
[tracker]
base_url = "https://workboard.example.net"

[agent]
max_tasks = 0
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert!(config.validate().unwrap_err().contains("max_tasks"));

    let toml_str = r#"
[tracker]
base_url = "https://workboard.example.net"

[agent]
poll_interval_secs = 0
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert!(config
        .validate()
        .unwrap_err()
        .contains("poll_interval_secs"));
}

#[test]
fn test_validation_rejects_empty_capabilities() {
    let toml_str = r#"
[tracker]
base_url = "https://workboard.example.net"

[agent]
capabilities = []
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert!(config.validate().unwrap_err().contains("capabilities"));
}

#[test]
fn test_invalid_toml_returns_error() {
    let bad_toml = "this is not valid { toml }}}";
    let result: Result<Config, _> = toml::from_str(bad_toml);
    assert!(result.is_err(), "Invalid TOML should produce an error");
}
