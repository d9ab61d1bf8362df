//! synod-node daemon
//!
//! Wires the subsystems together: transport and discovery, the messaging
//! fabric, the verifiable ledger, presence broadcasting, the claim engine,
//! the meta-discussion engine, and the coordination layer. All long-lived
//! loops share one cancellation token; ctrl-c shuts everything down.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use synod_node::clients::{
    EscalationClient, Reasoner, ReasoningClient, ReasoningConfig, TrackerClient, WorkTracker,
};
use synod_node::config::{Config, LoggingConfig};
use synod_node::coordination::{DependencyDetector, SessionCoordinator};
use synod_node::discussion::DiscussionEngine;
use synod_node::dispatch;
use synod_node::engine::{ClaimEngine, ExecutionOutcome, SandboxError, SandboxRuntime, TaskTracker};
use synod_node::ledger::{Ledger, LedgerEvent};
use synod_node::messaging::MessageFabric;
use synod_node::p2p::{
    build_swarm, short_peer_id, DiscoveryQueue, DiscoveryWorker, NetworkCoordinator, PeerRegistry,
};
use synod_node::payload;
use synod_node::presence::{self, AvailabilityBroadcaster};
use synod_node::tasks::WorkItem;

#[derive(Parser)]
#[command(name = "synod-node")]
#[command(about = "Peer-to-peer coordination fabric for autonomous work agents")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "synod-node.toml")]
    config: String,

    /// Data directory (node key, ledger)
    #[arg(short, long, env = "SYNOD_DATA_DIR")]
    data_dir: Option<String>,

    /// Agent ID (overrides config file)
    #[arg(long, env = "SYNOD_AGENT_ID")]
    agent_id: Option<String>,
}

/// Placeholder runtime until a real sandbox is attached.
///
/// The execution environment is an external collaborator; without one every
/// claimed item ends in a help request instead of silently "succeeding".
struct UnattachedSandbox;

#[async_trait::async_trait]
impl SandboxRuntime for UnattachedSandbox {
    async fn execute(&self, _item: &WorkItem) -> Result<ExecutionOutcome, SandboxError> {
        Err(SandboxError::CapabilityGap(
            "no sandbox runtime attached".to_string(),
        ))
    }
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("synod_node={}", logging.level)));

    let json = logging.structured || logging.format == "json";
    let to_stderr = logging.output == "stderr";

    match (json, to_stderr) {
        (true, true) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init(),
        (true, false) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        (false, true) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        (false, false) => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load or create default config
    let mut config: Config = if std::path::Path::new(&cli.config).exists() {
        let content = std::fs::read_to_string(&cli.config)
            .with_context(|| format!("reading config file {}", cli.config))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", cli.config))?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(agent_id) = cli.agent_id {
        config.agent.id = agent_id;
    }
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = PathBuf::from(data_dir);
    }

    init_tracing(&config.logging)?;

    info!("Starting synod-node");
    info!("Config file: {}", cli.config);

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;

    let cancel = CancellationToken::new();
    let mut tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    // --- Transport ---
    let data_dir = config.node.data_dir.clone();
    let (swarm, keypair) =
        build_swarm(&config.p2p, &data_dir).context("building P2P swarm")?;
    let local_peer_id = swarm.local_peer_id().to_string();

    // Agent identity defaults to the transport peer id.
    if config.agent.id.is_empty() {
        config.agent.id = format!("agent-{}", short_peer_id(&local_peer_id));
    }
    let agent_id = config.agent.id.clone();

    info!("Node ID: {}", short_peer_id(&local_peer_id));
    info!("Agent ID: {}", agent_id);
    info!("Specialization: {}", config.agent.specialization);
    info!("Tracker: {}", config.tracker.base_url);

    // --- Ledger ---
    let ledger = Ledger::open(&data_dir.join("ledger.jsonl"), keypair.clone())
        .context("opening ledger")?;
    ledger
        .append(LedgerEvent::PeerJoined, payload! { "status" => "started" })
        .await
        .context("recording startup")?;

    // --- Swarm loop ---
    let (command_tx, command_rx) = mpsc::channel(256);
    let (event_tx, event_rx) = mpsc::channel(256);
    {
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = swarm.run(command_rx, event_tx) => {}
            }
        }));
    }

    // --- Messaging fabric ---
    let (fabric, receivers) = MessageFabric::new(
        local_peer_id.clone(),
        config.p2p.coordination_topic.clone(),
        config.p2p.meta_topic.clone(),
        command_tx.clone(),
    )
    .await
    .context("initializing messaging fabric")?;
    let fabric = Arc::new(fabric);

    // --- Discovery + peer tracking ---
    let registry = Arc::new(PeerRegistry::new());
    let queue = Arc::new(DiscoveryQueue::new(config.p2p.discovery_queue_depth));

    let discovery = DiscoveryWorker::new(
        queue.clone(),
        registry.clone(),
        command_tx.clone(),
        local_peer_id
            .parse()
            .context("parsing local peer id")?,
        config.discovery_timeout(),
    );
    tasks.push(tokio::spawn(discovery.run(cancel.clone())));

    let coordinator = NetworkCoordinator::new(
        registry.clone(),
        queue.clone(),
        fabric.clone(),
        ledger.clone(),
        local_peer_id.clone(),
    );
    tasks.push(tokio::spawn(coordinator.run(event_rx, cancel.clone())));

    // --- External collaborators ---
    let tracker: Arc<dyn WorkTracker> = Arc::new(TrackerClient::new(
        &config.tracker.base_url,
        config.tracker.api_key.clone(),
        config.tracker_timeout(),
    ));
    match tracker.health().await {
        Ok(()) => info!("Tracker reachable"),
        Err(e) => warn!(error = %e, "Tracker not reachable, continuing in standalone mode"),
    }

    let reasoning = Arc::new(ReasoningClient::new(ReasoningConfig {
        base_url: config.reasoning.base_url.clone(),
        models: config.agent.models.clone(),
        selector_webhook: config.reasoning.model_selection_webhook.clone(),
    }));
    let reasoner: Arc<dyn Reasoner> = reasoning.clone();

    let escalation = EscalationClient::new(config.p2p.escalation_webhook.clone());

    // --- Presence ---
    let task_tracker = Arc::new(TaskTracker::new(config.agent.max_tasks));

    let memo = presence::memo_path(&agent_id);
    let models = presence::announce_capabilities(
        &fabric,
        &ledger,
        &reasoning,
        &config.agent,
        &agent_id,
        &memo,
    )
    .await;
    config.agent.models = models;

    let availability = AvailabilityBroadcaster::new(
        fabric.clone(),
        task_tracker.clone(),
        agent_id.clone(),
    );
    tasks.push(tokio::spawn(availability.run(cancel.clone())));

    // --- Coordination + discussion ---
    let sessions = Arc::new(SessionCoordinator::new(
        fabric.clone(),
        reasoner.clone(),
        ledger.clone(),
    ));
    tasks.push(tokio::spawn(sessions.clone().run_cleanup(cancel.clone())));

    let detector = Arc::new(DependencyDetector::new(fabric.clone(), sessions.clone()));

    let discussion = Arc::new(DiscussionEngine::new(
        reasoner.clone(),
        fabric.clone(),
        ledger.clone(),
        escalation,
        config.escalation_keywords(),
        config.p2p.conversation_limit,
        agent_id.clone(),
        config.agent.capabilities.clone(),
        task_tracker.clone(),
    ));

    // --- Claim engine ---
    let engine = Arc::new(ClaimEngine::new(
        tracker,
        fabric.clone(),
        ledger.clone(),
        task_tracker.clone(),
        discussion.clone(),
        detector.clone(),
        Arc::new(UnattachedSandbox),
        agent_id.clone(),
        config.agent.capabilities.clone(),
        config.poll_interval(),
    ));
    tasks.push(tokio::spawn(
        engine.clone().run_repository_sync(cancel.clone()),
    ));
    tasks.push(tokio::spawn(engine.clone().run_polling(cancel.clone())));

    // --- Topic-class dispatchers ---
    tasks.push(tokio::spawn(dispatch::run_coordination_dispatch(
        receivers.coordination,
        detector.clone(),
        cancel.clone(),
    )));
    tasks.push(tokio::spawn(dispatch::run_meta_dispatch(
        receivers.meta,
        discussion.clone(),
        sessions.clone(),
        cancel.clone(),
    )));

    info!(
        service_tag = %config.p2p.service_tag,
        "Listening for peers on the local network"
    );
    info!("Ready for task coordination and meta-discussion");

    // --- Shutdown ---
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");
    cancel.cancel();

    let _ = tokio::time::timeout(
        Duration::from_secs(5),
        futures::future::join_all(tasks),
    )
    .await;

    Ok(())
}
