//! libp2p transport configuration
//!
//! Builds the SynodSwarm with multi-transport support (QUIC + TCP/Noise/Yamux),
//! mDNS local discovery, gossipsub messaging, and the identify protocol.
//! The swarm loop owns the swarm; the rest of the node talks to it through
//! command and event channels.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use libp2p::gossipsub::{self, IdentTopic, MessageAuthenticity, ValidationMode};
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{identity, mdns, noise, tcp, yamux, Multiaddr, PeerId, SwarmBuilder, Swarm};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::P2pConfig;

/// Identify protocol id for this network.
pub const IDENTIFY_PROTOCOL: &str = "/synod/id/1.0.0";

/// Combined libp2p behaviour for synod nodes.
#[derive(NetworkBehaviour)]
pub struct SynodBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub mdns: mdns::tokio::Behaviour,
    pub identify: libp2p::identify::Behaviour,
}

/// Events emitted by the swarm for the network coordinator to process.
#[derive(Debug)]
pub enum NodeEvent {
    /// A peer was discovered on the local broadcast domain.
    PeerDiscovered { peer_id: PeerId, addrs: Vec<Multiaddr> },
    /// A discovered peer's advertisement expired.
    PeerExpired { peer_id: PeerId },
    ConnectionEstablished { peer_id: PeerId },
    ConnectionClosed { peer_id: PeerId },
    /// A gossipsub message arrived on a subscribed topic.
    Message {
        topic: String,
        source: Option<PeerId>,
        data: Vec<u8>,
    },
}

/// Commands sent into the swarm loop.
pub enum SwarmCommand {
    /// Dial a peer; the reply fires on establishment or failure.
    Dial {
        peer_id: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { topic: String, data: Vec<u8> },
}

/// Wrapper around the libp2p Swarm with synod-specific helpers.
pub struct SynodSwarm {
    swarm: Swarm<SynodBehaviour>,
    local_peer_id: PeerId,
}

impl SynodSwarm {
    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// Addresses the swarm was asked to listen on.
    pub fn listeners(&self) -> Vec<Multiaddr> {
        self.swarm.listeners().cloned().collect()
    }

    /// Run the swarm event loop until the command channel closes.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<SwarmCommand>,
        events: mpsc::Sender<NodeEvent>,
    ) {
        let mut pending_dials: HashMap<PeerId, oneshot::Sender<Result<(), String>>> =
            HashMap::new();

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command, &mut pending_dials);
                }
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event, &events, &mut pending_dials).await;
                }
            }
        }

        info!("Swarm loop stopped");
    }

    fn handle_command(
        &mut self,
        command: SwarmCommand,
        pending_dials: &mut HashMap<PeerId, oneshot::Sender<Result<(), String>>>,
    ) {
        match command {
            SwarmCommand::Dial {
                peer_id,
                addrs,
                reply,
            } => {
                let opts = DialOpts::peer_id(peer_id).addresses(addrs).build();
                match self.swarm.dial(opts) {
                    Ok(()) => {
                        pending_dials.insert(peer_id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.to_string()));
                    }
                }
            }
            SwarmCommand::Subscribe { topic } => {
                let topic = IdentTopic::new(topic);
                if let Err(e) = self.swarm.behaviour_mut().gossipsub.subscribe(&topic) {
                    warn!(topic = %topic, error = %e, "Subscribe failed");
                }
            }
            SwarmCommand::Unsubscribe { topic } => {
                let topic = IdentTopic::new(topic);
                let _ = self.swarm.behaviour_mut().gossipsub.unsubscribe(&topic);
            }
            SwarmCommand::Publish { topic, data } => {
                let topic = IdentTopic::new(topic);
                match self.swarm.behaviour_mut().gossipsub.publish(topic.clone(), data) {
                    Ok(_) => {}
                    Err(gossipsub::PublishError::InsufficientPeers) => {
                        // Normal while alone on the network.
                        debug!(topic = %topic, "No peers subscribed yet");
                    }
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "Publish failed");
                    }
                }
            }
        }
    }

    async fn handle_swarm_event(
        &mut self,
        event: libp2p::swarm::SwarmEvent<SynodBehaviourEvent>,
        events: &mpsc::Sender<NodeEvent>,
        pending_dials: &mut HashMap<PeerId, oneshot::Sender<Result<(), String>>>,
    ) {
        use libp2p::swarm::SwarmEvent as LibSwarmEvent;

        match event {
            // mDNS discovery
            LibSwarmEvent::Behaviour(SynodBehaviourEvent::Mdns(mdns::Event::Discovered(
                peers,
            ))) => {
                let mut by_peer: HashMap<PeerId, Vec<Multiaddr>> = HashMap::new();
                for (peer_id, addr) in peers {
                    by_peer.entry(peer_id).or_default().push(addr);
                }
                for (peer_id, addrs) in by_peer {
                    debug!(%peer_id, "mDNS: peer discovered");
                    let _ = events
                        .send(NodeEvent::PeerDiscovered { peer_id, addrs })
                        .await;
                }
            }
            LibSwarmEvent::Behaviour(SynodBehaviourEvent::Mdns(mdns::Event::Expired(peers))) => {
                for (peer_id, _addr) in peers {
                    debug!(%peer_id, "mDNS: peer expired");
                    let _ = events.send(NodeEvent::PeerExpired { peer_id }).await;
                }
            }

            // Gossipsub messages; Strict validation already rejected anything
            // unsigned or unverifiable.
            LibSwarmEvent::Behaviour(SynodBehaviourEvent::Gossipsub(
                gossipsub::Event::Message { message, .. },
            )) => {
                let _ = events
                    .send(NodeEvent::Message {
                        topic: message.topic.into_string(),
                        source: message.source,
                        data: message.data,
                    })
                    .await;
            }

            // Identify events (log only)
            LibSwarmEvent::Behaviour(SynodBehaviourEvent::Identify(
                libp2p::identify::Event::Received { peer_id, info, .. },
            )) => {
                debug!(%peer_id, agent = %info.agent_version, "Identified peer");
            }

            // Connection events
            LibSwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "Listening on");
            }
            LibSwarmEvent::ConnectionEstablished { peer_id, .. } => {
                if let Some(reply) = pending_dials.remove(&peer_id) {
                    let _ = reply.send(Ok(()));
                }
                let _ = events
                    .send(NodeEvent::ConnectionEstablished { peer_id })
                    .await;
            }
            LibSwarmEvent::ConnectionClosed { peer_id, .. } => {
                let _ = events.send(NodeEvent::ConnectionClosed { peer_id }).await;
            }
            LibSwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                if let Some(peer_id) = peer_id {
                    if let Some(reply) = pending_dials.remove(&peer_id) {
                        let _ = reply.send(Err(error.to_string()));
                    }
                }
            }

            _ => {}
        }
    }
}

/// Build the libp2p swarm from config.
///
/// Creates or loads an Ed25519 identity keypair, configures transports, and
/// constructs the composite behaviour. Gossipsub runs with mandatory message
/// signing and strict signature verification.
pub fn build_swarm(config: &P2pConfig, data_dir: &Path) -> Result<(SynodSwarm, identity::Keypair)> {
    let keypair = load_or_generate_keypair(data_dir)?;
    let local_peer_id = PeerId::from(keypair.public());
    info!(%local_peer_id, "Node identity");

    let swarm = SwarmBuilder::with_existing_identity(keypair.clone())
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .context("TCP transport")?
        .with_quic()
        .with_behaviour(move |key| {
            // Deduplicate by content so replayed envelopes collapse.
            let message_id_fn = |message: &gossipsub::Message| {
                let mut hasher = Sha256::new();
                if let Some(source) = &message.source {
                    hasher.update(source.to_bytes());
                }
                hasher.update(&message.data);
                gossipsub::MessageId::from(hex::encode(hasher.finalize()))
            };

            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .validation_mode(ValidationMode::Strict)
                .message_id_fn(message_id_fn)
                .build()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

            let gossipsub = gossipsub::Behaviour::new(
                MessageAuthenticity::Signed(key.clone()),
                gossipsub_config,
            )
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

            let mdns = mdns::tokio::Behaviour::new(
                mdns::Config::default(),
                key.public().to_peer_id(),
            )?;

            let identify = libp2p::identify::Behaviour::new(
                libp2p::identify::Config::new(IDENTIFY_PROTOCOL.to_string(), key.public())
                    .with_agent_version(format!("synod-node/{}", env!("CARGO_PKG_VERSION"))),
            );

            Ok(SynodBehaviour {
                gossipsub,
                mdns,
                identify,
            })
        })
        .context("swarm behaviour")?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    let mut synod_swarm = SynodSwarm {
        swarm,
        local_peer_id,
    };

    for addr_str in &config.listen_addrs {
        let addr: Multiaddr = addr_str
            .parse()
            .with_context(|| format!("invalid listen address: {}", addr_str))?;
        synod_swarm
            .swarm
            .listen_on(addr)
            .with_context(|| format!("failed to listen on {}", addr_str))?;
    }

    Ok((synod_swarm, keypair))
}

/// Load an Ed25519 keypair from disk, or generate and persist a new one.
///
/// The keypair is stored as protobuf-encoded bytes at `{data_dir}/node_key`.
pub fn load_or_generate_keypair(data_dir: &Path) -> Result<identity::Keypair> {
    let key_path = data_dir.join("node_key");

    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("reading node key")?;
        let keypair =
            identity::Keypair::from_protobuf_encoding(&bytes).context("decoding node key")?;
        info!("Loaded existing node identity");
        Ok(keypair)
    } else {
        let keypair = identity::Keypair::generate_ed25519();
        std::fs::create_dir_all(data_dir).context("creating data directory")?;
        let bytes = keypair
            .to_protobuf_encoding()
            .context("encoding node key")?;
        std::fs::write(&key_path, &bytes).context("writing node key")?;
        info!("Generated new node identity");
        Ok(keypair)
    }
}

/// Shortened peer id for log lines (last 8 characters of the base58 form).
pub fn short_peer_id(peer_id: &str) -> &str {
    let len = peer_id.len();
    if len <= 8 {
        peer_id
    } else {
        &peer_id[len - 8..]
    }
}
