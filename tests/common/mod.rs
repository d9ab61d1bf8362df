//! Shared fixtures for integration tests: mock tracker, scripted reasoner,
//! mock sandbox, a loopback fabric harness, and a tiny webhook capture
//! server.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use synod_node::clients::{ClaimOutcome, Reasoner, ReasoningError, TrackerError, WorkTracker};
use synod_node::engine::{ExecutionOutcome, SandboxError, SandboxRuntime};
use synod_node::messaging::{Envelope, FabricReceivers, MessageFabric};
use synod_node::p2p::SwarmCommand;
use synod_node::tasks::{ItemState, Repository, WorkItem};

pub fn repository(project_id: i64, owner: &str, name: &str) -> Repository {
    Repository {
        project_id,
        name: name.to_string(),
        git_url: format!("https://git.example.net/{}/{}.git", owner, name),
        owner: owner.to_string(),
        repository: name.to_string(),
        branch: "main".to_string(),
        ready_to_claim: true,
        private_repo: false,
    }
}

pub fn work_item(project_id: i64, item_id: i64, title: &str, task_type: &str) -> WorkItem {
    WorkItem {
        item_id,
        project_id,
        title: title.to_string(),
        body: String::new(),
        state: ItemState::Open,
        labels: Vec::new(),
        assignee: None,
        task_type: task_type.to_string(),
        priority: 1,
        requirements: Vec::new(),
        deliverables: Vec::new(),
        context: serde_json::Map::new(),
        repository: String::new(),
    }
}

/// Tracker double with exclusive-claim semantics: the first claim for a key
/// wins, every later one conflicts.
pub struct MockTracker {
    repositories: Vec<Repository>,
    items: Mutex<HashMap<i64, Vec<WorkItem>>>,
    claims: Mutex<HashSet<String>>,
    pub claim_requests: Mutex<Vec<(i64, i64, String)>>,
    pub status_updates: Mutex<Vec<(i64, i64, String)>>,
}

impl MockTracker {
    pub fn new(repositories: Vec<Repository>, items: Vec<WorkItem>) -> Self {
        let mut by_project: HashMap<i64, Vec<WorkItem>> = HashMap::new();
        for item in items {
            by_project.entry(item.project_id).or_default().push(item);
        }
        Self {
            repositories,
            items: Mutex::new(by_project),
            claims: Mutex::new(HashSet::new()),
            claim_requests: Mutex::new(Vec::new()),
            status_updates: Mutex::new(Vec::new()),
        }
    }

    pub fn statuses_for(&self, project_id: i64, item_id: i64) -> Vec<String> {
        self.status_updates
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, i, _)| *p == project_id && *i == item_id)
            .map(|(_, _, status)| status.clone())
            .collect()
    }
}

#[async_trait]
impl WorkTracker for MockTracker {
    async fn active_repositories(&self) -> Result<Vec<Repository>, TrackerError> {
        Ok(self.repositories.clone())
    }

    async fn candidate_items(&self, project_id: i64) -> Result<Vec<WorkItem>, TrackerError> {
        Ok(self
            .items
            .lock()
            .unwrap()
            .get(&project_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn claim_item(
        &self,
        project_id: i64,
        item_id: i64,
        claimant: &str,
    ) -> Result<ClaimOutcome, TrackerError> {
        self.claim_requests
            .lock()
            .unwrap()
            .push((project_id, item_id, claimant.to_string()));

        let key = format!("{}:{}", project_id, item_id);
        let mut claims = self.claims.lock().unwrap();
        if claims.insert(key) {
            Ok(ClaimOutcome::Accepted)
        } else {
            Ok(ClaimOutcome::Conflict)
        }
    }

    async fn update_item_status(
        &self,
        project_id: i64,
        item_id: i64,
        status: &str,
        _results: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<(), TrackerError> {
        self.status_updates
            .lock()
            .unwrap()
            .push((project_id, item_id, status.to_string()));
        Ok(())
    }

    async fn health(&self) -> Result<(), TrackerError> {
        Ok(())
    }
}

/// Reasoner double that replays scripted responses, then a fixed filler.
pub struct ScriptedReasoner {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedReasoner {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(str::to_string).collect()),
        }
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn generate(
        &self,
        _prompt: &str,
        _model: Option<&str>,
    ) -> Result<String, ReasoningError> {
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "Proceeding as planned.".to_string()))
    }
}

/// Sandbox double.
pub enum MockSandbox {
    Succeed { branch: String },
    Fail,
    CapabilityGap,
    /// Never finishes; holds the worker's claim slot open.
    Block,
}

#[async_trait]
impl SandboxRuntime for MockSandbox {
    async fn execute(&self, item: &WorkItem) -> Result<ExecutionOutcome, SandboxError> {
        match self {
            MockSandbox::Succeed { branch } => Ok(ExecutionOutcome {
                branch_name: branch.clone(),
                summary: serde_json::Map::new(),
            }),
            MockSandbox::Fail => Err(SandboxError::Failed(format!(
                "execution failed for item {}",
                item.item_id
            ))),
            MockSandbox::CapabilityGap => Err(SandboxError::CapabilityGap(
                "missing toolchain".to_string(),
            )),
            MockSandbox::Block => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

/// Fabric wired to an inspectable command channel instead of a live swarm.
pub struct FabricHarness {
    pub fabric: Arc<MessageFabric>,
    pub receivers: FabricReceivers,
    pub commands: mpsc::Receiver<SwarmCommand>,
}

pub async fn fabric_harness(local_peer_id: &str) -> FabricHarness {
    let (tx, rx) = mpsc::channel(1024);
    let (fabric, receivers) = MessageFabric::new(
        local_peer_id.to_string(),
        "synod/coordination/v1".to_string(),
        "synod/meta-discussion/v1".to_string(),
        tx,
    )
    .await
    .expect("fabric");
    FabricHarness {
        fabric: Arc::new(fabric),
        receivers,
        commands: rx,
    }
}

/// Drain every envelope published so far as `(topic, envelope)` pairs.
pub fn published(commands: &mut mpsc::Receiver<SwarmCommand>) -> Vec<(String, Envelope)> {
    let mut out = Vec::new();
    while let Ok(command) = commands.try_recv() {
        if let SwarmCommand::Publish { topic, data } = command {
            out.push((topic, Envelope::decode(&data).expect("published envelope")));
        }
    }
    out
}

/// One-shot HTTP capture server: accepts a single request, replies 200, and
/// hands the body to the caller.
pub async fn webhook_capture() -> (String, tokio::sync::oneshot::Receiver<String>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (tx, rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };

        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let body = loop {
            let Ok(n) = stream.read(&mut chunk).await else {
                return;
            };
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);

            let Some(split) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let header_end = split + 4;
            let headers = String::from_utf8_lossy(&buf[..split]).to_lowercase();
            let content_length = headers
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);

            while buf.len() < header_end + content_length {
                let Ok(n) = stream.read(&mut chunk).await else {
                    return;
                };
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            break String::from_utf8_lossy(&buf[header_end..header_end + content_length])
                .to_string();
        };

        let _ = stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
            .await;
        let _ = tx.send(body);
    });

    (format!("http://{}", addr), rx)
}
