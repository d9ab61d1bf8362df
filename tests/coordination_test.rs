//! Dependency detection and coordination session tests
//!
//! Cross-repository rule matching, session lifecycle, consensus resolution,
//! bounded escalation, and cleanup.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use libp2p::identity::Keypair;
use tokio::sync::mpsc;

use common::*;
use synod_node::clients::Reasoner;
use synod_node::coordination::{
    CoordinationSession, DependencyDetector, Participant, SessionCoordinator, SessionStatus,
    SessionType,
};
use synod_node::coordination::detector::TaskContext;
use synod_node::ledger::{Ledger, LedgerEvent};
use synod_node::messaging::{Delivery, Envelope, FabricReceivers, MessageType};
use synod_node::p2p::SwarmCommand;
use synod_node::payload;

struct Fixture {
    detector: Arc<DependencyDetector>,
    sessions: Arc<SessionCoordinator>,
    ledger: Ledger,
    commands: mpsc::Receiver<SwarmCommand>,
    _receivers: FabricReceivers,
    _dir: tempfile::TempDir,
}

async fn fixture(plan: &str) -> Fixture {
    let dir = tempfile::TempDir::new().unwrap();
    let harness = fabric_harness("peer-coordinator").await;
    let ledger = Ledger::open(&dir.path().join("ledger.jsonl"), Keypair::generate_ed25519())
        .unwrap();
    let reasoner: Arc<dyn Reasoner> = Arc::new(ScriptedReasoner::new(vec![plan]));

    let sessions = Arc::new(SessionCoordinator::new(
        harness.fabric.clone(),
        reasoner,
        ledger.clone(),
    ));
    let detector = Arc::new(DependencyDetector::new(
        harness.fabric.clone(),
        sessions.clone(),
    ));

    Fixture {
        detector,
        sessions,
        ledger,
        commands: harness.commands,
        _receivers: harness.receivers,
        _dir: dir,
    }
}

fn context(
    project_id: i64,
    item_id: i64,
    repository: &str,
    title: &str,
    claimant: &str,
) -> TaskContext {
    TaskContext {
        project_id,
        item_id,
        repository: repository.to_string(),
        title: title.to_string(),
        body: String::new(),
        claimant: claimant.to_string(),
        claimed_at: Utc::now(),
    }
}

fn response(session_id: &str, node_id: &str, message: &str) -> Delivery {
    Delivery {
        topic: "synod/meta-discussion/v1".to_string(),
        source: format!("peer-{}", node_id),
        envelope: Envelope::new(
            MessageType::CoordinationResponse,
            format!("peer-{}", node_id),
            payload! {
                "session_id" => session_id,
                "node_id" => node_id,
                "message" => message,
            },
        ),
    }
}

// =============================================================================
// S5: cross-repository dependency opens a session
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_api_dependency_detected_across_repositories() {
    let mut fx = fixture("Land the API contract first, then the service.").await;

    fx.detector
        .register(context(1, 10, "org/api", "Define user API", "node-a"))
        .await;
    fx.detector
        .register(context(2, 20, "org/service", "Implement user service", "node-b"))
        .await;

    let out = published(&mut fx.commands);

    // Exactly one dependency alert, naming the rule.
    let alerts: Vec<_> = out
        .iter()
        .filter(|(_, e)| e.kind == MessageType::DependencyAlert)
        .collect();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].1.data_str("relationship"), Some("API_Contract"));

    // One dependency session opened with both claimants.
    assert_eq!(fx.sessions.session_count().await, 1);
    let plans: Vec<_> = out
        .iter()
        .filter(|(_, e)| e.kind == MessageType::CoordinationPlan)
        .collect();
    assert_eq!(plans.len(), 1);
    let session_id = plans[0].1.data_str("session_id").unwrap();
    let session = fx.sessions.session(session_id).await.unwrap();
    assert_eq!(session.session_type, SessionType::Dependency);
    assert!(session.participants.contains_key("node-a"));
    assert!(session.participants.contains_key("node-b"));
    assert_eq!(
        plans[0].1.data_str("plan"),
        Some("Land the API contract first, then the service.")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_same_repository_items_never_match() {
    let mut fx = fixture("unused").await;

    fx.detector
        .register(context(1, 1, "org/api", "Define user API", "node-a"))
        .await;
    fx.detector
        .register(context(1, 2, "org/api", "Implement the user API", "node-b"))
        .await;

    assert!(published(&mut fx.commands).is_empty());
    assert_eq!(fx.sessions.session_count().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unrelated_items_never_match() {
    let mut fx = fixture("unused").await;

    fx.detector
        .register(context(1, 1, "org/api", "Polish the readme", "node-a"))
        .await;
    fx.detector
        .register(context(2, 2, "org/web", "Bump CI image", "node-b"))
        .await;

    assert!(published(&mut fx.commands).is_empty());
}

// =============================================================================
// S6: consensus resolves a session
// =============================================================================

fn three_party_session(session_id: &str) -> CoordinationSession {
    let now = Utc::now();
    let participants: HashMap<String, Participant> = ["node-a", "node-b", "node-c"]
        .iter()
        .map(|id| {
            (
                id.to_string(),
                Participant {
                    last_seen: now,
                    active: true,
                },
            )
        })
        .collect();
    CoordinationSession {
        session_id: session_id.to_string(),
        session_type: SessionType::Dependency,
        involved_items: vec!["1:10".to_string(), "2:20".to_string()],
        participants,
        messages: Vec::new(),
        status: SessionStatus::Active,
        created_at: now,
        last_activity: now,
        resolution: None,
        escalation_reason: None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_consensus_resolves_session() {
    let mut fx = fixture("unused").await;
    let session_id = fx.sessions.open_session(three_party_session("sess-1")).await;

    fx.sessions
        .handle(response(&session_id, "node-a", "I agree with the plan"))
        .await;
    fx.sessions
        .handle(response(&session_id, "node-b", "Agree, let's do it"))
        .await;
    fx.sessions
        .handle(response(&session_id, "node-c", "agree as well"))
        .await;

    let session = fx.sessions.session(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Resolved);
    assert_eq!(
        session.resolution.as_deref(),
        Some("Consensus reached among participants")
    );

    let out = published(&mut fx.commands);
    let completions: Vec<_> = out
        .iter()
        .filter(|(_, e)| e.kind == MessageType::CoordinationComplete)
        .collect();
    assert_eq!(completions.len(), 1);
    assert_eq!(
        completions[0].1.data_str("resolution"),
        Some("Consensus reached among participants")
    );

    assert_eq!(
        fx.ledger.by_event(LedgerEvent::ConsensusReached).await.len(),
        1
    );

    // Messages after resolution are ignored.
    fx.sessions
        .handle(response(&session_id, "node-a", "one more thing"))
        .await;
    let session = fx.sessions.session(&session_id).await.unwrap();
    assert_eq!(session.messages.len(), 2, "terminal sessions take no messages");
}

// =============================================================================
// Session bounds
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_message_limit_escalates_session() {
    let mut fx = fixture("unused").await;
    let session_id = fx.sessions.open_session(three_party_session("sess-2")).await;

    for i in 0..10 {
        fx.sessions
            .handle(response(&session_id, "node-a", &format!("point {}", i)))
            .await;
    }

    let session = fx.sessions.session(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Escalated);
    assert_eq!(
        session.escalation_reason.as_deref(),
        Some("Message limit exceeded")
    );

    let out = published(&mut fx.commands);
    assert!(out
        .iter()
        .any(|(_, e)| e.kind == MessageType::EscalationTrigger));
}

// =============================================================================
// Cleanup
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_cleanup_drops_terminal_and_idle_sessions() {
    let fx = fixture("unused").await;

    let mut resolved = three_party_session("sess-resolved");
    resolved.status = SessionStatus::Resolved;
    fx.sessions.open_session(resolved).await;

    let mut stale = three_party_session("sess-stale");
    stale.last_activity = Utc::now() - ChronoDuration::hours(3);
    fx.sessions.open_session(stale).await;

    let fresh = three_party_session("sess-fresh");
    fx.sessions.open_session(fresh).await;

    fx.sessions.cleanup_once().await;

    assert_eq!(fx.sessions.session_count().await, 1);
    assert!(fx.sessions.session("sess-fresh").await.is_some());
}
