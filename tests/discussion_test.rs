//! Meta-discussion engine integration tests
//!
//! Escalation by keyword, escalation by history cap, frozen conversations,
//! and the help request/response exchange.

mod common;

use std::sync::Arc;
use std::time::Duration;

use libp2p::identity::Keypair;
use tokio::sync::mpsc;

use common::*;
use synod_node::clients::{EscalationClient, Reasoner};
use synod_node::config::DEFAULT_ESCALATION_KEYWORDS;
use synod_node::discussion::DiscussionEngine;
use synod_node::engine::TaskTracker;
use synod_node::ledger::{Ledger, LedgerEvent};
use synod_node::messaging::{Delivery, Envelope, FabricReceivers, MessageType};
use synod_node::p2p::SwarmCommand;
use synod_node::payload;
use synod_node::tasks::claim_key;

struct Fixture {
    discussion: Arc<DiscussionEngine>,
    ledger: Ledger,
    tasks: Arc<TaskTracker>,
    fabric: Arc<synod_node::messaging::MessageFabric>,
    commands: mpsc::Receiver<SwarmCommand>,
    _receivers: FabricReceivers,
    _dir: tempfile::TempDir,
}

async fn fixture(responses: Vec<&str>, escalation: EscalationClient) -> Fixture {
    let dir = tempfile::TempDir::new().unwrap();
    let harness = fabric_harness("peer-self").await;
    let ledger = Ledger::open(&dir.path().join("ledger.jsonl"), Keypair::generate_ed25519())
        .unwrap();
    let tasks = Arc::new(TaskTracker::new(3));
    let reasoner: Arc<dyn Reasoner> = Arc::new(ScriptedReasoner::new(responses));

    let discussion = Arc::new(DiscussionEngine::new(
        reasoner,
        harness.fabric.clone(),
        ledger.clone(),
        escalation,
        DEFAULT_ESCALATION_KEYWORDS.iter().map(|s| s.to_string()).collect(),
        10,
        "agent-self".to_string(),
        vec!["general".to_string()],
        tasks.clone(),
    ));

    Fixture {
        discussion,
        ledger,
        tasks,
        fabric: harness.fabric,
        commands: harness.commands,
        _receivers: harness.receivers,
        _dir: dir,
    }
}

fn meta_delivery(project_id: i64, item_id: i64, from: &str, message: &str) -> Delivery {
    Delivery {
        topic: "synod/meta-discussion/v1".to_string(),
        source: from.to_string(),
        envelope: Envelope::new(
            MessageType::MetaDiscussion,
            from,
            payload! {
                "project_id" => project_id,
                "item_id" => item_id,
                "message" => message,
            },
        ),
    }
}

// =============================================================================
// S3: escalation by keyword
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_keyword_escalation_fires_webhook_and_freezes() {
    let (webhook_url, body_rx) = webhook_capture().await;
    let mut fx = fixture(
        vec!["I believe this needs manual intervention from the maintainers."],
        EscalationClient::new(Some(webhook_url)),
    )
    .await;

    let item = work_item(1, 42, "Migrate the billing schema", "feature");
    fx.discussion.open_conversation(&item).await;

    fx.discussion
        .handle(meta_delivery(1, 42, "peer-other", "Have you considered the downtime?"))
        .await;

    // Conversation frozen.
    let key = claim_key(1, 42);
    assert!(fx.discussion.is_escalated(&key).await);

    // One escalation ledger entry.
    let escalations = fx.ledger.by_event(LedgerEvent::Escalation).await;
    assert_eq!(escalations.len(), 1);

    // Escalation notice broadcast to peers; no discussion response published.
    let out = published(&mut fx.commands);
    assert!(out
        .iter()
        .any(|(_, e)| e.kind == MessageType::EscalationTrigger));
    assert!(!out.iter().any(|(_, e)| e.kind == MessageType::MetaDiscussion));

    // Exactly one webhook POST carrying the reason and history.
    let body = tokio::time::timeout(Duration::from_secs(5), body_rx)
        .await
        .expect("webhook should be called")
        .unwrap();
    assert!(body.contains("manual intervention"));
    assert!(body.contains("\"history\""));
    assert!(body.contains("\"escalating_node\""));

    // Subsequent messages produce nothing for the frozen conversation.
    fx.discussion
        .handle(meta_delivery(1, 42, "peer-other", "Any update?"))
        .await;
    assert!(published(&mut fx.commands).is_empty());
}

// =============================================================================
// S4: escalation by history cap
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_history_cap_escalates_at_limit() {
    let mut fx = fixture(vec![], EscalationClient::new(None)).await;

    let item = work_item(2, 5, "Refactor the uploader", "feature");
    fx.discussion.open_conversation(&item).await;
    let key = claim_key(2, 5);

    for i in 1..=9 {
        fx.discussion
            .handle(meta_delivery(2, 5, "peer-other", &format!("note {}", i)))
            .await;
        assert!(
            !fx.discussion.is_escalated(&key).await,
            "escalated too early at message {}",
            i
        );
    }

    fx.discussion
        .handle(meta_delivery(2, 5, "peer-other", "note 10"))
        .await;
    assert!(fx.discussion.is_escalated(&key).await);

    let convo = fx.discussion.conversation(&key).await.unwrap();
    assert!(convo.escalated);
    assert_eq!(convo.history.len(), 10);

    // Nine responses went out before the cap; none after.
    let responses: Vec<_> = published(&mut fx.commands)
        .into_iter()
        .filter(|(_, e)| e.kind == MessageType::MetaDiscussion)
        .collect();
    assert_eq!(responses.len(), 9);

    fx.discussion
        .handle(meta_delivery(2, 5, "peer-other", "note 11"))
        .await;
    assert!(published(&mut fx.commands).is_empty());
}

// =============================================================================
// Response routing
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_response_goes_back_on_arrival_topic() {
    let mut fx = fixture(vec![], EscalationClient::new(None)).await;

    let item = work_item(3, 8, "Tune the cache", "feature");
    fx.discussion.open_conversation(&item).await;
    fx.fabric.join_item_topic(8).await.unwrap();
    drain(&mut fx.commands);

    let mut delivery = meta_delivery(3, 8, "peer-other", "What eviction policy?");
    delivery.topic = fx.fabric.item_topic(8);
    fx.discussion.handle(delivery).await;

    let out = published(&mut fx.commands);
    let (topic, envelope) = out
        .iter()
        .find(|(_, e)| e.kind == MessageType::MetaDiscussion)
        .expect("a response should be published");
    assert_eq!(topic, &fx.fabric.item_topic(8));
    assert_eq!(envelope.data_i64("item_id"), Some(8));
}

fn drain(commands: &mut mpsc::Receiver<SwarmCommand>) {
    while commands.try_recv().is_ok() {}
}

// =============================================================================
// Unknown conversations
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_messages_for_unknown_items_ignored() {
    let mut fx = fixture(vec![], EscalationClient::new(None)).await;

    fx.discussion
        .handle(meta_delivery(9, 99, "peer-other", "hello?"))
        .await;
    assert!(published(&mut fx.commands).is_empty());
    assert!(fx.discussion.conversation("9:99").await.is_none());
}

// =============================================================================
// Help request / response
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_help_request_gets_offer_when_idle() {
    let mut fx = fixture(vec![], EscalationClient::new(None)).await;

    let delivery = Delivery {
        topic: fx.fabric.item_topic(12),
        source: "peer-needy".to_string(),
        envelope: Envelope::new(
            MessageType::TaskHelpRequest,
            "peer-needy",
            payload! {
                "item_id" => 12,
                "repository" => "org/service",
                "reason" => "missing toolchain",
            },
        ),
    };
    fx.discussion.handle(delivery).await;

    let offered = fx.ledger.by_event(LedgerEvent::TaskHelpOffered).await;
    assert_eq!(offered.len(), 1);

    let out = published(&mut fx.commands);
    let (topic, envelope) = out
        .iter()
        .find(|(_, e)| e.kind == MessageType::TaskHelpResponse)
        .expect("an offer should be published");
    assert_eq!(topic, &fx.fabric.item_topic(12));
    assert_eq!(envelope.data.get("can_help"), Some(&serde_json::json!(true)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_saturated_node_does_not_offer_help() {
    let mut fx = fixture(vec![], EscalationClient::new(None)).await;
    for i in 0..3 {
        assert!(fx.tasks.try_reserve(&format!("1:{}", i)));
    }

    let delivery = Delivery {
        topic: fx.fabric.item_topic(13),
        source: "peer-needy".to_string(),
        envelope: Envelope::new(
            MessageType::TaskHelpRequest,
            "peer-needy",
            payload! { "item_id" => 13, "reason" => "overloaded" },
        ),
    };
    fx.discussion.handle(delivery).await;

    assert!(fx.ledger.by_event(LedgerEvent::TaskHelpOffered).await.is_empty());
    assert!(published(&mut fx.commands).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_help_offer_recorded() {
    let mut fx = fixture(vec![], EscalationClient::new(None)).await;

    let delivery = Delivery {
        topic: fx.fabric.item_topic(14),
        source: "peer-helper".to_string(),
        envelope: Envelope::new(
            MessageType::TaskHelpResponse,
            "peer-helper",
            payload! { "item_id" => 14, "can_help" => true, "capabilities" => ["general"] },
        ),
    };
    fx.discussion.handle(delivery).await;

    let received = fx.ledger.by_event(LedgerEvent::TaskHelpReceived).await;
    assert_eq!(received.len(), 1);
    assert_eq!(
        received[0].payload["helper"],
        serde_json::json!("peer-helper")
    );
    let _ = published(&mut fx.commands);
}
