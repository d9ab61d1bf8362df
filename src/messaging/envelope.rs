//! Message envelope wire format
//!
//! Every fabric message is a JSON envelope `{type, from, timestamp, data,
//! hop_count?}`. Sender authenticity is enforced by gossipsub message
//! signing; the envelope's `from` field is additionally checked against the
//! transport-level source on receipt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Relay depth limit; envelopes past it are dropped, not forwarded.
pub const MAX_HOPS: u32 = 3;

/// Tagged union of every message the fabric carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Coordination topic
    TaskAnnouncement,
    TaskClaim,
    TaskProgress,
    TaskComplete,
    CapabilityBroadcast,
    AvailabilityBroadcast,

    // Meta-discussion topic (static + per-item)
    MetaDiscussion,
    TaskHelpRequest,
    TaskHelpResponse,
    CoordinationRequest,
    CoordinationPlan,
    CoordinationResponse,
    CoordinationComplete,
    DependencyAlert,
    EscalationTrigger,
}

impl MessageType {
    /// Whether this type belongs on the coordination topic.
    pub fn is_coordination(&self) -> bool {
        matches!(
            self,
            MessageType::TaskAnnouncement
                | MessageType::TaskClaim
                | MessageType::TaskProgress
                | MessageType::TaskComplete
                | MessageType::CapabilityBroadcast
                | MessageType::AvailabilityBroadcast
        )
    }
}

/// A signed fabric message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Sender peer id
    pub from: String,

    /// Sender wall clock; advisory only
    pub timestamp: DateTime<Utc>,

    pub data: serde_json::Map<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hop_count: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("hop limit exceeded ({0} > {MAX_HOPS})")]
    HopLimit(u32),
}

impl Envelope {
    pub fn new(
        kind: MessageType,
        from: impl Into<String>,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            kind,
            from: from.into(),
            timestamp: Utc::now(),
            data,
            hop_count: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode an envelope, rejecting anything past the hop limit.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        if let Some(hops) = envelope.hop_count {
            if hops > MAX_HOPS {
                return Err(EnvelopeError::HopLimit(hops));
            }
        }
        Ok(envelope)
    }

    /// Convenience accessor for string payload fields.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Convenience accessor for integer payload fields.
    pub fn data_i64(&self, key: &str) -> Option<i64> {
        self.data.get(key).and_then(|v| v.as_i64())
    }
}

/// Build an envelope payload from literal key/value pairs.
#[macro_export]
macro_rules! payload {
    ($($key:expr => $value:expr),* $(,)?) => {{
        let mut map = serde_json::Map::new();
        $(map.insert($key.to_string(), serde_json::json!($value));)*
        map
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let env = Envelope::new(
            MessageType::TaskClaim,
            "12D3KooTest",
            crate::payload! { "item_id" => 42, "project_id" => 1 },
        );
        let bytes = env.encode().unwrap();
        let back = Envelope::decode(&bytes).unwrap();
        assert_eq!(back.kind, MessageType::TaskClaim);
        assert_eq!(back.data_i64("item_id"), Some(42));
    }

    #[test]
    fn test_hop_limit_rejected() {
        let mut env = Envelope::new(MessageType::MetaDiscussion, "peer", serde_json::Map::new());
        env.hop_count = Some(4);
        let bytes = env.encode().unwrap();
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(EnvelopeError::HopLimit(4))
        ));
    }

    #[test]
    fn test_type_tags_are_snake_case() {
        let json = serde_json::to_string(&MessageType::AvailabilityBroadcast).unwrap();
        assert_eq!(json, "\"availability_broadcast\"");
    }
}
