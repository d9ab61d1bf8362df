//! External collaborator clients
//!
//! Typed facades for the work tracker, the reasoning backend, and the
//! human escalation webhook. Only the contracts live here; engine-level
//! retry/abandon/escalate policy belongs to the callers.

pub mod escalation;
pub mod reasoning;
pub mod tracker;

pub use escalation::{EscalationClient, EscalationNotice};
pub use reasoning::{Reasoner, ReasoningClient, ReasoningConfig, ReasoningError};
pub use tracker::{ClaimOutcome, TrackerClient, TrackerError, WorkTracker};
