//! Cross-item coordination
//!
//! Dependency detection across repositories and the multi-party sessions it
//! opens. Both maps key on interned node and claim ids, never on peer
//! handles.

pub mod detector;
pub mod sessions;

pub use detector::{
    default_rules, DependencyDetector, DependencyRule, TaskContext, TaskDependency,
    DEPENDENCY_CONFIDENCE,
};
pub use sessions::{
    evaluate_progress, CoordinationSession, Participant, SessionCoordinator, SessionMessage,
    SessionProgress, SessionStatus, SessionType,
};
