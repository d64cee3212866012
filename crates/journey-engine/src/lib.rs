//! Journey workflow engine: step catalog, transition validation, navigation,
//! progress, recovery, telemetry and session timers.
//!
//! The core is a pure reducer ([`machine::StateMachine::reduce`]) over
//! [`journey_types::JourneyState`]. [`engine::JourneyEngine`] wraps it in a
//! single dispatch queue that owns the live state, feeds analytics events to
//! the telemetry buffer and keeps the session timers in step with the session.

pub mod cache;
pub mod catalog;
pub mod condition;
pub mod config;
pub mod dropoff;
pub mod duration_serde;
pub mod engine;
pub mod events;
pub mod guards;
pub mod machine;
pub mod navigation;
pub mod persistence;
pub mod progress;
pub mod recovery;
pub mod standard;
pub mod telemetry;
pub mod timers;
pub mod validation;

pub use cache::TtlCache;
pub use catalog::{Phase, RulePredicate, StepCatalog, StepDefinition, ValidationRule};
pub use condition::{evaluate_condition, parse_condition, ConditionExpr};
pub use config::{DeliveryMode, EngineConfig, TelemetryConfig, TimerConfig};
pub use dropoff::{DropoffDetector, DropoffReason, DropoffRisk};
pub use engine::{DispatchOutcome, EngineBuilder, EngineHandle, JourneyEngine};
pub use events::{EventEmitter, Subscription};
pub use guards::{GuardTable, NavigationGuardRule};
pub use machine::{
    Action, ActionOutcome, AppliedEffect, FailureReport, RecoveryStrategy, Rejection, StateMachine,
    Transition,
};
pub use navigation::{next_allowed_step, previous_step, scan_forward, ScanOutcome};
pub use persistence::{FileSnapshotStore, JourneySnapshot, MemorySnapshotStore, SnapshotStore};
pub use progress::{PhaseProgress, ProgressReport};
pub use recovery::{
    execute_with_retry, BackoffPolicy, RecoveryPlan, RecoveryPolicy, RecoveryTracker,
};
pub use standard::standard_guards;
pub use telemetry::{
    LogSink, NullSink, RecordingSink, TelemetryHandle, TelemetrySink, TelemetryStats,
};
pub use timers::{
    ActiveTimer, Scheduler, SessionTimers, TimerHandle, TimerKind, TimerTick, TokioScheduler,
};
pub use validation::{IssueKind, TransitionValidator, ValidationIssue, ValidationResult};
