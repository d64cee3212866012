//! Shared types, errors, data bag, state and analytics events for the journey engine.
//!
//! This crate provides the foundational types used across the journey crates:
//! - `EngineError` - unified error taxonomy for fatal and infrastructure failures
//! - `DataBag` - namespaced key-value store carried in journey state
//! - `JourneyState` - the single aggregate owned by the state machine
//! - `AnalyticsEvent` - structured telemetry describing engine activity
//! - `Clock` - injectable time source

pub mod clock;
pub mod data;
pub mod event;
pub mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use data::{DataArea, DataBag};
pub use event::{AnalyticsEvent, AnalyticsEventType};
pub use state::{
    ClientInfo, ErrorSeverity, JourneyError, JourneyState, PerformanceCounters, SessionInfo,
    SessionMetadata, StepProgressRecord, StepStatus, SubStep,
};

/// Unified error type for the journey engine.
///
/// Domain conditions such as missing data or a blocked navigation are not
/// errors; they are reported through validation results and rejections.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // === Catalog construction ===
    #[error("Step catalog is empty")]
    EmptyCatalog,

    #[error("Duplicate step id '{step}' in catalog")]
    DuplicateStep { step: String },

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Step '{step}' depends on '{dependency}', which does not precede it in catalog order")]
    DependencyOrder { step: String, dependency: String },

    #[error("Invalid validation rule on step '{step}' for '{path}': {message}")]
    InvalidRule {
        step: String,
        path: String,
        message: String,
    },

    #[error("Invalid guard {from} -> {to}: {message}")]
    InvalidGuard {
        from: String,
        to: String,
        message: String,
    },

    #[error("Condition parse error: {0}")]
    ConditionParse(String),

    // === Runtime ===
    #[error("Unknown step '{0}'")]
    UnknownStep(String),

    #[error("Invalid data path '{path}': {message}")]
    InvalidDataPath { path: String, message: String },

    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Telemetry delivery failed: {0}")]
    Telemetry(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Journey engine is shut down")]
    EngineClosed,

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Returns `true` for errors raised while building the catalog, guards or config.
    /// These are fatal at startup.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EngineError::EmptyCatalog
                | EngineError::DuplicateStep { .. }
                | EngineError::UnknownDependency { .. }
                | EngineError::DependencyOrder { .. }
                | EngineError::InvalidRule { .. }
                | EngineError::InvalidGuard { .. }
                | EngineError::ConditionParse(_)
                | EngineError::Config(_)
        )
    }

    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Telemetry(_) | EngineError::Persistence(_) | EngineError::Io(_)
        )
    }
}

/// A convenience alias for `Result<T, EngineError>`.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_dependency_order() {
        let err = EngineError::DependencyOrder {
            step: "scenario_draft".into(),
            dependency: "video_review".into(),
        };
        assert_eq!(
            err.to_string(),
            "Step 'scenario_draft' depends on 'video_review', which does not precede it in catalog order"
        );
    }

    #[test]
    fn error_display_unknown_dependency() {
        let err = EngineError::UnknownDependency {
            step: "b".into(),
            dependency: "zz".into(),
        };
        assert_eq!(err.to_string(), "Step 'b' depends on unknown step 'zz'");
    }

    #[test]
    fn error_display_invalid_guard() {
        let err = EngineError::InvalidGuard {
            from: "x".into(),
            to: "y".into(),
            message: "unknown target".into(),
        };
        assert_eq!(err.to_string(), "Invalid guard x -> y: unknown target");
    }

    #[test]
    fn error_display_engine_closed() {
        assert_eq!(
            EngineError::EngineClosed.to_string(),
            "Journey engine is shut down"
        );
    }

    #[test]
    fn configuration_errors_are_flagged() {
        assert!(EngineError::EmptyCatalog.is_configuration());
        assert!(EngineError::ConditionParse("bad".into()).is_configuration());
        assert!(EngineError::Config("bad".into()).is_configuration());
        assert!(!EngineError::UnknownStep("x".into()).is_configuration());
        assert!(!EngineError::Telemetry("down".into()).is_configuration());
    }

    #[test]
    fn retryable_errors() {
        assert!(EngineError::Telemetry("503".into()).is_retryable());
        assert!(EngineError::Persistence("disk full".into()).is_retryable());
        assert!(!EngineError::InvalidSnapshot("bad".into()).is_retryable());
        assert!(!EngineError::EngineClosed.is_retryable());
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: EngineError = io_err.into();
        assert!(matches!(err, EngineError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: EngineError = json_err.into();
        assert!(matches!(err, EngineError::Json(_)));
    }

    #[test]
    fn result_alias_err() {
        fn example() -> Result<()> {
            Err(EngineError::Other("fail".into()))
        }
        assert!(example().is_err());
    }
}
