//! Journey state: the single aggregate owned by the state machine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::DataBag;

// ---------------------------------------------------------------------------
// StepStatus / StepProgressRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

/// A named unit of work inside a step, with its own 0–100 progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubStep {
    pub name: String,
    pub progress: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepProgressRecord {
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub attempts: u32,
    /// Overall progress of the step, 0–100.
    pub progress: u8,
    pub sub_steps: Vec<SubStep>,
    pub metrics: BTreeMap<String, f64>,
}

impl StepProgressRecord {
    /// Mark the step in progress. Counts an attempt unless it was already running.
    pub fn start(&mut self, now: DateTime<Utc>) {
        if self.status == StepStatus::InProgress {
            return;
        }
        self.status = StepStatus::InProgress;
        self.started_at = Some(now);
        self.completed_at = None;
        self.attempts += 1;
    }

    /// Mark the step completed and compute its duration from `started_at`.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        let started = *self.started_at.get_or_insert(now);
        self.status = StepStatus::Completed;
        self.completed_at = Some(now);
        self.progress = 100;
        self.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
    }

    pub fn fail(&mut self, now: DateTime<Utc>) {
        self.started_at.get_or_insert(now);
        self.status = StepStatus::Failed;
        self.attempts += 1;
    }

    pub fn skip(&mut self, now: DateTime<Utc>) {
        self.status = StepStatus::Skipped;
        self.completed_at = Some(now);
    }

    /// Forget everything except the attempt count.
    pub fn reset(&mut self) {
        let attempts = self.attempts;
        *self = StepProgressRecord {
            attempts,
            ..StepProgressRecord::default()
        };
    }

    /// Update (or create) a named sub-step. Returns `true` once every sub-step is at 100.
    pub fn set_sub_step(&mut self, name: &str, progress: u8) -> bool {
        let progress = progress.min(100);
        match self.sub_steps.iter_mut().find(|s| s.name == name) {
            Some(sub) => sub.progress = progress,
            None => self.sub_steps.push(SubStep {
                name: name.to_string(),
                progress,
            }),
        }
        let total: u32 = self.sub_steps.iter().map(|s| s.progress as u32).sum();
        self.progress = (total / self.sub_steps.len() as u32) as u8;
        self.sub_steps.iter().all(|s| s.progress == 100)
    }
}

// ---------------------------------------------------------------------------
// JourneyError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Warning,
    Error,
    Critical,
}

impl ErrorSeverity {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ErrorSeverity::Critical)
    }
}

/// An error recorded against a step in journey state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneyError {
    pub step: String,
    pub code: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub severity: ErrorSeverity,
    pub is_recoverable: bool,
    pub suggested_actions: Vec<String>,
    #[serde(default)]
    pub context: serde_json::Value,
}

impl JourneyError {
    pub fn new(
        step: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
        severity: ErrorSeverity,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            step: step.into(),
            code: code.into(),
            message: message.into(),
            timestamp,
            severity,
            is_recoverable: severity.is_recoverable(),
            suggested_actions: Vec::new(),
            context: serde_json::Value::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// Session info and metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub user_agent: Option<String>,
    pub platform: Option<String>,
    pub locale: Option<String>,
    pub viewport: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceCounters {
    pub dispatch_count: u64,
    pub rejected_count: u64,
    pub last_dispatch_micros: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub client: ClientInfo,
    pub performance: PerformanceCounters,
}

// ---------------------------------------------------------------------------
// JourneyState
// ---------------------------------------------------------------------------

/// Complete state of one journey session.
///
/// Only the state machine produces new values of this type; everyone else
/// sees immutable snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneyState {
    pub current_step: String,
    pub completed_steps: Vec<String>,
    pub step_progress: BTreeMap<String, StepProgressRecord>,
    pub data: DataBag,
    pub errors: Vec<JourneyError>,
    pub recovery_attempts: u32,
    #[serde(default)]
    pub recovery_attempts_by_code: BTreeMap<String, u32>,
    pub session: SessionInfo,
    pub metadata: SessionMetadata,
}

impl JourneyState {
    /// Fresh state positioned at `first_step`.
    pub fn new(
        first_step: impl Into<String>,
        session_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            current_step: first_step.into(),
            completed_steps: Vec::new(),
            step_progress: BTreeMap::new(),
            data: DataBag::new(),
            errors: Vec::new(),
            recovery_attempts: 0,
            recovery_attempts_by_code: BTreeMap::new(),
            session: SessionInfo {
                session_id: session_id.into(),
                user_id: None,
                started_at: now,
                last_activity: now,
            },
            metadata: SessionMetadata::default(),
        }
    }

    /// Generate a new random session identifier.
    pub fn new_session_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    pub fn is_completed(&self, step: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step)
    }

    /// Add `step` to the completed list. Returns `false` if it was already there.
    pub fn mark_completed(&mut self, step: &str) -> bool {
        if self.is_completed(step) {
            return false;
        }
        self.completed_steps.push(step.to_string());
        true
    }

    pub fn record(&self, step: &str) -> Option<&StepProgressRecord> {
        self.step_progress.get(step)
    }

    pub fn record_mut(&mut self, step: &str) -> &mut StepProgressRecord {
        self.step_progress.entry(step.to_string()).or_default()
    }

    pub fn status_of(&self, step: &str) -> StepStatus {
        self.record(step).map(|r| r.status).unwrap_or_default()
    }

    /// First unresolved critical error recorded against `step`.
    pub fn unresolved_critical(&self, step: &str) -> Option<&JourneyError> {
        self.errors
            .iter()
            .find(|e| e.step == step && e.severity == ErrorSeverity::Critical)
    }

    /// Stamp `last_activity`, never moving it backwards. Returns the stamped time.
    pub fn touch(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        if now > self.session.last_activity {
            self.session.last_activity = now;
        }
        self.session.last_activity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn mark_completed_is_idempotent() {
        let mut state = JourneyState::new("a", "s1", t0());
        assert!(state.mark_completed("a"));
        assert!(!state.mark_completed("a"));
        assert_eq!(state.completed_steps, vec!["a".to_string()]);
    }

    #[test]
    fn touch_never_moves_backwards() {
        let mut state = JourneyState::new("a", "s1", t0());
        let later = t0() + Duration::seconds(30);
        assert_eq!(state.touch(later), later);
        assert_eq!(state.touch(t0()), later);
        assert_eq!(state.session.last_activity, later);
    }

    #[test]
    fn record_complete_computes_duration() {
        let mut record = StepProgressRecord::default();
        record.start(t0());
        record.complete(t0() + Duration::milliseconds(1500));
        assert_eq!(record.status, StepStatus::Completed);
        assert_eq!(record.duration_ms, Some(1500));
        assert_eq!(record.attempts, 1);
        assert_eq!(record.progress, 100);
    }

    #[test]
    fn restarting_running_step_does_not_count_attempt() {
        let mut record = StepProgressRecord::default();
        record.start(t0());
        record.start(t0() + Duration::seconds(1));
        assert_eq!(record.attempts, 1);
        assert_eq!(record.started_at, Some(t0()));
    }

    #[test]
    fn fail_increments_attempts() {
        let mut record = StepProgressRecord::default();
        record.start(t0());
        record.fail(t0());
        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.attempts, 2);
    }

    #[test]
    fn sub_steps_average_into_progress() {
        let mut record = StepProgressRecord::default();
        assert!(!record.set_sub_step("upload", 40));
        assert_eq!(record.progress, 40);
        assert!(!record.set_sub_step("encode", 100));
        assert_eq!(record.progress, 70);
        assert!(record.set_sub_step("upload", 130));
        assert_eq!(record.sub_steps[0].progress, 100);
        assert_eq!(record.progress, 100);
    }

    #[test]
    fn reset_keeps_attempts() {
        let mut record = StepProgressRecord::default();
        record.start(t0());
        record.fail(t0());
        record.reset();
        assert_eq!(record.status, StepStatus::NotStarted);
        assert_eq!(record.attempts, 2);
        assert!(record.started_at.is_none());
    }

    #[test]
    fn critical_errors_are_not_recoverable() {
        let err = JourneyError::new("a", "X", "boom", ErrorSeverity::Critical, t0());
        assert!(!err.is_recoverable);
        let warn = JourneyError::new("a", "X", "meh", ErrorSeverity::Warning, t0());
        assert!(warn.is_recoverable);
    }

    #[test]
    fn unresolved_critical_only_matches_step() {
        let mut state = JourneyState::new("a", "s1", t0());
        state
            .errors
            .push(JourneyError::new("b", "X", "boom", ErrorSeverity::Critical, t0()));
        assert!(state.unresolved_critical("a").is_none());
        assert_eq!(state.unresolved_critical("b").unwrap().code, "X");
    }

    #[test]
    fn state_serialization_round_trip() {
        let mut state = JourneyState::new("a", "s1", t0());
        state.mark_completed("a");
        state.record_mut("a").complete(t0());
        let json = serde_json::to_string(&state).unwrap();
        let back: JourneyState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
