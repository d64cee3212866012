//! The journey state machine: a pure reducer over [`JourneyState`].
//!
//! `reduce(state, action, now)` never mutates its input and never performs I/O.
//! It returns the next state together with an [`ActionOutcome`] describing what
//! happened, which the runtime turns into analytics events. Refused actions
//! come back as a typed [`Rejection`] with the input state, touched only in
//! `last_activity` and the rejected-dispatch counter.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use journey_types::{ClientInfo, ErrorSeverity, JourneyError, JourneyState, StepStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::StepCatalog;
use crate::guards::GuardTable;
use crate::recovery::{RecoveryPlan, RecoveryPolicy, RecoveryTracker};
use crate::validation::TransitionValidator;

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Put the step back in progress.
    Retry,
    /// Leave the step as is; the caller reloads its own view.
    Reload,
    /// Mark the step skipped. Only for skippable steps.
    SkipStep,
    /// Clear the step's progress record, keeping its attempt count.
    ResetStep,
}

/// Error details carried by a `Fail` action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub code: String,
    pub message: String,
    pub severity: ErrorSeverity,
    #[serde(default)]
    pub context: Value,
}

impl FailureReport {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        severity: ErrorSeverity,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            severity,
            context: Value::Null,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Start {
        #[serde(default)]
        user_id: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        client: ClientInfo,
    },
    Navigate {
        step: String,
        #[serde(default)]
        force: bool,
    },
    Complete {
        step: String,
        #[serde(default)]
        data: Option<Value>,
    },
    Fail {
        step: String,
        error: FailureReport,
    },
    UpdateProgress {
        step: String,
        #[serde(default)]
        sub_step: Option<String>,
        percent: i32,
        /// Measurements reported by the producer, merged into the step record.
        #[serde(default)]
        metrics: BTreeMap<String, f64>,
    },
    PersistData {
        key: String,
        value: Value,
    },
    Skip {
        step: String,
    },
    Recover {
        code: String,
        #[serde(default)]
        step: Option<String>,
        strategy: RecoveryStrategy,
    },
    Reset {
        #[serde(default)]
        keep_data: bool,
    },
}

impl Action {
    pub fn start(user_id: impl Into<String>) -> Self {
        Action::Start {
            user_id: Some(user_id.into()),
            session_id: None,
            client: ClientInfo::default(),
        }
    }

    pub fn navigate(step: impl Into<String>) -> Self {
        Action::Navigate {
            step: step.into(),
            force: false,
        }
    }

    pub fn force_navigate(step: impl Into<String>) -> Self {
        Action::Navigate {
            step: step.into(),
            force: true,
        }
    }

    pub fn complete(step: impl Into<String>) -> Self {
        Action::Complete {
            step: step.into(),
            data: None,
        }
    }

    pub fn complete_with(step: impl Into<String>, data: Value) -> Self {
        Action::Complete {
            step: step.into(),
            data: Some(data),
        }
    }

    pub fn persist(key: impl Into<String>, value: Value) -> Self {
        Action::PersistData {
            key: key.into(),
            value,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::Start { .. } => "START",
            Action::Navigate { .. } => "NAVIGATE",
            Action::Complete { .. } => "COMPLETE",
            Action::Fail { .. } => "FAIL",
            Action::UpdateProgress { .. } => "UPDATE_PROGRESS",
            Action::PersistData { .. } => "PERSIST_DATA",
            Action::Skip { .. } => "SKIP",
            Action::Recover { .. } => "RECOVER",
            Action::Reset { .. } => "RESET",
        }
    }

    /// Actions a person performs, as opposed to timer-driven ones.
    pub fn is_user_activity(&self) -> bool {
        !matches!(self, Action::Fail { error, .. } if error.code == "SESSION_TIMEOUT")
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Why an action was refused. Rejections are ordinary results, not errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    #[error("Unknown step '{step}'")]
    UnknownStep { step: String },

    #[error("Guard '{guard}' blocked {from} -> {to}: {message}")]
    GuardFailed {
        guard: String,
        from: String,
        to: String,
        message: String,
        redirect: Option<String>,
    },

    #[error("Step '{step}' has an unresolved critical error '{code}'")]
    CriticalErrorOutstanding { step: String, code: String },

    #[error("Step '{step}' cannot be skipped")]
    NotSkippable { step: String },

    #[error("Invalid data at '{path}': {message}")]
    InvalidData { path: String, message: String },

    #[error("No recorded error with code '{code}'")]
    NoSuchError { code: String },

    #[error("Error '{code}' is critical and cannot be recovered")]
    NotRecoverable { code: String },

    #[error("Recovery for '{code}' exhausted after {attempts} attempts")]
    RecoveryExhausted { code: String, attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum AppliedEffect {
    SessionStarted {
        session_id: String,
    },
    Navigated {
        from: String,
        to: String,
        forced: bool,
        /// Name of the failed guard a forced navigation went past.
        guard_bypassed: Option<String>,
    },
    Completed {
        step: String,
        /// `false` when the step was already complete.
        newly: bool,
        duration_ms: Option<u64>,
    },
    Failed {
        step: String,
        code: String,
        severity: ErrorSeverity,
    },
    ProgressUpdated {
        step: String,
        progress: u8,
        record_completed: bool,
    },
    DataPersisted {
        key: String,
    },
    Skipped {
        step: String,
    },
    Recovered {
        step: Option<String>,
        removed: usize,
        plan: RecoveryPlan,
        strategy: RecoveryStrategy,
    },
    Reset {
        keep_data: bool,
        session_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    Applied(AppliedEffect),
    Rejected(Rejection),
}

impl ActionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ActionOutcome::Applied(_))
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            ActionOutcome::Rejected(r) => Some(r),
            ActionOutcome::Applied(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub state: JourneyState,
    pub outcome: ActionOutcome,
}

// ---------------------------------------------------------------------------
// StateMachine
// ---------------------------------------------------------------------------

pub struct StateMachine {
    validator: TransitionValidator,
    recovery: RecoveryTracker,
}

impl StateMachine {
    pub fn new(
        catalog: Arc<StepCatalog>,
        guards: Arc<GuardTable>,
        recovery: RecoveryPolicy,
    ) -> Self {
        Self {
            validator: TransitionValidator::new(catalog, guards),
            recovery: RecoveryTracker::new(recovery),
        }
    }

    pub fn catalog(&self) -> &StepCatalog {
        self.validator.catalog()
    }

    pub fn validator(&self) -> &TransitionValidator {
        &self.validator
    }

    pub fn recovery(&self) -> &RecoveryTracker {
        &self.recovery
    }

    /// State before any `Start`: positioned at the first step, nothing begun.
    pub fn initial_state(&self, now: DateTime<Utc>) -> JourneyState {
        JourneyState::new(&self.catalog().first().id, JourneyState::new_session_id(), now)
    }

    pub fn reduce(&self, state: &JourneyState, action: &Action, now: DateTime<Utc>) -> Transition {
        let mut next = state.clone();
        let now = next.touch(now);

        let result = match action {
            Action::Start {
                user_id,
                session_id,
                client,
            } => self.start(&mut next, user_id.as_deref(), session_id.clone(), client, now),
            Action::Navigate { step, force } => self.navigate(&mut next, step, *force, now),
            Action::Complete { step, data } => self.complete(&mut next, step, data.as_ref(), now),
            Action::Fail { step, error } => self.fail(&mut next, step, error, now),
            Action::UpdateProgress {
                step,
                sub_step,
                percent,
                metrics,
            } => self.update_progress(&mut next, step, sub_step.as_deref(), *percent, metrics, now),
            Action::PersistData { key, value } => persist_data(&mut next, key, value),
            Action::Skip { step } => self.skip(&mut next, step, now),
            Action::Recover {
                code,
                step,
                strategy,
            } => self.recover(&mut next, code, step.as_deref(), *strategy, now),
            Action::Reset { keep_data } => self.reset(&mut next, *keep_data, now),
        };

        match result {
            Ok(effect) => {
                next.metadata.performance.dispatch_count += 1;
                tracing::debug!(
                    session = %next.session.session_id,
                    action = action.name(),
                    step = %next.current_step,
                    "Action applied"
                );
                Transition {
                    state: next,
                    outcome: ActionOutcome::Applied(effect),
                }
            }
            Err(rejection) => {
                let mut unchanged = state.clone();
                unchanged.touch(now);
                unchanged.metadata.performance.rejected_count += 1;
                tracing::warn!(
                    session = %unchanged.session.session_id,
                    action = action.name(),
                    reason = %rejection,
                    "Action rejected"
                );
                Transition {
                    state: unchanged,
                    outcome: ActionOutcome::Rejected(rejection),
                }
            }
        }
    }

    fn step_exists(&self, step: &str) -> Result<(), Rejection> {
        if self.catalog().contains(step) {
            Ok(())
        } else {
            Err(Rejection::UnknownStep {
                step: step.to_string(),
            })
        }
    }

    fn fresh_session(
        &self,
        session_id: String,
        user_id: Option<String>,
        client: ClientInfo,
        now: DateTime<Utc>,
    ) -> JourneyState {
        let first = &self.catalog().first().id;
        let mut fresh = JourneyState::new(first, session_id, now);
        fresh.session.user_id = user_id;
        fresh.metadata.client = client;
        fresh.record_mut(first).start(now);
        fresh
    }

    fn start(
        &self,
        next: &mut JourneyState,
        user_id: Option<&str>,
        session_id: Option<String>,
        client: &ClientInfo,
        now: DateTime<Utc>,
    ) -> Result<AppliedEffect, Rejection> {
        let session_id = session_id.unwrap_or_else(JourneyState::new_session_id);
        let mut fresh = self.fresh_session(
            session_id.clone(),
            user_id.map(str::to_string),
            client.clone(),
            now,
        );
        if let Some(user) = user_id {
            seed_user(&mut fresh, user)?;
        }
        *next = fresh;
        Ok(AppliedEffect::SessionStarted { session_id })
    }

    fn navigate(
        &self,
        next: &mut JourneyState,
        step: &str,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<AppliedEffect, Rejection> {
        self.step_exists(step)?;
        let from = next.current_step.clone();
        let catalog = self.catalog();

        let forward = catalog.index_of(step) > catalog.index_of(&from);
        if forward {
            if let Some(err) = next.unresolved_critical(&from) {
                return Err(Rejection::CriticalErrorOutstanding {
                    step: from,
                    code: err.code.clone(),
                });
            }
        }

        let mut guard_bypassed = None;
        if let Some(guard) = self.validator.guards().get(&from, step) {
            if !guard.evaluate(&next.data) {
                let waived = guard.allow_skip_override
                    && catalog.by_id(step).is_some_and(|def| def.can_skip);
                if !force && !waived {
                    return Err(Rejection::GuardFailed {
                        guard: guard.name.clone(),
                        from,
                        to: step.to_string(),
                        message: guard.message.clone(),
                        redirect: guard.redirect.clone(),
                    });
                }
                tracing::warn!(
                    guard = %guard.name,
                    from = %from,
                    to = step,
                    forced = force,
                    "Navigating past unsatisfied guard"
                );
                guard_bypassed = Some(guard.name.clone());
            }
        }

        if next.status_of(step) != StepStatus::Completed {
            next.record_mut(step).start(now);
        }
        next.current_step = step.to_string();
        Ok(AppliedEffect::Navigated {
            from,
            to: step.to_string(),
            forced: force,
            guard_bypassed,
        })
    }

    fn complete(
        &self,
        next: &mut JourneyState,
        step: &str,
        data: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<AppliedEffect, Rejection> {
        let Some(def) = self.catalog().by_id(step) else {
            return Err(Rejection::UnknownStep {
                step: step.to_string(),
            });
        };
        if let Some(err) = next.unresolved_critical(step) {
            return Err(Rejection::CriticalErrorOutstanding {
                step: step.to_string(),
                code: err.code.clone(),
            });
        }

        match data {
            None | Some(Value::Null) => {}
            Some(payload) => {
                let area = def.phase.data_area();
                next.data
                    .merge_area(area, payload.clone())
                    .map_err(|e| Rejection::InvalidData {
                        path: area.to_string(),
                        message: e.to_string(),
                    })?;
            }
        }

        let newly = next.mark_completed(step);
        let record = next.record_mut(step);
        if record.status != StepStatus::Completed {
            record.complete(now);
        }
        Ok(AppliedEffect::Completed {
            step: step.to_string(),
            newly,
            duration_ms: record.duration_ms,
        })
    }

    fn fail(
        &self,
        next: &mut JourneyState,
        step: &str,
        report: &FailureReport,
        now: DateTime<Utc>,
    ) -> Result<AppliedEffect, Rejection> {
        self.step_exists(step)?;
        next.record_mut(step).fail(now);

        let mut error =
            JourneyError::new(step, &report.code, &report.message, report.severity, now);
        error.is_recoverable = RecoveryTracker::is_recoverable(report.severity);
        error.suggested_actions = RecoveryTracker::classify(&report.code);
        error.context = report.context.clone();
        next.errors.push(error);

        Ok(AppliedEffect::Failed {
            step: step.to_string(),
            code: report.code.clone(),
            severity: report.severity,
        })
    }

    fn update_progress(
        &self,
        next: &mut JourneyState,
        step: &str,
        sub_step: Option<&str>,
        percent: i32,
        metrics: &BTreeMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Result<AppliedEffect, Rejection> {
        self.step_exists(step)?;
        let percent = percent.clamp(0, 100) as u8;
        let record = next.record_mut(step);
        record
            .metrics
            .extend(metrics.iter().map(|(name, value)| (name.clone(), *value)));
        if record.status == StepStatus::NotStarted {
            record.start(now);
        }

        let reached = match sub_step {
            Some(name) => record.set_sub_step(name, percent),
            None => {
                record.progress = percent;
                percent == 100
            }
        };
        let record_completed = reached && record.status != StepStatus::Completed;
        if record_completed {
            record.complete(now);
        }
        Ok(AppliedEffect::ProgressUpdated {
            step: step.to_string(),
            progress: record.progress,
            record_completed,
        })
    }

    fn skip(
        &self,
        next: &mut JourneyState,
        step: &str,
        now: DateTime<Utc>,
    ) -> Result<AppliedEffect, Rejection> {
        let Some(def) = self.catalog().by_id(step) else {
            return Err(Rejection::UnknownStep {
                step: step.to_string(),
            });
        };
        if !def.can_skip {
            return Err(Rejection::NotSkippable {
                step: step.to_string(),
            });
        }
        next.record_mut(step).skip(now);
        Ok(AppliedEffect::Skipped {
            step: step.to_string(),
        })
    }

    fn recover(
        &self,
        next: &mut JourneyState,
        code: &str,
        step: Option<&str>,
        strategy: RecoveryStrategy,
        now: DateTime<Utc>,
    ) -> Result<AppliedEffect, Rejection> {
        let plan = self.recovery.plan(next, code, step)?;
        let target = step.map(str::to_string).or_else(|| {
            next.errors
                .iter()
                .find(|e| e.code == code)
                .map(|e| e.step.clone())
        });

        if strategy == RecoveryStrategy::SkipStep {
            let skippable = target
                .as_deref()
                .and_then(|t| self.catalog().by_id(t))
                .is_some_and(|def| def.can_skip);
            if !skippable {
                return Err(Rejection::NotSkippable {
                    step: target.unwrap_or_default(),
                });
            }
        }

        let before = next.errors.len();
        next.errors
            .retain(|e| !(e.code == code && step.map_or(true, |s| e.step == s)));
        let removed = before - next.errors.len();
        next.recovery_attempts += 1;
        *next.recovery_attempts_by_code.entry(code.to_string()).or_insert(0) += 1;

        if let Some(target) = &target {
            let record = next.record_mut(target);
            match strategy {
                RecoveryStrategy::Retry => record.start(now),
                RecoveryStrategy::ResetStep => record.reset(),
                RecoveryStrategy::SkipStep => record.skip(now),
                RecoveryStrategy::Reload => {}
            }
        }

        tracing::info!(
            code,
            attempt = plan.attempt,
            delay_ms = %plan.delay.as_millis(),
            ?strategy,
            "Recovery applied"
        );
        Ok(AppliedEffect::Recovered {
            step: target,
            removed,
            plan,
            strategy,
        })
    }

    fn reset(
        &self,
        next: &mut JourneyState,
        keep_data: bool,
        now: DateTime<Utc>,
    ) -> Result<AppliedEffect, Rejection> {
        let session_id = JourneyState::new_session_id();
        let user_id = next.session.user_id.clone();
        let mut fresh = self.fresh_session(
            session_id.clone(),
            user_id.clone(),
            next.metadata.client.clone(),
            now,
        );
        if keep_data {
            fresh.data = std::mem::take(&mut next.data);
        } else if let Some(user) = &user_id {
            seed_user(&mut fresh, user)?;
        }
        *next = fresh;
        Ok(AppliedEffect::Reset {
            keep_data,
            session_id,
        })
    }
}

fn seed_user(state: &mut JourneyState, user: &str) -> Result<(), Rejection> {
    state
        .data
        .merge("auth.user_id", Value::String(user.to_string()))
        .map_err(|e| Rejection::InvalidData {
            path: "auth.user_id".into(),
            message: e.to_string(),
        })
}

fn persist_data(
    next: &mut JourneyState,
    key: &str,
    value: &Value,
) -> Result<AppliedEffect, Rejection> {
    next.data
        .merge(key, value.clone())
        .map_err(|e| Rejection::InvalidData {
            path: key.to_string(),
            message: e.to_string(),
        })?;
    Ok(AppliedEffect::DataPersisted {
        key: key.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Phase, StepDefinition};
    use crate::guards::NavigationGuardRule;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn machine() -> StateMachine {
        let catalog = StepCatalog::new(vec![
            StepDefinition::new("X", Phase::Scenario),
            StepDefinition::new("Y", Phase::Planning).depends_on(&["X"]),
            StepDefinition::new("Z", Phase::Video).skippable(&["no_video"]),
        ])
        .unwrap();
        let guard = NavigationGuardRule::new(
            "locked",
            "X",
            "Y",
            "scenario.locked=true",
            "Lock the scenario",
        )
        .unwrap();
        let guards = GuardTable::new(vec![guard], &catalog).unwrap();
        StateMachine::new(Arc::new(catalog), Arc::new(guards), RecoveryPolicy::default())
    }

    fn started(m: &StateMachine) -> JourneyState {
        let init = m.initial_state(t0());
        m.reduce(&init, &Action::start("user-1"), t0()).state
    }

    fn apply(m: &StateMachine, state: &JourneyState, action: Action) -> Transition {
        m.reduce(state, &action, t0() + Duration::seconds(5))
    }

    fn fail_action(step: &str, code: &str, severity: ErrorSeverity) -> Action {
        Action::Fail {
            step: step.into(),
            error: FailureReport::new(code, "boom", severity),
        }
    }

    #[test]
    fn start_seeds_identity_and_first_step() {
        let m = machine();
        let state = started(&m);
        assert_eq!(state.current_step, "X");
        assert_eq!(state.session.user_id.as_deref(), Some("user-1"));
        assert_eq!(state.data.resolve_string("auth.user_id"), "user-1");
        assert_eq!(state.status_of("X"), StepStatus::InProgress);
        assert_eq!(state.record("X").unwrap().attempts, 1);
        assert_eq!(state.metadata.performance.dispatch_count, 1);
    }

    #[test]
    fn start_uses_supplied_session_id() {
        let m = machine();
        let t = m.reduce(
            &m.initial_state(t0()),
            &Action::Start {
                user_id: None,
                session_id: Some("fixed".into()),
                client: ClientInfo::default(),
            },
            t0(),
        );
        assert_eq!(t.state.session_id(), "fixed");
        assert_eq!(
            t.outcome,
            ActionOutcome::Applied(AppliedEffect::SessionStarted {
                session_id: "fixed".into()
            })
        );
    }

    #[test]
    fn guard_blocks_unforced_navigation() {
        let m = machine();
        let state = started(&m);
        let t = apply(&m, &state, Action::navigate("Y"));
        assert_eq!(t.state.current_step, "X");
        assert!(matches!(
            t.outcome.rejection(),
            Some(Rejection::GuardFailed { guard, .. }) if guard == "locked"
        ));
        assert_eq!(t.state.metadata.performance.rejected_count, 1);
        assert_eq!(t.state.session.last_activity, t0() + Duration::seconds(5));
        // Nothing else changed.
        assert_eq!(t.state.step_progress, state.step_progress);
    }

    #[test]
    fn forced_navigation_lands_on_target() {
        let m = machine();
        let state = started(&m);
        let t = apply(&m, &state, Action::force_navigate("Y"));
        assert_eq!(t.state.current_step, "Y");
        assert_eq!(t.state.status_of("Y"), StepStatus::InProgress);
        assert_eq!(
            t.outcome,
            ActionOutcome::Applied(AppliedEffect::Navigated {
                from: "X".into(),
                to: "Y".into(),
                forced: true,
                guard_bypassed: Some("locked".into()),
            })
        );
    }

    #[test]
    fn overridable_guard_lets_skippable_target_through() {
        let catalog = StepCatalog::new(vec![
            StepDefinition::new("X", Phase::Scenario),
            StepDefinition::new("Z", Phase::Video).skippable(&["no_video"]),
        ])
        .unwrap();
        let guard =
            NavigationGuardRule::new("approved", "X", "Z", "video.approved=true", "Approve first")
                .unwrap()
                .allowing_skip_override();
        let guards = GuardTable::new(vec![guard], &catalog).unwrap();
        let m = StateMachine::new(Arc::new(catalog), Arc::new(guards), RecoveryPolicy::default());
        let state = started(&m);

        let t = apply(&m, &state, Action::navigate("Z"));
        assert_eq!(t.state.current_step, "Z");
        assert_eq!(
            t.outcome,
            ActionOutcome::Applied(AppliedEffect::Navigated {
                from: "X".into(),
                to: "Z".into(),
                forced: false,
                guard_bypassed: Some("approved".into()),
            })
        );
    }

    #[test]
    fn satisfied_guard_allows_navigation() {
        let m = machine();
        let state = started(&m);
        let state = apply(&m, &state, Action::persist("scenario.locked", json!(true))).state;
        let t = apply(&m, &state, Action::navigate("Y"));
        assert!(t.outcome.is_applied());
        assert_eq!(t.state.current_step, "Y");
    }

    #[test]
    fn navigate_to_unknown_step_is_rejected() {
        let m = machine();
        let state = started(&m);
        let t = apply(&m, &state, Action::force_navigate("ghost"));
        assert_eq!(
            t.outcome.rejection(),
            Some(&Rejection::UnknownStep { step: "ghost".into() })
        );
        assert_eq!(t.state.current_step, "X");
    }

    #[test]
    fn complete_is_idempotent() {
        let m = machine();
        let state = started(&m);
        let once = m.reduce(&state, &Action::complete("X"), t0() + Duration::seconds(3)).state;
        let twice = m.reduce(&once, &Action::complete("X"), t0() + Duration::seconds(9));
        assert_eq!(twice.state.completed_steps, vec!["X".to_string()]);
        assert_eq!(twice.state.record("X").unwrap().duration_ms, Some(3000));
        assert!(matches!(
            twice.outcome,
            ActionOutcome::Applied(AppliedEffect::Completed { newly: false, .. })
        ));
    }

    #[test]
    fn complete_merges_payload_into_phase_area() {
        let m = machine();
        let state = started(&m);
        let t = apply(
            &m,
            &state,
            Action::complete_with("X", json!({"title": "Night Train", "acts": ["a", "b"]})),
        );
        assert_eq!(t.state.data.resolve_string("scenario.title"), "Night Train");
        let bad = apply(&m, &state, Action::complete_with("X", json!("not an object")));
        assert!(matches!(bad.outcome.rejection(), Some(Rejection::InvalidData { .. })));
        assert!(bad.state.completed_steps.is_empty());
    }

    #[test]
    fn fail_records_error_with_suggestions() {
        let m = machine();
        let state = started(&m);
        let t = apply(&m, &state, fail_action("X", "NETWORK_ERROR", ErrorSeverity::Error));
        assert_eq!(t.state.status_of("X"), StepStatus::Failed);
        assert_eq!(t.state.record("X").unwrap().attempts, 2);
        let err = &t.state.errors[0];
        assert!(err.is_recoverable);
        assert_eq!(err.suggested_actions, vec!["check_connection", "retry", "reload"]);
    }

    #[test]
    fn critical_error_blocks_completion_and_forward_navigation() {
        let m = machine();
        let state = started(&m);
        let failure = fail_action("X", "STORAGE_ERROR", ErrorSeverity::Critical);
        let state = apply(&m, &state, failure).state;
        assert!(!state.errors[0].is_recoverable);

        let t = apply(&m, &state, Action::complete("X"));
        assert!(matches!(
            t.outcome.rejection(),
            Some(Rejection::CriticalErrorOutstanding { .. })
        ));
        let t = apply(&m, &state, Action::force_navigate("Z"));
        assert!(matches!(
            t.outcome.rejection(),
            Some(Rejection::CriticalErrorOutstanding { .. })
        ));
        let t = apply(
            &m,
            &state,
            Action::Recover {
                code: "STORAGE_ERROR".into(),
                step: None,
                strategy: RecoveryStrategy::Retry,
            },
        );
        assert!(matches!(t.outcome.rejection(), Some(Rejection::NotRecoverable { .. })));
    }

    #[test]
    fn update_progress_completes_record_but_not_step() {
        let m = machine();
        let state = started(&m);
        let progress = |sub: Option<&str>, percent| Action::UpdateProgress {
            step: "Z".into(),
            sub_step: sub.map(str::to_string),
            percent,
            metrics: BTreeMap::new(),
        };
        let s1 = apply(&m, &state, progress(Some("upload"), -20)).state;
        let s2 = apply(&m, &s1, progress(Some("render"), 150)).state;
        assert_eq!(s2.record("Z").unwrap().progress, 50);
        assert_eq!(s2.status_of("Z"), StepStatus::InProgress);
        let t = apply(&m, &s2, progress(Some("upload"), 100));
        assert_eq!(t.state.status_of("Z"), StepStatus::Completed);
        assert!(!t.state.is_completed("Z"));
        assert!(matches!(
            t.outcome,
            ActionOutcome::Applied(AppliedEffect::ProgressUpdated {
                record_completed: true,
                ..
            })
        ));
    }

    #[test]
    fn update_progress_records_metrics() {
        let m = machine();
        let state = started(&m);
        let progress = |percent, metrics: &[(&str, f64)]| Action::UpdateProgress {
            step: "Z".into(),
            sub_step: None,
            percent,
            metrics: metrics.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        };
        let s1 = apply(&m, &state, progress(40, &[("frames", 120.0), ("fps", 24.0)])).state;
        let s2 = apply(&m, &s1, progress(60, &[("frames", 180.0)])).state;
        let metrics = &s2.record("Z").unwrap().metrics;
        assert_eq!(metrics["frames"], 180.0);
        assert_eq!(metrics["fps"], 24.0);

        let parsed: Action =
            serde_json::from_value(json!({"type": "UPDATE_PROGRESS", "step": "Z", "percent": 10}))
                .unwrap();
        assert!(matches!(parsed, Action::UpdateProgress { ref metrics, .. } if metrics.is_empty()));
    }

    #[test]
    fn persist_data_requires_known_area() {
        let m = machine();
        let state = started(&m);
        let ok = apply(&m, &state, Action::persist("video.settings.fps", json!(24)));
        assert!(ok.outcome.is_applied());
        assert_eq!(ok.state.data.resolve_string("video.settings.fps"), "24");
        let bad = apply(&m, &state, Action::persist("weather.today", json!("rain")));
        assert!(matches!(bad.outcome.rejection(), Some(Rejection::InvalidData { .. })));
        let through_scalar =
            apply(&m, &ok.state, Action::persist("video.settings.fps.max", json!(60)));
        assert!(matches!(
            through_scalar.outcome.rejection(),
            Some(Rejection::InvalidData { path, .. }) if path == "video.settings.fps.max"
        ));
        assert_eq!(through_scalar.state.data.resolve_string("video.settings.fps"), "24");
    }

    #[test]
    fn skip_only_skippable_steps() {
        let m = machine();
        let state = started(&m);
        let t = apply(&m, &state, Action::Skip { step: "Z".into() });
        assert_eq!(t.state.status_of("Z"), StepStatus::Skipped);
        let t = apply(&m, &state, Action::Skip { step: "Y".into() });
        assert_eq!(
            t.outcome.rejection(),
            Some(&Rejection::NotSkippable { step: "Y".into() })
        );
    }

    #[test]
    fn recovery_is_bounded_per_code() {
        let m = machine();
        let mut state = started(&m);
        let recover = Action::Recover {
            code: "TIMEOUT".into(),
            step: Some("X".into()),
            strategy: RecoveryStrategy::Retry,
        };
        for attempt in 1..=3 {
            state = apply(&m, &state, fail_action("X", "TIMEOUT", ErrorSeverity::Error)).state;
            let t = apply(&m, &state, recover.clone());
            match &t.outcome {
                ActionOutcome::Applied(AppliedEffect::Recovered { plan, removed, .. }) => {
                    assert_eq!(plan.attempt, attempt);
                    assert_eq!(*removed, 1);
                }
                other => panic!("expected recovery, got {other:?}"),
            }
            state = t.state;
            assert!(state.errors.is_empty());
            assert_eq!(state.status_of("X"), StepStatus::InProgress);
        }
        state = apply(&m, &state, fail_action("X", "TIMEOUT", ErrorSeverity::Error)).state;
        let t = apply(&m, &state, recover);
        assert_eq!(
            t.outcome.rejection(),
            Some(&Rejection::RecoveryExhausted {
                code: "TIMEOUT".into(),
                attempts: 3
            })
        );
        assert_eq!(t.state.errors.len(), 1);
        assert_eq!(t.state.recovery_attempts, 3);
    }

    #[test]
    fn recover_strategies_touch_the_record() {
        let m = machine();
        let state = started(&m);
        let failure = fail_action("Z", "GENERATION_FAILED", ErrorSeverity::Warning);
        let failed = apply(&m, &state, failure).state;
        let recover = |strategy| Action::Recover {
            code: "GENERATION_FAILED".into(),
            step: None,
            strategy,
        };
        let skipped = apply(&m, &failed, recover(RecoveryStrategy::SkipStep)).state;
        assert_eq!(skipped.status_of("Z"), StepStatus::Skipped);
        let reset = apply(&m, &failed, recover(RecoveryStrategy::ResetStep)).state;
        assert_eq!(reset.status_of("Z"), StepStatus::NotStarted);
        assert_eq!(reset.record("Z").unwrap().attempts, 1);
        let reloaded = apply(&m, &failed, recover(RecoveryStrategy::Reload)).state;
        assert_eq!(reloaded.status_of("Z"), StepStatus::Failed);
        assert!(reloaded.errors.is_empty());

        let failed_x = apply(&m, &state, fail_action("X", "TIMEOUT", ErrorSeverity::Error)).state;
        let t = apply(
            &m,
            &failed_x,
            Action::Recover {
                code: "TIMEOUT".into(),
                step: None,
                strategy: RecoveryStrategy::SkipStep,
            },
        );
        assert!(matches!(t.outcome.rejection(), Some(Rejection::NotSkippable { .. })));
    }

    #[test]
    fn reset_starts_fresh_session_for_same_user() {
        let m = machine();
        let state = started(&m);
        let state = apply(&m, &state, Action::persist("scenario.title", json!("Kept"))).state;
        let state = apply(&m, &state, Action::complete("X")).state;

        let kept = apply(&m, &state, Action::Reset { keep_data: true }).state;
        assert_ne!(kept.session_id(), state.session_id());
        assert_eq!(kept.session.user_id.as_deref(), Some("user-1"));
        assert_eq!(kept.current_step, "X");
        assert!(kept.completed_steps.is_empty());
        assert_eq!(kept.data.resolve_string("scenario.title"), "Kept");

        let wiped = apply(&m, &state, Action::Reset { keep_data: false }).state;
        assert_eq!(wiped.data.resolve_string("scenario.title"), "");
        assert_eq!(wiped.data.resolve_string("auth.user_id"), "user-1");
    }

    #[test]
    fn last_activity_never_moves_backwards() {
        let m = machine();
        let state = started(&m);
        let later = m.reduce(&state, &Action::complete("X"), t0() + Duration::minutes(1)).state;
        let earlier = m.reduce(&later, &Action::navigate("X"), t0()).state;
        assert_eq!(earlier.session.last_activity, t0() + Duration::minutes(1));
    }

    #[test]
    fn actions_round_trip_through_json() {
        let action: Action =
            serde_json::from_str(r#"{"type":"NAVIGATE","step":"Y","force":true}"#).unwrap();
        assert_eq!(action, Action::force_navigate("Y"));
        let action: Action = serde_json::from_str(
            r#"{"type":"RECOVER","code":"TIMEOUT","strategy":"skip_step"}"#,
        )
        .unwrap();
        assert_eq!(action.name(), "RECOVER");
        let json = serde_json::to_value(Action::Reset { keep_data: true }).unwrap();
        assert_eq!(json, json!({"type": "RESET", "keep_data": true}));
    }
}
