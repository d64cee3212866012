//! Journey runtime: the single serialized dispatch queue.
//!
//! One actor task owns the live [`JourneyState`]. Dispatches, restores and
//! timer ticks all arrive as commands on the same channel, so they are applied
//! strictly in order. After each command the actor publishes an immutable
//! `Arc<JourneyState>` on a watch channel, then derives analytics events from
//! the outcome and hands them to the telemetry worker and the event emitter.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use journey_types::{
    AnalyticsEvent, AnalyticsEventType, Clock, EngineError, ErrorSeverity, JourneyState, Result,
    StepStatus, SystemClock,
};
use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::catalog::StepCatalog;
use crate::config::EngineConfig;
use crate::dropoff::{DropoffDetector, DropoffRisk};
use crate::duration_serde::format_duration;
use crate::events::{EventEmitter, Subscription};
use crate::guards::GuardTable;
use crate::machine::{Action, ActionOutcome, AppliedEffect, FailureReport, StateMachine, Transition};
use crate::navigation;
use crate::persistence::{JourneySnapshot, SnapshotStore};
use crate::progress::{self, ProgressReport};
use crate::standard::standard_guards;
use crate::telemetry::{NullSink, TelemetryHandle, TelemetrySink, TelemetryStats};
use crate::timers::{
    ActiveTimer, Scheduler, SessionTimers, TickSender, TimerKind, TimerTick, TokioScheduler,
};
use crate::validation::ValidationResult;

/// What a dispatch produced: the published state and what happened.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub state: Arc<JourneyState>,
    pub outcome: ActionOutcome,
}

enum EngineCommand {
    Dispatch {
        action: Action,
        reply: oneshot::Sender<DispatchOutcome>,
    },
    Restore {
        snapshot: Box<JourneySnapshot>,
        reply: oneshot::Sender<Result<Arc<JourneyState>>>,
    },
    Tick(TimerTick),
    ActiveTimers(oneshot::Sender<Vec<ActiveTimer>>),
    Shutdown(oneshot::Sender<()>),
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a [`JourneyEngine`]. Everything has a default: the standard
/// catalog and guards, default config, system clock, tokio scheduler, a sink
/// that discards events and no snapshot store.
pub struct EngineBuilder {
    catalog: Option<Arc<StepCatalog>>,
    guards: Option<Arc<GuardTable>>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    sink: Arc<dyn TelemetrySink>,
    store: Option<Arc<dyn SnapshotStore>>,
    event_capacity: usize,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            catalog: None,
            guards: None,
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            scheduler: Arc::new(TokioScheduler),
            sink: Arc::new(NullSink),
            store: None,
            event_capacity: 256,
        }
    }
}

impl EngineBuilder {
    /// Use a custom catalog. Without explicit guards it runs unguarded.
    pub fn catalog(mut self, catalog: impl Into<Arc<StepCatalog>>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    pub fn guards(mut self, guards: impl Into<Arc<GuardTable>>) -> Self {
        self.guards = Some(guards.into());
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Capacity of the broadcast channel behind `subscribe` and `on_event`.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Start the engine and telemetry tasks. Must be called inside a tokio runtime.
    pub fn spawn(self) -> Result<EngineHandle> {
        self.config.check()?;
        let (catalog, guards) = match (self.catalog, self.guards) {
            (Some(catalog), Some(guards)) => (catalog, guards),
            (Some(catalog), None) => (catalog, Arc::new(GuardTable::empty())),
            (None, guards) => {
                let catalog = Arc::new(StepCatalog::standard()?);
                let guards = match guards {
                    Some(guards) => guards,
                    None => Arc::new(standard_guards(&catalog)?),
                };
                (catalog, guards)
            }
        };
        if let Some(rule) = guards
            .iter()
            .find(|r| !catalog.contains(&r.from) || !catalog.contains(&r.to))
        {
            return Err(EngineError::InvalidGuard {
                from: rule.from.clone(),
                to: rule.to.clone(),
                message: "guard refers to a step outside the catalog".into(),
            });
        }

        let machine = Arc::new(StateMachine::new(
            catalog.clone(),
            guards,
            self.config.recovery.clone(),
        ));
        let detector = DropoffDetector::new(&catalog, &self.config.telemetry);
        let (telemetry, _telemetry_task) =
            TelemetryHandle::spawn(self.sink, self.config.telemetry.clone(), detector);
        let emitter = EventEmitter::new(self.event_capacity);

        let (tx, rx) = mpsc::unbounded_channel();
        let weak = tx.downgrade();
        let ticks: TickSender = Arc::new(move |tick| {
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(EngineCommand::Tick(tick));
            }
        });
        let timers = SessionTimers::new(self.scheduler, self.config.timers.clone(), ticks);

        let initial = Arc::new(machine.initial_state(self.clock.now()));
        let (publish, state_rx) = watch::channel(initial.clone());

        let engine = JourneyEngine {
            machine: machine.clone(),
            config: self.config,
            clock: self.clock.clone(),
            store: self.store.clone(),
            telemetry: telemetry.clone(),
            emitter: emitter.clone(),
            timers,
            autosave: None,
            state: initial,
            publish,
        };
        tokio::spawn(engine.run(rx));
        tracing::debug!(steps = catalog.len(), "Journey engine started");

        Ok(EngineHandle {
            tx,
            machine,
            state_rx,
            emitter,
            telemetry,
            store: self.store,
            clock: self.clock,
        })
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// The actor that owns the live journey. Created through [`JourneyEngine::builder`].
pub struct JourneyEngine {
    machine: Arc<StateMachine>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn SnapshotStore>>,
    telemetry: TelemetryHandle,
    emitter: EventEmitter,
    timers: SessionTimers,
    /// The autosave in flight, if any. The actor never awaits it.
    autosave: Option<JoinHandle<()>>,
    state: Arc<JourneyState>,
    publish: watch::Sender<Arc<JourneyState>>,
}

impl JourneyEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                EngineCommand::Dispatch { action, reply } => {
                    let outcome = self.apply(action);
                    let _ = reply.send(outcome);
                }
                EngineCommand::Restore { snapshot, reply } => {
                    let _ = reply.send(self.restore(*snapshot));
                }
                EngineCommand::Tick(tick) => self.on_tick(tick),
                EngineCommand::ActiveTimers(reply) => {
                    let _ = reply.send(self.timers.active());
                }
                EngineCommand::Shutdown(done) => {
                    self.stop().await;
                    let _ = done.send(());
                    return;
                }
            }
        }
        self.stop().await;
    }

    async fn stop(&mut self) {
        self.timers.disarm();
        if let Some(task) = self.autosave.take() {
            task.abort();
        }
        if let Err(e) = self.telemetry.shutdown().await {
            tracing::debug!(error = %e, "Telemetry already stopped");
        }
        tracing::info!(session = %self.state.session_id(), "Journey engine stopped");
    }

    fn apply(&mut self, action: Action) -> DispatchOutcome {
        let started = Instant::now();
        let now = self.clock.now();
        let previous = self.state.clone();
        let Transition { mut state, outcome } = self.machine.reduce(&previous, &action, now);
        state.metadata.performance.last_dispatch_micros = started.elapsed().as_micros() as u64;
        let state = Arc::new(state);
        self.state = state.clone();
        self.publish.send_replace(state.clone());

        if matches!(
            outcome,
            ActionOutcome::Applied(
                AppliedEffect::SessionStarted { .. } | AppliedEffect::Reset { .. }
            )
        ) {
            self.change_session(previous.session_id(), state.session_id());
        } else if action.is_user_activity() {
            self.timers.touch();
        }

        for event in derive_events(&previous, &state, &action, &outcome, now) {
            self.telemetry.record(event.clone());
            self.emitter.emit(event);
        }

        DispatchOutcome { state, outcome }
    }

    fn change_session(&mut self, old: &str, new: &str) {
        self.timers.disarm();
        self.telemetry.rotate_session(old, new);
        self.timers.arm(new);
        tracing::info!(old = %old, session = %new, "Journey session changed");
    }

    fn restore(&mut self, snapshot: JourneySnapshot) -> Result<Arc<JourneyState>> {
        snapshot.validate_against(self.machine.catalog())?;
        let previous = self.state.clone();
        let state = Arc::new(snapshot.state);
        self.state = state.clone();
        self.publish.send_replace(state.clone());
        self.change_session(previous.session_id(), state.session_id());
        tracing::info!(
            session = %state.session_id(),
            step = %state.current_step,
            saved_at = %snapshot.saved_at,
            "Journey restored from snapshot"
        );
        Ok(state)
    }

    fn on_tick(&mut self, tick: TimerTick) {
        let live = tick.session_id == self.state.session_id()
            && self.timers.session() == Some(tick.session_id.as_str());
        if !live {
            tracing::debug!(
                kind = ?tick.kind,
                session = %tick.session_id,
                "Ignoring tick for stale session"
            );
            return;
        }
        match tick.kind {
            TimerKind::Autosave => self.autosave(),
            TimerKind::SessionTimeout => self.check_idle(),
            TimerKind::Heartbeat => self.heartbeat(),
        }
    }

    /// Hand the current snapshot to the store on its own task. At most one
    /// save is in flight; a tick that finds one still running is dropped.
    fn autosave(&mut self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        if self.autosave.as_ref().is_some_and(|task| !task.is_finished()) {
            tracing::warn!(
                session = %self.state.session_id(),
                "Previous autosave still running, skipping"
            );
            return;
        }
        let snapshot = JourneySnapshot::capture(&self.state, self.clock.now());
        self.autosave = Some(tokio::spawn(async move {
            match store.save(&snapshot).await {
                Ok(()) => tracing::debug!(session = %snapshot.session_id(), "Autosaved journey"),
                Err(e) => {
                    tracing::warn!(session = %snapshot.session_id(), error = %e, "Autosave failed")
                }
            }
        }));
    }

    fn check_idle(&mut self) {
        let now = self.clock.now();
        let idle = (now - self.state.session.last_activity).to_std().unwrap_or_default();
        if idle < self.config.timers.session_timeout {
            // Activity came in through a different clock path; check again later.
            self.timers.touch();
            return;
        }
        tracing::info!(
            session = %self.state.session_id(),
            idle = %format_duration(&idle),
            "Session idle past timeout"
        );
        let step = self.state.current_step.clone();
        self.apply(Action::Fail {
            step,
            error: FailureReport::new(
                "SESSION_TIMEOUT",
                format!("Session idle for {}", format_duration(&idle)),
                ErrorSeverity::Warning,
            ),
        });
    }

    fn heartbeat(&self) {
        let now = self.clock.now();
        let report = progress::calculate(self.machine.catalog(), &self.state);
        let event = AnalyticsEvent::new(
            AnalyticsEventType::PerformanceMeasured,
            &self.state.current_step,
            self.state.session_id(),
            now,
        )
        .with_user(self.state.session.user_id.clone())
        .with_payload(json!({
            "progress": report,
            "performance": self.state.metadata.performance,
        }));
        self.telemetry.record(event.clone());
        self.emitter.emit(event);
        self.telemetry.assess(now);
    }
}

/// Analytics events describing one reduction. All are tagged with the
/// session of the resulting state.
fn derive_events(
    previous: &JourneyState,
    next: &JourneyState,
    action: &Action,
    outcome: &ActionOutcome,
    now: DateTime<Utc>,
) -> Vec<AnalyticsEvent> {
    let event = |kind: AnalyticsEventType, step: &str, payload: serde_json::Value| {
        AnalyticsEvent::new(kind, step, next.session_id(), now)
            .with_user(next.session.user_id.clone())
            .with_payload(payload)
    };
    let started = |step: &str| {
        previous.status_of(step) != StepStatus::InProgress
            && next.status_of(step) == StepStatus::InProgress
    };

    let effect = match outcome {
        ActionOutcome::Rejected(rejection) => {
            let payload = json!({ "action": action.name(), "rejection": rejection });
            let mut events = Vec::new();
            if let Action::Navigate { step, force } = action {
                events.push(event(
                    AnalyticsEventType::NavigationAttempted,
                    step,
                    json!({
                        "from": previous.current_step,
                        "to": step,
                        "forced": force,
                        "allowed": false,
                    }),
                ));
            }
            events.push(event(
                AnalyticsEventType::ValidationFailed,
                &previous.current_step,
                payload,
            ));
            return events;
        }
        ActionOutcome::Applied(effect) => effect,
    };

    match effect {
        AppliedEffect::SessionStarted { .. } | AppliedEffect::Reset { .. } => {
            vec![event(AnalyticsEventType::StepStarted, &next.current_step, json!({}))]
        }
        AppliedEffect::Navigated {
            from,
            to,
            forced,
            guard_bypassed,
        } => {
            let mut events = vec![event(
                AnalyticsEventType::NavigationAttempted,
                to,
                json!({
                    "from": from,
                    "to": to,
                    "forced": forced,
                    "allowed": true,
                    "guard_bypassed": guard_bypassed,
                }),
            )];
            if started(to) {
                events.push(event(AnalyticsEventType::StepStarted, to, json!({ "from": from })));
            }
            events
        }
        AppliedEffect::Completed {
            step,
            newly,
            duration_ms,
        } => {
            if *newly {
                vec![event(
                    AnalyticsEventType::StepCompleted,
                    step,
                    json!({ "duration_ms": duration_ms }),
                )]
            } else {
                Vec::new()
            }
        }
        AppliedEffect::Failed { step, code, severity } => {
            let message = next
                .errors
                .iter()
                .rev()
                .find(|e| &e.step == step && &e.code == code)
                .map(|e| e.message.clone());
            vec![
                event(
                    AnalyticsEventType::StepFailed,
                    step,
                    json!({ "code": code, "severity": severity }),
                ),
                event(
                    AnalyticsEventType::Error,
                    step,
                    json!({ "code": code, "severity": severity, "message": message }),
                ),
            ]
        }
        AppliedEffect::ProgressUpdated {
            step,
            progress,
            record_completed,
        } => {
            if *record_completed {
                vec![event(
                    AnalyticsEventType::StepCompleted,
                    step,
                    json!({ "via": "progress", "progress": progress }),
                )]
            } else {
                Vec::new()
            }
        }
        AppliedEffect::DataPersisted { key } => {
            vec![event(
                AnalyticsEventType::DataPersisted,
                &next.current_step,
                json!({ "key": key }),
            )]
        }
        AppliedEffect::Skipped { step } => {
            vec![event(AnalyticsEventType::StepSkipped, step, json!({}))]
        }
        AppliedEffect::Recovered {
            step,
            removed,
            plan,
            strategy,
        } => {
            let step = step.as_deref().unwrap_or(&next.current_step);
            let mut events = vec![event(
                AnalyticsEventType::RecoveryAttempted,
                step,
                json!({ "plan": plan, "strategy": strategy, "removed": removed }),
            )];
            if started(step) {
                events.push(event(
                    AnalyticsEventType::StepStarted,
                    step,
                    json!({ "via": "recovery" }),
                ));
            }
            events
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineCommand>,
    machine: Arc<StateMachine>,
    state_rx: watch::Receiver<Arc<JourneyState>>,
    emitter: EventEmitter,
    telemetry: TelemetryHandle,
    store: Option<Arc<dyn SnapshotStore>>,
    clock: Arc<dyn Clock>,
}

impl EngineHandle {
    fn send(&self, command: EngineCommand) -> Result<()> {
        self.tx.send(command).map_err(|_| EngineError::EngineClosed)
    }

    /// Queue an action and wait for it to be applied.
    pub async fn dispatch(&self, action: Action) -> Result<DispatchOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Dispatch { action, reply })?;
        rx.await.map_err(|_| EngineError::EngineClosed)
    }

    /// The most recently published state.
    pub fn state(&self) -> Arc<JourneyState> {
        self.state_rx.borrow().clone()
    }

    /// A receiver that sees every published state.
    pub fn watch(&self) -> watch::Receiver<Arc<JourneyState>> {
        self.state_rx.clone()
    }

    pub fn catalog(&self) -> &StepCatalog {
        self.machine.catalog()
    }

    pub fn validate(&self, from: &str, to: &str, state: &JourneyState) -> ValidationResult {
        self.machine.validator().validate(from, to, state)
    }

    pub fn progress(&self, state: &JourneyState) -> ProgressReport {
        progress::calculate(self.machine.catalog(), state)
    }

    pub fn next_allowed_step(&self, state: &JourneyState) -> Option<String> {
        navigation::next_allowed_step(self.machine.validator(), &state.current_step, state)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AnalyticsEvent> {
        self.emitter.subscribe()
    }

    pub fn on_event<F>(&self, handler: F) -> Subscription
    where
        F: FnMut(AnalyticsEvent) + Send + 'static,
    {
        self.emitter.on_event(handler)
    }

    /// Validate `snapshot` against the catalog and make it the live state.
    pub async fn restore(&self, snapshot: JourneySnapshot) -> Result<Arc<JourneyState>> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Restore {
            snapshot: Box::new(snapshot),
            reply,
        })?;
        rx.await.map_err(|_| EngineError::EngineClosed)?
    }

    /// Restore the session saved under `session_id`, if the store has it.
    pub async fn resume(&self, session_id: &str) -> Result<Option<Arc<JourneyState>>> {
        let store = self.require_store()?;
        match store.load(session_id).await? {
            Some(snapshot) => self.restore(snapshot).await.map(Some),
            None => Ok(None),
        }
    }

    /// Save the current state now, outside the autosave cycle.
    pub async fn save_snapshot(&self) -> Result<JourneySnapshot> {
        let store = self.require_store()?;
        let snapshot = JourneySnapshot::capture(&self.state(), self.clock.now());
        store.save(&snapshot).await?;
        Ok(snapshot)
    }

    fn require_store(&self) -> Result<&Arc<dyn SnapshotStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| EngineError::Persistence("no snapshot store configured".into()))
    }

    pub async fn flush_telemetry(&self) -> Result<usize> {
        self.telemetry.flush().await
    }

    pub async fn telemetry_stats(&self) -> Result<TelemetryStats> {
        self.telemetry.stats().await
    }

    pub async fn dropoff_report(&self) -> Result<Vec<DropoffRisk>> {
        self.telemetry.dropoff_report(self.clock.now()).await
    }

    pub async fn active_timers(&self) -> Result<Vec<ActiveTimer>> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::ActiveTimers(reply))?;
        rx.await.map_err(|_| EngineError::EngineClosed)
    }

    /// Stop timers, flush telemetry and end the actor.
    pub async fn shutdown(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(EngineCommand::Shutdown(done))?;
        rx.await.map_err(|_| EngineError::EngineClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Phase, StepDefinition};
    use crate::machine::Rejection;
    use crate::telemetry::RecordingSink;
    use chrono::TimeZone;
    use journey_types::ManualClock;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap()
    }

    fn small_catalog() -> StepCatalog {
        StepCatalog::new(vec![
            StepDefinition::new("login", Phase::Authentication),
            StepDefinition::new("draft", Phase::Scenario).requires(&["scenario.draft"]),
            StepDefinition::new("render", Phase::Video).depends_on(&["draft"]),
        ])
        .unwrap()
    }

    fn engine(sink: &RecordingSink) -> EngineHandle {
        let mut config = EngineConfig::default();
        config.telemetry.mode = crate::config::DeliveryMode::Immediate;
        JourneyEngine::builder()
            .catalog(small_catalog())
            .config(config)
            .clock(Arc::new(ManualClock::new(t0())))
            .sink(Arc::new(sink.clone()))
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn dispatch_publishes_state() {
        let handle = engine(&RecordingSink::new());
        let out = handle.dispatch(Action::start("u-1")).await.unwrap();
        assert!(out.outcome.is_applied());
        assert_eq!(handle.state().session_id(), out.state.session_id());
        assert_eq!(handle.state().current_step, "login");
        assert_eq!(handle.state().metadata.performance.dispatch_count, 1);
    }

    #[tokio::test]
    async fn rejections_come_back_in_the_outcome() {
        let handle = engine(&RecordingSink::new());
        handle.dispatch(Action::start("u-1")).await.unwrap();
        let out = handle.dispatch(Action::navigate("nowhere")).await.unwrap();
        assert_eq!(
            out.outcome.rejection(),
            Some(&Rejection::UnknownStep { step: "nowhere".into() })
        );
        assert_eq!(out.state.metadata.performance.rejected_count, 1);
    }

    #[tokio::test]
    async fn outcomes_become_analytics_events() {
        let sink = RecordingSink::new();
        let handle = engine(&sink);
        let mut rx = handle.subscribe();
        handle.dispatch(Action::start("u-1")).await.unwrap();
        handle.dispatch(Action::complete("login")).await.unwrap();
        handle.dispatch(Action::complete("login")).await.unwrap();
        handle.dispatch(Action::navigate("draft")).await.unwrap();
        handle.flush_telemetry().await.unwrap();

        let kinds: Vec<_> = sink.events().into_iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![
                AnalyticsEventType::StepStarted,
                AnalyticsEventType::StepCompleted,
                AnalyticsEventType::NavigationAttempted,
                AnalyticsEventType::StepStarted,
            ]
        );
        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type, AnalyticsEventType::StepStarted);
        assert_eq!(first.user_id.as_deref(), Some("u-1"));
    }

    #[tokio::test]
    async fn pure_queries_read_snapshots() {
        let handle = engine(&RecordingSink::new());
        handle.dispatch(Action::start("u-1")).await.unwrap();
        handle.dispatch(Action::complete("login")).await.unwrap();
        let state = handle.state();
        assert_eq!(handle.progress(&state).simple, 33);
        assert!(!handle.validate("login", "draft", &state).is_valid);
        assert_eq!(handle.next_allowed_step(&state), None);
    }

    #[tokio::test]
    async fn restore_rejects_foreign_snapshot() {
        let handle = engine(&RecordingSink::new());
        let mut state = JourneyState::new("login", "s-restored", t0());
        state.current_step = "ghost".into();
        let err = handle
            .restore(JourneySnapshot::capture(&state, t0()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidSnapshot(_)));
    }

    #[tokio::test]
    async fn save_without_store_is_a_persistence_error() {
        let handle = engine(&RecordingSink::new());
        assert!(matches!(
            handle.save_snapshot().await,
            Err(EngineError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn guards_outside_catalog_are_rejected() {
        let standard = StepCatalog::standard().unwrap();
        let guards = standard_guards(&standard).unwrap();
        let result = JourneyEngine::builder()
            .catalog(small_catalog())
            .guards(guards)
            .spawn();
        assert!(matches!(result, Err(EngineError::InvalidGuard { .. })));
    }

    #[tokio::test]
    async fn shutdown_closes_the_handle() {
        let handle = engine(&RecordingSink::new());
        handle.shutdown().await.unwrap();
        assert!(matches!(
            handle.dispatch(Action::start("u")).await,
            Err(EngineError::EngineClosed)
        ));
    }
}
