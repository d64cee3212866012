//! Session timers: autosave, session timeout and heartbeat.
//!
//! Timers never touch journey state. When they fire they post a [`TimerTick`]
//! tagged with the session they were armed for; the runtime drops ticks whose
//! session is no longer live. Arming always cancels whatever was running.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::TimerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    Autosave,
    SessionTimeout,
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerTick {
    pub kind: TimerKind,
    pub session_id: String,
}

/// Where ticks go. The runtime posts them into its dispatch queue.
pub type TickSender = Arc<dyn Fn(TimerTick) + Send + Sync>;

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Something that can be cancelled and asked whether it has finished.
pub trait Cancel: Send + Sync {
    fn cancel(&self);
    fn is_finished(&self) -> bool;
}

impl Cancel for JoinHandle<()> {
    fn cancel(&self) {
        self.abort();
    }

    fn is_finished(&self) -> bool {
        JoinHandle::is_finished(self)
    }
}

/// A scheduled timer. Dropping the handle cancels it.
pub struct TimerHandle {
    inner: Box<dyn Cancel>,
}

impl TimerHandle {
    pub fn new(inner: impl Cancel + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.inner.is_finished()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.inner.cancel();
    }
}

pub trait Scheduler: Send + Sync {
    /// Run `task` every `period`, first after one period.
    fn every(&self, period: Duration, task: Box<dyn Fn() + Send + Sync>) -> TimerHandle;
    /// Run `task` once after `delay`.
    fn after(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TimerHandle;
}

/// Schedules on the current tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn every(&self, period: Duration, task: Box<dyn Fn() + Send + Sync>) -> TimerHandle {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                task();
            }
        });
        TimerHandle::new(handle)
    }

    fn after(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        TimerHandle::new(handle)
    }
}

// ---------------------------------------------------------------------------
// SessionTimers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveTimer {
    pub kind: TimerKind,
    pub session_id: String,
    #[serde(with = "crate::duration_serde")]
    pub period: Duration,
}

struct LiveTimer {
    info: ActiveTimer,
    handle: TimerHandle,
}

/// The timers of the one live session.
pub struct SessionTimers {
    scheduler: Arc<dyn Scheduler>,
    config: TimerConfig,
    ticks: TickSender,
    session: Option<String>,
    live: Vec<LiveTimer>,
}

impl SessionTimers {
    pub fn new(scheduler: Arc<dyn Scheduler>, config: TimerConfig, ticks: TickSender) -> Self {
        Self {
            scheduler,
            config,
            ticks,
            session: None,
            live: Vec::new(),
        }
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Cancel everything, then arm autosave, session timeout and heartbeat for `session_id`.
    pub fn arm(&mut self, session_id: &str) {
        self.disarm();
        self.session = Some(session_id.to_string());
        self.schedule_every(TimerKind::Autosave, self.config.autosave);
        self.schedule_timeout();
        self.schedule_every(TimerKind::Heartbeat, self.config.heartbeat);
        tracing::debug!(session = session_id, timers = self.live.len(), "Session timers armed");
    }

    /// Restart the session-timeout countdown after user activity.
    pub fn touch(&mut self) {
        if self.session.is_none() {
            return;
        }
        self.live.retain(|t| t.info.kind != TimerKind::SessionTimeout);
        self.schedule_timeout();
    }

    pub fn disarm(&mut self) {
        for timer in self.live.drain(..) {
            timer.handle.cancel();
        }
        if let Some(session) = self.session.take() {
            tracing::debug!(session = %session, "Session timers disarmed");
        }
    }

    /// Timers that are still scheduled to fire.
    pub fn active(&self) -> Vec<ActiveTimer> {
        self.live
            .iter()
            .filter(|t| t.handle.is_active())
            .map(|t| t.info.clone())
            .collect()
    }

    fn tick_fn(&self, kind: TimerKind, session_id: String) -> impl Fn() + Send + Sync + 'static {
        let ticks = self.ticks.clone();
        move || {
            ticks(TimerTick {
                kind,
                session_id: session_id.clone(),
            })
        }
    }

    fn schedule_every(&mut self, kind: TimerKind, period: Duration) {
        let Some(session_id) = self.session.clone() else {
            return;
        };
        let handle = self
            .scheduler
            .every(period, Box::new(self.tick_fn(kind, session_id.clone())));
        self.live.push(LiveTimer {
            info: ActiveTimer {
                kind,
                session_id,
                period,
            },
            handle,
        });
    }

    fn schedule_timeout(&mut self) {
        let Some(session_id) = self.session.clone() else {
            return;
        };
        let period = self.config.session_timeout;
        let fire = self.tick_fn(TimerKind::SessionTimeout, session_id.clone());
        let handle = self.scheduler.after(period, Box::new(move || fire()));
        self.live.push(LiveTimer {
            info: ActiveTimer {
                kind: TimerKind::SessionTimeout,
                session_id,
                period,
            },
            handle,
        });
    }
}

impl Drop for SessionTimers {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (TickSender, Arc<Mutex<Vec<TimerTick>>>) {
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let sink = ticks.clone();
        let sender: TickSender = Arc::new(move |tick| sink.lock().unwrap().push(tick));
        (sender, ticks)
    }

    fn config() -> TimerConfig {
        TimerConfig {
            autosave: Duration::from_secs(30),
            session_timeout: Duration::from_secs(10),
            heartbeat: Duration::from_secs(60),
        }
    }

    fn count(ticks: &Arc<Mutex<Vec<TimerTick>>>, kind: TimerKind, session: &str) -> usize {
        ticks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.kind == kind && t.session_id == session)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_timers_fire_for_armed_session() {
        let (sender, ticks) = recorder();
        let mut timers = SessionTimers::new(Arc::new(TokioScheduler), config(), sender);
        timers.arm("s1");
        assert_eq!(timers.active().len(), 3);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(count(&ticks, TimerKind::Autosave, "s1"), 2);
        assert_eq!(count(&ticks, TimerKind::Heartbeat, "s1"), 1);
        assert_eq!(count(&ticks, TimerKind::SessionTimeout, "s1"), 1);
        // The one-shot timeout has fired and is no longer active.
        assert_eq!(timers.active().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_cancels_previous_session() {
        let (sender, ticks) = recorder();
        let mut timers = SessionTimers::new(Arc::new(TokioScheduler), config(), sender);
        timers.arm("s1");
        timers.arm("s2");
        let active = timers.active();
        assert_eq!(active.len(), 3);
        assert!(active.iter().all(|t| t.session_id == "s2"));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(count(&ticks, TimerKind::Autosave, "s1"), 0);
        assert_eq!(count(&ticks, TimerKind::Autosave, "s2"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_restarts_timeout() {
        let (sender, ticks) = recorder();
        let mut timers = SessionTimers::new(Arc::new(TokioScheduler), config(), sender);
        timers.arm("s1");
        tokio::time::sleep(Duration::from_secs(8)).await;
        timers.touch();
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(count(&ticks, TimerKind::SessionTimeout, "s1"), 0);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(count(&ticks, TimerKind::SessionTimeout, "s1"), 1);
        assert_eq!(
            timers
                .active()
                .iter()
                .filter(|t| t.kind == TimerKind::SessionTimeout)
                .count(),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_and_drop_stop_everything() {
        let (sender, ticks) = recorder();
        let mut timers = SessionTimers::new(Arc::new(TokioScheduler), config(), sender.clone());
        timers.arm("s1");
        timers.disarm();
        assert!(timers.active().is_empty());
        assert!(timers.session().is_none());

        let mut other = SessionTimers::new(Arc::new(TokioScheduler), config(), sender);
        other.arm("s2");
        drop(other);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(ticks.lock().unwrap().is_empty());
    }
}
