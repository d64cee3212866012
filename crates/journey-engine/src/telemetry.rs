//! Telemetry buffer: asynchronous delivery of analytics events to a sink.
//!
//! A dedicated worker task owns the buffer and is fed through an unbounded
//! channel, so recording never waits on delivery. Events are delivered
//! immediately or in batches, retried with backoff, and re-queued when the sink
//! keeps failing. The buffer is bounded by `capacity`; overflowing drops the
//! oldest events with a warning. Events from different sessions never share a
//! delivery.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use journey_types::{AnalyticsEvent, EngineError, Result};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::{DeliveryMode, TelemetryConfig};
use crate::dropoff::{DropoffDetector, DropoffRisk};
use crate::recovery::execute_with_retry;

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Destination for analytics events.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn deliver(&self, events: &[AnalyticsEvent]) -> Result<()>;
}

/// Accepts and discards everything.
pub struct NullSink;

#[async_trait]
impl TelemetrySink for NullSink {
    async fn deliver(&self, _events: &[AnalyticsEvent]) -> Result<()> {
        Ok(())
    }
}

/// Writes each delivered event to the `tracing` log.
pub struct LogSink;

#[async_trait]
impl TelemetrySink for LogSink {
    async fn deliver(&self, events: &[AnalyticsEvent]) -> Result<()> {
        for event in events {
            tracing::info!(
                session = %event.session_id,
                step = %event.step,
                event = ?event.event_type,
                payload = %event.payload,
                "analytics"
            );
        }
        Ok(())
    }
}

/// Keeps every delivered batch in memory. Can be told to fail the next N deliveries.
#[derive(Clone, Default)]
pub struct RecordingSink {
    batches: Arc<Mutex<Vec<Vec<AnalyticsEvent>>>>,
    failures: Arc<AtomicU32>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<Vec<AnalyticsEvent>> {
        self.batches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.batches().into_iter().flatten().collect()
    }
}

#[async_trait]
impl TelemetrySink for RecordingSink {
    async fn deliver(&self, events: &[AnalyticsEvent]) -> Result<()> {
        let should_fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(EngineError::Telemetry("recording sink told to fail".into()));
        }
        self.batches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(events.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TelemetryStats {
    pub buffered: usize,
    pub delivered: u64,
    pub dropped: u64,
    pub failed_deliveries: u64,
    pub session: Option<String>,
}

enum TelemetryCommand {
    Record(AnalyticsEvent),
    Flush(oneshot::Sender<Result<usize>>),
    RotateSession { old: String, new: String },
    Assess {
        now: DateTime<Utc>,
        reply: Option<oneshot::Sender<Vec<DropoffRisk>>>,
    },
    Stats(oneshot::Sender<TelemetryStats>),
    Shutdown(oneshot::Sender<()>),
}

struct TelemetryWorker {
    sink: Arc<dyn TelemetrySink>,
    config: TelemetryConfig,
    buffer: VecDeque<AnalyticsEvent>,
    detector: DropoffDetector,
    stats: TelemetryStats,
}

impl TelemetryWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<TelemetryCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                TelemetryCommand::Record(event) => self.record(event).await,
                TelemetryCommand::Flush(reply) => {
                    let _ = reply.send(self.flush().await);
                }
                TelemetryCommand::RotateSession { old, new } => self.rotate(old, new).await,
                TelemetryCommand::Assess { now, reply } => {
                    let risks = self.detector.assess(now);
                    for risk in &risks {
                        tracing::warn!(step = %risk.step, reason = ?risk.reason, "Dropoff risk");
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(risks);
                    }
                }
                TelemetryCommand::Stats(reply) => {
                    let mut stats = self.stats.clone();
                    stats.buffered = self.buffer.len();
                    let _ = reply.send(stats);
                }
                TelemetryCommand::Shutdown(done) => {
                    if let Err(e) = self.flush().await {
                        tracing::warn!(
                            error = %e,
                            dropped = self.buffer.len(),
                            "Final telemetry flush failed"
                        );
                    }
                    let _ = done.send(());
                    break;
                }
            }
        }
        tracing::debug!("Telemetry worker stopped");
    }

    async fn record(&mut self, event: AnalyticsEvent) {
        let current = self
            .stats
            .session
            .get_or_insert_with(|| event.session_id.clone());
        if *current != event.session_id {
            tracing::warn!(
                current = %current,
                event_session = %event.session_id,
                "Dropping event from another session"
            );
            self.stats.dropped += 1;
            return;
        }
        self.detector.observe(&event);
        self.buffer.push_back(event);

        let due = match self.config.mode {
            DeliveryMode::Immediate => true,
            DeliveryMode::Batched { batch_size } => self.buffer.len() >= batch_size,
        };
        if due || self.buffer.len() >= self.config.capacity {
            if let Err(e) = self.flush().await {
                tracing::warn!(
                    error = %e,
                    buffered = self.buffer.len(),
                    "Telemetry delivery failed"
                );
            }
        }
    }

    /// Deliver everything buffered. On failure the batch goes back to the
    /// front of the buffer, trimmed to capacity.
    async fn flush(&mut self) -> Result<usize> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        let batch: Vec<AnalyticsEvent> = self.buffer.drain(..).collect();
        let sink = &self.sink;
        let result = execute_with_retry(
            || sink.deliver(&batch),
            self.config.max_retries,
            &self.config.backoff,
            "telemetry",
        )
        .await;

        match result {
            Ok(()) => {
                self.stats.delivered += batch.len() as u64;
                tracing::debug!(events = batch.len(), "Telemetry delivered");
                Ok(batch.len())
            }
            Err(e) => {
                self.stats.failed_deliveries += 1;
                let mut requeued: VecDeque<AnalyticsEvent> = batch.into();
                requeued.append(&mut self.buffer);
                self.buffer = requeued;
                let overflow = self.buffer.len().saturating_sub(self.config.capacity);
                if overflow > 0 {
                    self.buffer.drain(..overflow);
                    self.stats.dropped += overflow as u64;
                    tracing::warn!(
                        dropped = overflow,
                        capacity = self.config.capacity,
                        "Telemetry buffer full, oldest events dropped"
                    );
                }
                Err(e)
            }
        }
    }

    async fn rotate(&mut self, old: String, new: String) {
        if let Err(e) = self.flush().await {
            tracing::warn!(error = %e, session = %old, "Flush before session rotation failed");
        }
        if !self.buffer.is_empty() {
            tracing::warn!(
                session = %old,
                discarded = self.buffer.len(),
                "Discarding undelivered events of previous session"
            );
            self.stats.dropped += self.buffer.len() as u64;
            self.buffer.clear();
        }
        self.detector.clear();
        tracing::debug!(old = %old, new = %new, "Telemetry session rotated");
        self.stats.session = Some(new);
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cheap, cloneable handle to the telemetry worker.
#[derive(Clone)]
pub struct TelemetryHandle {
    tx: mpsc::UnboundedSender<TelemetryCommand>,
}

impl TelemetryHandle {
    pub fn spawn(
        sink: Arc<dyn TelemetrySink>,
        config: TelemetryConfig,
        detector: DropoffDetector,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = TelemetryWorker {
            sink,
            config,
            buffer: VecDeque::new(),
            detector,
            stats: TelemetryStats::default(),
        };
        let task = tokio::spawn(worker.run(rx));
        (Self { tx }, task)
    }

    fn send(&self, command: TelemetryCommand) -> Result<()> {
        self.tx.send(command).map_err(|_| EngineError::EngineClosed)
    }

    /// Queue an event. Never blocks.
    pub fn record(&self, event: AnalyticsEvent) {
        if self.send(TelemetryCommand::Record(event)).is_err() {
            tracing::debug!("Telemetry worker gone, event discarded");
        }
    }

    /// Deliver everything buffered now. Returns how many events were delivered.
    pub async fn flush(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(TelemetryCommand::Flush(reply))?;
        rx.await.map_err(|_| EngineError::EngineClosed)?
    }

    /// Flush the old session, discard what could not be delivered, then accept
    /// only events of `new`.
    pub fn rotate_session(&self, old: impl Into<String>, new: impl Into<String>) {
        let _ = self.send(TelemetryCommand::RotateSession {
            old: old.into(),
            new: new.into(),
        });
    }

    /// Log any dropoff risks as of `now`.
    pub fn assess(&self, now: DateTime<Utc>) {
        let _ = self.send(TelemetryCommand::Assess { now, reply: None });
    }

    pub async fn dropoff_report(&self, now: DateTime<Utc>) -> Result<Vec<DropoffRisk>> {
        let (reply, rx) = oneshot::channel();
        self.send(TelemetryCommand::Assess {
            now,
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| EngineError::EngineClosed)
    }

    pub async fn stats(&self) -> Result<TelemetryStats> {
        let (reply, rx) = oneshot::channel();
        self.send(TelemetryCommand::Stats(reply))?;
        rx.await.map_err(|_| EngineError::EngineClosed)
    }

    /// Flush and stop the worker.
    pub async fn shutdown(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(TelemetryCommand::Shutdown(done))?;
        rx.await.map_err(|_| EngineError::EngineClosed)
    }
}
