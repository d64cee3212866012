//! Analytics event fan-out.
//!
//! The runtime emits [`AnalyticsEvent`]s through a [`tokio::sync::broadcast`]
//! channel so observers can follow a journey without coupling to the engine.
//! Delivery to the telemetry sink is separate and goes through the buffer.

use journey_types::AnalyticsEvent;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<AnalyticsEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: AnalyticsEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AnalyticsEvent> {
        self.sender.subscribe()
    }

    /// Run `handler` for every event on a background task until the returned
    /// subscription is dropped.
    pub fn on_event<F>(&self, mut handler: F) -> Subscription
    where
        F: FnMut(AnalyticsEvent) + Send + 'static,
    {
        let mut rx = self.sender.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => handler(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event handler lagged, events skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { task }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Handle for an `on_event` handler. Dropping it stops the handler.
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use journey_types::AnalyticsEventType;
    use std::sync::{Arc, Mutex};

    fn event(step: &str) -> AnalyticsEvent {
        AnalyticsEvent::new(AnalyticsEventType::StepStarted, step, "s1", Utc::now())
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let emitter = EventEmitter::new(16);
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        emitter.emit(event("auth_login"));

        assert_eq!(rx1.recv().await.unwrap().step, "auth_login");
        assert_eq!(rx2.recv().await.unwrap().step, "auth_login");
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new(16);
        emitter.emit(event("x"));
    }

    #[tokio::test]
    async fn handler_runs_until_subscription_dropped() {
        let emitter = EventEmitter::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = emitter.on_event(move |e| sink.lock().unwrap().push(e.step));

        emitter.emit(event("a"));
        emitter.emit(event("b"));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);

        drop(sub);
        tokio::task::yield_now().await;
        emitter.emit(event("c"));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
