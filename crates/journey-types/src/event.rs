//! Structured analytics events describing engine activity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsEventType {
    StepStarted,
    StepCompleted,
    StepFailed,
    StepSkipped,
    NavigationAttempted,
    ValidationFailed,
    Error,
    RecoveryAttempted,
    DataPersisted,
    PerformanceMeasured,
}

/// One telemetry record. Events are tagged with the session that produced
/// them so a buffer never mixes sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub event_type: AnalyticsEventType,
    pub step: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub user_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl AnalyticsEvent {
    pub fn new(
        event_type: AnalyticsEventType,
        step: impl Into<String>,
        session_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type,
            step: step.into(),
            timestamp,
            session_id: session_id.into(),
            user_id: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_string(&AnalyticsEventType::NavigationAttempted).unwrap(),
            "\"navigation_attempted\""
        );
        assert_eq!(
            serde_json::to_string(&AnalyticsEventType::PerformanceMeasured).unwrap(),
            "\"performance_measured\""
        );
    }

    #[test]
    fn builder_sets_user_and_payload() {
        let event = AnalyticsEvent::new(
            AnalyticsEventType::StepCompleted,
            "auth_login",
            "s1",
            Utc::now(),
        )
        .with_user(Some("u-7".into()))
        .with_payload(serde_json::json!({"duration_ms": 42}));
        assert_eq!(event.user_id.as_deref(), Some("u-7"));
        assert_eq!(event.payload["duration_ms"], 42);
    }

    #[test]
    fn missing_payload_deserializes_as_null() {
        let json = r#"{
            "event_type": "error",
            "step": "video_generate",
            "timestamp": "2026-03-01T09:00:00Z",
            "session_id": "s1",
            "user_id": null
        }"#;
        let event: AnalyticsEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.event_type, AnalyticsEventType::Error);
        assert!(event.payload.is_null());
    }
}
