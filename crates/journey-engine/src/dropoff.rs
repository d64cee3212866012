//! Dropoff detection: steps where users keep failing or sit too long.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use journey_types::{AnalyticsEvent, AnalyticsEventType};
use serde::Serialize;

use crate::catalog::StepCatalog;
use crate::config::TelemetryConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DropoffReason {
    RepeatedErrors { count: u32, threshold: u32 },
    Stalled { elapsed_ms: u64, limit_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DropoffRisk {
    pub step: String,
    pub reason: DropoffReason,
}

/// Watches the event stream of one session.
#[derive(Debug, Clone)]
pub struct DropoffDetector {
    error_threshold: u32,
    max_durations: HashMap<String, Duration>,
    errors: BTreeMap<String, u32>,
    entered: BTreeMap<String, DateTime<Utc>>,
}

impl DropoffDetector {
    /// Maximum step durations come from the catalog estimate unless the
    /// config overrides them.
    pub fn new(catalog: &StepCatalog, config: &TelemetryConfig) -> Self {
        let max_durations = catalog
            .steps()
            .iter()
            .map(|s| {
                let max = config
                    .max_step_durations
                    .get(&s.id)
                    .copied()
                    .unwrap_or(s.estimated_duration);
                (s.id.clone(), max)
            })
            .collect();
        Self {
            error_threshold: config.error_threshold,
            max_durations,
            errors: BTreeMap::new(),
            entered: BTreeMap::new(),
        }
    }

    pub fn observe(&mut self, event: &AnalyticsEvent) {
        match event.event_type {
            AnalyticsEventType::Error => {
                *self.errors.entry(event.step.clone()).or_insert(0) += 1;
            }
            AnalyticsEventType::StepStarted => {
                self.entered.insert(event.step.clone(), event.timestamp);
            }
            AnalyticsEventType::StepCompleted | AnalyticsEventType::StepSkipped => {
                self.entered.remove(&event.step);
            }
            AnalyticsEventType::NavigationAttempted => self.observe_navigation(event),
            _ => {}
        }
    }

    /// Only the step the user is on accrues time.
    fn observe_navigation(&mut self, event: &AnalyticsEvent) {
        let payload = &event.payload;
        if payload.get("allowed").and_then(|v| v.as_bool()) != Some(true) {
            return;
        }
        let from = payload.get("from").and_then(|v| v.as_str());
        let to = payload.get("to").and_then(|v| v.as_str()).unwrap_or(&event.step);
        if let Some(from) = from.filter(|from| *from != to) {
            self.entered.remove(from);
        }
        self.entered
            .entry(to.to_string())
            .or_insert(event.timestamp);
    }

    pub fn assess(&self, now: DateTime<Utc>) -> Vec<DropoffRisk> {
        let mut risks: Vec<DropoffRisk> = self
            .errors
            .iter()
            .filter(|(_, count)| **count > self.error_threshold)
            .map(|(step, &count)| DropoffRisk {
                step: step.clone(),
                reason: DropoffReason::RepeatedErrors {
                    count,
                    threshold: self.error_threshold,
                },
            })
            .collect();

        for (step, since) in &self.entered {
            let Some(max) = self.max_durations.get(step) else {
                continue;
            };
            let elapsed = (now - *since).to_std().unwrap_or_default();
            let limit = max.saturating_mul(2);
            if elapsed > limit {
                risks.push(DropoffRisk {
                    step: step.clone(),
                    reason: DropoffReason::Stalled {
                        elapsed_ms: elapsed.as_millis() as u64,
                        limit_ms: limit.as_millis() as u64,
                    },
                });
            }
        }
        risks
    }

    /// Forget everything observed, for a new session.
    pub fn clear(&mut self) {
        self.errors.clear();
        self.entered.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Phase, StepDefinition};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 2, 8, 0, 0).unwrap()
    }

    fn detector(overrides: &[(&str, u64)]) -> DropoffDetector {
        let catalog = StepCatalog::new(vec![
            StepDefinition::new("draft", Phase::Scenario).duration(Duration::from_secs(300)),
            StepDefinition::new("render", Phase::Video).duration(Duration::from_secs(600)),
        ])
        .unwrap();
        let mut config = TelemetryConfig::default();
        for (step, secs) in overrides {
            config
                .max_step_durations
                .insert(step.to_string(), Duration::from_secs(*secs));
        }
        DropoffDetector::new(&catalog, &config)
    }

    fn event(kind: AnalyticsEventType, step: &str, at: DateTime<Utc>) -> AnalyticsEvent {
        AnalyticsEvent::new(kind, step, "s", at)
    }

    #[test]
    fn errors_above_threshold_are_flagged() {
        let mut d = detector(&[]);
        for _ in 0..3 {
            d.observe(&event(AnalyticsEventType::Error, "draft", t0()));
        }
        assert!(d.assess(t0()).is_empty());
        d.observe(&event(AnalyticsEventType::Error, "draft", t0()));
        assert_eq!(
            d.assess(t0()),
            vec![DropoffRisk {
                step: "draft".into(),
                reason: DropoffReason::RepeatedErrors { count: 4, threshold: 3 }
            }]
        );
    }

    #[test]
    fn stalled_step_uses_twice_the_max_duration() {
        let mut d = detector(&[]);
        d.observe(&event(AnalyticsEventType::StepStarted, "draft", t0()));
        assert!(d.assess(t0() + chrono::Duration::seconds(600)).is_empty());
        let risks = d.assess(t0() + chrono::Duration::seconds(601));
        assert_eq!(risks.len(), 1);
        assert!(matches!(risks[0].reason, DropoffReason::Stalled { limit_ms: 600_000, .. }));

        d.observe(&event(AnalyticsEventType::StepCompleted, "draft", t0()));
        assert!(d.assess(t0() + chrono::Duration::hours(5)).is_empty());
    }

    #[test]
    fn leaving_a_step_stops_its_clock() {
        let mut d = detector(&[]);
        let navigate = |from: &str, to: &str, allowed: bool| {
            event(AnalyticsEventType::NavigationAttempted, to, t0())
                .with_payload(serde_json::json!({ "from": from, "to": to, "allowed": allowed }))
        };
        d.observe(&event(AnalyticsEventType::StepStarted, "draft", t0()));
        d.observe(&event(AnalyticsEventType::StepStarted, "render", t0()));
        d.observe(&navigate("render", "draft", true));

        let risks = d.assess(t0() + chrono::Duration::minutes(30));
        assert_eq!(risks.len(), 1);
        assert_eq!(risks[0].step, "draft");

        // A refused navigation leaves the user where they were.
        d.observe(&navigate("draft", "render", false));
        let risks = d.assess(t0() + chrono::Duration::minutes(30));
        assert_eq!(risks.iter().map(|r| r.step.as_str()).collect::<Vec<_>>(), vec!["draft"]);
    }

    #[test]
    fn config_overrides_catalog_duration() {
        let mut d = detector(&[("render", 60)]);
        d.observe(&event(AnalyticsEventType::StepStarted, "render", t0()));
        assert_eq!(d.assess(t0() + chrono::Duration::seconds(121)).len(), 1);
        d.clear();
        assert!(d.assess(t0() + chrono::Duration::hours(1)).is_empty());
    }
}
