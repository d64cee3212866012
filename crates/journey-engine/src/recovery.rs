//! Error classification, remediation suggestions and bounded retry with backoff.

use std::time::Duration;

use journey_types::{ErrorSeverity, JourneyState};
use serde::{Deserialize, Serialize};

use crate::machine::Rejection;

/// Backoff policy controlling the delay between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// `step * (attempt + 1)`, capped at `max`.
    Linear {
        #[serde(with = "crate::duration_serde")]
        step: Duration,
        #[serde(with = "crate::duration_serde")]
        max: Duration,
    },
    /// `base * 2^attempt`, capped at `max`.
    Exponential {
        #[serde(with = "crate::duration_serde")]
        base: Duration,
        #[serde(with = "crate::duration_serde")]
        max: Duration,
    },
    /// No delay between attempts.
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::Linear { step, max } => {
                step.saturating_mul(attempt.saturating_add(1)).min(*max)
            }
            BackoffPolicy::Exponential { base, max } => {
                let millis = (base.as_millis() as u64).saturating_mul(2u64.saturating_pow(attempt));
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    pub backoff: BackoffPolicy,
    /// Recoveries allowed per error code.
    pub max_attempts: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_attempts: 3,
        }
    }
}

/// An approved recovery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryPlan {
    pub code: String,
    /// 1-based attempt number for this code.
    pub attempt: u32,
    /// How long the caller should wait before retrying the failed work.
    #[serde(with = "crate::duration_serde")]
    pub delay: Duration,
}

const FALLBACK_ACTIONS: [&str; 2] = ["retry", "reload"];

fn known_actions(code: &str) -> &'static [&'static str] {
    match code {
        "NETWORK_ERROR" => &["check_connection", "retry"],
        "TIMEOUT" => &["retry", "reduce_request_size"],
        "VALIDATION_ERROR" => &["review_input", "fix_highlighted_fields"],
        "GENERATION_FAILED" => &["retry", "simplify_prompt", "change_settings"],
        "AUTH_EXPIRED" => &["sign_in_again"],
        "QUOTA_EXCEEDED" => &["wait_for_quota_reset", "upgrade_plan"],
        "STORAGE_ERROR" => &["free_storage", "retry"],
        "SESSION_TIMEOUT" => &["resume_session", "reload"],
        _ => &[],
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryTracker {
    policy: RecoveryPolicy,
}

impl RecoveryTracker {
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    /// Suggested remediation for an error code: the code's own actions followed
    /// by the generic fallbacks, without duplicates.
    pub fn classify(code: &str) -> Vec<String> {
        let mut actions: Vec<String> = Vec::new();
        for action in known_actions(code).iter().chain(FALLBACK_ACTIONS.iter()) {
            if !actions.iter().any(|a| a == action) {
                actions.push(action.to_string());
            }
        }
        actions
    }

    pub fn is_recoverable(severity: ErrorSeverity) -> bool {
        severity.is_recoverable()
    }

    /// Decide whether a recovery for `code` (optionally on `step`) may proceed.
    pub fn plan(
        &self,
        state: &JourneyState,
        code: &str,
        step: Option<&str>,
    ) -> Result<RecoveryPlan, Rejection> {
        let mut matching = state
            .errors
            .iter()
            .filter(|e| e.code == code && step.map_or(true, |s| e.step == s))
            .peekable();
        if matching.peek().is_none() {
            return Err(Rejection::NoSuchError {
                code: code.to_string(),
            });
        }
        if matching.any(|e| !Self::is_recoverable(e.severity)) {
            return Err(Rejection::NotRecoverable {
                code: code.to_string(),
            });
        }

        let attempts = state
            .recovery_attempts_by_code
            .get(code)
            .copied()
            .unwrap_or(0);
        if attempts >= self.policy.max_attempts {
            return Err(Rejection::RecoveryExhausted {
                code: code.to_string(),
                attempts,
            });
        }
        Ok(RecoveryPlan {
            code: code.to_string(),
            attempt: attempts + 1,
            delay: self.policy.backoff.delay_for_attempt(attempts),
        })
    }
}

/// Run `f` up to `max_retries + 1` times, sleeping between attempts while the
/// error is [`journey_types::EngineError::is_retryable`].
pub async fn execute_with_retry<T, F, Fut>(
    f: F,
    max_retries: u32,
    policy: &BackoffPolicy,
    label: &str,
) -> journey_types::Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = journey_types::Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    operation = %label,
                    attempt,
                    delay_ms = %delay.as_millis(),
                    error = %e,
                    "Retryable error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use journey_types::{EngineError, JourneyError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn state_with(errors: Vec<JourneyError>) -> JourneyState {
        let mut state = JourneyState::new("a", "s", Utc::now());
        state.errors = errors;
        state
    }

    fn err(step: &str, code: &str, severity: ErrorSeverity) -> JourneyError {
        JourneyError::new(step, code, "boom", severity, Utc::now())
    }

    #[test]
    fn linear_backoff_grows_and_caps() {
        let policy = BackoffPolicy::Linear {
            step: Duration::from_millis(100),
            max: Duration::from_millis(250),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(250));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(64), Duration::from_millis(500));
        assert_eq!(BackoffPolicy::None.delay_for_attempt(5), Duration::ZERO);
    }

    #[test]
    fn backoff_deserializes_from_tagged_json() {
        let policy: BackoffPolicy =
            serde_json::from_str(r#"{"kind":"linear","step":"2s","max":"10s"}"#).unwrap();
        assert_eq!(
            policy,
            BackoffPolicy::Linear {
                step: Duration::from_secs(2),
                max: Duration::from_secs(10)
            }
        );
    }

    #[test]
    fn classify_known_and_unknown_codes() {
        assert_eq!(
            RecoveryTracker::classify("NETWORK_ERROR"),
            vec!["check_connection", "retry", "reload"]
        );
        assert_eq!(
            RecoveryTracker::classify("SESSION_TIMEOUT"),
            vec!["resume_session", "reload", "retry"]
        );
        assert_eq!(RecoveryTracker::classify("WHATEVER"), vec!["retry", "reload"]);
    }

    #[test]
    fn plan_counts_attempts_per_code() {
        let tracker = RecoveryTracker::default();
        let mut state = state_with(vec![err("a", "TIMEOUT", ErrorSeverity::Error)]);
        let plan = tracker.plan(&state, "TIMEOUT", None).unwrap();
        assert_eq!(plan.attempt, 1);
        assert_eq!(plan.delay, Duration::from_secs(1));

        state.recovery_attempts_by_code.insert("TIMEOUT".into(), 2);
        let plan = tracker.plan(&state, "TIMEOUT", Some("a")).unwrap();
        assert_eq!(plan.attempt, 3);
        assert_eq!(plan.delay, Duration::from_secs(4));

        state.recovery_attempts_by_code.insert("TIMEOUT".into(), 3);
        assert_eq!(
            tracker.plan(&state, "TIMEOUT", None).unwrap_err(),
            Rejection::RecoveryExhausted {
                code: "TIMEOUT".into(),
                attempts: 3
            }
        );
    }

    #[test]
    fn plan_refuses_missing_and_critical_errors() {
        let tracker = RecoveryTracker::default();
        let state = state_with(vec![err("a", "STORAGE_ERROR", ErrorSeverity::Critical)]);
        assert!(matches!(
            tracker.plan(&state, "TIMEOUT", None),
            Err(Rejection::NoSuchError { .. })
        ));
        assert!(matches!(
            tracker.plan(&state, "STORAGE_ERROR", Some("b")),
            Err(Rejection::NoSuchError { .. })
        ));
        assert!(matches!(
            tracker.plan(&state, "STORAGE_ERROR", None),
            Err(Rejection::NotRecoverable { .. })
        ));
    }

    #[tokio::test]
    async fn retry_on_retryable_error_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = execute_with_retry(
            move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(EngineError::Telemetry("sink down".into()))
                    } else {
                        Ok(7)
                    }
                }
            },
            3,
            &BackoffPolicy::None,
            "test",
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: journey_types::Result<()> = execute_with_retry(
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(EngineError::Config("bad".into()))
                }
            },
            3,
            &BackoffPolicy::None,
            "test",
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_return_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: journey_types::Result<()> = execute_with_retry(
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(EngineError::Persistence("disk".into()))
                }
            },
            2,
            &BackoffPolicy::None,
            "test",
        )
        .await;
        assert!(matches!(result, Err(EngineError::Persistence(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
