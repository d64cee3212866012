//! Engine configuration, loaded from JSON with human-readable durations.
//!
//! ```json
//! {
//!   "timers": { "autosave": "30s", "session_timeout": "30m", "heartbeat": "60s" },
//!   "telemetry": { "mode": { "kind": "batched", "batch_size": 10 }, "capacity": 100 },
//!   "recovery": { "max_attempts": 3 }
//! }
//! ```
//!
//! Every field is optional; missing fields take their defaults.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use journey_types::{EngineError, Result};
use serde::{Deserialize, Serialize};

use crate::duration_serde::format_duration;
use crate::recovery::{BackoffPolicy, RecoveryPolicy};

/// Upper bound for any timer period.
pub const MAX_TIMER_PERIOD: Duration = Duration::from_secs(365 * 86_400);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    #[serde(with = "crate::duration_serde")]
    pub autosave: Duration,
    /// Idle time after which a `SESSION_TIMEOUT` warning is recorded.
    #[serde(with = "crate::duration_serde")]
    pub session_timeout: Duration,
    #[serde(with = "crate::duration_serde")]
    pub heartbeat: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            autosave: Duration::from_secs(30),
            session_timeout: Duration::from_secs(30 * 60),
            heartbeat: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Deliver every event as soon as it is recorded.
    Immediate,
    /// Deliver once `batch_size` events are buffered.
    Batched { batch_size: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub mode: DeliveryMode,
    /// Upper bound on buffered events.
    pub capacity: usize,
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    /// Error events per step above which a dropoff risk is flagged.
    pub error_threshold: u32,
    /// Per-step overrides of the maximum expected time in a step.
    #[serde(with = "crate::duration_serde::map")]
    pub max_step_durations: BTreeMap<String, Duration>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::Batched { batch_size: 10 },
            capacity: 100,
            max_retries: 3,
            backoff: BackoffPolicy::Exponential {
                base: Duration::from_millis(500),
                max: Duration::from_secs(30),
            },
            error_threshold: 3,
            max_step_durations: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub timers: TimerConfig,
    pub telemetry: TelemetryConfig,
    pub recovery: RecoveryPolicy,
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Reject values the runtime cannot work with.
    pub fn check(&self) -> Result<()> {
        let timers = &self.timers;
        for (name, value) in [
            ("autosave", timers.autosave),
            ("session_timeout", timers.session_timeout),
            ("heartbeat", timers.heartbeat),
        ] {
            if value.is_zero() {
                return Err(EngineError::Config(format!("timers.{name} must be greater than zero")));
            }
            if value > MAX_TIMER_PERIOD {
                return Err(EngineError::Config(format!(
                    "timers.{name} must be at most {}",
                    format_duration(&MAX_TIMER_PERIOD)
                )));
            }
        }
        if let DeliveryMode::Batched { batch_size } = self.telemetry.mode {
            if batch_size == 0 || batch_size > self.telemetry.capacity {
                return Err(EngineError::Config(format!(
                    "telemetry batch size {batch_size} must be between 1 and capacity {}",
                    self.telemetry.capacity
                )));
            }
        }
        if self.telemetry.capacity == 0 {
            return Err(EngineError::Config("telemetry.capacity must be at least 1".into()));
        }
        Ok(())
    }
}
