//! Simple, weighted and per-phase completion, plus remaining-time estimate.

use std::time::Duration;

use journey_types::JourneyState;
use serde::Serialize;

use crate::catalog::{Phase, StepCatalog};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseProgress {
    pub phase: Phase,
    pub percent: u32,
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressReport {
    /// Share of completed steps, 0–100.
    pub simple: u32,
    /// Share of completed weight, 0–100.
    pub weighted: u32,
    pub per_phase: Vec<PhaseProgress>,
    #[serde(with = "crate::duration_serde")]
    pub eta_remaining: Duration,
}

impl ProgressReport {
    pub fn phase(&self, phase: Phase) -> Option<&PhaseProgress> {
        self.per_phase.iter().find(|p| p.phase == phase)
    }
}

/// `round(100 * n / d)`, rounding half up. Zero when `d` is zero.
pub fn percent(n: u64, d: u64) -> u32 {
    if d == 0 {
        return 0;
    }
    ((200 * n + d) / (2 * d)) as u32
}

pub fn calculate(catalog: &StepCatalog, state: &JourneyState) -> ProgressReport {
    let completed: Vec<_> = catalog
        .steps()
        .iter()
        .filter(|s| state.is_completed(&s.id))
        .collect();

    let simple = percent(completed.len() as u64, catalog.len() as u64);
    let done_weight: u64 = completed.iter().map(|s| s.weight as u64).sum();
    let weighted = percent(done_weight, catalog.total_weight());

    let per_phase = Phase::ALL
        .iter()
        .map(|&phase| {
            let steps = catalog.steps_in_phase(phase);
            let done = steps.iter().filter(|s| state.is_completed(&s.id)).count();
            PhaseProgress {
                phase,
                percent: percent(done as u64, steps.len() as u64),
                completed: done,
                total: steps.len(),
            }
        })
        .collect();

    // Everything strictly after the current step, regardless of completion.
    let eta_remaining = catalog
        .index_of(&state.current_step)
        .map(|i| {
            catalog.steps()[i + 1..]
                .iter()
                .map(|s| s.estimated_duration)
                .sum::<Duration>()
        })
        .unwrap_or_default();

    ProgressReport {
        simple,
        weighted,
        per_phase,
        eta_remaining,
    }
}
