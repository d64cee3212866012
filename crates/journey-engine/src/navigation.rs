//! Forward scan for the next actionable step.
//!
//! Starting after the current step, each candidate is validated with
//! `from = current`. The first candidate that can proceed wins. A blocked
//! mandatory step stops the scan; a blocked skippable step is passed over.

use journey_types::JourneyState;

use crate::catalog::StepCatalog;
use crate::validation::{TransitionValidator, ValidationResult};

/// Result of a forward scan.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    /// The next step that may be entered.
    Next(String),
    /// A mandatory step that cannot be entered yet, with its diagnostics.
    Blocked { step: String, result: ValidationResult },
    /// Nothing left to scan: the current step is last, unknown, or every
    /// remaining step is a blocked skippable one.
    End,
}

pub fn scan_forward(
    validator: &TransitionValidator,
    current: &str,
    state: &JourneyState,
) -> ScanOutcome {
    let catalog = validator.catalog();
    let Some(index) = catalog.index_of(current) else {
        return ScanOutcome::End;
    };

    for candidate in &catalog.steps()[index + 1..] {
        let result = validator.validate(current, &candidate.id, state);
        if result.can_proceed {
            tracing::debug!(from = current, to = %candidate.id, "Next step resolved");
            return ScanOutcome::Next(candidate.id.clone());
        }
        if !candidate.can_skip {
            return ScanOutcome::Blocked {
                step: candidate.id.clone(),
                result,
            };
        }
    }
    ScanOutcome::End
}

/// The next step the user may move to from `current`, or `None`.
pub fn next_allowed_step(
    validator: &TransitionValidator,
    current: &str,
    state: &JourneyState,
) -> Option<String> {
    match scan_forward(validator, current, state) {
        ScanOutcome::Next(step) => Some(step),
        ScanOutcome::Blocked { .. } | ScanOutcome::End => None,
    }
}

/// The step before `current` in catalog order, for backward navigation.
pub fn previous_step(catalog: &StepCatalog, current: &str) -> Option<String> {
    catalog.before(current).map(|s| s.id.clone())
}
