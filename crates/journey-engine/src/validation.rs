//! Transition validation: checks and diagnostics.
//!
//! A transition `(from, to)` is run through a fixed list of checks
//! (required data, dependencies, guard, critical errors, validation rules).
//! Findings are folded into a [`ValidationResult`]. Validation never fails;
//! problems are always reported as data.

use std::sync::Arc;

use journey_types::JourneyState;

use crate::catalog::{StepCatalog, StepDefinition};
use crate::guards::{GuardTable, NavigationGuardRule};

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    UnknownStep,
    Dependency,
    Guard,
    Critical,
    Rule,
}

impl IssueKind {
    /// Blocking issues stop a transition even when the target step is skippable.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, IssueKind::Rule)
    }
}

/// One problem found while validating a transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    /// The step the issue is about.
    pub step: String,
    /// Data path involved, for rule failures.
    pub field: Option<String>,
    /// Rule, guard or dependency name involved.
    pub rule: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub missing_data: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<ValidationIssue>,
    pub can_proceed: bool,
    pub recommended_action: Option<String>,
    /// Where a failed guard suggests sending the user instead.
    pub redirect: Option<String>,
}

impl ValidationResult {
    pub fn blocking(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.errors.iter().filter(|e| e.kind.is_blocking())
    }

    pub fn has_blocking(&self) -> bool {
        self.blocking().next().is_some()
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// Everything a check may look at.
struct TransitionContext<'a> {
    from: &'a str,
    to: &'a StepDefinition,
    state: &'a JourneyState,
    guard: Option<&'a NavigationGuardRule>,
}

#[derive(Debug, Clone, PartialEq)]
enum Finding {
    Missing(String),
    Warning(String),
    Issue(ValidationIssue),
    Redirect(String),
    /// A failed guard waived because the target may be skipped.
    Overridden(String),
}

trait TransitionCheck: Send + Sync {
    fn apply(&self, ctx: &TransitionContext<'_>) -> Vec<Finding>;
}

struct RequiredDataCheck;
impl TransitionCheck for RequiredDataCheck {
    fn apply(&self, ctx: &TransitionContext<'_>) -> Vec<Finding> {
        let data = &ctx.state.data;
        let missing = ctx
            .to
            .required_data
            .iter()
            .filter(|path| !data.is_present(path))
            .map(|path| Finding::Missing(path.clone()));
        let unset_optional = ctx
            .to
            .optional_data
            .iter()
            .filter(|path| !data.is_present(path))
            .map(|path| Finding::Warning(format!("Optional '{path}' is not set")));
        missing.chain(unset_optional).collect()
    }
}

struct DependencyCheck;
impl TransitionCheck for DependencyCheck {
    fn apply(&self, ctx: &TransitionContext<'_>) -> Vec<Finding> {
        ctx.to
            .dependencies
            .iter()
            .filter(|dep| !ctx.state.is_completed(dep))
            .map(|dep| {
                Finding::Issue(ValidationIssue {
                    kind: IssueKind::Dependency,
                    step: ctx.to.id.clone(),
                    field: None,
                    rule: Some(dep.clone()),
                    message: format!("Step '{}' requires '{}' to be completed", ctx.to.id, dep),
                })
            })
            .collect()
    }
}

struct GuardCheck;
impl TransitionCheck for GuardCheck {
    fn apply(&self, ctx: &TransitionContext<'_>) -> Vec<Finding> {
        let Some(guard) = ctx.guard else {
            return vec![];
        };
        if guard.evaluate(&ctx.state.data) {
            return vec![];
        }
        if guard.allow_skip_override && ctx.to.can_skip {
            return vec![Finding::Overridden(format!(
                "Guard '{}' not satisfied, '{}' may be skipped: {}",
                guard.name, ctx.to.id, guard.message
            ))];
        }
        let mut findings = vec![Finding::Issue(ValidationIssue {
            kind: IssueKind::Guard,
            step: ctx.to.id.clone(),
            field: guard.reads().first().map(|k| k.to_string()),
            rule: Some(guard.name.clone()),
            message: guard.message.clone(),
        })];
        if let Some(redirect) = &guard.redirect {
            findings.push(Finding::Redirect(redirect.clone()));
        }
        findings
    }
}

struct CriticalErrorCheck;
impl TransitionCheck for CriticalErrorCheck {
    fn apply(&self, ctx: &TransitionContext<'_>) -> Vec<Finding> {
        match ctx.state.unresolved_critical(ctx.from) {
            Some(err) => vec![Finding::Issue(ValidationIssue {
                kind: IssueKind::Critical,
                step: ctx.from.to_string(),
                field: None,
                rule: Some(err.code.clone()),
                message: format!(
                    "Critical error '{}' on '{}': {}",
                    err.code, err.step, err.message
                ),
            })],
            None => vec![],
        }
    }
}

struct RuleCheck;
impl TransitionCheck for RuleCheck {
    fn apply(&self, ctx: &TransitionContext<'_>) -> Vec<Finding> {
        ctx.to
            .validation_rules
            .iter()
            .filter_map(|rule| {
                let value = ctx.state.data.get(&rule.path)?;
                if journey_types::data::is_empty_value(value) || rule.predicate.check(value) {
                    return None;
                }
                Some(Finding::Issue(ValidationIssue {
                    kind: IssueKind::Rule,
                    step: ctx.to.id.clone(),
                    field: Some(rule.path.clone()),
                    rule: Some(rule.predicate.name().to_string()),
                    message: rule.message.clone(),
                }))
            })
            .collect()
    }
}

fn default_checks() -> Vec<Box<dyn TransitionCheck>> {
    vec![
        Box::new(RequiredDataCheck),
        Box::new(DependencyCheck),
        Box::new(GuardCheck),
        Box::new(CriticalErrorCheck),
        Box::new(RuleCheck),
    ]
}

// ---------------------------------------------------------------------------
// TransitionValidator
// ---------------------------------------------------------------------------

pub struct TransitionValidator {
    catalog: Arc<StepCatalog>,
    guards: Arc<GuardTable>,
    checks: Vec<Box<dyn TransitionCheck>>,
}

impl TransitionValidator {
    pub fn new(catalog: Arc<StepCatalog>, guards: Arc<GuardTable>) -> Self {
        Self {
            catalog,
            guards,
            checks: default_checks(),
        }
    }

    pub fn catalog(&self) -> &StepCatalog {
        &self.catalog
    }

    pub fn guards(&self) -> &GuardTable {
        &self.guards
    }

    /// Validate moving from `from` to `to` in the given state.
    pub fn validate(&self, from: &str, to: &str, state: &JourneyState) -> ValidationResult {
        let Some(target) = self.catalog.by_id(to) else {
            return unknown_step_result(to);
        };
        let mut result = ValidationResult {
            is_valid: true,
            missing_data: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
            can_proceed: false,
            recommended_action: None,
            redirect: None,
        };
        if !self.catalog.contains(from) {
            result.errors.push(ValidationIssue {
                kind: IssueKind::UnknownStep,
                step: from.to_string(),
                field: None,
                rule: None,
                message: format!("Step '{from}' is not in the catalog"),
            });
        }

        let ctx = TransitionContext {
            from,
            to: target,
            state,
            guard: self.guards.get(from, to),
        };
        let mut overridden = false;
        for check in &self.checks {
            for finding in check.apply(&ctx) {
                match finding {
                    Finding::Missing(path) => result.missing_data.push(path),
                    Finding::Warning(w) => result.warnings.push(w),
                    Finding::Issue(issue) => result.errors.push(issue),
                    Finding::Redirect(step) => result.redirect = Some(step),
                    Finding::Overridden(w) => {
                        overridden = true;
                        result.warnings.push(w);
                    }
                }
            }
        }

        result.is_valid =
            !overridden && result.missing_data.is_empty() && result.errors.is_empty();
        result.can_proceed = result.is_valid || (target.can_skip && !result.has_blocking());
        result.recommended_action = recommend(&result, target);
        if !result.can_proceed {
            tracing::debug!(
                from,
                to,
                missing = result.missing_data.len(),
                errors = result.errors.len(),
                "Transition blocked"
            );
        }
        result
    }
}

fn unknown_step_result(to: &str) -> ValidationResult {
    ValidationResult {
        is_valid: false,
        missing_data: Vec::new(),
        warnings: Vec::new(),
        errors: vec![ValidationIssue {
            kind: IssueKind::UnknownStep,
            step: to.to_string(),
            field: None,
            rule: None,
            message: format!("Step '{to}' is not in the catalog"),
        }],
        can_proceed: false,
        recommended_action: Some("Choose a step from the catalog".into()),
        redirect: None,
    }
}

/// Blocking errors first, then missing data, then rule failures.
fn recommend(result: &ValidationResult, target: &StepDefinition) -> Option<String> {
    if let Some(issue) = result.blocking().next() {
        let hint = match issue.kind {
            IssueKind::Dependency => format!(
                "Complete '{}' first",
                issue.rule.as_deref().unwrap_or_default()
            ),
            IssueKind::Guard => match &result.redirect {
                Some(redirect) => format!("Return to '{redirect}': {}", issue.message),
                None => issue.message.clone(),
            },
            IssueKind::Critical => format!(
                "Resolve critical error '{}' or reset the journey",
                issue.rule.as_deref().unwrap_or_default()
            ),
            IssueKind::UnknownStep => "Choose a step from the catalog".to_string(),
            IssueKind::Rule => issue.message.clone(),
        };
        return Some(hint);
    }
    if let Some(path) = result.missing_data.first() {
        return Some(format!("Provide '{path}' before continuing to '{}'", target.id));
    }
    result
        .errors
        .iter()
        .find(|e| e.kind == IssueKind::Rule)
        .map(|issue| match &issue.field {
            Some(field) => format!("Fix '{field}': {}", issue.message),
            None => issue.message.clone(),
        })
}
