//! Navigation guards: named predicates gating one specific step-to-step transition.
//!
//! Guards live in a table keyed by `(from, to)`. A guard is consulted only for
//! the exact pair it declares; pairs without a guard have no extra check beyond
//! dependencies and data.

use std::collections::HashMap;

use journey_types::{DataArea, DataBag, EngineError, Result};

use crate::catalog::StepCatalog;
use crate::condition::{evaluate_condition, parse_condition, ConditionExpr};

#[derive(Debug, Clone)]
pub struct NavigationGuardRule {
    pub name: String,
    pub from: String,
    pub to: String,
    pub condition: ConditionExpr,
    pub message: String,
    pub redirect: Option<String>,
    /// Waive the guard when the target step may be skipped.
    pub allow_skip_override: bool,
}

impl NavigationGuardRule {
    pub fn new(
        name: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: &str,
        message: impl Into<String>,
    ) -> Result<Self> {
        let from = from.into();
        let to = to.into();
        let condition = parse_condition(condition).map_err(|e| EngineError::InvalidGuard {
            from: from.clone(),
            to: to.clone(),
            message: e.to_string(),
        })?;
        Ok(Self {
            name: name.into(),
            from,
            to,
            condition,
            message: message.into(),
            redirect: None,
            allow_skip_override: false,
        })
    }

    pub fn with_redirect(mut self, step: impl Into<String>) -> Self {
        self.redirect = Some(step.into());
        self
    }

    pub fn allowing_skip_override(mut self) -> Self {
        self.allow_skip_override = true;
        self
    }

    pub fn evaluate(&self, data: &DataBag) -> bool {
        evaluate_condition(&self.condition, data)
    }

    /// Data-bag paths the predicate reads.
    pub fn reads(&self) -> Vec<&str> {
        self.condition.keys()
    }
}

/// Guard rules keyed by `(from, to)`.
#[derive(Debug, Clone, Default)]
pub struct GuardTable {
    rules: HashMap<(String, String), NavigationGuardRule>,
}

impl GuardTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a table, checking every guard against the catalog.
    pub fn new(rules: Vec<NavigationGuardRule>, catalog: &StepCatalog) -> Result<Self> {
        let mut table = HashMap::with_capacity(rules.len());
        for rule in rules {
            let invalid = |message: String| EngineError::InvalidGuard {
                from: rule.from.clone(),
                to: rule.to.clone(),
                message,
            };
            for step in [&rule.from, &rule.to] {
                if !catalog.contains(step) {
                    return Err(invalid(format!("unknown step '{step}'")));
                }
            }
            if let Some(redirect) = &rule.redirect {
                if !catalog.contains(redirect) {
                    return Err(invalid(format!("unknown redirect step '{redirect}'")));
                }
            }
            for key in rule.reads() {
                let area = key.split('.').next().unwrap_or_default();
                if area.parse::<DataArea>().is_err() {
                    return Err(invalid(format!("'{key}' is not a data-bag path")));
                }
            }
            let pair = (rule.from.clone(), rule.to.clone());
            if table.contains_key(&pair) {
                return Err(invalid("duplicate guard for this transition".into()));
            }
            table.insert(pair, rule);
        }
        Ok(Self { rules: table })
    }

    pub fn get(&self, from: &str, to: &str) -> Option<&NavigationGuardRule> {
        self.rules.get(&(from.to_string(), to.to_string()))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NavigationGuardRule> {
        self.rules.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Phase, StepDefinition};
    use serde_json::json;

    fn catalog() -> StepCatalog {
        StepCatalog::new(vec![
            StepDefinition::new("x", Phase::Planning),
            StepDefinition::new("y", Phase::Video),
        ])
        .unwrap()
    }

    fn locked_guard() -> NavigationGuardRule {
        NavigationGuardRule::new(
            "storyboard_locked",
            "x",
            "y",
            "planning.locked=true",
            "Lock the storyboard first",
        )
        .unwrap()
        .with_redirect("x")
    }

    #[test]
    fn lookup_is_by_exact_pair() {
        let table = GuardTable::new(vec![locked_guard()], &catalog()).unwrap();
        assert!(table.get("x", "y").is_some());
        assert!(table.get("y", "x").is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn evaluate_reads_data_bag() {
        let guard = locked_guard();
        let mut data = DataBag::new();
        assert!(!guard.evaluate(&data));
        data.merge("planning.locked", json!(true)).unwrap();
        assert!(guard.evaluate(&data));
        assert_eq!(guard.reads(), vec!["planning.locked"]);
    }

    #[test]
    fn unknown_steps_are_rejected() {
        let guard = NavigationGuardRule::new("g", "x", "ghost", "planning.locked", "nope").unwrap();
        let err = GuardTable::new(vec![guard], &catalog()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidGuard { .. }));
        assert!(err.is_configuration());
    }

    #[test]
    fn unknown_redirect_is_rejected() {
        let guard = locked_guard().with_redirect("ghost");
        assert!(GuardTable::new(vec![guard], &catalog()).is_err());
    }

    #[test]
    fn non_data_keys_are_rejected() {
        let guard = NavigationGuardRule::new("g", "x", "y", "outcome=success", "nope").unwrap();
        assert!(GuardTable::new(vec![guard], &catalog()).is_err());
    }

    #[test]
    fn duplicate_pairs_are_rejected() {
        assert!(GuardTable::new(vec![locked_guard(), locked_guard()], &catalog()).is_err());
    }

    #[test]
    fn bad_condition_is_a_guard_error() {
        let err = NavigationGuardRule::new("g", "x", "y", "planning.locked=", "nope").unwrap_err();
        assert!(matches!(err, EngineError::InvalidGuard { .. }));
    }
}
