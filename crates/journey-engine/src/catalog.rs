use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use journey_types::{DataArea, EngineError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Authentication,
    Scenario,
    Planning,
    Video,
    Feedback,
    Completion,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Authentication,
        Phase::Scenario,
        Phase::Planning,
        Phase::Video,
        Phase::Feedback,
        Phase::Completion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Authentication => "authentication",
            Phase::Scenario => "scenario",
            Phase::Planning => "planning",
            Phase::Video => "video",
            Phase::Feedback => "feedback",
            Phase::Completion => "completion",
        }
    }

    /// The data area that steps of this phase write into.
    pub fn data_area(&self) -> DataArea {
        match self {
            Phase::Authentication => DataArea::Auth,
            Phase::Scenario => DataArea::Scenario,
            Phase::Planning => DataArea::Planning,
            Phase::Video => DataArea::Video,
            Phase::Feedback => DataArea::Feedback,
            Phase::Completion => DataArea::Project,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Validation rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum RulePredicate {
    MinLength(usize),
    MaxLength(usize),
    Pattern(Regex),
    OneOf(Vec<String>),
    MinItems(usize),
    Range { min: f64, max: f64 },
}

impl RulePredicate {
    pub fn pattern(pattern: &str) -> std::result::Result<Self, regex::Error> {
        Regex::new(pattern).map(RulePredicate::Pattern)
    }

    pub fn one_of(options: &[&str]) -> Self {
        RulePredicate::OneOf(options.iter().map(|s| s.to_string()).collect())
    }

    /// Evaluate against a present value. Type mismatches fail the rule.
    pub fn check(&self, value: &Value) -> bool {
        match (self, value) {
            (RulePredicate::MinLength(n), Value::String(s)) => s.trim().chars().count() >= *n,
            (RulePredicate::MaxLength(n), Value::String(s)) => s.chars().count() <= *n,
            (RulePredicate::Pattern(re), Value::String(s)) => re.is_match(s),
            (RulePredicate::OneOf(options), Value::String(s)) => options.iter().any(|o| o == s),
            (RulePredicate::MinItems(n), Value::Array(items)) => items.len() >= *n,
            (RulePredicate::Range { min, max }, Value::Number(num)) => num
                .as_f64()
                .is_some_and(|v| v >= *min && v <= *max),
            _ => false,
        }
    }

    /// Short machine-readable name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            RulePredicate::MinLength(_) => "min_length",
            RulePredicate::MaxLength(_) => "max_length",
            RulePredicate::Pattern(_) => "pattern",
            RulePredicate::OneOf(_) => "one_of",
            RulePredicate::MinItems(_) => "min_items",
            RulePredicate::Range { .. } => "range",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationRule {
    pub path: String,
    pub predicate: RulePredicate,
    pub message: String,
}

// ---------------------------------------------------------------------------
// StepDefinition
// ---------------------------------------------------------------------------

/// One entry in the step catalog.
#[derive(Debug, Clone)]
pub struct StepDefinition {
    pub id: String,
    pub title: String,
    pub phase: Phase,
    pub required_data: Vec<String>,
    pub optional_data: Vec<String>,
    pub validation_rules: Vec<ValidationRule>,
    pub dependencies: Vec<String>,
    pub estimated_duration: Duration,
    pub can_skip: bool,
    /// Named situations in which skipping is expected. Informational only;
    /// `can_skip` alone decides skippability.
    pub skip_conditions: Vec<String>,
    /// Complexity weight for weighted progress. Independent of duration.
    pub weight: u32,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, phase: Phase) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            phase,
            required_data: Vec::new(),
            optional_data: Vec::new(),
            validation_rules: Vec::new(),
            dependencies: Vec::new(),
            estimated_duration: Duration::from_secs(60),
            can_skip: false,
            skip_conditions: Vec::new(),
            weight: 1,
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn requires(mut self, paths: &[&str]) -> Self {
        self.required_data.extend(paths.iter().map(|p| p.to_string()));
        self
    }

    pub fn optional(mut self, paths: &[&str]) -> Self {
        self.optional_data.extend(paths.iter().map(|p| p.to_string()));
        self
    }

    pub fn rule(mut self, path: &str, predicate: RulePredicate, message: &str) -> Self {
        self.validation_rules.push(ValidationRule {
            path: path.to_string(),
            predicate,
            message: message.to_string(),
        });
        self
    }

    pub fn depends_on(mut self, steps: &[&str]) -> Self {
        self.dependencies.extend(steps.iter().map(|s| s.to_string()));
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.estimated_duration = duration;
        self
    }

    pub fn skippable(mut self, conditions: &[&str]) -> Self {
        self.can_skip = true;
        self.skip_conditions.extend(conditions.iter().map(|c| c.to_string()));
        self
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

// ---------------------------------------------------------------------------
// StepCatalog
// ---------------------------------------------------------------------------

/// Immutable ordered list of steps with id and phase indices.
#[derive(Debug, Clone)]
pub struct StepCatalog {
    steps: Vec<StepDefinition>,
    index: HashMap<String, usize>,
    phases: BTreeMap<Phase, Vec<usize>>,
}

fn check_path(step: &str, path: &str) -> Result<()> {
    let area = path.split('.').next().unwrap_or_default();
    if path.is_empty() || path.split('.').count() < 2 || area.parse::<DataArea>().is_err() {
        return Err(EngineError::InvalidRule {
            step: step.to_string(),
            path: path.to_string(),
            message: "path must be '<area>.<key>' with a known data area".into(),
        });
    }
    Ok(())
}

impl StepCatalog {
    /// Build a catalog, enforcing that ids are unique and every dependency
    /// appears strictly earlier in the list. Since dependencies can only point
    /// backwards, the dependency graph cannot contain a cycle.
    pub fn new(steps: Vec<StepDefinition>) -> Result<Self> {
        if steps.is_empty() {
            return Err(EngineError::EmptyCatalog);
        }

        let mut index = HashMap::with_capacity(steps.len());
        let mut phases: BTreeMap<Phase, Vec<usize>> = BTreeMap::new();
        for (pos, step) in steps.iter().enumerate() {
            if index.insert(step.id.clone(), pos).is_some() {
                return Err(EngineError::DuplicateStep {
                    step: step.id.clone(),
                });
            }
            phases.entry(step.phase).or_default().push(pos);
        }

        for (pos, step) in steps.iter().enumerate() {
            for dep in &step.dependencies {
                match index.get(dep) {
                    None => {
                        return Err(EngineError::UnknownDependency {
                            step: step.id.clone(),
                            dependency: dep.clone(),
                        })
                    }
                    Some(&dep_pos) if dep_pos >= pos => {
                        return Err(EngineError::DependencyOrder {
                            step: step.id.clone(),
                            dependency: dep.clone(),
                        })
                    }
                    Some(_) => {}
                }
            }
            for path in step.required_data.iter().chain(&step.optional_data) {
                check_path(&step.id, path)?;
            }
            for rule in &step.validation_rules {
                check_path(&step.id, &rule.path)?;
            }
        }

        tracing::debug!(steps = steps.len(), "Step catalog built");
        Ok(Self {
            steps,
            index,
            phases,
        })
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn by_id(&self, id: &str) -> Option<&StepDefinition> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Steps of one phase, in catalog order. Empty if the phase has no steps.
    pub fn steps_in_phase(&self, phase: Phase) -> Vec<&StepDefinition> {
        self.phases
            .get(&phase)
            .map(|positions| positions.iter().map(|&i| &self.steps[i]).collect())
            .unwrap_or_default()
    }

    pub fn first(&self) -> &StepDefinition {
        &self.steps[0]
    }

    pub fn last(&self) -> &StepDefinition {
        &self.steps[self.steps.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The step after `id` in catalog order.
    pub fn after(&self, id: &str) -> Option<&StepDefinition> {
        self.index_of(id).and_then(|i| self.steps.get(i + 1))
    }

    /// The step before `id` in catalog order.
    pub fn before(&self, id: &str) -> Option<&StepDefinition> {
        self.index_of(id)
            .and_then(|i| i.checked_sub(1))
            .map(|i| &self.steps[i])
    }

    pub fn total_weight(&self) -> u64 {
        self.steps.iter().map(|s| s.weight as u64).sum()
    }
}
