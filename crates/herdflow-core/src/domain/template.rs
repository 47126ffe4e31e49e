use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::action::{ActionType, WorkflowAction};
use super::condition::{FieldRegistry, WorkflowCondition};
use super::instance::{AnimalProfile, StepId, TemplateId};
use crate::CoreError;

/// Kind of work a step represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    /// Clinical exam
    Exam,
    /// Injection
    Injection,
    /// Procedure (ET, OPU, flushing)
    Procedure,
    /// Waiting period
    Wait,
    /// Branching decision
    Decision,
    /// Staff notification
    Notification,
}

/// Reproductive role of an animal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnimalRole {
    /// Embryo donor
    Donor,
    /// Embryo recipient
    Recipient,
    /// Natural breeding
    Breeding,
    /// Matches any role
    All,
}

/// Scheduling priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    /// Low
    Low,
    /// Medium
    Medium,
    /// High
    High,
    /// Urgent
    Urgent,
}

/// Protocol family of a template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemplateCategory {
    /// Full donor cycle
    DonorComplete,
    /// Recipient synchronization
    RecipientSync,
    /// Breeding cycle
    BreedingCycle,
    /// Operator-defined
    Custom,
}

/// One step of a workflow template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    /// Step ID, unique within the template
    pub id: StepId,

    /// Display name
    pub name: String,

    /// Description
    #[serde(default)]
    pub description: String,

    /// Kind of step
    pub step_type: StepType,

    /// Position; unique and increasing along every path
    pub order: u32,

    /// Must hold when the step is entered, otherwise the step is skipped
    #[serde(default)]
    pub entry_conditions: Vec<WorkflowCondition>,

    /// Dispatched when the step is entered
    #[serde(default)]
    pub on_start_actions: Vec<WorkflowAction>,

    /// Evaluated on every trigger event for the step
    #[serde(default)]
    pub exit_conditions: Vec<WorkflowCondition>,

    /// Dispatched when the exit conditions hold
    #[serde(default)]
    pub on_success_actions: Vec<WorkflowAction>,

    /// Dispatched when the exit conditions fail
    #[serde(default)]
    pub on_failure_actions: Vec<WorkflowAction>,

    /// Next step when the exit conditions hold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_next_step: Option<StepId>,

    /// Next step when the exit conditions fail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_next_step: Option<StepId>,

    /// Fallback for either outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_next_step: Option<StepId>,

    /// Pointers to earlier (or the same) step an operator has declared as loops
    #[serde(default)]
    pub loop_back_steps: Vec<StepId>,

    /// Expected duration in days
    #[serde(default)]
    pub estimated_duration: f64,

    /// Days to wait for a trigger before the step times out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wait_days: Option<f64>,

    /// Role the animal must have
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_role: Option<AnimalRole>,

    /// Species the step applies to; empty means any
    #[serde(default)]
    pub required_species: Vec<String>,

    /// Requires manual intervention
    #[serde(default)]
    pub is_manual_step: bool,

    /// Shown on dashboards
    #[serde(default)]
    pub display_in_dashboard: bool,

    /// Staff must be notified on entry
    #[serde(default)]
    pub notification_required: bool,
}

fn non_empty(pointer: &Option<StepId>) -> Option<&StepId> {
    pointer.as_ref().filter(|id| !id.0.is_empty())
}

impl WorkflowStep {
    /// Create a step with no conditions, actions or pointers
    pub fn new(id: &str, name: &str, step_type: StepType, order: u32) -> Self {
        Self {
            id: StepId(id.to_string()),
            name: name.to_string(),
            description: String::new(),
            step_type,
            order,
            entry_conditions: Vec::new(),
            on_start_actions: Vec::new(),
            exit_conditions: Vec::new(),
            on_success_actions: Vec::new(),
            on_failure_actions: Vec::new(),
            success_next_step: None,
            failure_next_step: None,
            default_next_step: None,
            loop_back_steps: Vec::new(),
            estimated_duration: 0.0,
            max_wait_days: None,
            required_role: None,
            required_species: Vec::new(),
            is_manual_step: false,
            display_in_dashboard: true,
            notification_required: false,
        }
    }

    /// Success pointer, empty IDs treated as terminal
    pub fn success_next(&self) -> Option<&StepId> {
        non_empty(&self.success_next_step)
    }

    /// Failure pointer, empty IDs treated as terminal
    pub fn failure_next(&self) -> Option<&StepId> {
        non_empty(&self.failure_next_step)
    }

    /// Default pointer, empty IDs treated as terminal
    pub fn default_next(&self) -> Option<&StepId> {
        non_empty(&self.default_next_step)
    }

    /// All outgoing pointers
    pub fn next_pointers(&self) -> impl Iterator<Item = &StepId> {
        [self.success_next(), self.failure_next(), self.default_next()]
            .into_iter()
            .flatten()
    }

    /// Whether the step applies to the animal
    pub fn applies_to(&self, animal: &AnimalProfile) -> bool {
        let role_ok = match self.required_role {
            None | Some(AnimalRole::All) => true,
            Some(role) => animal.roles.contains(&role),
        };
        let species_ok = self.required_species.is_empty()
            || self
                .required_species
                .iter()
                .any(|s| s.eq_ignore_ascii_case("ALL") || s.eq_ignore_ascii_case(&animal.species));
        role_ok && species_ok
    }
}

/// Immutable, versioned protocol definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTemplate {
    /// Template ID, shared by all versions
    pub id: TemplateId,

    /// Display name
    pub name: String,

    /// Description
    #[serde(default)]
    pub description: String,

    /// Protocol family
    pub category: TemplateCategory,

    /// Roles the template may be started for
    pub applicable_roles: Vec<AnimalRole>,

    /// Species the template may be started for ("ALL" matches any)
    pub applicable_species: Vec<String>,

    /// Steps
    pub steps: Vec<WorkflowStep>,

    /// First step
    pub starting_step: StepId,

    /// Maximum days for the whole workflow
    pub max_duration: u32,

    /// Default priority of started workflows
    pub priority: Priority,

    /// Start automatically when an applicable animal is assigned
    #[serde(default)]
    pub auto_start: bool,

    /// Expected success rate in percent
    #[serde(default)]
    pub expected_success_rate: f64,

    /// Version number, assigned by the registry
    #[serde(default)]
    pub version: u32,

    /// Whether new instances may be started
    #[serde(default = "default_active")]
    pub is_active: bool,

    /// Author
    #[serde(default)]
    pub created_by: String,

    /// Creation timestamp of this version
    pub created_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl WorkflowTemplate {
    /// Find a step by ID
    pub fn step(&self, id: &StepId) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| &step.id == id)
    }

    /// Find a step by ID or fail with `StepNotFound`
    pub fn require_step(&self, id: &StepId) -> Result<&WorkflowStep, CoreError> {
        self.step(id).ok_or_else(|| {
            CoreError::StepNotFound(format!(
                "{} in template {} v{}",
                id.0, self.id.0, self.version
            ))
        })
    }

    /// Human-readable key of this version
    pub fn version_key(&self) -> String {
        format!("{}@{}", self.id.0, self.version)
    }

    /// Percentage of steps ordered strictly before the given step
    pub fn progress_at(&self, step_id: &StepId) -> u8 {
        let total = self.steps.len();
        let order = match self.step(step_id) {
            Some(step) => step.order,
            None => return 0,
        };
        if total == 0 {
            return 0;
        }
        let before = self.steps.iter().filter(|s| s.order < order).count();
        ((before * 100) / total) as u8
    }

    /// 1-based position of the step in template order
    pub fn step_number(&self, step_id: &StepId) -> usize {
        match self.step(step_id) {
            Some(step) => self.steps.iter().filter(|s| s.order < step.order).count() + 1,
            None => 0,
        }
    }

    /// Whether the template may be started for the animal
    pub fn is_applicable(&self, animal: &AnimalProfile) -> bool {
        let role_ok = self.applicable_roles.is_empty()
            || self.applicable_roles.iter().any(|role| {
                *role == AnimalRole::All || animal.roles.contains(role)
            });
        let species_ok = self.applicable_species.is_empty()
            || self.applicable_species.iter().any(|s| {
                s.eq_ignore_ascii_case("ALL") || s.eq_ignore_ascii_case(&animal.species)
            });
        role_ok && species_ok
    }

    /// Validate the template against the field vocabulary
    pub fn validate(&self, fields: &FieldRegistry) -> Result<(), CoreError> {
        if self.steps.is_empty() {
            return Err(CoreError::ValidationError(
                "Template must have at least one step".to_string(),
            ));
        }

        if self.max_duration == 0 {
            return Err(CoreError::ValidationError(
                "Template maxDuration must be at least one day".to_string(),
            ));
        }

        if !(0.0..=100.0).contains(&self.expected_success_rate) {
            return Err(CoreError::ValidationError(format!(
                "Expected success rate out of range: {}",
                self.expected_success_rate
            )));
        }

        let mut by_id: HashMap<&StepId, &WorkflowStep> = HashMap::new();
        let mut orders = HashSet::new();
        for step in &self.steps {
            if step.id.0.is_empty() {
                return Err(CoreError::ValidationError("Step with empty ID".to_string()));
            }
            if by_id.insert(&step.id, step).is_some() {
                return Err(CoreError::ValidationError(format!(
                    "Duplicate step ID: {}",
                    step.id.0
                )));
            }
            if !orders.insert(step.order) {
                return Err(CoreError::ValidationError(format!(
                    "Duplicate step order {} at step {}",
                    step.order, step.id.0
                )));
            }
        }

        if !by_id.contains_key(&self.starting_step) {
            return Err(CoreError::ValidationError(format!(
                "Starting step does not exist: {}",
                self.starting_step.0
            )));
        }

        for step in &self.steps {
            for target in step.next_pointers() {
                let target_step = by_id.get(target).ok_or_else(|| {
                    CoreError::ValidationError(format!(
                        "Step {} points to non-existent step: {}",
                        step.id.0, target.0
                    ))
                })?;

                if target_step.order <= step.order && !step.loop_back_steps.contains(target) {
                    return Err(CoreError::ValidationError(format!(
                        "Step {} points back to step {} without a declared loop-back",
                        step.id.0, target.0
                    )));
                }
            }

            for declared in &step.loop_back_steps {
                if !step.next_pointers().any(|target| target == declared) {
                    return Err(CoreError::ValidationError(format!(
                        "Step {} declares loop-back to {} but has no pointer to it",
                        step.id.0, declared.0
                    )));
                }
            }

            for condition in step.entry_conditions.iter().chain(step.exit_conditions.iter()) {
                fields.validate_condition(condition).map_err(|e| {
                    CoreError::ValidationError(format!("Step {}: {}", step.id.0, e))
                })?;
            }

            for action in step
                .on_start_actions
                .iter()
                .chain(step.on_success_actions.iter())
                .chain(step.on_failure_actions.iter())
            {
                if action.action_type == ActionType::WaitDays
                    && !action.wait_days().map(|d| d > 0.0).unwrap_or(false)
                {
                    return Err(CoreError::ValidationError(format!(
                        "Step {}: WAIT_DAYS action {} needs a positive 'days' parameter",
                        step.id.0, action.id
                    )));
                }
            }

            if let Some(days) = step.max_wait_days {
                if days <= 0.0 {
                    return Err(CoreError::ValidationError(format!(
                        "Step {}: maxWaitDays must be positive",
                        step.id.0
                    )));
                }
            }
        }

        let unreachable = self.unreachable_steps();
        if !unreachable.is_empty() {
            tracing::warn!(
                template_id = %self.id.0,
                steps = ?unreachable,
                "Template has steps unreachable from the starting step"
            );
        }

        Ok(())
    }

    /// Steps that cannot be reached from the starting step
    pub fn unreachable_steps(&self) -> Vec<StepId> {
        let mut visited = HashSet::new();
        let mut stack = vec![&self.starting_step];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            if let Some(step) = self.step(id) {
                stack.extend(step.next_pointers());
            }
        }

        self.steps
            .iter()
            .filter(|step| !visited.contains(&step.id))
            .map(|step| step.id.clone())
            .collect()
    }
}
