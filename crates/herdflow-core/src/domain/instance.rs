use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::action::{ActionType, TargetModule};
use super::events::WorkflowEvent;
use super::template::{AnimalRole, Priority, WorkflowTemplate};
use super::timer::{days, SuspendedTimer};
use crate::CoreError;

/// Value object: Active workflow ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    /// Generate a fresh ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Value object: Template ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateId(pub String);

/// Value object: Step ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub String);

/// Value object: Animal ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnimalId(pub String);

/// Animal attributes relevant to template applicability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimalProfile {
    /// Animal ID
    pub id: AnimalId,
    /// Display name
    pub name: String,
    /// Reproductive roles
    pub roles: Vec<AnimalRole>,
    /// Species code
    pub species: String,
}

/// Active workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// Accepting trigger events
    Active,
    /// Suspended by an operator
    Paused,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed,
    /// Stopped by an operator
    Cancelled,
}

impl WorkflowStatus {
    /// Whether no further transitions are allowed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the instance still occupies its (template, animal) slot
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

/// Coarse stage of a workflow, derived from progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowPhase {
    /// Nothing done yet
    Preparation,
    /// Main body of the protocol
    Execution,
    /// Late steps, mostly follow-up exams
    Monitoring,
    /// Finished
    Completion,
}

impl WorkflowPhase {
    /// Phase for a progress value and status
    pub fn derive(progress: u8, status: WorkflowStatus) -> Self {
        if status.is_terminal() {
            Self::Completion
        } else if progress == 0 {
            Self::Preparation
        } else if progress < 75 {
            Self::Execution
        } else {
            Self::Monitoring
        }
    }
}

/// Snapshot of the last exit-condition check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionCheck {
    /// Step whose conditions were checked
    pub step_id: StepId,
    /// Check time
    pub checked_at: DateTime<Utc>,
    /// Folded result
    pub result: bool,
    /// Per-condition results
    pub per_condition: Vec<bool>,
    /// Fields the evaluation read
    pub snapshot: Map<String, Value>,
}

/// Next outbound action of the current step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledAction {
    /// Action ID
    pub action_id: String,
    /// Action kind
    pub action_type: ActionType,
    /// Receiving module
    pub target_module: TargetModule,
    /// Summary for dashboards
    pub description: String,
    /// When the action is due
    pub scheduled_for: DateTime<Utc>,
}

/// Optional settings when starting a workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    /// Responsible veterinarian
    #[serde(default)]
    pub assigned_vet: Option<String>,
    /// Overrides the template priority
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Initial note
    #[serde(default)]
    pub notes: Option<String>,
    /// Who requested the start; `None` for automatic starts
    #[serde(default)]
    pub requested_by: Option<String>,
}

/// Aggregate: running application of a template to one animal
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveWorkflow {
    /// Workflow ID
    pub id: WorkflowId,

    /// Template ID
    pub template_id: TemplateId,

    /// Template version pinned at start
    pub template_version: u32,

    /// Template name
    pub template_name: String,

    /// Animal ID
    pub animal_id: AnimalId,

    /// Animal name
    pub animal_name: String,

    /// Animal roles at start, used for step requirements
    #[serde(default)]
    pub animal_roles: Vec<AnimalRole>,

    /// Animal species at start, used for step requirements
    #[serde(default)]
    pub animal_species: String,

    /// Current step
    pub current_step_id: StepId,

    /// Current step name
    pub current_step_name: String,

    /// 1-based position of the current step
    pub step_number: usize,

    /// Steps in the pinned template
    pub total_steps: usize,

    /// Progress in percent
    pub progress_percentage: u8,

    /// Status
    pub status: WorkflowStatus,

    /// Phase
    pub phase: WorkflowPhase,

    /// Start time
    pub started_at: DateTime<Utc>,

    /// Deadline derived from the template `maxDuration`, shifted by paused time
    pub expected_completion_at: DateTime<Utc>,

    /// Time the workflow reached a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_completion_at: Option<DateTime<Utc>>,

    /// Time of the last committed transition
    pub last_activity_at: DateTime<Utc>,

    /// Time the current step was entered
    pub step_entered_at: DateTime<Utc>,

    /// Incremented on every step entry; timers from older epochs are stale
    pub step_epoch: u64,

    /// Steps exited successfully
    #[serde(default)]
    pub completed_steps: Vec<StepId>,

    /// Steps exited unsuccessfully
    #[serde(default)]
    pub failed_steps: Vec<StepId>,

    /// Steps skipped because their entry conditions did not hold
    #[serde(default)]
    pub skipped_steps: Vec<StepId>,

    /// Last exit-condition check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_condition_check: Option<ConditionCheck>,

    /// First scheduled outbound action of the current step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_scheduled_action: Option<ScheduledAction>,

    /// Responsible veterinarian
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_vet: Option<String>,

    /// Priority
    pub priority: Priority,

    /// Operator notes and decision reasoning
    #[serde(default)]
    pub notes: Vec<String>,

    /// A permanently failed side effect awaits human review
    #[serde(default)]
    pub manual_review_pending: bool,

    /// Timers held back while paused
    #[serde(default)]
    pub suspended_timers: Vec<SuspendedTimer>,

    /// Time the workflow was paused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,

    /// Failure or cancellation reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<String>,

    /// Compare-and-swap sequence, incremented on every committed write
    pub sequence: u64,

    /// Pending egress events
    #[serde(skip)]
    pub events: Vec<WorkflowEvent>,
}

impl Clone for ActiveWorkflow {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            template_id: self.template_id.clone(),
            template_version: self.template_version,
            template_name: self.template_name.clone(),
            animal_id: self.animal_id.clone(),
            animal_name: self.animal_name.clone(),
            animal_roles: self.animal_roles.clone(),
            animal_species: self.animal_species.clone(),
            current_step_id: self.current_step_id.clone(),
            current_step_name: self.current_step_name.clone(),
            step_number: self.step_number,
            total_steps: self.total_steps,
            progress_percentage: self.progress_percentage,
            status: self.status,
            phase: self.phase,
            started_at: self.started_at,
            expected_completion_at: self.expected_completion_at,
            actual_completion_at: self.actual_completion_at,
            last_activity_at: self.last_activity_at,
            step_entered_at: self.step_entered_at,
            step_epoch: self.step_epoch,
            completed_steps: self.completed_steps.clone(),
            failed_steps: self.failed_steps.clone(),
            skipped_steps: self.skipped_steps.clone(),
            last_condition_check: self.last_condition_check.clone(),
            next_scheduled_action: self.next_scheduled_action.clone(),
            assigned_vet: self.assigned_vet.clone(),
            priority: self.priority,
            notes: self.notes.clone(),
            manual_review_pending: self.manual_review_pending,
            suspended_timers: self.suspended_timers.clone(),
            paused_at: self.paused_at,
            end_reason: self.end_reason.clone(),
            sequence: self.sequence,
            events: Vec::new(), // Events are not cloned
        }
    }
}

fn push_unique(list: &mut Vec<StepId>, step_id: &StepId) {
    if !list.contains(step_id) {
        list.push(step_id.clone());
    }
}

impl ActiveWorkflow {
    /// Create an instance positioned at the template's starting step
    pub fn new(
        template: &WorkflowTemplate,
        animal: &AnimalProfile,
        options: &StartOptions,
        now: DateTime<Utc>,
    ) -> Result<Self, CoreError> {
        let start = template.require_step(&template.starting_step)?;
        let progress = template.progress_at(&start.id);

        let mut instance = Self {
            id: WorkflowId::generate(),
            template_id: template.id.clone(),
            template_version: template.version,
            template_name: template.name.clone(),
            animal_id: animal.id.clone(),
            animal_name: animal.name.clone(),
            animal_roles: animal.roles.clone(),
            animal_species: animal.species.clone(),
            current_step_id: start.id.clone(),
            current_step_name: start.name.clone(),
            step_number: template.step_number(&start.id),
            total_steps: template.steps.len(),
            progress_percentage: progress,
            status: WorkflowStatus::Active,
            phase: WorkflowPhase::derive(progress, WorkflowStatus::Active),
            started_at: now,
            expected_completion_at: now + days(template.max_duration as f64),
            actual_completion_at: None,
            last_activity_at: now,
            step_entered_at: now,
            step_epoch: 1,
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            skipped_steps: Vec::new(),
            last_condition_check: None,
            next_scheduled_action: None,
            assigned_vet: options.assigned_vet.clone(),
            priority: options.priority.unwrap_or(template.priority),
            notes: Vec::new(),
            manual_review_pending: false,
            suspended_timers: Vec::new(),
            paused_at: None,
            end_reason: None,
            sequence: 0,
            events: Vec::new(),
        };

        if let Some(note) = &options.notes {
            instance.add_note(note);
        }

        Ok(instance)
    }

    /// Animal attributes captured at start
    pub fn animal_profile(&self) -> AnimalProfile {
        AnimalProfile {
            id: self.animal_id.clone(),
            name: self.animal_name.clone(),
            roles: self.animal_roles.clone(),
            species: self.animal_species.clone(),
        }
    }

    /// Fail unless the instance is ACTIVE
    pub fn ensure_active(&self) -> Result<(), CoreError> {
        if self.status != WorkflowStatus::Active {
            return Err(CoreError::InvalidTransition(format!(
                "Workflow {} is {:?}, not ACTIVE",
                self.id.0, self.status
            )));
        }
        Ok(())
    }

    /// Whether the workflow-level deadline has passed
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == WorkflowStatus::Active && self.expected_completion_at <= now
    }

    /// Mark the current step as exited
    pub fn record_step_outcome(&mut self, success: bool) {
        let step_id = self.current_step_id.clone();
        if success {
            push_unique(&mut self.completed_steps, &step_id);
        } else {
            push_unique(&mut self.failed_steps, &step_id);
        }
    }

    /// Mark a step as skipped
    pub fn skip_step(&mut self, step_id: &StepId) {
        push_unique(&mut self.skipped_steps, step_id);
    }

    /// Move to a step of the pinned template
    pub fn enter_step(
        &mut self,
        template: &WorkflowTemplate,
        step_id: &StepId,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        self.ensure_active()?;
        let step = template.require_step(step_id)?;

        self.current_step_id = step.id.clone();
        self.current_step_name = step.name.clone();
        self.step_number = template.step_number(&step.id);
        self.progress_percentage = template.progress_at(&step.id);
        self.phase = WorkflowPhase::derive(self.progress_percentage, self.status);
        self.step_entered_at = now;
        self.step_epoch += 1;
        self.next_scheduled_action = None;
        self.touch(now);
        Ok(())
    }

    /// Finish successfully
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), CoreError> {
        self.ensure_active()?;
        self.status = WorkflowStatus::Completed;
        self.progress_percentage = 100;
        self.finish(now);
        Ok(())
    }

    /// Finish unsuccessfully
    pub fn fail(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        self.ensure_active()?;
        self.status = WorkflowStatus::Failed;
        self.end_reason = Some(reason.to_string());
        self.finish(now);
        Ok(())
    }

    /// Suspend; timers removed from the scheduler are kept on the instance
    pub fn pause(
        &mut self,
        suspended: Vec<SuspendedTimer>,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        if self.status != WorkflowStatus::Active {
            return Err(CoreError::InvalidTransition(format!(
                "Cannot pause workflow in state: {:?}",
                self.status
            )));
        }
        self.status = WorkflowStatus::Paused;
        self.paused_at = Some(now);
        self.suspended_timers = suspended;
        self.touch(now);
        Ok(())
    }

    /// Reactivate; returns the suspended timers for rescheduling
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<Vec<SuspendedTimer>, CoreError> {
        if self.status != WorkflowStatus::Paused {
            return Err(CoreError::InvalidTransition(format!(
                "Cannot resume workflow in state: {:?}",
                self.status
            )));
        }
        if let Some(paused_at) = self.paused_at.take() {
            let paused_for = (now - paused_at).max(Duration::zero());
            self.expected_completion_at = self.expected_completion_at + paused_for;
        }
        self.status = WorkflowStatus::Active;
        self.touch(now);
        Ok(std::mem::take(&mut self.suspended_timers))
    }

    /// Stop from any non-terminal state
    pub fn cancel(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        if self.status.is_terminal() {
            return Err(CoreError::InvalidTransition(format!(
                "Cannot cancel workflow in state: {:?}",
                self.status
            )));
        }
        self.status = WorkflowStatus::Cancelled;
        self.end_reason = Some(reason.to_string());
        self.paused_at = None;
        self.suspended_timers.clear();
        self.finish(now);
        Ok(())
    }

    /// Flag that a failed side effect needs human review
    pub fn mark_manual_review(&mut self, reason: &str, now: DateTime<Utc>) {
        self.manual_review_pending = true;
        self.events.push(WorkflowEvent::ManualReviewRequired {
            workflow_id: self.id.clone(),
            animal_id: self.animal_id.clone(),
            step_id: self.current_step_id.clone(),
            reason: reason.to_string(),
            timestamp: now,
        });
        self.touch(now);
    }

    /// Append a note
    pub fn add_note(&mut self, note: &str) {
        let note = note.trim();
        if !note.is_empty() {
            self.notes.push(note.to_string());
        }
    }

    /// Record the time of a committed transition
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity_at {
            self.last_activity_at = now;
        }
    }

    /// Queue a progress event for egress
    pub fn record_progress(&mut self, now: DateTime<Utc>) {
        self.events.push(WorkflowEvent::Progress {
            workflow_id: self.id.clone(),
            animal_id: self.animal_id.clone(),
            template_id: self.template_id.clone(),
            step_id: self.current_step_id.clone(),
            progress: self.progress_percentage,
            status: self.status,
            phase: self.phase,
            timestamp: now,
        });
    }

    /// Get and clear all pending events
    pub fn take_events(&mut self) -> Vec<WorkflowEvent> {
        std::mem::take(&mut self.events)
    }

    /// Prepare for a conditional write; returns the sequence the store must hold
    pub fn next_sequence(&mut self) -> u64 {
        let expected = self.sequence;
        self.sequence += 1;
        expected
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.phase = WorkflowPhase::Completion;
        self.actual_completion_at = Some(now);
        self.next_scheduled_action = None;
        self.touch(now);
    }
}
