use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::condition::WorkflowCondition;
use super::instance::{ActiveWorkflow, AnimalId, ScheduledAction, StepId, WorkflowId, WorkflowStatus};
use super::step::ResolvedPath;

/// Actor recorded for automatic decisions
pub const SYSTEM_ACTOR: &str = "SYSTEM";

/// Value object: Decision ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecisionId(pub String);

/// What caused a transition evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerKind {
    /// Exam result available
    ExamCompleted,
    /// Injection administered
    InjectionGiven,
    /// Procedure finished
    ProcedureDone,
    /// Veterinarian decision
    ManualOverride,
    /// Step `maxWaitDays` elapsed
    Timeout,
    /// `WAIT_DAYS` action elapsed
    WaitElapsed,
    /// Workflow started
    Started,
    /// Pause command
    Paused,
    /// Resume command
    Resumed,
    /// Cancel command
    Cancelled,
    /// Workflow `maxDuration` exceeded
    DurationExceeded,
    /// Module update exhausted its attempts
    DeliveryFailed,
}

impl TriggerKind {
    /// Whether the kind is produced internally rather than by the ingress
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::WaitElapsed
                | Self::Started
                | Self::Paused
                | Self::Resumed
                | Self::Cancelled
                | Self::DurationExceeded
                | Self::DeliveryFailed
        )
    }
}

/// Outcome of a transition evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalDecision {
    /// Exit conditions held
    Success,
    /// Exit conditions failed
    Failure,
    /// Human-directed or command transition
    Alternative,
    /// Needs a human
    ManualReview,
}

/// Immutable audit record of one transition evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDecision {
    /// Decision ID
    pub id: DecisionId,

    /// Workflow
    pub workflow_id: WorkflowId,

    /// Step the evaluation ran against
    pub step_id: StepId,

    /// Animal
    pub animal_id: AnimalId,

    /// Trigger
    pub trigger: TriggerKind,

    /// Conditions evaluated
    #[serde(default)]
    pub conditions: Vec<WorkflowCondition>,

    /// Per-condition results
    #[serde(default)]
    pub evaluation_results: Vec<bool>,

    /// Outcome
    pub final_decision: FinalDecision,

    /// Rule that chose the path
    pub chosen_path: ResolvedPath,

    /// Step entered, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_id: Option<StepId>,

    /// Status after the transition
    pub resulting_status: WorkflowStatus,

    /// Steps skipped on the way to the next step
    #[serde(default)]
    pub skipped_steps: Vec<StepId>,

    /// Side effects scheduled by the transition
    #[serde(default)]
    pub scheduled_actions: Vec<ScheduledAction>,

    /// Explanation generated by the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automatic_reasoning: Option<String>,

    /// Explanation given by a human
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_reasoning: Option<String>,

    /// A veterinarian overrode the automatic evaluation
    #[serde(default)]
    pub veterinarian_override: bool,

    /// 0-100, automatic decisions only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u8>,

    /// `SYSTEM` or a human ID
    pub decided_by: String,

    /// Decision time
    pub decided_at: DateTime<Utc>,

    /// Trigger payload as received
    #[serde(default)]
    pub trigger_payload: Value,
}

impl WorkflowDecision {
    /// Start a decision for the instance's current step
    ///
    /// The resulting status and next step default to the instance state and
    /// are overwritten with the `with_*` builders.
    pub fn for_instance(
        instance: &ActiveWorkflow,
        trigger: TriggerKind,
        final_decision: FinalDecision,
        decided_by: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DecisionId(Uuid::new_v4().to_string()),
            workflow_id: instance.id.clone(),
            step_id: instance.current_step_id.clone(),
            animal_id: instance.animal_id.clone(),
            trigger,
            conditions: Vec::new(),
            evaluation_results: Vec::new(),
            final_decision,
            chosen_path: ResolvedPath::Unchanged,
            next_step_id: None,
            resulting_status: instance.status,
            skipped_steps: Vec::new(),
            scheduled_actions: Vec::new(),
            automatic_reasoning: None,
            manual_reasoning: None,
            veterinarian_override: false,
            confidence: None,
            decided_by: decided_by.unwrap_or(SYSTEM_ACTOR).to_string(),
            decided_at: now,
            trigger_payload: Value::Null,
        }
    }

    /// Attach the evaluated conditions and their results
    pub fn with_evaluation(mut self, conditions: &[WorkflowCondition], results: Vec<bool>) -> Self {
        self.conditions = conditions.to_vec();
        self.evaluation_results = results;
        self
    }

    /// Attach the chosen path
    pub fn with_path(
        mut self,
        path: ResolvedPath,
        next_step_id: Option<StepId>,
        resulting_status: WorkflowStatus,
    ) -> Self {
        self.chosen_path = path;
        self.next_step_id = next_step_id;
        self.resulting_status = resulting_status;
        self
    }

    /// Attach the automatic explanation and confidence
    pub fn with_automatic_reasoning(mut self, reasoning: String, confidence: u8) -> Self {
        self.automatic_reasoning = Some(reasoning);
        self.confidence = Some(confidence.min(100));
        self
    }

    /// Attach a human explanation
    pub fn with_manual_reasoning(mut self, reasoning: Option<String>, overridden: bool) -> Self {
        self.manual_reasoning = reasoning;
        self.veterinarian_override = overridden;
        self.confidence = None;
        self
    }

    /// Attach the side effects and skipped steps of the transition
    pub fn with_effects(mut self, scheduled: Vec<ScheduledAction>, skipped: Vec<StepId>) -> Self {
        self.scheduled_actions = scheduled;
        self.skipped_steps = skipped;
        self
    }

    /// Attach the trigger payload
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.trigger_payload = payload;
        self
    }

    /// Whether a human made this decision
    pub fn is_manual(&self) -> bool {
        self.decided_by != SYSTEM_ACTOR
    }
}
