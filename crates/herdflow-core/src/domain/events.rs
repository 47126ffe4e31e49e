use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::instance::{AnimalId, StepId, TemplateId, WorkflowId, WorkflowPhase, WorkflowStatus};

/// Event broadcast on the egress after a committed transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowEvent {
    /// Workflow state after a transition
    #[serde(rename_all = "camelCase")]
    Progress {
        /// Workflow
        workflow_id: WorkflowId,
        /// Animal
        animal_id: AnimalId,
        /// Template
        template_id: TemplateId,
        /// Current step
        step_id: StepId,
        /// Progress in percent
        progress: u8,
        /// Status after the transition
        status: WorkflowStatus,
        /// Phase after the transition
        phase: WorkflowPhase,
        /// Commit time
        timestamp: DateTime<Utc>,
    },

    /// Alert: a human has to look at the workflow
    #[serde(rename_all = "camelCase")]
    ManualReviewRequired {
        /// Workflow
        workflow_id: WorkflowId,
        /// Animal
        animal_id: AnimalId,
        /// Step the failure belongs to
        step_id: StepId,
        /// What failed
        reason: String,
        /// Escalation time
        timestamp: DateTime<Utc>,
    },
}

impl WorkflowEvent {
    /// Returns the type of the event as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "workflow.progress",
            Self::ManualReviewRequired { .. } => "workflow.manual_review_required",
        }
    }

    /// Returns the workflow this event is associated with
    pub fn workflow_id(&self) -> &WorkflowId {
        match self {
            Self::Progress { workflow_id, .. } | Self::ManualReviewRequired { workflow_id, .. } => {
                workflow_id
            }
        }
    }

    /// Returns the timestamp when the event occurred
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Progress { timestamp, .. } | Self::ManualReviewRequired { timestamp, .. } => {
                *timestamp
            }
        }
    }

    /// Whether the event must reach a human
    pub fn is_alert(&self) -> bool {
        matches!(self, Self::ManualReviewRequired { .. })
    }
}
