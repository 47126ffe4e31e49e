use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::action::{ActionType, TargetModule};
use super::instance::{AnimalId, StepId, WorkflowId};

/// Value object: Module update ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleUpdateId(pub String);

impl ModuleUpdateId {
    /// Generate a fresh ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Operation requested from the target module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateType {
    /// Create a record
    Create,
    /// Update a record
    Update,
    /// Delete a record
    Delete,
    /// Move a scheduled record
    Reschedule,
}

/// Delivery status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateStatus {
    /// Not yet attempted
    Pending,
    /// Delivered
    Completed,
    /// Attempts exhausted
    Failed,
    /// Waiting for the next retry
    Retry,
}

/// Which action list (or the engine itself) produced the update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateOrigin {
    /// Entered step's on-start actions
    OnStart,
    /// Exited step's on-success actions
    OnSuccess,
    /// Exited step's on-failure actions
    OnFailure,
    /// Manual-review notification queued by the engine
    Escalation,
}

/// Outcome reported by the target module
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResult {
    /// Whether the module accepted the update
    pub success: bool,

    /// Raw module response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,

    /// Error text of the last failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// ID of the record created by the module
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_record_id: Option<String>,
}

/// Outbound side-effect request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleUpdate {
    /// Update ID
    pub id: ModuleUpdateId,

    /// Owning workflow
    pub source_workflow_id: WorkflowId,

    /// Step whose action produced the update
    pub source_step_id: StepId,

    /// Animal the update concerns
    pub animal_id: AnimalId,

    /// Action that produced the update
    pub action_id: String,

    /// Kind of the producing action
    pub action_type: ActionType,

    /// Producing action list
    pub origin: UpdateOrigin,

    /// Receiving module
    pub target_module: TargetModule,

    /// Requested operation
    pub update_type: UpdateType,

    /// Payload handed to the module client
    pub payload: Value,

    /// Delivery status
    pub status: UpdateStatus,

    /// Delivery attempts so far
    pub attempts: u32,

    /// Attempts before the update is marked FAILED
    pub max_attempts: u32,

    /// Outcome of the last attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<UpdateResult>,

    /// Creation time
    pub scheduled_at: DateTime<Utc>,

    /// Time of the last attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,

    /// Earliest time of the next attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,

    /// FAILED, but the manual review it owes is not committed yet
    #[serde(default)]
    pub escalation_pending: bool,
}

impl ModuleUpdate {
    /// Whether delivery is finished, successfully or not
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, UpdateStatus::Completed | UpdateStatus::Failed)
    }

    /// Whether the dispatch loop should attempt delivery at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            UpdateStatus::Pending => true,
            UpdateStatus::Retry => self.next_retry_at.map(|at| at <= now).unwrap_or(true),
            UpdateStatus::Completed | UpdateStatus::Failed => false,
        }
    }

    /// Record a successful delivery
    pub fn mark_completed(
        &mut self,
        response: Option<Value>,
        created_record_id: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.attempts += 1;
        self.status = UpdateStatus::Completed;
        self.executed_at = Some(now);
        self.next_retry_at = None;
        self.result = Some(UpdateResult {
            success: true,
            response,
            error: None,
            created_record_id,
        });
    }

    /// Record a failed delivery
    ///
    /// Returns `true` when this failure exhausted the attempts and moved the
    /// update to FAILED. Calling it on a terminal update is a no-op.
    pub fn record_failure(&mut self, error: &str, now: DateTime<Utc>, backoff: Duration) -> bool {
        if self.is_terminal() {
            return false;
        }

        self.attempts += 1;
        self.executed_at = Some(now);
        self.result = Some(UpdateResult {
            success: false,
            response: None,
            error: Some(error.to_string()),
            created_record_id: None,
        });

        if self.attempts >= self.max_attempts {
            self.status = UpdateStatus::Failed;
            self.next_retry_at = None;
            true
        } else {
            self.status = UpdateStatus::Retry;
            self.next_retry_at = Some(now + backoff);
            false
        }
    }

    /// Last recorded error
    pub fn last_error(&self) -> Option<&str> {
        self.result.as_ref().and_then(|r| r.error.as_deref())
    }
}
