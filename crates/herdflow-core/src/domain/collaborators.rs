//! Boundaries to the subsystems around the engine
//!
//! Clinical data, external modules, event ingress/egress and the snapshot
//! cache live outside this crate and are reached through these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::decision::TriggerKind;
use super::events::WorkflowEvent;
use super::instance::{AnimalId, StepId, WorkflowId};
use super::module_update::UpdateType;
use crate::types::ClinicalSnapshot;
use crate::CoreError;

/// Supplies point-in-time clinical data for an animal
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Current snapshot of the animal's clinical fields
    async fn get_snapshot(&self, animal_id: &AnimalId) -> Result<ClinicalSnapshot, CoreError>;
}

/// Non-authoritative cache of recent snapshots
#[async_trait]
pub trait SnapshotCache: Send + Sync {
    /// Cached snapshot, if any
    async fn get(&self, animal_id: &AnimalId) -> Option<ClinicalSnapshot>;

    /// Store a snapshot
    async fn put(&self, animal_id: &AnimalId, snapshot: &ClinicalSnapshot);
}

/// Answer of an external module
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleResponse {
    /// Whether the module applied the update
    pub success: bool,

    /// ID of a record the module created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_record_id: Option<String>,

    /// Raw module response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,

    /// Rejection reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModuleResponse {
    /// Successful response
    pub fn ok(created_record_id: Option<String>) -> Self {
        Self {
            success: true,
            created_record_id,
            response: None,
            error: None,
        }
    }

    /// Rejection
    pub fn rejected(error: &str) -> Self {
        Self {
            success: false,
            created_record_id: None,
            response: None,
            error: Some(error.to_string()),
        }
    }
}

/// Client of one external module (calendar, injection, ET, OPU, ultrasound, internal)
#[async_trait]
pub trait ModuleClient: Send + Sync {
    /// Apply an update
    async fn apply(
        &self,
        update_type: UpdateType,
        payload: &Value,
    ) -> Result<ModuleResponse, CoreError>;
}

/// Broadcasts workflow events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one event
    async fn publish(&self, event: &WorkflowEvent) -> Result<(), CoreError>;
}

/// Human decision attached to a trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualOverride {
    /// Step to enter, superseding the resolver
    #[serde(default)]
    pub next_step: Option<StepId>,

    /// Exit outcome to use instead of evaluating conditions
    #[serde(default)]
    pub outcome: Option<bool>,

    /// Veterinarian's explanation
    #[serde(default)]
    pub reasoning: Option<String>,

    /// Veterinarian ID
    pub veterinarian: String,
}

/// Event that causes a transition evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    /// What happened
    pub kind: TriggerKind,

    /// Target workflow
    pub workflow_id: WorkflowId,

    /// Animal, checked against the workflow when present
    #[serde(default)]
    pub animal_id: Option<AnimalId>,

    /// Step the event was produced for; the event is stale once the workflow moved on
    #[serde(default)]
    pub step_id: Option<StepId>,

    /// Step epoch the event was produced for (timers)
    #[serde(default)]
    pub step_epoch: Option<u64>,

    /// Free-form payload
    #[serde(default)]
    pub payload: Value,

    /// Human decision, for `MANUAL_OVERRIDE`
    #[serde(default)]
    pub manual_override: Option<ManualOverride>,

    /// Arrival time
    pub received_at: DateTime<Utc>,
}

impl TriggerEvent {
    /// Event with no step binding or payload
    pub fn new(kind: TriggerKind, workflow_id: WorkflowId, received_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            workflow_id,
            animal_id: None,
            step_id: None,
            step_epoch: None,
            payload: Value::Null,
            manual_override: None,
            received_at,
        }
    }

    /// Attach a payload
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Bind the event to a step
    pub fn for_step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }

    /// Attach a manual override
    pub fn with_override(mut self, manual_override: ManualOverride) -> Self {
        self.kind = TriggerKind::ManualOverride;
        self.manual_override = Some(manual_override);
        self
    }
}

/// Subscription delivering trigger events
#[async_trait]
pub trait TriggerSource: Send + Sync {
    /// Next event; `None` once the subscription is closed
    async fn next_event(&self) -> Option<TriggerEvent>;
}
