//! Repository traits for the workflow engine
//!
//! Durable storage sits behind these traits. Every change to an
//! `ActiveWorkflow` goes through [`WorkflowStore::commit`], which writes the
//! instance, its decision, the produced module updates and the timer changes
//! as one unit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::decision::WorkflowDecision;
use super::instance::{ActiveWorkflow, AnimalId, TemplateId, WorkflowId, WorkflowStatus};
use super::module_update::{ModuleUpdate, ModuleUpdateId};
use super::template::WorkflowTemplate;
use super::timer::{TimerId, WorkflowTimer};
use crate::CoreError;

/// Filter for workflow listings; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowFilter {
    /// Template
    pub template_id: Option<TemplateId>,
    /// Animal
    pub animal_id: Option<AnimalId>,
    /// Status
    pub status: Option<WorkflowStatus>,
}

impl WorkflowFilter {
    /// Whether the instance passes the filter
    pub fn matches(&self, instance: &ActiveWorkflow) -> bool {
        self.template_id
            .as_ref()
            .map_or(true, |id| &instance.template_id == id)
            && self
                .animal_id
                .as_ref()
                .map_or(true, |id| &instance.animal_id == id)
            && self.status.map_or(true, |status| instance.status == status)
    }
}

/// Instance write inside a commit
#[derive(Debug, Clone)]
pub enum WorkflowWrite {
    /// New instance; fails if the (template, animal) slot is taken
    Insert(ActiveWorkflow),
    /// Conditional update; fails unless the stored sequence equals `expected_sequence`
    Update {
        /// New state
        instance: ActiveWorkflow,
        /// Sequence the stored instance must still carry
        expected_sequence: u64,
    },
}

impl WorkflowWrite {
    /// Instance being written
    pub fn instance(&self) -> &ActiveWorkflow {
        match self {
            Self::Insert(instance) | Self::Update { instance, .. } => instance,
        }
    }
}

/// Everything one transition writes
#[derive(Debug, Clone)]
pub struct TransitionCommit {
    /// Instance change; `None` when the instance is terminal and only the log grows
    pub workflow: Option<WorkflowWrite>,
    /// Decision record
    pub decision: WorkflowDecision,
    /// Module updates to insert or replace
    pub updates: Vec<ModuleUpdate>,
    /// Timers to register (replacing timers with the same ID)
    pub timers_to_schedule: Vec<WorkflowTimer>,
    /// Timers to drop
    pub timers_to_cancel: Vec<TimerId>,
}

impl TransitionCommit {
    /// Commit carrying only a decision
    pub fn new(workflow: Option<WorkflowWrite>, decision: WorkflowDecision) -> Self {
        Self {
            workflow,
            decision,
            updates: Vec::new(),
            timers_to_schedule: Vec::new(),
            timers_to_cancel: Vec::new(),
        }
    }
}

/// Atomic writer for transitions
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Apply all parts of the commit, or none of them
    ///
    /// Returns `ConcurrencyConflict` on a sequence mismatch or an occupied
    /// slot, `StateStoreError` when the store is unavailable.
    async fn commit(&self, commit: TransitionCommit) -> Result<(), CoreError>;
}

/// Read access to active workflows
#[async_trait]
pub trait ActiveWorkflowRepository: Send + Sync {
    /// Find a workflow by ID
    async fn find_by_id(&self, id: &WorkflowId) -> Result<Option<ActiveWorkflow>, CoreError>;

    /// Find the live (non-terminal) workflow for a (template, animal) pair
    async fn find_live(
        &self,
        template_id: &TemplateId,
        animal_id: &AnimalId,
    ) -> Result<Option<ActiveWorkflow>, CoreError>;

    /// List workflows matching the filter
    async fn list(&self, filter: &WorkflowFilter) -> Result<Vec<ActiveWorkflow>, CoreError>;
}

/// Append-only decision log
#[async_trait]
pub trait DecisionLog: Send + Sync {
    /// Decisions of a workflow, oldest first
    async fn list_for_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<WorkflowDecision>, CoreError>;
}

/// Storage for module updates
#[async_trait]
pub trait ModuleUpdateRepository: Send + Sync {
    /// Find an update by ID
    async fn find_by_id(&self, id: &ModuleUpdateId) -> Result<Option<ModuleUpdate>, CoreError>;

    /// Insert or replace an update
    async fn save(&self, update: &ModuleUpdate) -> Result<(), CoreError>;

    /// Updates due for delivery at `now`, oldest first
    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ModuleUpdate>, CoreError>;

    /// FAILED updates whose escalation has not been committed
    async fn find_escalation_pending(&self, limit: usize) -> Result<Vec<ModuleUpdate>, CoreError>;

    /// Updates of a workflow, oldest first
    async fn list_for_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<ModuleUpdate>, CoreError>;
}

/// Storage for versioned templates
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    /// Store a new version; fails if the version already exists
    async fn insert_version(&self, template: &WorkflowTemplate) -> Result<(), CoreError>;

    /// Get a version, or the latest when `version` is `None`
    async fn get(
        &self,
        id: &TemplateId,
        version: Option<u32>,
    ) -> Result<Option<WorkflowTemplate>, CoreError>;

    /// Stored version numbers of a template, ascending
    async fn versions(&self, id: &TemplateId) -> Result<Vec<u32>, CoreError>;

    /// Latest version of every template
    async fn list_latest(&self) -> Result<Vec<WorkflowTemplate>, CoreError>;
}

/// Durable timers
#[async_trait]
pub trait TimerRepository: Send + Sync {
    /// Timers due at `now`, earliest first
    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowTimer>, CoreError>;

    /// Timers registered for a workflow
    async fn list_for_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<WorkflowTimer>, CoreError>;

    /// Drop a timer; unknown IDs are ignored
    async fn remove(&self, id: &TimerId) -> Result<(), CoreError>;
}
