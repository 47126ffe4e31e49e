use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use herdflow_core::{
    domain::module_update::ModuleUpdateId,
    domain::timer::TimerId,
    ActiveWorkflow, ActiveWorkflowRepository, AnimalId, CoreError, DecisionLog, ModuleUpdate,
    ModuleUpdateRepository, TemplateId, TemplateRepository, TimerRepository, TransitionCommit,
    WorkflowDecision, WorkflowFilter, WorkflowId, WorkflowStore, WorkflowTemplate, WorkflowTimer,
    WorkflowWrite,
};

/// Everything the store holds; serializable so a process can dump and reload it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreState {
    /// Active workflows by ID
    pub workflows: HashMap<String, ActiveWorkflow>,
    /// Decision log, append order
    pub decisions: Vec<WorkflowDecision>,
    /// Module updates, insertion order
    pub updates: Vec<ModuleUpdate>,
    /// Pending timers by ID
    pub timers: HashMap<String, WorkflowTimer>,
    /// Template versions, insertion order
    pub templates: Vec<WorkflowTemplate>,
}

impl StoreState {
    fn live_for(&self, template_id: &TemplateId, animal_id: &AnimalId) -> Option<&ActiveWorkflow> {
        self.workflows.values().find(|wf| {
            &wf.template_id == template_id && &wf.animal_id == animal_id && wf.status.is_live()
        })
    }

    /// Reject the commit without touching any state
    fn check(&self, commit: &TransitionCommit) -> Result<(), CoreError> {
        match &commit.workflow {
            Some(WorkflowWrite::Insert(instance)) => {
                if self.workflows.contains_key(&instance.id.0) {
                    return Err(CoreError::ConcurrencyConflict(format!(
                        "Workflow {} already exists",
                        instance.id.0
                    )));
                }
                if let Some(existing) = self.live_for(&instance.template_id, &instance.animal_id) {
                    return Err(CoreError::ConcurrencyConflict(format!(
                        "Animal {} already has live workflow {} for template {}",
                        instance.animal_id.0, existing.id.0, instance.template_id.0
                    )));
                }
            }
            Some(WorkflowWrite::Update {
                instance,
                expected_sequence,
            }) => {
                let stored = self
                    .workflows
                    .get(&instance.id.0)
                    .ok_or_else(|| CoreError::WorkflowNotFound(instance.id.0.clone()))?;
                if stored.sequence != *expected_sequence {
                    return Err(CoreError::ConcurrencyConflict(format!(
                        "Workflow {} is at sequence {}, expected {}",
                        instance.id.0, stored.sequence, expected_sequence
                    )));
                }
            }
            None => {}
        }
        Ok(())
    }

    fn upsert_update(&mut self, update: ModuleUpdate) {
        match self.updates.iter_mut().find(|u| u.id == update.id) {
            Some(existing) => *existing = update,
            None => self.updates.push(update),
        }
    }

    fn apply(&mut self, commit: TransitionCommit) {
        if let Some(write) = commit.workflow {
            let instance = match write {
                WorkflowWrite::Insert(instance) | WorkflowWrite::Update { instance, .. } => instance,
            };
            self.workflows.insert(instance.id.0.clone(), instance);
        }

        self.decisions.push(commit.decision);

        for update in commit.updates {
            self.upsert_update(update);
        }

        // Cancels first so a rescheduled timer with the same key survives
        for id in &commit.timers_to_cancel {
            self.timers.remove(&id.0);
        }
        for timer in commit.timers_to_schedule {
            self.timers.insert(timer.id.0.clone(), timer);
        }
    }
}

/// In-memory implementation of every repository trait
///
/// All data sits behind one lock, so a transition commit is applied
/// completely or not at all.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<StoreState>>,
    unavailable: Arc<AtomicBool>,
    failing_commits: Arc<AtomicUsize>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store from previously dumped state
    pub fn from_state(state: StoreState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
            unavailable: Arc::new(AtomicBool::new(false)),
            failing_commits: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Copy of the full state
    pub async fn dump(&self) -> StoreState {
        self.state.read().await.clone()
    }

    /// Serialize the full state to JSON
    pub async fn to_json(&self) -> Result<String, CoreError> {
        let state = self.state.read().await;
        Ok(serde_json::to_string(&*state)?)
    }

    /// Rebuild a store from JSON produced by [`InMemoryStore::to_json`]
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let state: StoreState = serde_json::from_str(json)?;
        Ok(Self::from_state(state))
    }

    /// Simulate an outage; every operation fails with `StateStoreError` while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the next `count` transition commits fail; reads keep working
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), CoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoreError::StateStoreError(
                "In-memory store is unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for InMemoryStore {
    async fn commit(&self, commit: TransitionCommit) -> Result<(), CoreError> {
        self.ensure_available()?;
        let injected = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CoreError::StateStoreError(
                "Injected commit failure".to_string(),
            ));
        }
        let mut state = self.state.write().await;

        if let Err(e) = state.check(&commit) {
            warn!(workflow_id = %commit.decision.workflow_id.0, error = %e, "Commit rejected");
            return Err(e);
        }

        debug!(
            workflow_id = %commit.decision.workflow_id.0,
            decision_id = %commit.decision.id.0,
            updates = commit.updates.len(),
            timers_scheduled = commit.timers_to_schedule.len(),
            timers_cancelled = commit.timers_to_cancel.len(),
            "Applying commit"
        );
        state.apply(commit);
        Ok(())
    }
}

#[async_trait]
impl ActiveWorkflowRepository for InMemoryStore {
    async fn find_by_id(&self, id: &WorkflowId) -> Result<Option<ActiveWorkflow>, CoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        Ok(state.workflows.get(&id.0).cloned())
    }

    async fn find_live(
        &self,
        template_id: &TemplateId,
        animal_id: &AnimalId,
    ) -> Result<Option<ActiveWorkflow>, CoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        Ok(state.live_for(template_id, animal_id).cloned())
    }

    async fn list(&self, filter: &WorkflowFilter) -> Result<Vec<ActiveWorkflow>, CoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        let mut workflows: Vec<ActiveWorkflow> = state
            .workflows
            .values()
            .filter(|wf| filter.matches(wf))
            .cloned()
            .collect();
        workflows.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.0.cmp(&b.id.0)));
        Ok(workflows)
    }
}

#[async_trait]
impl DecisionLog for InMemoryStore {
    async fn list_for_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<WorkflowDecision>, CoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        Ok(state
            .decisions
            .iter()
            .filter(|d| &d.workflow_id == workflow_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ModuleUpdateRepository for InMemoryStore {
    async fn find_by_id(&self, id: &ModuleUpdateId) -> Result<Option<ModuleUpdate>, CoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        Ok(state.updates.iter().find(|u| &u.id == id).cloned())
    }

    async fn save(&self, update: &ModuleUpdate) -> Result<(), CoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        state.upsert_update(update.clone());
        Ok(())
    }

    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ModuleUpdate>, CoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        let mut due: Vec<ModuleUpdate> = state
            .updates
            .iter()
            .filter(|u| u.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|u| u.next_retry_at.unwrap_or(u.scheduled_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn find_escalation_pending(&self, limit: usize) -> Result<Vec<ModuleUpdate>, CoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        Ok(state
            .updates
            .iter()
            .filter(|u| u.escalation_pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_for_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<ModuleUpdate>, CoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        Ok(state
            .updates
            .iter()
            .filter(|u| &u.source_workflow_id == workflow_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TemplateRepository for InMemoryStore {
    async fn insert_version(&self, template: &WorkflowTemplate) -> Result<(), CoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let exists = state
            .templates
            .iter()
            .any(|t| t.id == template.id && t.version == template.version);
        if exists {
            return Err(CoreError::ConcurrencyConflict(format!(
                "Template {} v{} already exists",
                template.id.0, template.version
            )));
        }
        state.templates.push(template.clone());
        Ok(())
    }

    async fn get(
        &self,
        id: &TemplateId,
        version: Option<u32>,
    ) -> Result<Option<WorkflowTemplate>, CoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        let mut candidates = state.templates.iter().filter(|t| &t.id == id);
        let found = match version {
            Some(version) => candidates.find(|t| t.version == version),
            None => candidates.max_by_key(|t| t.version),
        };
        Ok(found.cloned())
    }

    async fn versions(&self, id: &TemplateId) -> Result<Vec<u32>, CoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        let mut versions: Vec<u32> = state
            .templates
            .iter()
            .filter(|t| &t.id == id)
            .map(|t| t.version)
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    async fn list_latest(&self) -> Result<Vec<WorkflowTemplate>, CoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        let mut latest: HashMap<&str, &WorkflowTemplate> = HashMap::new();
        for template in &state.templates {
            let entry = latest.entry(template.id.0.as_str()).or_insert(template);
            if template.version > entry.version {
                *entry = template;
            }
        }
        let mut templates: Vec<WorkflowTemplate> = latest.into_values().cloned().collect();
        templates.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        Ok(templates)
    }
}

#[async_trait]
impl TimerRepository for InMemoryStore {
    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowTimer>, CoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        let mut due: Vec<WorkflowTimer> = state
            .timers
            .values()
            .filter(|t| t.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.fires_at.cmp(&b.fires_at).then_with(|| a.id.0.cmp(&b.id.0)));
        Ok(due)
    }

    async fn list_for_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<WorkflowTimer>, CoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        let mut timers: Vec<WorkflowTimer> = state
            .timers
            .values()
            .filter(|t| &t.workflow_id == workflow_id)
            .cloned()
            .collect();
        timers.sort_by(|a, b| a.fires_at.cmp(&b.fires_at));
        Ok(timers)
    }

    async fn remove(&self, id: &TimerId) -> Result<(), CoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        state.timers.remove(&id.0);
        Ok(())
    }
}
