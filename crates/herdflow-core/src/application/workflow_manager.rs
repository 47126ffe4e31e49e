use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    application::action_dispatcher::{ActionDispatcher, DeliveryOutcome, ModuleClients, PreparedAction},
    application::template_registry::TemplateRegistry,
    config::EngineConfig,
    domain::action::{ActionType, TargetModule, WorkflowAction},
    domain::collaborators::{EventPublisher, SnapshotCache, SnapshotProvider, TriggerEvent},
    domain::condition::{ConditionEvaluation, ConditionEvaluator, ConditionOutcome, WorkflowCondition},
    domain::decision::{FinalDecision, TriggerKind, WorkflowDecision},
    domain::instance::{
        ActiveWorkflow, AnimalId, AnimalProfile, ConditionCheck, ScheduledAction, StartOptions,
        StepId, TemplateId, WorkflowId, WorkflowStatus,
    },
    domain::module_update::{ModuleUpdate, ModuleUpdateId, UpdateOrigin},
    domain::repository::{
        ActiveWorkflowRepository, DecisionLog, ModuleUpdateRepository, TemplateRepository,
        TimerRepository, TransitionCommit, WorkflowFilter, WorkflowStore, WorkflowWrite,
    },
    domain::step::{Resolution, ResolvedPath, StepResolver},
    domain::template::{Priority, WorkflowStep, WorkflowTemplate},
    domain::timer::{days, TimerId, TimerKind, WorkflowTimer},
    types::ClinicalSnapshot,
    CoreError,
};

/// Storage used by the engine
#[derive(Clone)]
pub struct EngineRepositories {
    /// Active workflow reads
    pub workflows: Arc<dyn ActiveWorkflowRepository>,
    /// Atomic transition writer
    pub store: Arc<dyn WorkflowStore>,
    /// Decision log reads
    pub decisions: Arc<dyn DecisionLog>,
    /// Module updates
    pub updates: Arc<dyn ModuleUpdateRepository>,
    /// Durable timers
    pub timers: Arc<dyn TimerRepository>,
    /// Template versions
    pub templates: Arc<dyn TemplateRepository>,
}

/// External subsystems the engine talks to
#[derive(Clone)]
pub struct EngineCollaborators {
    /// Clinical data
    pub snapshots: Arc<dyn SnapshotProvider>,
    /// Optional snapshot cache
    pub cache: Option<Arc<dyn SnapshotCache>>,
    /// Event egress
    pub publisher: Arc<dyn EventPublisher>,
    /// Module clients
    pub clients: ModuleClients,
}

/// Summary of one committed transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionReport {
    /// Workflow
    pub workflow_id: WorkflowId,
    /// Recorded decision
    pub decision_id: String,
    /// Trigger
    pub trigger: TriggerKind,
    /// Outcome
    pub final_decision: FinalDecision,
    /// Step the evaluation ran against
    pub from_step: StepId,
    /// Step entered, if any
    pub next_step: Option<StepId>,
    /// Status after the transition
    pub status: WorkflowStatus,
    /// Progress after the transition
    pub progress_percentage: u8,
    /// Module updates queued by the transition
    pub module_updates: Vec<ModuleUpdateId>,
    /// Steps skipped by entry conditions
    pub skipped_steps: Vec<StepId>,
}

/// Counters of one dispatch pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    /// Updates accepted by their module
    pub delivered: usize,
    /// Updates scheduled for another attempt
    pub retrying: usize,
    /// Updates that ran out of attempts
    pub failed: usize,
    /// Failures turned into a manual review
    pub escalated: usize,
}

/// Counters of one timer pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerReport {
    /// Timers that produced a transition
    pub fired: usize,
    /// Timers dropped because their workflow moved on
    pub stale: usize,
    /// Timers kept for the next pass after an error
    pub deferred: usize,
}

/// One template started for many animals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkAssignment {
    /// Template to start
    pub template_id: TemplateId,
    /// Animals
    pub animals: Vec<AnimalProfile>,
    /// Shared veterinarian
    #[serde(default)]
    pub assigned_vet: Option<String>,
    /// Shared priority override
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Shared note
    #[serde(default)]
    pub notes: Option<String>,
    /// Requesting user
    #[serde(default)]
    pub requested_by: Option<String>,
}

/// Per-animal result of a bulk assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkAssignmentResult {
    /// Animal
    pub animal_id: AnimalId,
    /// Started workflow
    pub workflow_id: Option<WorkflowId>,
    /// Why the start failed
    pub error: Option<String>,
}

enum PlanWrite {
    Insert,
    Update,
    LogOnly,
}

/// Everything a transition will commit
struct Plan {
    instance: ActiveWorkflow,
    write: PlanWrite,
    from_step: StepId,
    decision: WorkflowDecision,
    effects: Effects,
}

#[derive(Default)]
struct Effects {
    updates: Vec<ModuleUpdate>,
    timers: Vec<WorkflowTimer>,
    scheduled: Vec<ScheduledAction>,
    skipped: Vec<StepId>,
    cancel: Vec<TimerId>,
}

impl Effects {
    fn absorb(&mut self, other: Effects) {
        self.updates.extend(other.updates);
        self.timers.extend(other.timers);
        self.scheduled.extend(other.scheduled);
        self.skipped.extend(other.skipped);
        self.cancel.extend(other.cancel);
    }
}

/// Marks a pending cancel for the lifetime of the guard
struct CancelGuard<'a> {
    requests: &'a DashMap<WorkflowId, usize>,
    workflow_id: WorkflowId,
}

impl<'a> CancelGuard<'a> {
    fn new(requests: &'a DashMap<WorkflowId, usize>, workflow_id: &WorkflowId) -> Self {
        *requests.entry(workflow_id.clone()).or_insert(0) += 1;
        Self {
            requests,
            workflow_id: workflow_id.clone(),
        }
    }
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        self.requests
            .remove_if_mut(&self.workflow_id, |_, count| {
                *count = count.saturating_sub(1);
                *count == 0
            });
    }
}

/// Owns the lifecycle of active workflows
///
/// Transitions of one workflow are serialized through a per-workflow mutex
/// (FIFO, so events are handled in arrival order) and committed with a
/// compare-and-swap on the workflow sequence. Module deliveries happen
/// outside the mutex.
pub struct WorkflowManager {
    workflows: Arc<dyn ActiveWorkflowRepository>,
    store: Arc<dyn WorkflowStore>,
    decisions: Arc<dyn DecisionLog>,
    updates: Arc<dyn ModuleUpdateRepository>,
    timers: Arc<dyn TimerRepository>,
    templates: Arc<TemplateRegistry>,
    dispatcher: ActionDispatcher,
    evaluator: Arc<dyn ConditionEvaluator>,
    resolver: StepResolver,
    snapshots: Arc<dyn SnapshotProvider>,
    cache: Option<Arc<dyn SnapshotCache>>,
    publisher: Arc<dyn EventPublisher>,
    config: EngineConfig,
    locks: DashMap<WorkflowId, Arc<Mutex<()>>>,
    cancel_requests: DashMap<WorkflowId, usize>,
}

impl WorkflowManager {
    /// Create a manager
    pub fn new(
        repositories: EngineRepositories,
        collaborators: EngineCollaborators,
        templates: Arc<TemplateRegistry>,
        evaluator: Arc<dyn ConditionEvaluator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            workflows: repositories.workflows,
            store: repositories.store,
            decisions: repositories.decisions,
            updates: repositories.updates,
            timers: repositories.timers,
            templates,
            dispatcher: ActionDispatcher::new(collaborators.clients, config.clone()),
            evaluator,
            resolver: StepResolver,
            snapshots: collaborators.snapshots,
            cache: collaborators.cache,
            publisher: collaborators.publisher,
            config,
            locks: DashMap::new(),
            cancel_requests: DashMap::new(),
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Template registry
    pub fn templates(&self) -> &Arc<TemplateRegistry> {
        &self.templates
    }

    // ---------------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------------

    /// Start the latest version of a template for an animal
    pub async fn start_workflow(
        &self,
        template_id: &TemplateId,
        animal: &AnimalProfile,
        options: StartOptions,
    ) -> Result<ActiveWorkflow, CoreError> {
        let now = Utc::now();
        let template = self.templates.get(template_id, None).await?;

        if !template.is_active {
            return Err(CoreError::ValidationError(format!(
                "Template {} is inactive",
                template.version_key()
            )));
        }
        if !template.is_applicable(animal) {
            return Err(CoreError::ValidationError(format!(
                "Template {} does not apply to animal {} ({})",
                template.id.0, animal.id.0, animal.species
            )));
        }
        if let Some(existing) = self.workflows.find_live(template_id, &animal.id).await? {
            return Err(CoreError::ConcurrencyConflict(format!(
                "Animal {} already has live workflow {} for template {}",
                animal.id.0, existing.id.0, template_id.0
            )));
        }

        let mut instance = ActiveWorkflow::new(&template, animal, &options, now)?;
        let decision = WorkflowDecision::for_instance(
            &instance,
            TriggerKind::Started,
            FinalDecision::Success,
            options.requested_by.as_deref(),
            now,
        );
        let from_step = instance.current_step_id.clone();

        let mut effects = Effects::default();
        let mut snapshot = None;
        let entered = self
            .enter(&mut instance, &template, &from_step, &mut snapshot, now, &mut effects)
            .await?;

        let status = match &entered {
            Some(_) => {
                effects.timers.push(WorkflowTimer::new(
                    &instance.id,
                    &template.starting_step,
                    TimerKind::WorkflowDeadline,
                    None,
                    0,
                    instance.expected_completion_at,
                ));
                WorkflowStatus::Active
            }
            None => {
                instance.complete(now)?;
                WorkflowStatus::Completed
            }
        };

        let reasoning = format!(
            "Started {} for {}",
            template.version_key(),
            instance.animal_id.0
        );
        let decision = decision
            .with_path(ResolvedPath::Start, entered, status)
            .with_automatic_reasoning(reasoning, 100)
            .with_effects(effects.scheduled.clone(), effects.skipped.clone());
        let decision = match options.requested_by {
            Some(_) => decision.with_manual_reasoning(options.notes.clone(), false),
            None => decision,
        };
        instance.record_progress(now);

        let plan = Plan {
            instance,
            write: PlanWrite::Insert,
            from_step,
            decision,
            effects,
        };
        let (_, instance) = self.commit(plan).await?;
        Ok(instance)
    }

    /// Start every active auto-start template that applies to the animal
    pub async fn auto_start_for_animal(
        &self,
        animal: &AnimalProfile,
    ) -> Result<Vec<ActiveWorkflow>, CoreError> {
        let templates = self.templates.list_active().await?;
        let mut started = Vec::new();

        for template in templates
            .iter()
            .filter(|t| t.auto_start && t.is_applicable(animal))
        {
            if self.workflows.find_live(&template.id, &animal.id).await?.is_some() {
                continue;
            }
            match self
                .start_workflow(&template.id, animal, StartOptions::default())
                .await
            {
                Ok(instance) => started.push(instance),
                Err(CoreError::ConcurrencyConflict(msg)) => {
                    debug!(template_id = %template.id.0, animal_id = %animal.id.0, "Auto start skipped: {}", msg);
                }
                Err(e) => {
                    warn!(
                        template_id = %template.id.0,
                        animal_id = %animal.id.0,
                        error = %e,
                        "Auto start failed"
                    );
                }
            }
        }

        Ok(started)
    }

    /// Start one template for many animals
    pub async fn assign_bulk(&self, request: BulkAssignment) -> Vec<BulkAssignmentResult> {
        let template_id = &request.template_id;
        let starts = request.animals.iter().map(|animal| {
            let options = StartOptions {
                assigned_vet: request.assigned_vet.clone(),
                priority: request.priority,
                notes: request.notes.clone(),
                requested_by: request.requested_by.clone(),
            };
            async move {
                let result = self.start_workflow(template_id, animal, options).await;
                match result {
                    Ok(instance) => BulkAssignmentResult {
                        animal_id: animal.id.clone(),
                        workflow_id: Some(instance.id),
                        error: None,
                    },
                    Err(e) => BulkAssignmentResult {
                        animal_id: animal.id.clone(),
                        workflow_id: None,
                        error: Some(e.to_string()),
                    },
                }
            }
        });

        let results = join_all(starts).await;
        info!(
            template_id = %template_id.0,
            requested = results.len(),
            started = results.iter().filter(|r| r.workflow_id.is_some()).count(),
            "Bulk assignment processed"
        );
        results
    }

    /// Evaluate a trigger event against the workflow's current step
    pub async fn handle_trigger(&self, event: TriggerEvent) -> Result<TransitionReport, CoreError> {
        match event.kind {
            TriggerKind::ExamCompleted
            | TriggerKind::InjectionGiven
            | TriggerKind::ProcedureDone
            | TriggerKind::ManualOverride
            | TriggerKind::Timeout
            | TriggerKind::WaitElapsed => {}
            other => {
                return Err(CoreError::ValidationError(format!(
                    "{:?} cannot be delivered as a trigger event",
                    other
                )))
            }
        }

        let event = &event;
        self.transact(&event.workflow_id, false, move |instance| {
            self.plan_trigger(instance, event)
        })
        .await?
        .ok_or_else(|| CoreError::Other(format!("No transition for workflow {}", event.workflow_id.0)))
    }

    /// Suspend a workflow and its timers
    pub async fn pause(
        &self,
        workflow_id: &WorkflowId,
        actor: Option<&str>,
        reason: Option<&str>,
    ) -> Result<TransitionReport, CoreError> {
        let now = Utc::now();
        self.transact(workflow_id, false, move |instance| {
            self.plan_pause(instance, actor, reason, now)
        })
        .await?
        .ok_or_else(|| CoreError::Other(format!("No transition for workflow {}", workflow_id.0)))
    }

    /// Reactivate a paused workflow and reschedule its timers
    pub async fn resume(
        &self,
        workflow_id: &WorkflowId,
        actor: Option<&str>,
        reason: Option<&str>,
    ) -> Result<TransitionReport, CoreError> {
        let now = Utc::now();
        self.transact(workflow_id, false, move |instance| {
            self.plan_resume(instance, actor, reason, now)
        })
        .await?
        .ok_or_else(|| CoreError::Other(format!("No transition for workflow {}", workflow_id.0)))
    }

    /// Cancel a workflow; takes priority over queued transitions
    pub async fn cancel(
        &self,
        workflow_id: &WorkflowId,
        actor: Option<&str>,
        reason: Option<&str>,
    ) -> Result<TransitionReport, CoreError> {
        let _cancel = CancelGuard::new(&self.cancel_requests, workflow_id);
        let now = Utc::now();
        self.transact(workflow_id, true, move |instance| {
            self.plan_cancel(instance, actor, reason, now)
        })
        .await?
        .ok_or_else(|| CoreError::Other(format!("No transition for workflow {}", workflow_id.0)))
    }

    // ---------------------------------------------------------------------
    // Background passes
    // ---------------------------------------------------------------------

    /// Fire every timer due at `now`
    pub async fn fire_due_timers(&self, now: DateTime<Utc>) -> Result<TimerReport, CoreError> {
        let due = self.timers.find_due(now).await?;
        let mut report = TimerReport::default();

        for timer in due {
            let outcome = match timer.kind {
                TimerKind::WorkflowDeadline => self
                    .expire_workflow(&timer.workflow_id, now)
                    .await
                    .map(|report| report.is_some()),
                TimerKind::StepTimeout | TimerKind::WaitElapsed => {
                    let kind = if timer.kind == TimerKind::StepTimeout {
                        TriggerKind::Timeout
                    } else {
                        TriggerKind::WaitElapsed
                    };
                    let mut event = TriggerEvent::new(kind, timer.workflow_id.clone(), now)
                        .for_step(timer.step_id.clone());
                    event.step_epoch = Some(timer.step_epoch);
                    self.handle_trigger(event).await.map(|_| true)
                }
            };

            match outcome {
                Ok(true) => report.fired += 1,
                Ok(false)
                | Err(CoreError::ConcurrencyConflict(_))
                | Err(CoreError::InvalidTransition(_))
                | Err(CoreError::WorkflowNotFound(_)) => {
                    debug!(timer_id = %timer.id.0, workflow_id = %timer.workflow_id.0, "Dropping stale timer");
                    self.timers.remove(&timer.id).await?;
                    report.stale += 1;
                }
                Err(e) => {
                    warn!(
                        timer_id = %timer.id.0,
                        workflow_id = %timer.workflow_id.0,
                        error = %e,
                        "Timer could not fire, keeping it for the next pass"
                    );
                    report.deferred += 1;
                }
            }
        }

        Ok(report)
    }

    /// Deliver module updates due at `now`, escalating exhausted ones
    pub async fn process_due_updates(
        &self,
        now: DateTime<Utc>,
    ) -> Result<DispatchReport, CoreError> {
        let due = self
            .updates
            .find_due(now, self.config.dispatch_batch_size)
            .await?;
        let mut report = DispatchReport::default();

        let owed = self
            .updates
            .find_escalation_pending(self.config.dispatch_batch_size)
            .await?;
        for update in owed {
            self.settle_escalation(update, now, &mut report).await;
        }

        for mut update in due {
            match self.dispatcher.deliver(&mut update, now).await {
                DeliveryOutcome::Delivered => {
                    report.delivered += 1;
                    self.save_update(&update).await;
                }
                DeliveryOutcome::Retrying => {
                    report.retrying += 1;
                    self.save_update(&update).await;
                }
                DeliveryOutcome::Exhausted => {
                    report.failed += 1;
                    if update.origin == UpdateOrigin::Escalation {
                        error!(
                            update_id = %update.id.0,
                            workflow_id = %update.source_workflow_id.0,
                            "Manual review notification could not be delivered"
                        );
                        self.save_update(&update).await;
                        continue;
                    }

                    // FAILED is stored first so the module is never called again
                    update.escalation_pending = true;
                    self.save_update(&update).await;
                    self.settle_escalation(update, now, &mut report).await;
                }
            }
        }

        Ok(report)
    }

    async fn settle_escalation(
        &self,
        mut update: ModuleUpdate,
        now: DateTime<Utc>,
        report: &mut DispatchReport,
    ) {
        update.escalation_pending = false;
        match self.escalate(&update, now).await {
            Ok(true) => report.escalated += 1,
            Ok(false) => self.save_update(&update).await,
            Err(e) => {
                error!(
                    update_id = %update.id.0,
                    workflow_id = %update.source_workflow_id.0,
                    error = %e,
                    "Escalation not committed, retried on the next pass"
                );
            }
        }
    }

    /// Fail every ACTIVE workflow whose deadline passed
    pub async fn expire_overdue_workflows(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkflowId>, CoreError> {
        let filter = WorkflowFilter {
            status: Some(WorkflowStatus::Active),
            ..WorkflowFilter::default()
        };
        let overdue: Vec<WorkflowId> = self
            .workflows
            .list(&filter)
            .await?
            .into_iter()
            .filter(|wf| wf.is_overdue(now))
            .map(|wf| wf.id)
            .collect();

        let mut expired = Vec::new();
        for workflow_id in overdue {
            match self.expire_workflow(&workflow_id, now).await {
                Ok(Some(_)) => expired.push(workflow_id),
                Ok(None) => {}
                Err(e) => warn!(workflow_id = %workflow_id.0, error = %e, "Expiry failed"),
            }
        }
        Ok(expired)
    }

    /// Fail the workflow if its deadline passed; `None` when it has not
    pub async fn expire_workflow(
        &self,
        workflow_id: &WorkflowId,
        now: DateTime<Utc>,
    ) -> Result<Option<TransitionReport>, CoreError> {
        self.transact(workflow_id, false, move |instance| async move {
            if !instance.is_overdue(now) {
                return Ok(None);
            }
            self.plan_expiry(instance, now).await.map(Some)
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Get a workflow
    pub async fn get_workflow(&self, workflow_id: &WorkflowId) -> Result<ActiveWorkflow, CoreError> {
        self.load(workflow_id).await
    }

    /// List workflows
    pub async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<ActiveWorkflow>, CoreError> {
        self.workflows.list(filter).await
    }

    /// Decisions of a workflow, oldest first
    pub async fn decisions_for(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<WorkflowDecision>, CoreError> {
        self.decisions.list_for_workflow(workflow_id).await
    }

    /// Module updates of a workflow, oldest first
    pub async fn module_updates_for(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<ModuleUpdate>, CoreError> {
        self.updates.list_for_workflow(workflow_id).await
    }

    /// Timers of a workflow
    pub async fn timers_for(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<WorkflowTimer>, CoreError> {
        self.timers.list_for_workflow(workflow_id).await
    }

    // ---------------------------------------------------------------------
    // Transition plumbing
    // ---------------------------------------------------------------------

    fn lock_for(&self, workflow_id: &WorkflowId) -> Arc<Mutex<()>> {
        self.locks
            .entry(workflow_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget the workflow's lock unless another caller holds or awaits it
    fn release_lock(&self, workflow_id: &WorkflowId) {
        // One reference in the map, one held by the releasing caller
        self.locks
            .remove_if(workflow_id, |_, lock| Arc::strong_count(lock) <= 2);
    }

    /// Number of workflows with a lock entry
    pub fn tracked_locks(&self) -> usize {
        self.locks.len()
    }

    fn cancel_pending(&self, workflow_id: &WorkflowId) -> bool {
        self.cancel_requests.contains_key(workflow_id)
    }

    async fn load(&self, workflow_id: &WorkflowId) -> Result<ActiveWorkflow, CoreError> {
        self.workflows
            .find_by_id(workflow_id)
            .await?
            .ok_or_else(|| CoreError::WorkflowNotFound(workflow_id.0.clone()))
    }

    /// Run `build` against fresh state under the workflow lock and commit its plan
    ///
    /// Lost compare-and-swaps re-read and rebuild up to the configured retry
    /// limit. Unless `cancelling`, a pending cancel aborts the transition.
    /// The lock entry lives only while some caller holds or awaits it.
    async fn transact<F, Fut>(
        &self,
        workflow_id: &WorkflowId,
        cancelling: bool,
        build: F,
    ) -> Result<Option<TransitionReport>, CoreError>
    where
        F: FnMut(ActiveWorkflow) -> Fut,
        Fut: Future<Output = Result<Option<Plan>, CoreError>>,
    {
        let lock = self.lock_for(workflow_id);
        let result = {
            let _guard = lock.lock().await;
            self.transact_locked(workflow_id, cancelling, build).await
        };
        self.release_lock(workflow_id);
        result
    }

    async fn transact_locked<F, Fut>(
        &self,
        workflow_id: &WorkflowId,
        cancelling: bool,
        mut build: F,
    ) -> Result<Option<TransitionReport>, CoreError>
    where
        F: FnMut(ActiveWorkflow) -> Fut,
        Fut: Future<Output = Result<Option<Plan>, CoreError>>,
    {
        let mut attempt = 0;

        loop {
            let superseded = || {
                CoreError::InvalidTransition(format!(
                    "Workflow {} is being cancelled",
                    workflow_id.0
                ))
            };
            if !cancelling && self.cancel_pending(workflow_id) {
                return Err(superseded());
            }

            let instance = self.load(workflow_id).await?;
            let plan = match build(instance).await? {
                Some(plan) => plan,
                None => return Ok(None),
            };

            if !cancelling && self.cancel_pending(workflow_id) {
                return Err(superseded());
            }

            match self.commit(plan).await {
                Ok((report, _)) => return Ok(Some(report)),
                Err(CoreError::ConcurrencyConflict(msg))
                    if attempt < self.config.max_transition_retries =>
                {
                    attempt += 1;
                    warn!(
                        workflow_id = %workflow_id.0,
                        attempt,
                        "Stale workflow state, re-reading: {}",
                        msg
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write the plan atomically, then publish its events
    async fn commit(&self, plan: Plan) -> Result<(TransitionReport, ActiveWorkflow), CoreError> {
        let Plan {
            mut instance,
            write,
            from_step,
            decision,
            effects,
        } = plan;

        let events = instance.take_events();
        let workflow = match write {
            PlanWrite::Insert => Some(WorkflowWrite::Insert(instance.clone())),
            PlanWrite::Update => {
                let expected_sequence = instance.next_sequence();
                Some(WorkflowWrite::Update {
                    instance: instance.clone(),
                    expected_sequence,
                })
            }
            PlanWrite::LogOnly => None,
        };

        let report = TransitionReport {
            workflow_id: instance.id.clone(),
            decision_id: decision.id.0.clone(),
            trigger: decision.trigger,
            final_decision: decision.final_decision,
            from_step,
            next_step: decision.next_step_id.clone(),
            status: instance.status,
            progress_percentage: instance.progress_percentage,
            module_updates: effects.updates.iter().map(|u| u.id.clone()).collect(),
            skipped_steps: effects.skipped.clone(),
        };

        let commit = TransitionCommit {
            workflow,
            decision,
            updates: effects.updates,
            timers_to_schedule: effects.timers,
            timers_to_cancel: effects.cancel,
        };

        if let Err(e) = self.store.commit(commit).await {
            match &e {
                CoreError::ConcurrencyConflict(_) => {}
                _ => error!(workflow_id = %instance.id.0, error = %e, "Transition not committed"),
            }
            return Err(e);
        }

        info!(
            workflow_id = %instance.id.0,
            trigger = ?report.trigger,
            decision = ?report.final_decision,
            from_step = %report.from_step.0,
            step_id = %instance.current_step_id.0,
            status = ?instance.status,
            progress = instance.progress_percentage,
            updates = report.module_updates.len(),
            "Workflow transition committed"
        );

        for event in &events {
            if let Err(e) = self.publisher.publish(event).await {
                warn!(
                    workflow_id = %instance.id.0,
                    event_type = event.event_type(),
                    error = %e,
                    "Event could not be published"
                );
            }
        }

        Ok((report, instance))
    }

    async fn save_update(&self, update: &ModuleUpdate) {
        if let Err(e) = self.updates.save(update).await {
            error!(update_id = %update.id.0, error = %e, "Module update state not saved");
        }
    }

    async fn timer_ids(
        &self,
        workflow_id: &WorkflowId,
        include_deadline: bool,
    ) -> Result<Vec<TimerId>, CoreError> {
        Ok(self
            .timers
            .list_for_workflow(workflow_id)
            .await?
            .into_iter()
            .filter(|t| include_deadline || t.kind != TimerKind::WorkflowDeadline)
            .map(|t| t.id)
            .collect())
    }

    /// Clinical data for the animal; a cached copy is used only when it was
    /// captured after both the last activity and `observed_at`
    async fn load_snapshot(
        &self,
        instance: &ActiveWorkflow,
        observed_at: DateTime<Utc>,
    ) -> ClinicalSnapshot {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(&instance.animal_id).await {
                let not_before = instance.last_activity_at.max(observed_at);
                if cached.is_fresh_since(not_before) {
                    debug!(workflow_id = %instance.id.0, "Using cached snapshot");
                    return cached;
                }
                debug!(workflow_id = %instance.id.0, "Cached snapshot predates the trigger");
            }
        }

        match self.snapshots.get_snapshot(&instance.animal_id).await {
            Ok(snapshot) => {
                if let Some(cache) = &self.cache {
                    cache.put(&instance.animal_id, &snapshot).await;
                }
                snapshot
            }
            Err(e) => {
                warn!(
                    workflow_id = %instance.id.0,
                    animal_id = %instance.animal_id.0,
                    error = %e,
                    "Snapshot unavailable, conditions evaluate to false"
                );
                ClinicalSnapshot::empty(Utc::now())
            }
        }
    }

    /// Evaluate conditions, fetching the snapshot only when needed
    async fn evaluate(
        &self,
        instance: &ActiveWorkflow,
        conditions: &[WorkflowCondition],
        slot: &mut Option<ClinicalSnapshot>,
        observed_at: DateTime<Utc>,
    ) -> (ConditionEvaluation, Map<String, Value>) {
        if conditions.is_empty() {
            return (self.evaluator.evaluate(conditions, &ClinicalSnapshot::empty(Utc::now())), Map::new());
        }

        let snapshot = match slot.take() {
            Some(snapshot) => snapshot,
            None => self.load_snapshot(instance, observed_at).await,
        };
        let evaluation = self.evaluator.evaluate(conditions, &snapshot);

        let fields = self.templates.fields();
        let read: Map<String, Value> = conditions
            .iter()
            .map(|c| {
                let value = snapshot
                    .lookup(fields.path_for(&c.field))
                    .unwrap_or(Value::Null);
                (c.field.clone(), value)
            })
            .collect();

        *slot = Some(snapshot);
        (evaluation, read)
    }

    fn prepare_actions(
        &self,
        actions: &[WorkflowAction],
        instance: &ActiveWorkflow,
        source_step: &StepId,
        origin: UpdateOrigin,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) -> Result<(), CoreError> {
        for action in actions {
            let prepared = match self
                .dispatcher
                .dispatch(action, instance, source_step, origin, now)?
            {
                PreparedAction::Timer(_) if instance.status.is_terminal() => {
                    debug!(workflow_id = %instance.id.0, action_id = %action.id, "Wait ignored, workflow finished");
                    continue;
                }
                PreparedAction::Timer(timer) => PreparedAction::Timer(WorkflowTimer::new(
                    &instance.id,
                    &instance.current_step_id,
                    timer.kind,
                    Some(action.id.as_str()),
                    instance.step_epoch,
                    timer.fires_at,
                )),
                other => other,
            };

            effects.scheduled.push(prepared.scheduled(action));
            match prepared {
                PreparedAction::Update(update) => effects.updates.push(update),
                PreparedAction::Timer(timer) => effects.timers.push(timer),
            }
        }
        Ok(())
    }

    /// Enter `target`, skipping steps whose entry conditions do not hold
    ///
    /// Returns the entered step, or `None` when the skip chain ran off the
    /// end of the template.
    async fn enter(
        &self,
        instance: &mut ActiveWorkflow,
        template: &WorkflowTemplate,
        target: &StepId,
        snapshot: &mut Option<ClinicalSnapshot>,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) -> Result<Option<StepId>, CoreError> {
        let profile = instance.animal_profile();
        let mut next = Some(target.clone());
        let mut hops = 0;

        while let Some(step_id) = next.take() {
            hops += 1;
            if hops > template.steps.len() {
                return Err(CoreError::ValidationError(format!(
                    "Entry-condition skips in {} do not terminate at step {}",
                    template.version_key(),
                    step_id.0
                )));
            }

            let step: &WorkflowStep = template.require_step(&step_id)?;
            let admitted = step.applies_to(&profile)
                && self
                    .evaluate(instance, &step.entry_conditions, snapshot, now)
                    .await
                    .0
                    .result;

            if admitted {
                instance.enter_step(template, &step.id, now)?;
                let first_scheduled = effects.scheduled.len();
                self.prepare_actions(
                    &step.on_start_actions,
                    instance,
                    &step.id,
                    UpdateOrigin::OnStart,
                    now,
                    effects,
                )?;
                instance.next_scheduled_action = effects.scheduled.get(first_scheduled).cloned();

                if let Some(wait) = step.max_wait_days {
                    effects.timers.push(WorkflowTimer::new(
                        &instance.id,
                        &step.id,
                        TimerKind::StepTimeout,
                        None,
                        instance.step_epoch,
                        now + days(wait),
                    ));
                }
                if step.notification_required {
                    let notice = WorkflowAction::new(
                        &format!("notify:{}", step.id.0),
                        ActionType::Notify,
                        TargetModule::Internal,
                    )
                    .with_parameter(
                        "message",
                        json!(format!("{} entered step {}", instance.animal_name, step.name)),
                    );
                    self.prepare_actions(
                        std::slice::from_ref(&notice),
                        instance,
                        &step.id,
                        UpdateOrigin::OnStart,
                        now,
                        effects,
                    )?;
                }
                return Ok(Some(step.id.clone()));
            }

            debug!(workflow_id = %instance.id.0, step_id = %step.id.0, "Entry conditions not met, skipping step");
            instance.skip_step(&step.id);
            effects.skipped.push(step.id.clone());
            next = self.resolver.resolve_skip(step).cloned();
        }

        Ok(None)
    }

    async fn plan_trigger(
        &self,
        mut instance: ActiveWorkflow,
        event: &TriggerEvent,
    ) -> Result<Option<Plan>, CoreError> {
        let now = event.received_at;

        if let Some(animal_id) = &event.animal_id {
            if animal_id != &instance.animal_id {
                return Err(CoreError::ValidationError(format!(
                    "Event for animal {} does not match workflow {} (animal {})",
                    animal_id.0, instance.id.0, instance.animal_id.0
                )));
            }
        }

        instance.ensure_active()?;

        if let Some(step_id) = &event.step_id {
            if step_id != &instance.current_step_id {
                return Err(CoreError::ConcurrencyConflict(format!(
                    "Event for step {} is stale, workflow {} is at step {}",
                    step_id.0, instance.id.0, instance.current_step_id.0
                )));
            }
        }
        if let Some(epoch) = event.step_epoch {
            if epoch != instance.step_epoch {
                return Err(CoreError::ConcurrencyConflict(format!(
                    "Event for step epoch {} is stale, workflow {} is at epoch {}",
                    epoch, instance.id.0, instance.step_epoch
                )));
            }
        }

        let template = self
            .templates
            .get_pinned(&instance.template_id, instance.template_version)
            .await?;

        if instance.is_overdue(now) {
            return self.plan_expiry(instance, now).await.map(Some);
        }

        let step = template.require_step(&instance.current_step_id)?;
        let from_step = step.id.clone();
        let mut snapshot = None;

        let (exit_result, decision) = match event.kind {
            TriggerKind::Timeout => {
                let reasoning = format!(
                    "No trigger for step {} within {} days",
                    step.name,
                    step.max_wait_days.unwrap_or_default()
                );
                let decision = WorkflowDecision::for_instance(
                    &instance,
                    TriggerKind::Timeout,
                    FinalDecision::Failure,
                    None,
                    now,
                )
                .with_automatic_reasoning(reasoning, 100);
                (false, decision)
            }
            TriggerKind::ManualOverride => {
                let manual = event.manual_override.as_ref().ok_or_else(|| {
                    CoreError::ValidationError("MANUAL_OVERRIDE event without override".to_string())
                })?;
                if manual.next_step.is_none() && manual.outcome.is_none() {
                    return Err(CoreError::ValidationError(
                        "Manual override needs a next step or an outcome".to_string(),
                    ));
                }
                if let Some(target) = &manual.next_step {
                    template.require_step(target)?;
                }

                instance.manual_review_pending = false;
                if let Some(reasoning) = &manual.reasoning {
                    instance.add_note(&format!("{}: {}", manual.veterinarian, reasoning));
                }

                let decision = WorkflowDecision::for_instance(
                    &instance,
                    TriggerKind::ManualOverride,
                    FinalDecision::Alternative,
                    Some(&manual.veterinarian),
                    now,
                )
                .with_manual_reasoning(manual.reasoning.clone(), true);
                (manual.outcome.unwrap_or(true), decision)
            }
            kind => {
                let (evaluation, read) = self
                    .evaluate(&instance, &step.exit_conditions, &mut snapshot, now)
                    .await;
                instance.last_condition_check = Some(ConditionCheck {
                    step_id: step.id.clone(),
                    checked_at: now,
                    result: evaluation.result,
                    per_condition: evaluation.per_condition.clone(),
                    snapshot: read,
                });

                let final_decision = if evaluation.result {
                    FinalDecision::Success
                } else {
                    FinalDecision::Failure
                };
                let reasoning = describe_evaluation(step, &step.exit_conditions, &evaluation);
                let decision =
                    WorkflowDecision::for_instance(&instance, kind, final_decision, None, now)
                        .with_evaluation(&step.exit_conditions, evaluation.per_condition.clone())
                        .with_automatic_reasoning(reasoning, evaluation.confidence());
                (evaluation.result, decision)
            }
        };

        let override_target = event
            .manual_override
            .as_ref()
            .and_then(|manual| manual.next_step.as_ref());
        let resolution = self.resolver.resolve_next(step, exit_result, override_target);
        instance.record_step_outcome(exit_result);

        let mut effects = Effects {
            cancel: self.timer_ids(&instance.id, false).await?,
            ..Effects::default()
        };
        let mut entry_effects = Effects::default();

        let next_step = match &resolution {
            Resolution::Next { step_id, .. } => {
                let entered = self
                    .enter(&mut instance, &template, step_id, &mut snapshot, now, &mut entry_effects)
                    .await?;
                if entered.is_none() {
                    instance.complete(now)?;
                }
                entered
            }
            Resolution::Terminal {
                status: WorkflowStatus::Completed,
                ..
            } => {
                instance.complete(now)?;
                None
            }
            Resolution::Terminal { .. } => {
                instance.fail(
                    &format!("Step {} failed with no failure path", step.id.0),
                    now,
                )?;
                None
            }
        };

        let (exit_actions, origin) = if exit_result {
            (&step.on_success_actions, UpdateOrigin::OnSuccess)
        } else {
            (&step.on_failure_actions, UpdateOrigin::OnFailure)
        };
        self.prepare_actions(exit_actions, &instance, &from_step, origin, now, &mut effects)?;
        effects.absorb(entry_effects);

        if instance.status.is_terminal() {
            effects.cancel = self.timer_ids(&instance.id, true).await?;
            effects.timers.clear();
        }

        let decision = decision
            .with_path(resolution.path(), next_step, instance.status)
            .with_effects(effects.scheduled.clone(), effects.skipped.clone())
            .with_payload(event.payload.clone());
        instance.record_progress(now);

        debug!(
            workflow_id = %instance.id.0,
            from_step = %from_step.0,
            path = ?decision.chosen_path,
            "Transition planned"
        );

        Ok(Some(Plan {
            instance,
            write: PlanWrite::Update,
            from_step,
            decision,
            effects,
        }))
    }

    async fn plan_expiry(
        &self,
        mut instance: ActiveWorkflow,
        now: DateTime<Utc>,
    ) -> Result<Plan, CoreError> {
        let from_step = instance.current_step_id.clone();
        let reasoning = format!(
            "Workflow exceeded its maximum duration (deadline {})",
            instance.expected_completion_at.to_rfc3339()
        );
        let decision = WorkflowDecision::for_instance(
            &instance,
            TriggerKind::DurationExceeded,
            FinalDecision::Failure,
            None,
            now,
        );

        instance.fail(&reasoning, now)?;
        instance.record_progress(now);
        warn!(workflow_id = %instance.id.0, "Workflow expired");

        let decision = decision
            .with_path(ResolvedPath::Failed, None, instance.status)
            .with_automatic_reasoning(reasoning, 100);
        let effects = Effects {
            cancel: self.timer_ids(&instance.id, true).await?,
            ..Effects::default()
        };

        Ok(Plan {
            instance,
            write: PlanWrite::Update,
            from_step,
            decision,
            effects,
        })
    }

    async fn plan_pause(
        &self,
        mut instance: ActiveWorkflow,
        actor: Option<&str>,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Plan>, CoreError> {
        let timers = self.timers.list_for_workflow(&instance.id).await?;
        let decision = WorkflowDecision::for_instance(
            &instance,
            TriggerKind::Paused,
            FinalDecision::Alternative,
            actor,
            now,
        );

        let suspended = timers.iter().map(|t| t.suspend(now)).collect();
        instance.pause(suspended, now)?;
        if let Some(reason) = reason {
            instance.add_note(&format!("Paused: {}", reason));
        }
        instance.record_progress(now);

        let decision = decision
            .with_path(ResolvedPath::Unchanged, None, instance.status)
            .with_manual_reasoning(reason.map(str::to_string), false);
        let effects = Effects {
            cancel: timers.into_iter().map(|t| t.id).collect(),
            ..Effects::default()
        };

        Ok(Some(Plan {
            from_step: instance.current_step_id.clone(),
            instance,
            write: PlanWrite::Update,
            decision,
            effects,
        }))
    }

    async fn plan_resume(
        &self,
        mut instance: ActiveWorkflow,
        actor: Option<&str>,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Plan>, CoreError> {
        let decision = WorkflowDecision::for_instance(
            &instance,
            TriggerKind::Resumed,
            FinalDecision::Alternative,
            actor,
            now,
        );

        let suspended = instance.resume(now)?;
        if let Some(reason) = reason {
            instance.add_note(&format!("Resumed: {}", reason));
        }
        instance.record_progress(now);

        let decision = decision
            .with_path(ResolvedPath::Unchanged, None, instance.status)
            .with_manual_reasoning(reason.map(str::to_string), false);
        let effects = Effects {
            timers: suspended.iter().map(|s| s.reschedule(now)).collect(),
            ..Effects::default()
        };

        Ok(Some(Plan {
            from_step: instance.current_step_id.clone(),
            instance,
            write: PlanWrite::Update,
            decision,
            effects,
        }))
    }

    async fn plan_cancel(
        &self,
        mut instance: ActiveWorkflow,
        actor: Option<&str>,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Plan>, CoreError> {
        let decision = WorkflowDecision::for_instance(
            &instance,
            TriggerKind::Cancelled,
            FinalDecision::Alternative,
            actor,
            now,
        );

        instance.cancel(reason.unwrap_or("Cancelled"), now)?;
        if let Some(reason) = reason {
            instance.add_note(&format!("Cancelled: {}", reason));
        }
        instance.record_progress(now);

        let decision = decision
            .with_path(ResolvedPath::Unchanged, None, instance.status)
            .with_manual_reasoning(reason.map(str::to_string), false);
        let effects = Effects {
            cancel: self.timer_ids(&instance.id, true).await?,
            ..Effects::default()
        };

        Ok(Some(Plan {
            from_step: instance.current_step_id.clone(),
            instance,
            write: PlanWrite::Update,
            decision,
            effects,
        }))
    }

    /// Record a manual review for an exhausted update; `false` when the workflow no longer cares
    async fn escalate(&self, failed: &ModuleUpdate, now: DateTime<Utc>) -> Result<bool, CoreError> {
        let workflow_id = &failed.source_workflow_id;
        let result = self
            .transact(workflow_id, false, move |instance| {
                self.plan_escalation(instance, failed, now)
            })
            .await;

        match result {
            Ok(Some(_)) => {
                error!(
                    workflow_id = %workflow_id.0,
                    update_id = %failed.id.0,
                    "Module update escalated to manual review"
                );
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(CoreError::WorkflowNotFound(_)) => {
                warn!(workflow_id = %workflow_id.0, update_id = %failed.id.0, "Failed update belongs to an unknown workflow");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn plan_escalation(
        &self,
        mut instance: ActiveWorkflow,
        failed: &ModuleUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<Plan>, CoreError> {
        if instance.status == WorkflowStatus::Cancelled {
            info!(
                workflow_id = %instance.id.0,
                update_id = %failed.id.0,
                "Workflow cancelled, failed update not escalated"
            );
            return Ok(None);
        }

        let reason = format!(
            "{:?} action {} to {} failed after {} attempts: {}",
            failed.action_type,
            failed.action_id,
            failed.target_module,
            failed.attempts,
            failed.last_error().unwrap_or("unknown error")
        );

        let mut decision = WorkflowDecision::for_instance(
            &instance,
            TriggerKind::DeliveryFailed,
            FinalDecision::ManualReview,
            None,
            now,
        );
        decision.step_id = failed.source_step_id.clone();

        let notify = self.dispatcher.escalation_update(&instance, failed, now);
        let scheduled = ScheduledAction {
            action_id: notify.action_id.clone(),
            action_type: notify.action_type,
            target_module: notify.target_module,
            description: format!("Manual review for {}", instance.animal_name),
            scheduled_for: now,
        };

        let write = if instance.status.is_live() {
            PlanWrite::Update
        } else {
            PlanWrite::LogOnly
        };
        instance.mark_manual_review(&reason, now);

        let decision = decision
            .with_path(ResolvedPath::Unchanged, None, instance.status)
            .with_automatic_reasoning(reason, 100)
            .with_effects(vec![scheduled], Vec::new())
            .with_payload(json!({
                "updateId": failed.id.0,
                "targetModule": failed.target_module,
                "attempts": failed.attempts,
                "error": failed.last_error(),
            }));

        let effects = Effects {
            updates: vec![failed.clone(), notify],
            ..Effects::default()
        };

        Ok(Some(Plan {
            from_step: failed.source_step_id.clone(),
            instance,
            write,
            decision,
            effects,
        }))
    }
}

fn describe_evaluation(
    step: &WorkflowStep,
    conditions: &[WorkflowCondition],
    evaluation: &ConditionEvaluation,
) -> String {
    if conditions.is_empty() {
        return format!("Step {} has no exit conditions", step.name);
    }

    let held = evaluation.per_condition.iter().filter(|r| **r).count();
    let mut text = format!(
        "{} of {} exit conditions held at step {}; result {}",
        held,
        conditions.len(),
        step.name,
        if evaluation.result { "success" } else { "failure" }
    );

    let unreadable: Vec<String> = conditions
        .iter()
        .zip(evaluation.outcomes.iter())
        .filter_map(|(condition, outcome)| match outcome {
            ConditionOutcome::MissingField => Some(format!("{} missing", condition.field)),
            ConditionOutcome::TypeMismatch => Some(format!("{} type mismatch", condition.field)),
            _ => None,
        })
        .collect();
    if !unreadable.is_empty() {
        text.push_str(&format!(" ({})", unreadable.join(", ")));
    }
    text
}
