use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{
    application::template_registry::TemplateRegistry,
    application::workflow_manager::{
        BulkAssignment, BulkAssignmentResult, DispatchReport, EngineCollaborators,
        EngineRepositories, TimerReport, TransitionReport, WorkflowManager,
    },
    config::EngineConfig,
    domain::collaborators::{TriggerEvent, TriggerSource},
    domain::condition::{DefaultConditionEvaluator, FieldRegistry},
    domain::decision::WorkflowDecision,
    domain::instance::{
        ActiveWorkflow, AnimalId, AnimalProfile, StartOptions, StepId, TemplateId, WorkflowId,
        WorkflowPhase, WorkflowStatus,
    },
    domain::module_update::ModuleUpdate,
    domain::repository::WorkflowFilter,
    domain::template::WorkflowTemplate,
    domain::timer::WorkflowTimer,
    CoreError,
};

/// Dashboard view of an active workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    /// Workflow ID
    pub id: WorkflowId,
    /// Template
    pub template_id: TemplateId,
    /// Pinned template version
    pub template_version: u32,
    /// Template name
    pub template_name: String,
    /// Animal
    pub animal_id: AnimalId,
    /// Animal name
    pub animal_name: String,
    /// Current step
    pub current_step_id: StepId,
    /// Current step name
    pub current_step_name: String,
    /// "3 / 7" style position
    pub step_position: String,
    /// Progress in percent
    pub progress_percentage: u8,
    /// Status
    pub status: WorkflowStatus,
    /// Phase
    pub phase: WorkflowPhase,
    /// Deadline
    pub expected_completion_at: DateTime<Utc>,
    /// Waiting on a human
    pub manual_review_pending: bool,
}

impl From<&ActiveWorkflow> for WorkflowSummary {
    fn from(instance: &ActiveWorkflow) -> Self {
        Self {
            id: instance.id.clone(),
            template_id: instance.template_id.clone(),
            template_version: instance.template_version,
            template_name: instance.template_name.clone(),
            animal_id: instance.animal_id.clone(),
            animal_name: instance.animal_name.clone(),
            current_step_id: instance.current_step_id.clone(),
            current_step_name: instance.current_step_name.clone(),
            step_position: format!("{} / {}", instance.step_number, instance.total_steps),
            progress_percentage: instance.progress_percentage,
            status: instance.status,
            phase: instance.phase,
            expected_completion_at: instance.expected_completion_at,
            manual_review_pending: instance.manual_review_pending,
        }
    }
}

/// Counters of one ingress run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressReport {
    /// Events read from the source
    pub received: usize,
    /// Events that produced a transition
    pub handled: usize,
    /// Events rejected or stale
    pub rejected: usize,
}

/// The main API provided by the engine to external systems
#[derive(Clone)]
pub struct WorkflowRuntime {
    manager: Arc<WorkflowManager>,
    templates: Arc<TemplateRegistry>,
}

impl WorkflowRuntime {
    /// Create a runtime from existing services
    pub fn new(manager: Arc<WorkflowManager>, templates: Arc<TemplateRegistry>) -> Self {
        Self { manager, templates }
    }

    /// Wire the engine on top of externally provided storage and collaborators
    pub fn create_with_repositories(
        repositories: EngineRepositories,
        collaborators: EngineCollaborators,
        fields: FieldRegistry,
        config: EngineConfig,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let templates = Arc::new(TemplateRegistry::new(
            repositories.templates.clone(),
            fields.clone(),
        ));
        let evaluator = Arc::new(DefaultConditionEvaluator::new(fields));
        let manager = Arc::new(WorkflowManager::new(
            repositories,
            collaborators,
            templates.clone(),
            evaluator,
            config,
        ));

        Ok(Self::new(manager, templates))
    }

    /// Workflow manager
    pub fn manager(&self) -> &Arc<WorkflowManager> {
        &self.manager
    }

    /// Register a template as its next version
    pub async fn register_template(
        &self,
        template: WorkflowTemplate,
    ) -> Result<WorkflowTemplate, CoreError> {
        self.templates.register(template).await
    }

    /// Get a template version, or the latest
    pub async fn get_template(
        &self,
        id: &TemplateId,
        version: Option<u32>,
    ) -> Result<Arc<WorkflowTemplate>, CoreError> {
        self.templates.get(id, version).await
    }

    /// Templates accepting new workflows
    pub async fn list_templates(&self) -> Result<Vec<WorkflowTemplate>, CoreError> {
        self.templates.list_active().await
    }

    /// Stop new starts of a template
    pub async fn deactivate_template(&self, id: &TemplateId) -> Result<WorkflowTemplate, CoreError> {
        self.templates.deactivate(id).await
    }

    /// Start a workflow
    pub async fn start_workflow(
        &self,
        template_id: &TemplateId,
        animal: &AnimalProfile,
        options: StartOptions,
    ) -> Result<WorkflowId, CoreError> {
        let instance = self.manager.start_workflow(template_id, animal, options).await?;
        Ok(instance.id)
    }

    /// Start every applicable auto-start template
    pub async fn auto_start(&self, animal: &AnimalProfile) -> Result<Vec<WorkflowId>, CoreError> {
        let started = self.manager.auto_start_for_animal(animal).await?;
        Ok(started.into_iter().map(|wf| wf.id).collect())
    }

    /// Start one template for many animals
    pub async fn assign_bulk(&self, request: BulkAssignment) -> Vec<BulkAssignmentResult> {
        self.manager.assign_bulk(request).await
    }

    /// Deliver a trigger event
    pub async fn submit_event(&self, event: TriggerEvent) -> Result<TransitionReport, CoreError> {
        self.manager.handle_trigger(event).await
    }

    /// Pause a workflow
    pub async fn pause(
        &self,
        id: &WorkflowId,
        actor: Option<&str>,
        reason: Option<&str>,
    ) -> Result<TransitionReport, CoreError> {
        self.manager.pause(id, actor, reason).await
    }

    /// Resume a workflow
    pub async fn resume(
        &self,
        id: &WorkflowId,
        actor: Option<&str>,
        reason: Option<&str>,
    ) -> Result<TransitionReport, CoreError> {
        self.manager.resume(id, actor, reason).await
    }

    /// Cancel a workflow
    pub async fn cancel(
        &self,
        id: &WorkflowId,
        actor: Option<&str>,
        reason: Option<&str>,
    ) -> Result<TransitionReport, CoreError> {
        self.manager.cancel(id, actor, reason).await
    }

    /// Full state of a workflow
    pub async fn get_workflow(&self, id: &WorkflowId) -> Result<ActiveWorkflow, CoreError> {
        self.manager.get_workflow(id).await
    }

    /// Summaries matching a filter
    pub async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowSummary>, CoreError> {
        let workflows = self.manager.list_workflows(filter).await?;
        Ok(workflows.iter().map(WorkflowSummary::from).collect())
    }

    /// Decision history of a workflow
    pub async fn decisions(&self, id: &WorkflowId) -> Result<Vec<WorkflowDecision>, CoreError> {
        self.manager.decisions_for(id).await
    }

    /// Module updates of a workflow
    pub async fn module_updates(&self, id: &WorkflowId) -> Result<Vec<ModuleUpdate>, CoreError> {
        self.manager.module_updates_for(id).await
    }

    /// Pending timers of a workflow
    pub async fn timers(&self, id: &WorkflowId) -> Result<Vec<WorkflowTimer>, CoreError> {
        self.manager.timers_for(id).await
    }

    /// One scheduler pass: timers, deliveries, then overdue workflows
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<(TimerReport, DispatchReport), CoreError> {
        let timers = self.manager.fire_due_timers(now).await?;
        let dispatch = self.manager.process_due_updates(now).await?;
        let expired = self.manager.expire_overdue_workflows(now).await?;
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Overdue workflows expired");
        }
        Ok((timers, dispatch))
    }

    /// Drain a trigger source until it closes
    ///
    /// Events for the same workflow are handled one at a time in arrival
    /// order; different workflows proceed in parallel. A workflow's queue is
    /// closed once it has nothing in flight, so idle workflows hold no task.
    pub async fn run_ingress(&self, source: Arc<dyn TriggerSource>) -> IngressReport {
        let counters = Arc::new(IngressCounters::default());
        let mut queues: HashMap<WorkflowId, IngressQueue> = HashMap::new();
        let mut retiring: Vec<JoinHandle<()>> = Vec::new();
        let mut received = 0;

        while let Some(event) = source.next_event().await {
            received += 1;
            retire_idle(&mut queues, &mut retiring);
            let workflow_id = event.workflow_id.clone();

            let queue = queues.entry(workflow_id.clone()).or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let in_flight = Arc::new(AtomicUsize::new(0));
                let worker = tokio::spawn(Self::drain_queue(
                    self.manager.clone(),
                    workflow_id.clone(),
                    rx,
                    in_flight.clone(),
                    counters.clone(),
                ));
                IngressQueue {
                    tx,
                    in_flight,
                    worker,
                }
            });

            queue.in_flight.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = queue.tx.send(event) {
                queue.in_flight.fetch_sub(1, Ordering::SeqCst);
                tracing::error!(workflow_id = %workflow_id.0, "Ingress queue closed: {}", e);
            }
        }

        // Dropping the senders lets every worker finish its backlog and exit
        let workers: Vec<JoinHandle<()>> = queues
            .into_values()
            .map(|queue| queue.worker)
            .chain(retiring)
            .collect();
        for result in join_all(workers).await {
            if let Err(e) = result {
                tracing::error!("Ingress worker panicked: {}", e);
            }
        }

        let report = IngressReport {
            received,
            handled: counters.handled.load(Ordering::SeqCst),
            rejected: counters.rejected.load(Ordering::SeqCst),
        };
        tracing::info!(
            received = report.received,
            handled = report.handled,
            rejected = report.rejected,
            "Trigger source closed"
        );
        report
    }

    async fn drain_queue(
        manager: Arc<WorkflowManager>,
        workflow_id: WorkflowId,
        mut rx: mpsc::UnboundedReceiver<TriggerEvent>,
        in_flight: Arc<AtomicUsize>,
        counters: Arc<IngressCounters>,
    ) {
        while let Some(event) = rx.recv().await {
            let kind = event.kind;
            match manager.handle_trigger(event).await {
                Ok(_) => {
                    counters.handled.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    counters.rejected.fetch_add(1, Ordering::SeqCst);
                    tracing::warn!(
                        workflow_id = %workflow_id.0,
                        trigger = ?kind,
                        error = %e,
                        "Trigger event rejected"
                    );
                }
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Per-workflow ingress queue and its worker
struct IngressQueue {
    tx: mpsc::UnboundedSender<TriggerEvent>,
    in_flight: Arc<AtomicUsize>,
    worker: JoinHandle<()>,
}

#[derive(Default)]
struct IngressCounters {
    handled: AtomicUsize,
    rejected: AtomicUsize,
}

/// Close queues with nothing in flight and forget finished workers
///
/// Only the ingress loop sends, so a zero count means every event of that
/// workflow has been handled and a later queue cannot overtake it.
fn retire_idle(
    queues: &mut HashMap<WorkflowId, IngressQueue>,
    retiring: &mut Vec<JoinHandle<()>>,
) {
    retiring.retain(|worker| !worker.is_finished());
    let idle: Vec<WorkflowId> = queues
        .iter()
        .filter(|(_, queue)| queue.in_flight.load(Ordering::SeqCst) == 0)
        .map(|(id, _)| id.clone())
        .collect();
    for workflow_id in idle {
        if let Some(queue) = queues.remove(&workflow_id) {
            retiring.push(queue.worker);
        }
    }
}
