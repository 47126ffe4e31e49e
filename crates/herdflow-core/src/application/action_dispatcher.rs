use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    config::EngineConfig,
    domain::action::{ActionType, TargetModule, WorkflowAction},
    domain::collaborators::ModuleClient,
    domain::instance::{ActiveWorkflow, ScheduledAction, StepId},
    domain::module_update::{
        ModuleUpdate, ModuleUpdateId, UpdateOrigin, UpdateStatus, UpdateType,
    },
    domain::timer::{days, TimerKind, WorkflowTimer},
    CoreError,
};

/// Client per target module
#[derive(Clone, Default)]
pub struct ModuleClients {
    clients: HashMap<TargetModule, Arc<dyn ModuleClient>>,
}

impl ModuleClients {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the client for a module, replacing any previous one
    pub fn register(&mut self, module: TargetModule, client: Arc<dyn ModuleClient>) {
        self.clients.insert(module, client);
    }

    /// Builder form of [`ModuleClients::register`]
    pub fn with_client(mut self, module: TargetModule, client: Arc<dyn ModuleClient>) -> Self {
        self.register(module, client);
        self
    }

    /// Client for a module
    pub fn get(&self, module: TargetModule) -> Option<Arc<dyn ModuleClient>> {
        self.clients.get(&module).cloned()
    }
}

/// What an action turned into
#[derive(Debug, Clone)]
pub enum PreparedAction {
    /// Outbound update, status PENDING
    Update(ModuleUpdate),
    /// Deferred trigger back into the instance manager
    Timer(WorkflowTimer),
}

impl PreparedAction {
    /// Dashboard summary of the prepared action
    pub fn scheduled(&self, action: &WorkflowAction) -> ScheduledAction {
        let scheduled_for = match self {
            Self::Update(update) => update.scheduled_at,
            Self::Timer(timer) => timer.fires_at,
        };
        ScheduledAction {
            action_id: action.id.clone(),
            action_type: action.action_type,
            target_module: action.target_module,
            description: action.describe(),
            scheduled_for,
        }
    }
}

/// Result of one delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Module accepted the update
    Delivered,
    /// Attempt failed, another one is scheduled
    Retrying,
    /// Attempt failed and no attempts are left
    Exhausted,
}

/// Turns actions into module updates and delivers them
pub struct ActionDispatcher {
    clients: ModuleClients,
    config: EngineConfig,
}

impl ActionDispatcher {
    /// Create a dispatcher
    pub fn new(clients: ModuleClients, config: EngineConfig) -> Self {
        Self { clients, config }
    }

    /// Translate an action of `step_id` into a pending update or a wait timer
    pub fn dispatch(
        &self,
        action: &WorkflowAction,
        instance: &ActiveWorkflow,
        step_id: &StepId,
        origin: UpdateOrigin,
        now: DateTime<Utc>,
    ) -> Result<PreparedAction, CoreError> {
        if action.action_type == ActionType::WaitDays {
            let wait = action.wait_days().filter(|d| *d > 0.0).ok_or_else(|| {
                CoreError::ValidationError(format!(
                    "WAIT_DAYS action {} has no positive 'days' parameter",
                    action.id
                ))
            })?;
            return Ok(PreparedAction::Timer(WorkflowTimer::new(
                &instance.id,
                step_id,
                TimerKind::WaitElapsed,
                Some(action.id.as_str()),
                instance.step_epoch,
                now + days(wait),
            )));
        }

        let update_type = action.update_type().unwrap_or(UpdateType::Create);
        let payload = json!({
            "workflowId": instance.id.0,
            "templateId": instance.template_id.0,
            "animalId": instance.animal_id.0,
            "animalName": instance.animal_name,
            "stepId": step_id.0,
            "actionId": action.id,
            "actionType": action.action_type,
            "assignedVet": instance.assigned_vet,
            "priority": instance.priority,
            "parameters": Value::Object(action.parameters.clone()),
        });

        Ok(PreparedAction::Update(ModuleUpdate {
            id: ModuleUpdateId::generate(),
            source_workflow_id: instance.id.clone(),
            source_step_id: step_id.clone(),
            animal_id: instance.animal_id.clone(),
            action_id: action.id.clone(),
            action_type: action.action_type,
            origin,
            target_module: action.target_module,
            update_type,
            payload,
            status: UpdateStatus::Pending,
            attempts: 0,
            max_attempts: self.config.max_attempts,
            result: None,
            scheduled_at: now,
            executed_at: None,
            next_retry_at: None,
            escalation_pending: false,
        }))
    }

    /// Notification queued when `failed` exhausted its attempts
    pub fn escalation_update(
        &self,
        instance: &ActiveWorkflow,
        failed: &ModuleUpdate,
        now: DateTime<Utc>,
    ) -> ModuleUpdate {
        let message = format!(
            "{:?} for {} ({}) could not be delivered to {}: {}",
            failed.action_type,
            instance.animal_name,
            instance.animal_id.0,
            failed.target_module,
            failed.last_error().unwrap_or("unknown error")
        );

        ModuleUpdate {
            id: ModuleUpdateId::generate(),
            source_workflow_id: instance.id.clone(),
            source_step_id: failed.source_step_id.clone(),
            animal_id: instance.animal_id.clone(),
            action_id: format!("escalation:{}", failed.id.0),
            action_type: ActionType::Notify,
            origin: UpdateOrigin::Escalation,
            target_module: self.config.escalation_module,
            update_type: UpdateType::Create,
            payload: json!({
                "workflowId": instance.id.0,
                "animalId": instance.animal_id.0,
                "stepId": failed.source_step_id.0,
                "failedUpdateId": failed.id.0,
                "assignedVet": instance.assigned_vet,
                "severity": "MANUAL_REVIEW",
                "message": message,
            }),
            status: UpdateStatus::Pending,
            attempts: 0,
            max_attempts: self.config.max_attempts,
            result: None,
            scheduled_at: now,
            executed_at: None,
            next_retry_at: None,
            escalation_pending: false,
        }
    }

    /// Attempt delivery once and record the outcome on the update
    ///
    /// The call is bounded by the configured dispatch timeout. Callers must
    /// not hold any workflow lock while awaiting it.
    pub async fn deliver(&self, update: &mut ModuleUpdate, now: DateTime<Utc>) -> DeliveryOutcome {
        let error = match self.clients.get(update.target_module) {
            None => format!("No client registered for module {}", update.target_module),
            Some(client) => {
                let call = client.apply(update.update_type, &update.payload);
                match tokio::time::timeout(self.config.dispatch_timeout(), call).await {
                    Ok(Ok(response)) if response.success => {
                        update.mark_completed(response.response, response.created_record_id, now);
                        tracing::debug!(
                            update_id = %update.id.0,
                            workflow_id = %update.source_workflow_id.0,
                            module = %update.target_module,
                            attempts = update.attempts,
                            "Module update delivered"
                        );
                        return DeliveryOutcome::Delivered;
                    }
                    Ok(Ok(response)) => response
                        .error
                        .unwrap_or_else(|| "Module rejected the update".to_string()),
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => CoreError::DeliveryTimeout(format!(
                        "{} did not answer within {}ms",
                        update.target_module, self.config.dispatch_timeout_ms
                    ))
                    .to_string(),
                }
            }
        };

        let backoff = self.config.backoff(update.attempts + 1);
        if update.record_failure(&error, now, backoff) {
            tracing::error!(
                update_id = %update.id.0,
                workflow_id = %update.source_workflow_id.0,
                module = %update.target_module,
                attempts = update.attempts,
                error = %error,
                "Module update failed permanently"
            );
            DeliveryOutcome::Exhausted
        } else {
            tracing::warn!(
                update_id = %update.id.0,
                workflow_id = %update.source_workflow_id.0,
                module = %update.target_module,
                attempts = update.attempts,
                retry_in_secs = backoff.num_seconds(),
                error = %error,
                "Module update failed, will retry"
            );
            DeliveryOutcome::Retrying
        }
    }
}
