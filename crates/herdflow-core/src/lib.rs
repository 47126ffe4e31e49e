//!
//! Herdflow Core - Workflow execution engine for livestock reproductive protocols
//!
//! This crate defines the domain model (templates, active workflows,
//! decisions, module updates, timers), the services that drive workflows
//! through their steps, and the repository and collaborator traits that
//! storage and integration crates implement.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - workflow models, entities, and rules
pub mod domain;

/// Application services - registry, dispatcher, workflow manager
pub mod application;

/// Engine configuration
pub mod config;

/// Core types
pub mod types;

/// Error types
pub mod error;

// Re-export key types
pub use config::EngineConfig;
pub use error::CoreError;
pub use types::ClinicalSnapshot;

// Application interfaces
pub use application::action_dispatcher::{ActionDispatcher, DeliveryOutcome, ModuleClients};
pub use application::runtime_interface::{IngressReport, WorkflowRuntime, WorkflowSummary};
pub use application::template_registry::TemplateRegistry;
pub use application::workflow_manager::{
    BulkAssignment, BulkAssignmentResult, DispatchReport, EngineCollaborators, EngineRepositories,
    TimerReport, TransitionReport, WorkflowManager,
};

// Re-export main API types for easy use
pub use domain::action::{ActionType, TargetModule, WorkflowAction};
pub use domain::collaborators::{
    EventPublisher, ManualOverride, ModuleClient, ModuleResponse, SnapshotCache, SnapshotProvider,
    TriggerEvent, TriggerSource,
};
pub use domain::condition::{
    ConditionEvaluation, ConditionEvaluator, ConditionOperator, DefaultConditionEvaluator,
    FieldKind, FieldRegistry, LogicalOperator, WorkflowCondition,
};
pub use domain::decision::{FinalDecision, TriggerKind, WorkflowDecision};
pub use domain::events::WorkflowEvent;
pub use domain::instance::{
    ActiveWorkflow, AnimalId, AnimalProfile, StartOptions, StepId, TemplateId, WorkflowId,
    WorkflowPhase, WorkflowStatus,
};
pub use domain::module_update::{ModuleUpdate, UpdateOrigin, UpdateStatus, UpdateType};
pub use domain::repository::{
    ActiveWorkflowRepository, DecisionLog, ModuleUpdateRepository, TemplateRepository,
    TimerRepository, TransitionCommit, WorkflowFilter, WorkflowStore, WorkflowWrite,
};
pub use domain::step::{Resolution, ResolvedPath, StepResolver};
pub use domain::template::{
    AnimalRole, Priority, StepType, TemplateCategory, WorkflowStep, WorkflowTemplate,
};
pub use domain::timer::{TimerKind, WorkflowTimer};
