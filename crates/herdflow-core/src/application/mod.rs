/// Action translation and module delivery
pub mod action_dispatcher;

/// Versioned template storage
pub mod template_registry;

/// Workflow lifecycle and transitions
pub mod workflow_manager;

/// Runtime interface for external systems
pub mod runtime_interface;
