use thiserror::Error;

/// Core error type for the workflow engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Active workflow not found
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Workflow template not found
    #[error("Workflow template not found: {0}")]
    TemplateNotFound(String),

    /// A pinned template version is missing from the registry
    #[error("Workflow template version not found: {0}")]
    TemplateVersionNotFound(String),

    /// Step referenced by an instance or template is missing
    #[error("Step not found: {0}")]
    StepNotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Requested transition is not allowed from the current state
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Stale state or competing writer
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// State store error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// External module rejected or failed an update
    #[error("Delivery error: {0}")]
    DeliveryError(String),

    /// External module did not answer in time
    #[error("Delivery timed out: {0}")]
    DeliveryTimeout(String),

    /// Clinical snapshot could not be produced
    #[error("Snapshot error: {0}")]
    SnapshotError(String),

    /// Timer error
    #[error("Timer error: {0}")]
    TimerError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Whether the caller may transparently retry the failed operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::ConcurrencyConflict(_)
                | CoreError::DeliveryError(_)
                | CoreError::DeliveryTimeout(_)
        )
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}
