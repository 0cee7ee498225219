use thiserror::Error;

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, ConductorError>;

/// Unified error type for the orchestration engine.
///
/// Retryable step errors (`StepTimeout`, `StepExecution`) are absorbed by the
/// step executor up to the step's retry budget; everything else either aborts
/// a submission before any step runs (`Validation`, `ResourceExhausted`,
/// `Configuration`, `TemplateNotFound`) or is logged and swallowed
/// (`RollbackAction`).
#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("workflow validation failed: {}", errors.join("; "))]
    Validation { errors: Vec<String> },

    #[error("agent not available: {0}")]
    AgentUnavailable(String),

    #[error("agent already registered: {0}")]
    AgentAlreadyRegistered(String),

    #[error("step '{step_id}' timed out after {timeout_ms}ms")]
    StepTimeout { step_id: String, timeout_ms: u64 },

    #[error("step '{step_id}' execution failed: {message}")]
    StepExecution { step_id: String, message: String },

    #[error("rollback action for step '{step_id}' failed: {message}")]
    RollbackAction { step_id: String, message: String },

    #[error("resource exhausted: {resource} (requested {requested}, pool capacity {capacity})")]
    ResourceExhausted {
        resource: String,
        requested: f64,
        capacity: f64,
    },

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("YAML parsing failed: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO operation failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ConductorError {
    /// Create a validation error from collected messages.
    pub fn validation(errors: Vec<String>) -> Self {
        Self::Validation { errors }
    }

    pub fn step_execution<S: Into<String>, M: Into<String>>(step_id: S, message: M) -> Self {
        Self::StepExecution {
            step_id: step_id.into(),
            message: message.into(),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration(message.into())
    }
}
