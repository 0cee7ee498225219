//! Conductor - an in-process workflow orchestration engine.
//!
//! Workflows are validated against a registry of caller-supplied agents,
//! given bounded resource budgets, executed under a sequential, parallel or
//! dag coordination strategy with per-step timeouts and retries, rolled
//! back on failure, and observed through an internal event bus.

// Core infrastructure modules
pub mod core {
    pub mod errors;
    pub mod resources;
}

pub mod agents; // Agent capability trait, registry and health monitoring
pub mod events; // Append-only event log with async fan-out
pub mod workflow; // Definitions, validation, execution, rollback, templates

mod orchestrator;

// Re-exports for convenience
pub use crate::core::errors::{ConductorError, Result};
pub use crate::core::resources::{PoolConfig, ResourceAllocation, ResourceAllocator, ResourceKind};

pub use agents::{
    AgentHealthStatus, AgentRegistry, HealthMonitor, HealthMonitorConfig, HealthState,
    SystemHealth, TaskExecutor,
};
pub use events::{Event, EventBus, EventType};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use workflow::{
    CoordinationStrategy, ExecutionEngine, Step, StepRequest, StepResult, StepStatus,
    StepTemplate, TemplateRegistry, WorkflowDefinition, WorkflowRequest, WorkflowResult,
    WorkflowStatus,
};
