//! The composition root: one `Orchestrator` instance owns the agent
//! registry, resource pool, event bus, template registry and workflow
//! history. Nothing is process-global, so multiple orchestrators coexist
//! in one process.

use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::agents::executor::TaskExecutor;
use crate::agents::health::{HealthMonitor, HealthMonitorConfig, SystemHealth};
use crate::agents::registry::AgentRegistry;
use crate::core::errors::{ConductorError, Result};
use crate::core::resources::{PoolConfig, ResourceAllocator};
use crate::events::bus::EventBus;
use crate::events::types::EventType;
use crate::workflow::engine::ExecutionEngine;
use crate::workflow::templates::{StepTemplate, TemplateRegistry};
use crate::workflow::types::{
    CoordinationStrategy, WorkflowDefinition, WorkflowRequest, WorkflowResult,
};
use crate::workflow::validator;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub pool: PoolConfig,
    pub health: HealthMonitorConfig,
    /// Backoff unit for step retries.
    pub backoff_base: Duration,
    /// Global timeout applied when a submission does not set one.
    pub default_global_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            health: HealthMonitorConfig::default(),
            backoff_base: Duration::from_secs(1),
            default_global_timeout: Duration::from_secs(3600),
        }
    }
}

pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    allocator: Arc<ResourceAllocator>,
    bus: Arc<EventBus>,
    templates: TemplateRegistry,
    engine: ExecutionEngine,
    health: Arc<HealthMonitor>,
    history: DashMap<String, (WorkflowDefinition, WorkflowResult)>,
    default_global_timeout: Duration,
}

impl Orchestrator {
    /// Create an orchestrator with default configuration. Must be called
    /// from within a Tokio runtime (the event bus spawns its delivery
    /// loop).
    pub fn new() -> Result<Self> {
        Self::with_config(OrchestratorConfig::default())
    }

    pub fn with_config(config: OrchestratorConfig) -> Result<Self> {
        let registry = Arc::new(AgentRegistry::new());
        let allocator = Arc::new(ResourceAllocator::new(config.pool)?);
        let bus = EventBus::new();
        let engine = ExecutionEngine::new(
            registry.clone(),
            allocator.clone(),
            bus.clone(),
            config.backoff_base,
        );
        let health = Arc::new(HealthMonitor::new(
            registry.clone(),
            bus.clone(),
            config.health,
        ));
        Ok(Self {
            registry,
            allocator,
            bus,
            templates: TemplateRegistry::new(),
            engine,
            health,
            history: DashMap::new(),
            default_global_timeout: config.default_global_timeout,
        })
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn registry(&self) -> Arc<AgentRegistry> {
        self.registry.clone()
    }

    /// Register a worker under a unique id with its capability strings.
    pub fn register_agent<S: Into<String>>(
        &self,
        agent_id: S,
        capabilities: Vec<String>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<()> {
        let agent_id = agent_id.into();
        self.registry
            .register(agent_id.clone(), capabilities.clone(), executor)?;
        self.bus.emit(
            EventType::AgentRegistered,
            json!({
                "agent_id": agent_id,
                "capabilities": capabilities,
            }),
        );
        Ok(())
    }

    pub fn deregister_agent(&self, agent_id: &str) -> bool {
        self.registry.deregister(agent_id).is_some()
    }

    pub fn register_template<S: Into<String>>(&self, name: S, steps: Vec<StepTemplate>) {
        self.templates.register(name, steps);
    }

    /// Load a step template from a YAML file; returns the template name.
    pub fn load_template_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<String> {
        self.templates.load_yaml_file(path)
    }

    /// Submit a workflow request: template expansion or explicit steps,
    /// validation, resource allocation, execution, rollback on abnormal
    /// end, archival. The engine's public entry point.
    pub async fn submit(&self, request: WorkflowRequest) -> Result<WorkflowResult> {
        let (definition, pre_errors) = self.build_definition(request)?;
        self.run_definition(definition, pre_errors).await
    }

    /// Submit an already-built definition, e.g. one loaded from YAML.
    pub async fn submit_definition(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowResult> {
        self.run_definition(definition, Vec::new()).await
    }

    async fn run_definition(
        &self,
        mut definition: WorkflowDefinition,
        mut errors: Vec<String>,
    ) -> Result<WorkflowResult> {
        let report = validator::validate(&definition, &self.registry);
        errors.extend(report.errors);
        if !errors.is_empty() {
            return Err(ConductorError::validation(errors));
        }

        self.allocator
            .allocate_workflow(&definition, &self.registry)?;
        let result = self.engine.run(&mut definition).await;
        self.allocator.release_workflow(&definition);

        info!(
            workflow_id = %definition.id,
            status = ?result.status,
            "Archived workflow run"
        );
        self.history
            .insert(definition.id.clone(), (definition, result.clone()));
        Ok(result)
    }

    fn build_definition(
        &self,
        request: WorkflowRequest,
    ) -> Result<(WorkflowDefinition, Vec<String>)> {
        let mut errors = Vec::new();

        let strategy = match request.coordination_strategy.as_deref() {
            None => CoordinationStrategy::Sequential,
            Some(raw) => match CoordinationStrategy::parse(raw) {
                Some(strategy) => strategy,
                None => {
                    errors.push(format!("unrecognized coordination strategy '{}'", raw));
                    CoordinationStrategy::Sequential
                }
            },
        };

        let steps = match (request.template.as_deref(), request.steps) {
            (Some(_), Some(_)) => {
                return Err(ConductorError::configuration(
                    "a submission provides either a template or explicit steps, not both",
                ))
            }
            (Some(name), None) => self.templates.expand(name)?,
            (None, Some(step_requests)) => step_requests
                .into_iter()
                .enumerate()
                .map(|(index, step)| step.into_step(index))
                .collect(),
            (None, None) => {
                return Err(ConductorError::configuration(
                    "a submission requires a template name or explicit steps",
                ))
            }
        };

        let id = request.workflow_id.unwrap_or_else(cuid2::create_id);
        let name = request.template.unwrap_or_else(|| id.clone());
        let mut definition = WorkflowDefinition::new(id, name, steps)
            .with_strategy(strategy)
            .with_rollback_enabled(request.enable_rollback.unwrap_or(true));
        definition.global_timeout = request
            .timeout_minutes
            .map(|minutes| Duration::from_secs(minutes * 60))
            .unwrap_or(self.default_global_timeout);
        Ok((definition, errors))
    }

    /// Archived definition and result of a finished run.
    pub fn history(&self, workflow_id: &str) -> Option<(WorkflowDefinition, WorkflowResult)> {
        self.history
            .get(workflow_id)
            .map(|entry| entry.value().clone())
    }

    /// Spawn the periodic health probe loop.
    pub fn start_health_monitor(&self) -> tokio::task::JoinHandle<()> {
        self.health.clone().spawn()
    }

    /// Run one health probe sweep immediately.
    pub async fn probe_agents(&self) {
        self.health.probe_all().await;
    }

    pub fn system_health(&self) -> SystemHealth {
        self.health.system_health()
    }
}
