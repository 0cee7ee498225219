//! Compensation for abnormally terminated workflows.
//!
//! Walks the steps in reverse declaration order and invokes the recorded
//! compensating payloads for every step that had completed by failure time.
//! Individual compensation failures are logged and swallowed so rollback
//! always attempts every remaining action.

use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::agents::registry::AgentRegistry;
use crate::core::errors::ConductorError;
use crate::core::resources::ResourceAllocator;
use crate::events::bus::EventBus;
use crate::events::types::EventType;
use crate::workflow::types::{StepResult, WorkflowDefinition};

pub struct RollbackCoordinator {
    registry: Arc<AgentRegistry>,
    allocator: Arc<ResourceAllocator>,
    bus: Arc<EventBus>,
}

impl RollbackCoordinator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        allocator: Arc<ResourceAllocator>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            allocator,
            bus,
        }
    }

    /// Compensate completed steps in reverse declaration order. A failing
    /// compensation for a later step never prevents rollback of earlier
    /// ones.
    pub async fn rollback(
        &self,
        definition: &WorkflowDefinition,
        results: &DashMap<String, StepResult>,
    ) {
        let completed = definition
            .steps
            .iter()
            .filter(|step| {
                results
                    .get(&step.id)
                    .map(|r| r.is_completed())
                    .unwrap_or(false)
            })
            .count();
        self.bus.emit(
            EventType::RollbackInitiated,
            json!({
                "workflow_id": definition.id,
                "completed_steps": completed,
            }),
        );
        info!(
            workflow_id = %definition.id,
            completed_steps = completed,
            "Rolling back workflow"
        );

        for step in definition.steps.iter().rev() {
            let was_completed = results
                .get(&step.id)
                .map(|r| r.is_completed())
                .unwrap_or(false);
            if !was_completed || step.rollback_actions.is_empty() {
                continue;
            }

            let agent_id = self
                .allocator
                .assigned_agent(&definition.id, &step.id)
                .unwrap_or_else(|| step.agent_id.clone());
            let Some(agent) = self.registry.get(&agent_id) else {
                warn!(
                    workflow_id = %definition.id,
                    step_id = %step.id,
                    agent_id = %agent_id,
                    "Agent gone; skipping step's compensating actions"
                );
                continue;
            };

            for (index, action) in step.rollback_actions.iter().enumerate() {
                match agent.executor.process_task(action.clone()).await {
                    Ok(_) => {
                        debug!(
                            workflow_id = %definition.id,
                            step_id = %step.id,
                            action = index,
                            "Compensating action applied"
                        );
                    }
                    Err(e) => {
                        let error = ConductorError::RollbackAction {
                            step_id: step.id.clone(),
                            message: e.to_string(),
                        };
                        warn!(
                            workflow_id = %definition.id,
                            step_id = %step.id,
                            action = index,
                            error = %error,
                            "Compensating action failed; continuing"
                        );
                    }
                }
            }
        }
    }
}
