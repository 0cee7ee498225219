//! Drives a validated, resource-allocated workflow to a terminal status
//! under one of three coordination strategies.

use async_broadcast::{broadcast, Receiver};
use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{error, info, warn};

use crate::agents::registry::AgentRegistry;
use crate::core::errors::ConductorError;
use crate::core::resources::ResourceAllocator;
use crate::events::bus::EventBus;
use crate::events::types::EventType;
use crate::workflow::rollback::RollbackCoordinator;
use crate::workflow::step_executor::StepExecutor;
use crate::workflow::types::{
    CoordinationStrategy, Step, StepResult, StepStatus, WorkflowDefinition, WorkflowResult,
    WorkflowStatus,
};

enum RunOutcome {
    Completed,
    Failed { failed_step: String, error: String },
}

pub struct ExecutionEngine {
    registry: Arc<AgentRegistry>,
    allocator: Arc<ResourceAllocator>,
    bus: Arc<EventBus>,
    step_executor: StepExecutor,
    rollback: RollbackCoordinator,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<AgentRegistry>,
        allocator: Arc<ResourceAllocator>,
        bus: Arc<EventBus>,
        backoff_base: Duration,
    ) -> Self {
        Self {
            step_executor: StepExecutor::new(bus.clone(), backoff_base),
            rollback: RollbackCoordinator::new(registry.clone(), allocator.clone(), bus.clone()),
            registry,
            allocator,
            bus,
        }
    }

    /// Run a workflow to completion, failure or global timeout. Rollback
    /// runs here for abnormal endings when the definition enables it; the
    /// definition's step bookkeeping is synced before returning so the
    /// caller can archive it.
    pub async fn run(&self, definition: &mut WorkflowDefinition) -> WorkflowResult {
        let started = Instant::now();
        info!(
            workflow_id = %definition.id,
            name = %definition.name,
            strategy = definition.coordination_strategy.as_str(),
            steps = definition.steps.len(),
            "Workflow started"
        );
        self.bus.emit(
            EventType::WorkflowStarted,
            json!({
                "workflow_id": definition.id,
                "name": definition.name,
                "strategy": definition.coordination_strategy.as_str(),
                "steps": definition.steps.len(),
            }),
        );

        let results: DashMap<String, StepResult> = DashMap::new();
        let updated_steps: DashMap<String, Step> = DashMap::new();

        let outcome = timeout(
            definition.global_timeout,
            self.run_strategy(definition, &results, &updated_steps),
        )
        .await;

        for step in definition.steps.iter_mut() {
            if let Some(updated) = updated_steps.get(&step.id) {
                *step = updated.clone();
            }
        }

        let execution_time = started.elapsed();
        let (status, failed_step, error) = match outcome {
            Ok(RunOutcome::Completed) => (WorkflowStatus::Completed, None, None),
            Ok(RunOutcome::Failed { failed_step, error }) => {
                (WorkflowStatus::Failed, Some(failed_step), Some(error))
            }
            Err(_) => {
                warn!(
                    workflow_id = %definition.id,
                    timeout_ms = definition.global_timeout.as_millis() as u64,
                    "Workflow exceeded global timeout"
                );
                (
                    WorkflowStatus::TimedOut,
                    None,
                    Some(format!(
                        "workflow timed out after {}ms",
                        definition.global_timeout.as_millis() as u64
                    )),
                )
            }
        };

        if status != WorkflowStatus::Completed && definition.rollback_enabled {
            self.rollback.rollback(definition, &results).await;
        }

        // Steps cancelled mid-flight never released their budgets; the
        // release is idempotent so a sweep is safe.
        for step in &definition.steps {
            self.allocator.release(&definition.id, &step.id);
        }

        let execution_time_ms = execution_time.as_millis() as u64;
        match status {
            WorkflowStatus::Completed => {
                info!(workflow_id = %definition.id, execution_time_ms, "Workflow completed");
                self.bus.emit(
                    EventType::WorkflowCompleted,
                    json!({
                        "workflow_id": definition.id,
                        "execution_time_ms": execution_time_ms,
                    }),
                );
            }
            WorkflowStatus::Failed => {
                error!(
                    workflow_id = %definition.id,
                    failed_step = failed_step.as_deref().unwrap_or("?"),
                    execution_time_ms,
                    "Workflow failed"
                );
                self.bus.emit(
                    EventType::WorkflowFailed,
                    json!({
                        "workflow_id": definition.id,
                        "execution_time_ms": execution_time_ms,
                        "failed_step": failed_step,
                        "error": error,
                        "timeout": false,
                    }),
                );
            }
            WorkflowStatus::TimedOut => {
                error!(workflow_id = %definition.id, execution_time_ms, "Workflow timed out");
                self.bus.emit(
                    EventType::WorkflowFailed,
                    json!({
                        "workflow_id": definition.id,
                        "execution_time_ms": execution_time_ms,
                        "error": error,
                        "timeout": true,
                    }),
                );
            }
        }

        WorkflowResult {
            status,
            workflow_id: definition.id.clone(),
            execution_time,
            step_results: results
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
            failed_step,
            error,
        }
    }

    async fn run_strategy(
        &self,
        definition: &WorkflowDefinition,
        results: &DashMap<String, StepResult>,
        updated: &DashMap<String, Step>,
    ) -> RunOutcome {
        match definition.coordination_strategy {
            CoordinationStrategy::Sequential => {
                self.run_sequential(definition, results, updated).await
            }
            // dag shares the parallel code path: readiness is driven purely
            // by the dependency rule, with no topological batching.
            CoordinationStrategy::Parallel | CoordinationStrategy::Dag => {
                self.run_concurrent(definition, results, updated).await
            }
        }
    }

    /// Declaration order, one step at a time. Stops at the first failure.
    async fn run_sequential(
        &self,
        definition: &WorkflowDefinition,
        results: &DashMap<String, StepResult>,
        updated: &DashMap<String, Step>,
    ) -> RunOutcome {
        let (mut tx, rx) = broadcast::<String>(definition.steps.len().max(1));
        tx.set_overflow(true);

        for step in &definition.steps {
            if !step.dependencies.is_empty() {
                wait_for_dependencies(step, results, rx.clone()).await;
            }
            let result = self.dispatch_step(definition, step.clone(), results, updated).await;
            let _ = tx.try_broadcast(step.id.clone());
            if !result.is_completed() {
                return RunOutcome::Failed {
                    failed_step: step.id.clone(),
                    error: result
                        .error
                        .unwrap_or_else(|| "step failed".to_string()),
                };
            }
        }
        RunOutcome::Completed
    }

    /// Ready steps run concurrently; the ready set is recomputed after each
    /// completion. The first failure cancels every in-flight sibling and
    /// keeps unstarted steps from launching.
    async fn run_concurrent(
        &self,
        definition: &WorkflowDefinition,
        results: &DashMap<String, StepResult>,
        updated: &DashMap<String, Step>,
    ) -> RunOutcome {
        let mut launched: HashSet<String> = HashSet::new();
        let mut in_flight = FuturesUnordered::new();

        loop {
            for step in &definition.steps {
                if launched.contains(&step.id) {
                    continue;
                }
                let ready = step.dependencies.iter().all(|dep| {
                    results
                        .get(dep)
                        .map(|r| r.is_completed())
                        .unwrap_or(false)
                });
                if !ready {
                    continue;
                }
                launched.insert(step.id.clone());
                let step_clone = step.clone();
                in_flight.push(async move {
                    let step_id = step_clone.id.clone();
                    let result = self
                        .dispatch_step(definition, step_clone, results, updated)
                        .await;
                    (step_id, result)
                });
            }

            let Some((step_id, result)) = in_flight.next().await else {
                break;
            };

            if !result.is_completed() {
                let cancelled = in_flight.len();
                if cancelled > 0 {
                    warn!(
                        workflow_id = %definition.id,
                        failed_step = %step_id,
                        cancelled,
                        "Cancelling in-flight sibling steps"
                    );
                }
                drop(in_flight);
                return RunOutcome::Failed {
                    failed_step: step_id,
                    error: result
                        .error
                        .unwrap_or_else(|| "step failed".to_string()),
                };
            }
        }

        if launched.len() == definition.steps.len() {
            RunOutcome::Completed
        } else {
            // With an acyclic, fully-resolvable graph and no failure every
            // step launches; a leftover means the definition slipped past
            // validation.
            let blocked = definition
                .steps
                .iter()
                .find(|s| !launched.contains(&s.id))
                .map(|s| s.id.clone())
                .unwrap_or_default();
            RunOutcome::Failed {
                failed_step: blocked.clone(),
                error: format!("step '{}' never became ready", blocked),
            }
        }
    }

    /// Resolve the step's assigned agent and execute it; record the result,
    /// sync the step snapshot and release the step's budget.
    async fn dispatch_step(
        &self,
        definition: &WorkflowDefinition,
        mut step: Step,
        results: &DashMap<String, StepResult>,
        updated: &DashMap<String, Step>,
    ) -> StepResult {
        let agent_id = self
            .allocator
            .assigned_agent(&definition.id, &step.id)
            .unwrap_or_else(|| step.agent_id.clone());

        let result = match self.registry.get(&agent_id) {
            Some(agent) => {
                self.step_executor
                    .execute(&definition.id, &mut step, agent)
                    .await
            }
            None => {
                let err = ConductorError::AgentUnavailable(agent_id.clone());
                error!(
                    workflow_id = %definition.id,
                    step_id = %step.id,
                    agent_id = %agent_id,
                    "Assigned agent no longer registered"
                );
                step.status = StepStatus::Failed;
                step.completed_at = Some(Utc::now());
                self.bus.emit(
                    EventType::StepFailed,
                    json!({
                        "workflow_id": definition.id,
                        "step_id": step.id,
                        "error": err.to_string(),
                        "attempts": 0,
                    }),
                );
                StepResult {
                    status: StepStatus::Failed,
                    result: None,
                    error: Some(err.to_string()),
                    duration: Duration::ZERO,
                    attempts: 0,
                }
            }
        };

        results.insert(step.id.clone(), result.clone());
        updated.insert(step.id.clone(), step.clone());
        self.allocator.release(&definition.id, &step.id);
        result
    }
}

/// Block until every dependency shows completed in the results map, waking
/// on step-terminal broadcasts. A dependency that can never complete leaves
/// the caller parked until the workflow's global timeout cancels the run.
async fn wait_for_dependencies(
    step: &Step,
    results: &DashMap<String, StepResult>,
    mut rx: Receiver<String>,
) {
    loop {
        let unmet = step.dependencies.iter().any(|dep| {
            results
                .get(dep)
                .map(|r| !r.is_completed())
                .unwrap_or(true)
        });
        if !unmet {
            return;
        }
        match rx.recv().await {
            Ok(_) | Err(async_broadcast::RecvError::Overflowed(_)) => continue,
            Err(async_broadcast::RecvError::Closed) => {
                // No further completions can arrive; hold the dependency
                // barrier until the global timeout cancels this future.
                futures::future::pending::<()>().await;
            }
        }
    }
}
