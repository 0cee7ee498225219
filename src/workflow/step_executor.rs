//! Runs one step against its assigned agent under a deadline, with bounded
//! retries and exponential backoff.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{info, warn};

use crate::agents::registry::RegisteredAgent;
use crate::events::bus::EventBus;
use crate::events::types::EventType;
use crate::workflow::types::{Step, StepResult, StepStatus};

pub struct StepExecutor {
    bus: Arc<EventBus>,
    /// Unit for the `2^attempt` backoff progression; one second in
    /// production, shrunk in tests.
    backoff_base: Duration,
}

impl StepExecutor {
    pub fn new(bus: Arc<EventBus>, backoff_base: Duration) -> Self {
        Self { bus, backoff_base }
    }

    /// Execute a step to a terminal status, mutating its bookkeeping fields
    /// along the way. A timeout and an agent-reported error consume a retry
    /// attempt identically; they are distinguished only in the logs.
    pub async fn execute(
        &self,
        workflow_id: &str,
        step: &mut Step,
        agent: Arc<RegisteredAgent>,
    ) -> StepResult {
        let started = Instant::now();
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());
        self.bus.emit(
            EventType::StepStarted,
            json!({
                "workflow_id": workflow_id,
                "step_id": step.id,
                "agent_id": agent.agent_id,
            }),
        );

        // A declared config schema is checked once, up front; a mismatch is
        // deterministic so retrying cannot help.
        if let Some(schema) = agent.executor.config_schema() {
            if let Err(message) = check_config_schema(&schema, &step.task_config) {
                warn!(
                    workflow_id,
                    step_id = %step.id,
                    agent_id = %agent.agent_id,
                    error = %message,
                    "Task config rejected by agent schema"
                );
                return self.fail(workflow_id, step, message, 0, started);
            }
        }

        let mut last_error = String::from("step permits no execution attempts");
        for attempt in 1..=step.retry_count {
            info!(
                workflow_id,
                step_id = %step.id,
                agent_id = %agent.agent_id,
                attempt,
                max_attempts = step.retry_count,
                "Executing step"
            );

            match timeout(
                step.timeout,
                agent.executor.process_task(step.task_config.clone()),
            )
            .await
            {
                Ok(Ok(value)) => match interpret_result(&value) {
                    Ok(()) => {
                        step.status = StepStatus::Completed;
                        step.completed_at = Some(Utc::now());
                        step.result = Some(value.clone());
                        let duration = started.elapsed();
                        info!(
                            workflow_id,
                            step_id = %step.id,
                            attempt,
                            duration_ms = duration.as_millis() as u64,
                            "Step completed"
                        );
                        self.bus.emit(
                            EventType::StepCompleted,
                            json!({
                                "workflow_id": workflow_id,
                                "step_id": step.id,
                                "duration_ms": duration.as_millis() as u64,
                                "attempts": attempt,
                            }),
                        );
                        return StepResult {
                            status: StepStatus::Completed,
                            result: Some(value),
                            error: None,
                            duration,
                            attempts: attempt,
                        };
                    }
                    Err(message) => {
                        warn!(
                            workflow_id,
                            step_id = %step.id,
                            attempt,
                            error = %message,
                            "Step attempt failed"
                        );
                        last_error = message;
                    }
                },
                Ok(Err(e)) => {
                    warn!(
                        workflow_id,
                        step_id = %step.id,
                        attempt,
                        error = %e,
                        "Step attempt raised"
                    );
                    last_error = e.to_string();
                }
                Err(_) => {
                    last_error = format!(
                        "timed out after {}ms",
                        step.timeout.as_millis() as u64
                    );
                    warn!(
                        workflow_id,
                        step_id = %step.id,
                        attempt,
                        timeout_ms = step.timeout.as_millis() as u64,
                        "Step attempt timed out"
                    );
                }
            }

            if attempt < step.retry_count {
                let delay = self.backoff_base * 2u32.saturating_pow(attempt - 1);
                info!(
                    workflow_id,
                    step_id = %step.id,
                    delay_ms = delay.as_millis() as u64,
                    "Backing off before retry"
                );
                sleep(delay).await;
            }
        }

        self.fail(workflow_id, step, last_error, step.retry_count, started)
    }

    fn fail(
        &self,
        workflow_id: &str,
        step: &mut Step,
        error: String,
        attempts: u32,
        started: Instant,
    ) -> StepResult {
        step.status = StepStatus::Failed;
        step.completed_at = Some(Utc::now());
        let duration = started.elapsed();
        self.bus.emit(
            EventType::StepFailed,
            json!({
                "workflow_id": workflow_id,
                "step_id": step.id,
                "error": error,
                "duration_ms": duration.as_millis() as u64,
                "attempts": attempts,
            }),
        );
        StepResult {
            status: StepStatus::Failed,
            result: None,
            error: Some(error),
            duration,
            attempts,
        }
    }
}

/// An agent result counts as success only when it carries
/// `status: "completed"`. Anything else, including a missing status field,
/// is a failure.
fn interpret_result(value: &Value) -> Result<(), String> {
    match value.get("status").and_then(|s| s.as_str()) {
        Some("completed") => Ok(()),
        Some("failed") => Err(value
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("agent reported failure")
            .to_string()),
        Some(other) => Err(format!("agent returned unrecognized status '{}'", other)),
        None => Err("agent result is missing a status field".to_string()),
    }
}

fn check_config_schema(schema: &Value, task_config: &Map<String, Value>) -> Result<(), String> {
    let compiled = jsonschema::validator_for(schema)
        .map_err(|e| format!("failed to compile agent config schema: {}", e))?;
    let instance = Value::Object(task_config.clone());
    if let Err(error) = compiled.validate(&instance) {
        return Err(format!("task config rejected by agent schema: {}", error));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::executor::TaskExecutor;
    use crate::agents::registry::AgentRegistry;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyAgent {
        calls: Arc<AtomicU32>,
        succeed_after: u32,
    }

    #[async_trait]
    impl TaskExecutor for FlakyAgent {
        async fn process_task(&self, _task_config: Map<String, Value>) -> Result<Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_after {
                Ok(json!({"status": "completed", "call": call}))
            } else {
                Err(anyhow!("transient failure on call {}", call))
            }
        }
    }

    struct HangingAgent;

    #[async_trait]
    impl TaskExecutor for HangingAgent {
        async fn process_task(&self, _task_config: Map<String, Value>) -> Result<Value> {
            sleep(Duration::from_secs(60)).await;
            Ok(json!({"status": "completed"}))
        }
    }

    struct PickyAgent;

    #[async_trait]
    impl TaskExecutor for PickyAgent {
        async fn process_task(&self, _task_config: Map<String, Value>) -> Result<Value> {
            Ok(json!({"status": "completed"}))
        }

        fn config_schema(&self) -> Option<Value> {
            Some(json!({
                "type": "object",
                "properties": {"table": {"type": "string"}},
                "required": ["table"]
            }))
        }
    }

    fn executor() -> StepExecutor {
        StepExecutor::new(EventBus::new(), Duration::from_millis(1))
    }

    async fn run_step(
        step: &mut Step,
        agent: Arc<dyn TaskExecutor>,
    ) -> StepResult {
        let registry = AgentRegistry::new();
        registry
            .register(step.agent_id.clone(), vec![], agent)
            .unwrap();
        let registered = registry.get(&step.agent_id).unwrap();
        executor().execute("wf_test", step, registered).await
    }

    #[tokio::test]
    async fn permanently_failing_agent_is_invoked_exactly_retry_count_times() {
        let calls = Arc::new(AtomicU32::new(0));
        let agent = Arc::new(FlakyAgent {
            calls: calls.clone(),
            succeed_after: u32::MAX,
        });
        let mut step = Step::new("s1", "flaky").with_retry_count(3);

        let result = run_step(&mut step, agent).await;
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(result.error.unwrap().contains("transient failure"));
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step.completed_at.is_some());
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let agent = Arc::new(FlakyAgent {
            calls: calls.clone(),
            succeed_after: 2,
        });
        let mut step = Step::new("s1", "flaky").with_retry_count(3);

        let result = run_step(&mut step, agent).await;
        assert_eq!(result.status, StepStatus::Completed);
        assert_eq!(result.attempts, 2);
        assert_eq!(step.status, StepStatus::Completed);
        assert!(step.result.is_some());
    }

    #[tokio::test]
    async fn timeout_consumes_attempts_like_any_error() {
        let mut step = Step::new("s1", "hanging")
            .with_retry_count(2)
            .with_timeout(Duration::from_millis(20));

        let result = run_step(&mut step, Arc::new(HangingAgent)).await;
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.attempts, 2);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn schema_mismatch_fails_without_consuming_retries() {
        let mut step = Step::new("s1", "picky").with_retry_count(5);

        let result = run_step(&mut step, Arc::new(PickyAgent)).await;
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.attempts, 0);
        assert!(result.error.unwrap().contains("schema"));
    }

    #[tokio::test]
    async fn missing_status_field_is_a_failure() {
        struct VagueAgent;

        #[async_trait]
        impl TaskExecutor for VagueAgent {
            async fn process_task(&self, _task_config: Map<String, Value>) -> Result<Value> {
                Ok(json!({"data": 42}))
            }
        }

        let mut step = Step::new("s1", "vague");
        let result = run_step(&mut step, Arc::new(VagueAgent)).await;
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.error.unwrap().contains("missing a status field"));
    }
}
