//! Coordination-strategy behavior: ordering, failure handling,
//! cancellation, rollback and the global timeout.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use conductor::{
    EventType, Orchestrator, Step, StepRequest, StepStatus, TaskExecutor, WorkflowDefinition,
    WorkflowRequest, WorkflowStatus,
};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Logs the `step` marker from each payload after an optional delay.
struct MarkerAgent {
    log: Arc<Mutex<Vec<String>>>,
    delay: Duration,
}

#[async_trait]
impl TaskExecutor for MarkerAgent {
    async fn process_task(&self, task_config: Map<String, Value>) -> Result<Value> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let marker = task_config
            .get("step")
            .and_then(|v| v.as_str())
            .unwrap_or("?")
            .to_string();
        self.log.lock().unwrap().push(marker);
        Ok(json!({"status": "completed"}))
    }
}

/// Always errors, counting its invocations.
struct BrokenAgent {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl TaskExecutor for BrokenAgent {
    async fn process_task(&self, _task_config: Map<String, Value>) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("broken agent"))
    }
}

fn marker_config(step: &str) -> Map<String, Value> {
    let mut config = Map::new();
    config.insert("step".to_string(), json!(step));
    config
}

fn step_request(id: &str, agent: &str, deps: &[&str]) -> StepRequest {
    let mut request = StepRequest::new(agent);
    request.id = Some(id.to_string());
    request.task_config = marker_config(id);
    request.dependencies = deps.iter().map(|d| d.to_string()).collect();
    request
}

fn fast_orchestrator() -> Orchestrator {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut config = conductor::OrchestratorConfig::default();
    config.backoff_base = Duration::from_millis(1);
    Orchestrator::with_config(config).unwrap()
}

#[tokio::test]
async fn sequential_failure_stops_later_steps_and_rolls_back() {
    let orchestrator = fast_orchestrator();
    let log = Arc::new(Mutex::new(Vec::new()));
    let broken_calls = Arc::new(AtomicU32::new(0));

    orchestrator
        .register_agent(
            "worker",
            vec![],
            Arc::new(MarkerAgent {
                log: log.clone(),
                delay: Duration::ZERO,
            }),
        )
        .unwrap();
    orchestrator
        .register_agent(
            "broken",
            vec![],
            Arc::new(BrokenAgent {
                calls: broken_calls.clone(),
            }),
        )
        .unwrap();

    let mut a = step_request("a", "worker", &[]);
    a.rollback_actions = vec![marker_config("undo_a")];
    let mut b = step_request("b", "broken", &["a"]);
    b.retry_count = Some(2);
    let c = step_request("c", "worker", &["b"]);

    let request = WorkflowRequest {
        workflow_id: Some("wf_seq_fail".to_string()),
        steps: Some(vec![a, b, c]),
        ..Default::default()
    };

    let result = orchestrator.submit(request).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.failed_step.as_deref(), Some("b"));
    assert!(result.error.unwrap().contains("broken agent"));

    // b consumed its full retry budget; c never started.
    assert_eq!(broken_calls.load(Ordering::SeqCst), 2);
    assert!(!result.step_results.contains_key("c"));
    assert_eq!(result.step_results["a"].status, StepStatus::Completed);
    assert_eq!(result.step_results["b"].status, StepStatus::Failed);

    // Rollback compensated the one completed step, after its execution.
    assert_eq!(*log.lock().unwrap(), vec!["a", "undo_a"]);
    let bus = orchestrator.event_bus();
    assert_eq!(bus.events_of(EventType::RollbackInitiated).len(), 1);
}

#[tokio::test]
async fn failed_first_step_compensates_nothing() {
    let orchestrator = fast_orchestrator();
    let log = Arc::new(Mutex::new(Vec::new()));
    let broken_calls = Arc::new(AtomicU32::new(0));

    orchestrator
        .register_agent(
            "worker",
            vec![],
            Arc::new(MarkerAgent {
                log: log.clone(),
                delay: Duration::ZERO,
            }),
        )
        .unwrap();
    orchestrator
        .register_agent(
            "broken",
            vec![],
            Arc::new(BrokenAgent {
                calls: broken_calls.clone(),
            }),
        )
        .unwrap();

    let mut a = step_request("a", "broken", &[]);
    a.retry_count = Some(1);
    a.rollback_actions = vec![marker_config("undo_a")];
    let b = step_request("b", "worker", &["a"]);

    let request = WorkflowRequest {
        workflow_id: Some("wf_first_fails".to_string()),
        steps: Some(vec![a, b]),
        ..Default::default()
    };

    let result = orchestrator.submit(request).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.failed_step.as_deref(), Some("a"));
    assert_eq!(broken_calls.load(Ordering::SeqCst), 1);
    assert!(!result.step_results.contains_key("b"));

    // a never completed, so its compensations are not candidates.
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(
        orchestrator
            .event_bus()
            .events_of(EventType::RollbackInitiated)
            .len(),
        1
    );
}

#[tokio::test]
async fn parallel_independent_steps_both_complete() {
    let orchestrator = fast_orchestrator();
    let log = Arc::new(Mutex::new(Vec::new()));
    orchestrator
        .register_agent(
            "worker",
            vec![],
            Arc::new(MarkerAgent {
                log,
                delay: Duration::ZERO,
            }),
        )
        .unwrap();

    let request = WorkflowRequest {
        workflow_id: Some("wf_par".to_string()),
        steps: Some(vec![
            step_request("x", "worker", &[]),
            step_request("y", "worker", &[]),
        ]),
        coordination_strategy: Some("parallel".to_string()),
        ..Default::default()
    };

    let result = orchestrator.submit(request).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.step_results["x"].status, StepStatus::Completed);
    assert_eq!(result.step_results["y"].status, StepStatus::Completed);
}

#[tokio::test]
async fn parallel_dependent_step_starts_after_its_dependency() {
    let orchestrator = fast_orchestrator();
    let log = Arc::new(Mutex::new(Vec::new()));
    orchestrator
        .register_agent(
            "worker",
            vec![],
            Arc::new(MarkerAgent {
                log: log.clone(),
                delay: Duration::from_millis(30),
            }),
        )
        .unwrap();

    let request = WorkflowRequest {
        workflow_id: Some("wf_dag".to_string()),
        steps: Some(vec![
            step_request("fetch", "worker", &[]),
            step_request("transform", "worker", &["fetch"]),
            step_request("load", "worker", &["transform"]),
        ]),
        coordination_strategy: Some("dag".to_string()),
        ..Default::default()
    };

    let result = orchestrator.submit(request).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(*log.lock().unwrap(), vec!["fetch", "transform", "load"]);
}

#[tokio::test]
async fn parallel_failure_cancels_in_flight_and_unstarted_siblings() {
    let orchestrator = fast_orchestrator();
    let log = Arc::new(Mutex::new(Vec::new()));
    let broken_calls = Arc::new(AtomicU32::new(0));

    orchestrator
        .register_agent(
            "slow",
            vec![],
            Arc::new(MarkerAgent {
                log: log.clone(),
                delay: Duration::from_millis(300),
            }),
        )
        .unwrap();
    orchestrator
        .register_agent(
            "broken",
            vec![],
            Arc::new(BrokenAgent {
                calls: broken_calls.clone(),
            }),
        )
        .unwrap();

    let mut fail_fast = step_request("fail_fast", "broken", &[]);
    fail_fast.retry_count = Some(1);
    let in_flight = step_request("in_flight", "slow", &[]);
    let dependent = step_request("dependent", "slow", &["in_flight"]);

    let request = WorkflowRequest {
        workflow_id: Some("wf_cancel".to_string()),
        steps: Some(vec![fail_fast, in_flight, dependent]),
        coordination_strategy: Some("parallel".to_string()),
        ..Default::default()
    };

    let result = orchestrator.submit(request).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.failed_step.as_deref(), Some("fail_fast"));

    // The in-flight sibling was cancelled before logging; the dependent
    // never launched.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(log.lock().unwrap().is_empty());
    assert!(!result.step_results.contains_key("dependent"));
}

#[tokio::test]
async fn failed_dependency_never_readies_its_dependent() {
    let orchestrator = fast_orchestrator();
    let log = Arc::new(Mutex::new(Vec::new()));
    let broken_calls = Arc::new(AtomicU32::new(0));

    orchestrator
        .register_agent(
            "worker",
            vec![],
            Arc::new(MarkerAgent {
                log: log.clone(),
                delay: Duration::ZERO,
            }),
        )
        .unwrap();
    orchestrator
        .register_agent(
            "broken",
            vec![],
            Arc::new(BrokenAgent {
                calls: broken_calls.clone(),
            }),
        )
        .unwrap();

    let mut a = step_request("a", "broken", &[]);
    a.retry_count = Some(1);
    let b = step_request("b", "worker", &["a"]);

    let request = WorkflowRequest {
        workflow_id: Some("wf_dep_fail".to_string()),
        steps: Some(vec![a, b]),
        coordination_strategy: Some("parallel".to_string()),
        ..Default::default()
    };

    let result = orchestrator.submit(request).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert!(!result.step_results.contains_key("b"));
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn global_timeout_yields_timeout_status_distinct_from_failed() {
    let orchestrator = fast_orchestrator();
    let log = Arc::new(Mutex::new(Vec::new()));
    orchestrator
        .register_agent(
            "slow",
            vec![],
            Arc::new(MarkerAgent {
                log,
                delay: Duration::from_millis(500),
            }),
        )
        .unwrap();

    let mut step = Step::new("long_haul", "slow");
    step.task_config = marker_config("long_haul");
    let definition = WorkflowDefinition::new("wf_timeout", "timeout-test", vec![step])
        .with_global_timeout(Duration::from_millis(80));

    let result = orchestrator.submit_definition(definition).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::TimedOut);
    assert!(result.failed_step.is_none());
    assert!(result.error.unwrap().contains("timed out"));

    let bus = orchestrator.event_bus();
    assert_eq!(bus.events_of(EventType::RollbackInitiated).len(), 1);
    let failed_events = bus.events_of(EventType::WorkflowFailed);
    assert_eq!(failed_events.len(), 1);
    assert_eq!(failed_events[0].payload["timeout"], json!(true));
}

#[tokio::test]
async fn sequential_forward_dependency_parks_until_global_timeout() {
    let orchestrator = fast_orchestrator();
    let log = Arc::new(Mutex::new(Vec::new()));
    orchestrator
        .register_agent(
            "worker",
            vec![],
            Arc::new(MarkerAgent {
                log: log.clone(),
                delay: Duration::ZERO,
            }),
        )
        .unwrap();

    // a depends on b, but sequential order runs a first: the dependency can
    // never complete, so the global deadline is the only way out.
    let mut a = Step::new("a", "worker");
    a.dependencies = vec!["b".to_string()];
    a.task_config = marker_config("a");
    let mut b = Step::new("b", "worker");
    b.task_config = marker_config("b");

    let definition = WorkflowDefinition::new("wf_parked", "forward-dep", vec![a, b])
        .with_global_timeout(Duration::from_millis(100));

    let result = orchestrator.submit_definition(definition).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::TimedOut);
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn exactly_one_terminal_event_per_run() {
    let orchestrator = fast_orchestrator();
    let log = Arc::new(Mutex::new(Vec::new()));
    orchestrator
        .register_agent(
            "worker",
            vec![],
            Arc::new(MarkerAgent {
                log,
                delay: Duration::ZERO,
            }),
        )
        .unwrap();

    let request = WorkflowRequest {
        workflow_id: Some("wf_events".to_string()),
        steps: Some(vec![step_request("only", "worker", &[])]),
        ..Default::default()
    };
    let result = orchestrator.submit(request).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Completed);

    let bus = orchestrator.event_bus();
    assert_eq!(bus.events_of(EventType::WorkflowStarted).len(), 1);
    assert_eq!(bus.events_of(EventType::WorkflowCompleted).len(), 1);
    assert_eq!(bus.events_of(EventType::WorkflowFailed).len(), 0);

    // The started event precedes the terminal one in the log.
    let events = bus.events();
    let started_pos = events
        .iter()
        .position(|e| e.event_type == EventType::WorkflowStarted)
        .unwrap();
    let completed_pos = events
        .iter()
        .position(|e| e.event_type == EventType::WorkflowCompleted)
        .unwrap();
    assert!(started_pos < completed_pos);
}
