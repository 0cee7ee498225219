//! Core data model for workflow definitions, steps and results.
//!
//! Definitions are plain serde structs so they can be built in code, parsed
//! from a submission request or loaded from YAML files on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::core::errors::Result;

/// Serialize/deserialize a `Duration` as whole seconds, the way definition
/// files author timeouts.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Lifecycle of a single step. Transitions only ever move forward:
/// pending -> running -> completed | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

/// Scheduling discipline for a workflow's steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationStrategy {
    #[default]
    Sequential,
    Parallel,
    /// Same execution algorithm as `Parallel`; kept as a distinct label so
    /// callers can express intent. No topological batching is performed.
    Dag,
}

impl CoordinationStrategy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sequential" => Some(CoordinationStrategy::Sequential),
            "parallel" => Some(CoordinationStrategy::Parallel),
            "dag" => Some(CoordinationStrategy::Dag),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinationStrategy::Sequential => "sequential",
            CoordinationStrategy::Parallel => "parallel",
            CoordinationStrategy::Dag => "dag",
        }
    }
}

fn default_step_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_retry_count() -> u32 {
    1
}

/// A single unit of work dispatched to exactly one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique identifier within the owning workflow.
    pub id: String,
    /// Agent selector: an exact agent id or a capability string.
    pub agent_id: String,
    /// Opaque payload handed to the agent's `process_task`.
    #[serde(default)]
    pub task_config: Map<String, Value>,
    /// Ids of steps that must complete before this one starts.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Deadline for a single execution attempt, in seconds.
    #[serde(with = "duration_secs", default = "default_step_timeout")]
    pub timeout: Duration,
    /// Total number of execution attempts permitted.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Compensating payloads, invoked in order during rollback.
    #[serde(default)]
    pub rollback_actions: Vec<Map<String, Value>>,
    #[serde(default = "Step::default_status")]
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    fn default_status() -> StepStatus {
        StepStatus::Pending
    }

    pub fn new<S: Into<String>, A: Into<String>>(id: S, agent_id: A) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            task_config: Map::new(),
            dependencies: Vec::new(),
            timeout: default_step_timeout(),
            retry_count: default_retry_count(),
            rollback_actions: Vec::new(),
            status: StepStatus::Pending,
            result: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_task_config(mut self, task_config: Map<String, Value>) -> Self {
        self.task_config = task_config;
        self
    }

    pub fn with_rollback_actions(mut self, actions: Vec<Map<String, Value>>) -> Self {
        self.rollback_actions = actions;
        self
    }
}

fn default_global_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_rollback_enabled() -> bool {
    true
}

/// A named, ordered collection of steps with one coordination strategy and
/// an overall deadline. Owned by the execution engine for the duration of a
/// run, then archived by value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub coordination_strategy: CoordinationStrategy,
    #[serde(with = "duration_secs", default = "default_global_timeout")]
    pub global_timeout: Duration,
    #[serde(default = "default_rollback_enabled")]
    pub rollback_enabled: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn new<S: Into<String>, N: Into<String>>(id: S, name: N, steps: Vec<Step>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            steps,
            coordination_strategy: CoordinationStrategy::Sequential,
            global_timeout: default_global_timeout(),
            rollback_enabled: true,
            created_at: Utc::now(),
        }
    }

    pub fn with_strategy(mut self, strategy: CoordinationStrategy) -> Self {
        self.coordination_strategy = strategy;
        self
    }

    pub fn with_global_timeout(mut self, timeout: Duration) -> Self {
        self.global_timeout = timeout;
        self
    }

    pub fn with_rollback_enabled(mut self, enabled: bool) -> Self {
        self.rollback_enabled = enabled;
        self
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Load a definition from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }
}

/// Outcome of one step's execution, retries included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration: Duration,
    pub attempts: u32,
}

impl StepResult {
    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

/// Terminal state of a whole workflow run. `TimedOut` is distinct from
/// `Failed`: it marks the global deadline firing rather than a step failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Completed,
    Failed,
    #[serde(rename = "timeout")]
    TimedOut,
}

/// Final report returned to the submitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub status: WorkflowStatus,
    pub workflow_id: String,
    pub execution_time: Duration,
    pub step_results: HashMap<String, StepResult>,
    pub failed_step: Option<String>,
    pub error: Option<String>,
}

impl WorkflowResult {
    pub fn is_completed(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }
}

/// One step of a workflow submission request (§ external interface).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    /// Optional explicit id; defaults to `step_<index>`.
    #[serde(default)]
    pub id: Option<String>,
    /// Agent selector: exact agent id or capability string.
    pub agent: String,
    #[serde(default)]
    pub task_config: Map<String, Value>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub rollback_actions: Vec<Map<String, Value>>,
}

impl StepRequest {
    pub fn new<A: Into<String>>(agent: A) -> Self {
        Self {
            id: None,
            agent: agent.into(),
            task_config: Map::new(),
            dependencies: Vec::new(),
            timeout_secs: None,
            retry_count: None,
            rollback_actions: Vec::new(),
        }
    }

    pub(crate) fn into_step(self, index: usize) -> Step {
        let mut step = Step::new(
            self.id.unwrap_or_else(|| format!("step_{}", index)),
            self.agent,
        );
        step.task_config = self.task_config;
        step.dependencies = self.dependencies;
        if let Some(secs) = self.timeout_secs {
            step.timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = self.retry_count {
            step.retry_count = retries;
        }
        step.rollback_actions = self.rollback_actions;
        step
    }
}

/// Workflow submission request, the engine's public entry point.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowRequest {
    /// Generated when absent.
    #[serde(default)]
    pub workflow_id: Option<String>,
    /// Name of a registered step template to expand.
    #[serde(default)]
    pub template: Option<String>,
    /// Explicit steps; mutually exclusive with `template`.
    #[serde(default)]
    pub steps: Option<Vec<StepRequest>>,
    /// One of "sequential" | "parallel" | "dag"; defaults to "sequential".
    #[serde(default)]
    pub coordination_strategy: Option<String>,
    #[serde(default)]
    pub timeout_minutes: Option<u64>,
    /// Defaults to true.
    #[serde(default)]
    pub enable_rollback: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn step_defaults_from_yaml() {
        let yaml = r#"
id: fetch
agent_id: http_worker
"#;
        let step: Step = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(step.timeout, Duration::from_secs(60));
        assert_eq!(step.retry_count, 1);
        assert_eq!(step.status, StepStatus::Pending);
        assert!(step.dependencies.is_empty());
    }

    #[test]
    fn definition_from_yaml() {
        let yaml = r#"
id: wf_demo
name: demo
coordination_strategy: parallel
global_timeout: 120
steps:
  - id: a
    agent_id: worker
    timeout: 5
  - id: b
    agent_id: worker
    dependencies: [a]
"#;
        let definition = WorkflowDefinition::from_yaml_str(yaml).unwrap();
        assert_eq!(
            definition.coordination_strategy,
            CoordinationStrategy::Parallel
        );
        assert_eq!(definition.global_timeout, Duration::from_secs(120));
        assert!(definition.rollback_enabled);
        assert_eq!(definition.steps.len(), 2);
        assert_eq!(definition.step("b").unwrap().dependencies, vec!["a"]);
    }

    #[test]
    fn strategy_parsing() {
        assert_eq!(
            CoordinationStrategy::parse("dag"),
            Some(CoordinationStrategy::Dag)
        );
        assert_eq!(CoordinationStrategy::parse("round_robin"), None);
    }

    #[test]
    fn step_request_defaults() {
        let request = StepRequest::new("schema_designer");
        let step = request.into_step(3);
        assert_eq!(step.id, "step_3");
        assert_eq!(step.agent_id, "schema_designer");
        assert_eq!(step.retry_count, 1);
    }
}
