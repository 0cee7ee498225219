use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Capability implemented by every worker the engine can dispatch to.
///
/// The engine treats the payload and the result as opaque apart from one
/// contract: the returned map should carry a `status` field of `"completed"`
/// or `"failed"`. A missing status field or an `Err` from `process_task` is
/// treated as a failure.
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    /// Process one task payload and return the worker's result map.
    async fn process_task(&self, task_config: Map<String, Value>) -> Result<Value>;

    /// Cheap liveness probe used by the health monitor. The default
    /// implementation reports the agent as reachable.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// JSON schema the task payload must satisfy, when the agent declares
    /// one. Checked once per step, before the first execution attempt.
    fn config_schema(&self) -> Option<Value> {
        None
    }
}
