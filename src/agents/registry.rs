use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

use super::executor::TaskExecutor;
use super::health::{AgentHealthStatus, HealthState};
use crate::core::errors::{ConductorError, Result};

/// A worker known to the orchestrator: the executor reference plus the
/// capability strings it advertises.
pub struct RegisteredAgent {
    pub agent_id: String,
    pub capabilities: HashSet<String>,
    pub executor: Arc<dyn TaskExecutor>,
}

/// Instance-owned agent registry. Also owns the health map so that an agent
/// absent from the registry can never carry a health entry.
pub struct AgentRegistry {
    agents: DashMap<String, Arc<RegisteredAgent>>,
    health: DashMap<String, AgentHealthStatus>,
    /// Registration order, used for deterministic candidate tie-breaking.
    order: Mutex<Vec<String>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
            health: DashMap::new(),
            order: Mutex::new(Vec::new()),
        }
    }

    /// Register an agent under a unique id with its capability set. The
    /// agent starts out healthy with zero observed latency.
    pub fn register<S: Into<String>>(
        &self,
        agent_id: S,
        capabilities: Vec<String>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<()> {
        let agent_id = agent_id.into();
        if self.agents.contains_key(&agent_id) {
            return Err(ConductorError::AgentAlreadyRegistered(agent_id));
        }

        let capabilities: HashSet<String> = capabilities.into_iter().collect();
        self.health.insert(
            agent_id.clone(),
            AgentHealthStatus {
                agent_id: agent_id.clone(),
                status: HealthState::Healthy,
                last_heartbeat: Utc::now(),
                response_time: Duration::ZERO,
                capabilities: capabilities.clone(),
            },
        );
        self.agents.insert(
            agent_id.clone(),
            Arc::new(RegisteredAgent {
                agent_id: agent_id.clone(),
                capabilities,
                executor,
            }),
        );
        self.order
            .lock()
            .expect("agent order lock poisoned")
            .push(agent_id.clone());
        info!(agent_id = %agent_id, "Registered agent");
        Ok(())
    }

    /// Remove an agent and its health entry.
    pub fn deregister(&self, agent_id: &str) -> Option<Arc<RegisteredAgent>> {
        self.health.remove(agent_id);
        self.order
            .lock()
            .expect("agent order lock poisoned")
            .retain(|id| id != agent_id);
        self.agents.remove(agent_id).map(|(_, agent)| agent)
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<RegisteredAgent>> {
        self.agents.get(agent_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Every registered agent, in registration order.
    pub fn agents(&self) -> Vec<Arc<RegisteredAgent>> {
        let order = self.order.lock().expect("agent order lock poisoned");
        order.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Agents able to serve the given selector: an exact id match or any
    /// agent advertising the selector as a capability. Registration order
    /// is preserved.
    pub fn candidates(&self, selector: &str) -> Vec<Arc<RegisteredAgent>> {
        self.agents()
            .into_iter()
            .filter(|agent| agent.agent_id == selector || agent.capabilities.contains(selector))
            .collect()
    }

    /// Overwrite an agent's health entry. Ignored when the agent has been
    /// deregistered since the probe started.
    pub(crate) fn update_health(&self, status: AgentHealthStatus) {
        if self.agents.contains_key(&status.agent_id) {
            self.health.insert(status.agent_id.clone(), status);
        }
    }

    pub fn health(&self, agent_id: &str) -> Option<AgentHealthStatus> {
        self.health.get(agent_id).map(|entry| entry.value().clone())
    }

    pub fn all_health(&self) -> Vec<AgentHealthStatus> {
        self.health
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
