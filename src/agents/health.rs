//! Periodic agent liveness probing and latency classification.
//!
//! Health state is advisory: it is surfaced on the event bus for external
//! alerting and never blocks scheduling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::registry::AgentRegistry;
use crate::events::bus::EventBus;
use crate::events::types::EventType;

/// Classification of a single agent after a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unreachable,
}

/// Aggregate view over every registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// One registered agent's most recent health observation. Overwritten in
/// place on each probe; an agent absent from the registry never has an
/// entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealthStatus {
    pub agent_id: String,
    pub status: HealthState,
    pub last_heartbeat: DateTime<Utc>,
    pub response_time: Duration,
    pub capabilities: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Interval between probe sweeps.
    pub probe_interval: Duration,
    /// Latency above which a reachable agent is classified degraded.
    pub degraded_threshold: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            degraded_threshold: Duration::from_millis(1000),
        }
    }
}

/// Probes every registered agent on a fixed interval and records the
/// classification in the registry's health map.
pub struct HealthMonitor {
    registry: Arc<AgentRegistry>,
    bus: Arc<EventBus>,
    config: HealthMonitorConfig,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<AgentRegistry>,
        bus: Arc<EventBus>,
        config: HealthMonitorConfig,
    ) -> Self {
        Self {
            registry,
            bus,
            config,
        }
    }

    /// Run one probe sweep over every registered agent.
    pub async fn probe_all(&self) {
        let mut healthy = 0usize;
        let mut degraded = 0usize;
        let mut unreachable = 0usize;

        for agent in self.registry.agents() {
            let started = Instant::now();
            let outcome = agent.executor.ping().await;
            let response_time = started.elapsed();

            let status = match outcome {
                Err(e) => {
                    warn!(agent_id = %agent.agent_id, error = %e, "Agent probe failed");
                    unreachable += 1;
                    HealthState::Unreachable
                }
                Ok(()) if response_time > self.config.degraded_threshold => {
                    warn!(
                        agent_id = %agent.agent_id,
                        response_ms = response_time.as_millis() as u64,
                        threshold_ms = self.config.degraded_threshold.as_millis() as u64,
                        "Agent responding slowly"
                    );
                    degraded += 1;
                    HealthState::Degraded
                }
                Ok(()) => {
                    debug!(
                        agent_id = %agent.agent_id,
                        response_ms = response_time.as_millis() as u64,
                        "Agent healthy"
                    );
                    healthy += 1;
                    HealthState::Healthy
                }
            };

            self.registry.update_health(AgentHealthStatus {
                agent_id: agent.agent_id.clone(),
                status,
                last_heartbeat: Utc::now(),
                response_time,
                capabilities: agent.capabilities.clone(),
            });
        }

        self.bus.emit(
            EventType::AgentHealthCheck,
            json!({
                "healthy": healthy,
                "degraded": degraded,
                "unreachable": unreachable,
                "system_health": self.system_health(),
            }),
        );
    }

    /// Aggregate system health: healthy with zero unhealthy agents,
    /// degraded while unhealthy agents stay below half, unhealthy beyond.
    pub fn system_health(&self) -> SystemHealth {
        let statuses = self.registry.all_health();
        let total = statuses.len();
        if total == 0 {
            return SystemHealth::Healthy;
        }
        let unhealthy = statuses
            .iter()
            .filter(|s| s.status != HealthState::Healthy)
            .count();
        if unhealthy == 0 {
            SystemHealth::Healthy
        } else if unhealthy * 2 < total {
            SystemHealth::Degraded
        } else {
            SystemHealth::Unhealthy
        }
    }

    /// Spawn the periodic probe loop. Runs until the returned handle is
    /// aborted or the runtime shuts down.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.probe_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.probe_all().await;
            }
        })
    }
}
