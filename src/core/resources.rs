//! Bounded resource budgets shared across all running workflows.
//!
//! One pool per orchestrator. Allocation is greedy and happens before a
//! workflow starts: for every step, in declaration order, the least-loaded
//! capable agent is chosen and a bounded slice of the pool is reserved.
//! Quantities return to the pool exactly once, when the step reaches a
//! terminal status; release is idempotent.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use crate::agents::registry::AgentRegistry;
use crate::core::errors::{ConductorError, Result};
use crate::workflow::types::{Step, WorkflowDefinition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Disk,
    Network,
    ConcurrencySlots,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Cpu,
        ResourceKind::Memory,
        ResourceKind::Disk,
        ResourceKind::Network,
        ResourceKind::ConcurrencySlots,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
            ResourceKind::Disk => "disk",
            ResourceKind::Network => "network",
            ResourceKind::ConcurrencySlots => "concurrency_slots",
        }
    }
}

/// Pool capacities per resource kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub network: f64,
    pub concurrency_slots: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cpu: 100.0,
            memory: 100.0,
            disk: 100.0,
            network: 100.0,
            concurrency_slots: 10.0,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        for kind in ResourceKind::ALL {
            if self.capacity(kind) <= 0.0 {
                return Err(ConductorError::configuration(format!(
                    "pool capacity for {} must be greater than 0",
                    kind.as_str()
                )));
            }
        }
        Ok(())
    }

    fn capacity(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Memory => self.memory,
            ResourceKind::Disk => self.disk,
            ResourceKind::Network => self.network,
            ResourceKind::ConcurrencySlots => self.concurrency_slots,
        }
    }

    fn capacities(&self) -> HashMap<ResourceKind, f64> {
        ResourceKind::ALL
            .iter()
            .map(|kind| (*kind, self.capacity(*kind)))
            .collect()
    }
}

/// Budget reserved for one step for the duration of its execution.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceAllocation {
    /// The agent chosen to run the step.
    pub agent_id: String,
    pub resources: HashMap<ResourceKind, f64>,
    /// Declaration index of the step; earlier steps carry higher priority.
    pub priority: u32,
    pub estimated_duration: Duration,
}

struct AllocationRecord {
    allocation: ResourceAllocation,
    released: bool,
}

struct PoolState {
    available: HashMap<ResourceKind, f64>,
    total: HashMap<ResourceKind, f64>,
}

/// The shared pool plus the per-step allocation ledger. The mutex guards
/// only numeric bookkeeping; it is never held across an await.
pub struct ResourceAllocator {
    state: Mutex<PoolState>,
    allocations: DashMap<String, AllocationRecord>,
}

fn allocation_key(workflow_id: &str, step_id: &str) -> String {
    format!("{}::{}", workflow_id, step_id)
}

/// Per-step requested quantities: defaults of one unit per kind, with
/// overrides read from a `resources` object inside the step's task config.
fn requested_for(step: &Step) -> HashMap<ResourceKind, f64> {
    let mut requested: HashMap<ResourceKind, f64> =
        ResourceKind::ALL.iter().map(|kind| (*kind, 1.0)).collect();
    if let Some(overrides) = step.task_config.get("resources").and_then(|v| v.as_object()) {
        for kind in ResourceKind::ALL {
            if let Some(qty) = overrides.get(kind.as_str()).and_then(|v| v.as_f64()) {
                requested.insert(kind, qty.max(0.0));
            }
        }
    }
    requested
}

impl ResourceAllocator {
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(PoolState {
                available: config.capacities(),
                total: config.capacities(),
            }),
            allocations: DashMap::new(),
        })
    }

    pub fn available(&self, kind: ResourceKind) -> f64 {
        let state = self.state.lock().expect("resource pool lock poisoned");
        state.available.get(&kind).copied().unwrap_or(0.0)
    }

    pub fn used(&self, kind: ResourceKind) -> f64 {
        let state = self.state.lock().expect("resource pool lock poisoned");
        let total = state.total.get(&kind).copied().unwrap_or(0.0);
        let available = state.available.get(&kind).copied().unwrap_or(0.0);
        total - available
    }

    /// Reserve budgets for every step of a workflow, in declaration order.
    ///
    /// A step whose selector no capable agent matches is a fatal error
    /// surfaced before any step runs, as is a request exceeding the pool's
    /// total capacity. Neither leaves partial reservations behind.
    pub fn allocate_workflow(
        &self,
        definition: &WorkflowDefinition,
        registry: &AgentRegistry,
    ) -> Result<()> {
        let mut errors = Vec::new();
        for step in &definition.steps {
            if registry.candidates(&step.agent_id).is_empty() {
                errors.push(format!(
                    "no registered agent satisfies '{}' required by step '{}'",
                    step.agent_id, step.id
                ));
            }
        }
        if !errors.is_empty() {
            return Err(ConductorError::validation(errors));
        }

        {
            let state = self.state.lock().expect("resource pool lock poisoned");
            for step in &definition.steps {
                for (kind, qty) in requested_for(step) {
                    let capacity = state.total.get(&kind).copied().unwrap_or(0.0);
                    if qty > capacity {
                        return Err(ConductorError::ResourceExhausted {
                            resource: kind.as_str().to_string(),
                            requested: qty,
                            capacity,
                        });
                    }
                }
            }
        }

        // Greedy pass: least scheduled hours wins, first-seen order breaks
        // ties.
        let mut scheduled_hours: HashMap<String, f64> = HashMap::new();
        for (index, step) in definition.steps.iter().enumerate() {
            let candidates = registry.candidates(&step.agent_id);
            let mut chosen = candidates[0].clone();
            for candidate in candidates.iter().skip(1) {
                let current = scheduled_hours
                    .get(&candidate.agent_id)
                    .copied()
                    .unwrap_or(0.0);
                let best = scheduled_hours
                    .get(&chosen.agent_id)
                    .copied()
                    .unwrap_or(0.0);
                if current < best {
                    chosen = candidate.clone();
                }
            }

            let granted = self.take_bounded(&requested_for(step));
            *scheduled_hours.entry(chosen.agent_id.clone()).or_default() +=
                step.timeout.as_secs_f64() / 3600.0;

            debug!(
                workflow_id = %definition.id,
                step_id = %step.id,
                agent_id = %chosen.agent_id,
                "Reserved resources for step"
            );
            self.allocations.insert(
                allocation_key(&definition.id, &step.id),
                AllocationRecord {
                    allocation: ResourceAllocation {
                        agent_id: chosen.agent_id.clone(),
                        resources: granted,
                        priority: index as u32,
                        estimated_duration: step.timeout,
                    },
                    released: false,
                },
            );
        }
        Ok(())
    }

    /// The agent assigned to a step during allocation.
    pub fn assigned_agent(&self, workflow_id: &str, step_id: &str) -> Option<String> {
        self.allocations
            .get(&allocation_key(workflow_id, step_id))
            .map(|record| record.allocation.agent_id.clone())
    }

    pub fn allocation(&self, workflow_id: &str, step_id: &str) -> Option<ResourceAllocation> {
        self.allocations
            .get(&allocation_key(workflow_id, step_id))
            .map(|record| record.allocation.clone())
    }

    /// Return a step's reserved quantities to the pool. Idempotent: a
    /// second release of the same step is a no-op.
    pub fn release(&self, workflow_id: &str, step_id: &str) {
        let key = allocation_key(workflow_id, step_id);
        if let Some(mut record) = self.allocations.get_mut(&key) {
            if record.released {
                return;
            }
            record.released = true;
            self.give_back(&record.allocation.resources);
            debug!(workflow_id, step_id, "Released step resources");
        }
    }

    /// Release whatever is still reserved for a workflow and drop its
    /// ledger entries.
    pub fn release_workflow(&self, definition: &WorkflowDefinition) {
        for step in &definition.steps {
            self.release(&definition.id, &step.id);
        }
        for step in &definition.steps {
            self.allocations
                .remove(&allocation_key(&definition.id, &step.id));
        }
    }

    /// Deduct as much of the request as the pool still holds.
    fn take_bounded(&self, requested: &HashMap<ResourceKind, f64>) -> HashMap<ResourceKind, f64> {
        let mut state = self.state.lock().expect("resource pool lock poisoned");
        let mut granted = HashMap::new();
        for (kind, qty) in requested {
            let available = state.available.get_mut(kind).expect("known resource kind");
            let taken = qty.min(*available);
            *available -= taken;
            granted.insert(*kind, taken);
        }
        granted
    }

    fn give_back(&self, amounts: &HashMap<ResourceKind, f64>) {
        let mut state = self.state.lock().expect("resource pool lock poisoned");
        for (kind, qty) in amounts {
            let total = state.total.get(kind).copied().unwrap_or(0.0);
            let available = state.available.get_mut(kind).expect("known resource kind");
            let credited = (*available + qty).min(total);
            if credited < *available + qty {
                warn!(
                    resource = kind.as_str(),
                    "Release would overflow pool capacity; clamping"
                );
            }
            *available = credited;
        }
    }
}
