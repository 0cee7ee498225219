pub mod executor;
pub mod health;
pub mod registry;

pub use executor::TaskExecutor;
pub use health::{AgentHealthStatus, HealthMonitor, HealthMonitorConfig, HealthState, SystemHealth};
pub use registry::{AgentRegistry, RegisteredAgent};
