//! Named, predefined step lists that a submission can expand instead of
//! spelling out steps inline.
//!
//! Templates are pure data registered by the caller; the engine attaches no
//! business meaning to them.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::core::errors::{ConductorError, Result};
use crate::workflow::types::Step;

fn default_timeout_secs() -> u64 {
    60
}

fn default_retry_count() -> u32 {
    1
}

/// One step of a template, mirroring the submission-request step shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTemplate {
    pub id: String,
    /// Agent selector: exact agent id or capability string.
    pub agent: String,
    #[serde(default)]
    pub task_config: Map<String, Value>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default)]
    pub rollback_actions: Vec<Map<String, Value>>,
}

impl StepTemplate {
    fn materialize(&self) -> Step {
        let mut step = Step::new(self.id.clone(), self.agent.clone());
        step.task_config = self.task_config.clone();
        step.dependencies = self.dependencies.clone();
        step.timeout = Duration::from_secs(self.timeout_secs);
        step.retry_count = self.retry_count;
        step.rollback_actions = self.rollback_actions.clone();
        step
    }
}

/// On-disk shape of a template file.
#[derive(Debug, Deserialize)]
struct TemplateFile {
    name: String,
    steps: Vec<StepTemplate>,
}

/// Registry of named templates. Re-registering a name replaces the previous
/// template.
pub struct TemplateRegistry {
    templates: DashMap<String, Vec<StepTemplate>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self {
            templates: DashMap::new(),
        }
    }

    pub fn register<S: Into<String>>(&self, name: S, steps: Vec<StepTemplate>) {
        let name = name.into();
        info!(template = %name, steps = steps.len(), "Registered step template");
        self.templates.insert(name, steps);
    }

    /// Load a `name` + `steps` template definition from a YAML file.
    pub fn load_yaml_file<P: AsRef<Path>>(&self, path: P) -> Result<String> {
        let contents = std::fs::read_to_string(path)?;
        let file: TemplateFile = serde_yaml::from_str(&contents)?;
        let name = file.name.clone();
        self.register(file.name, file.steps);
        Ok(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Materialize fresh step instances from a template. Each expansion is
    /// independent: mutating one run's steps never affects another.
    pub fn expand(&self, name: &str) -> Result<Vec<Step>> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| ConductorError::TemplateNotFound(name.to_string()))?;
        Ok(template.iter().map(StepTemplate::materialize).collect())
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}
