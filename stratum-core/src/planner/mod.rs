pub mod builtin;
pub mod command;
pub mod manifest;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use builtin::{DecomposingPlanner, LinearPlanner};
pub use command::CommandPlanner;
pub use manifest::{ManifestError, PlannerManifest, PlannerTier};

pub const BUILTIN_PREFIX: &str = "builtin:";
pub const COMMAND_ENTRYPOINT: &str = "command";

#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("objective is empty")]
    EmptyObjective,
    #[error("invalid planner configuration: {0}")]
    Configuration(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("planner output could not be decoded: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("planner did not answer within {after_s:.2}s")]
    Timeout { after_s: f64 },
    #[error("planner process failed with status {status:?}: {stderr}")]
    Process { status: Option<i32>, stderr: String },
}

pub type PlanningResult<T> = std::result::Result<T, PlanningError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    pub index: usize,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub planner: String,
    pub objective: String,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(planner: impl Into<String>, objective: impl Into<String>) -> Self {
        Self {
            planner: planner.into(),
            objective: objective.into(),
            steps: Vec::new(),
            metadata: Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn push_step(&mut self, description: impl Into<String>, depends_on: Vec<usize>) -> usize {
        let index = self.steps.len();
        self.steps.push(PlanStep {
            index,
            description: description.into(),
            depends_on,
        });
        index
    }
}

/// Caller-supplied context handed through to `Planner::plan`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlanContext {
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl PlanContext {
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Minimal contract every registry candidate satisfies once instantiated.
#[async_trait]
pub trait Planner: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> BTreeSet<String>;

    async fn plan(&self, objective: &str, context: &PlanContext) -> PlanningResult<Plan>;
}

/// Builds live planners for one entrypoint.
pub trait PlannerFactory: Send + Sync {
    fn instantiate(&self, manifest: &PlannerManifest) -> PlanningResult<Arc<dyn Planner>>;

    /// Manifest used when a `builtin:` locator is discovered without a file.
    fn default_manifest(&self) -> Option<PlannerManifest> {
        None
    }
}

struct FnFactory<F> {
    build: F,
}

impl<F> PlannerFactory for FnFactory<F>
where
    F: Fn(&PlannerManifest) -> PlanningResult<Arc<dyn Planner>> + Send + Sync,
{
    fn instantiate(&self, manifest: &PlannerManifest) -> PlanningResult<Arc<dyn Planner>> {
        (self.build)(manifest)
    }
}

/// Entrypoint name to factory mapping consulted by the sandbox loader.
#[derive(Clone, Default)]
pub struct PlannerCatalog {
    factories: HashMap<String, Arc<dyn PlannerFactory>>,
}

impl PlannerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog.register(
            format!("{BUILTIN_PREFIX}{}", LinearPlanner::ENTRYPOINT),
            Arc::new(builtin::LinearFactory),
        );
        catalog.register(
            format!("{BUILTIN_PREFIX}{}", DecomposingPlanner::ENTRYPOINT),
            Arc::new(builtin::DecomposingFactory),
        );
        catalog.register(COMMAND_ENTRYPOINT, Arc::new(command::CommandFactory));
        catalog
    }

    pub fn register(&mut self, entrypoint: impl Into<String>, factory: Arc<dyn PlannerFactory>) {
        self.factories.insert(entrypoint.into(), factory);
    }

    pub fn register_fn<F>(&mut self, entrypoint: impl Into<String>, build: F)
    where
        F: Fn(&PlannerManifest) -> PlanningResult<Arc<dyn Planner>> + Send + Sync + 'static,
    {
        self.register(entrypoint, Arc::new(FnFactory { build }));
    }

    pub fn resolve(&self, entrypoint: &str) -> Option<Arc<dyn PlannerFactory>> {
        self.factories.get(entrypoint).cloned()
    }

    pub fn entrypoints(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Locators for every compiled-in planner that can describe itself.
    pub fn builtin_locators(&self) -> Vec<String> {
        self.entrypoints()
            .into_iter()
            .filter(|entrypoint| entrypoint.starts_with(BUILTIN_PREFIX))
            .filter(|entrypoint| {
                self.factories
                    .get(entrypoint)
                    .and_then(|factory| factory.default_manifest())
                    .is_some()
            })
            .collect()
    }
}

impl fmt::Debug for PlannerCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlannerCatalog")
            .field("entrypoints", &self.entrypoints())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let catalog = PlannerCatalog::with_builtins();
        assert_eq!(
            catalog.entrypoints(),
            vec![
                "builtin:decompose".to_string(),
                "builtin:linear".to_string(),
                "command".to_string(),
            ]
        );
        assert_eq!(
            catalog.builtin_locators(),
            vec!["builtin:decompose".to_string(), "builtin:linear".to_string()]
        );
        assert!(catalog.resolve("builtin:missing").is_none());
    }

    #[test]
    fn closure_factories_can_fail() {
        let mut catalog = PlannerCatalog::new();
        catalog.register_fn("broken", |manifest| {
            Err(PlanningError::Configuration(format!(
                "{} cannot start",
                manifest.name
            )))
        });
        let factory = catalog.resolve("broken").unwrap();
        let result = factory.instantiate(&PlannerManifest::new("b", "broken"));
        assert!(matches!(result, Err(PlanningError::Configuration(_))));
    }

    #[test]
    fn plan_steps_are_indexed() {
        let mut plan = Plan::new("linear", "ship it");
        let first = plan.push_step("write", vec![]);
        let second = plan.push_step("test", vec![first]);
        assert_eq!(second, 1);
        assert_eq!(plan.steps[1].depends_on, vec![0]);
    }
}
