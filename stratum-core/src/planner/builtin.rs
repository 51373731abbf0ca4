use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::manifest::{PlannerManifest, PlannerTier};
use super::{Plan, PlanContext, Planner, PlannerFactory, PlanningError, PlanningResult, BUILTIN_PREFIX};

/// Turns an objective into a strictly sequential plan, one step per clause.
#[derive(Debug, Clone)]
pub struct LinearPlanner {
    name: String,
    capabilities: BTreeSet<String>,
}

impl LinearPlanner {
    pub const ENTRYPOINT: &'static str = "linear";

    pub fn new(name: impl Into<String>, capabilities: BTreeSet<String>) -> Self {
        Self {
            name: name.into(),
            capabilities,
        }
    }
}

#[async_trait]
impl Planner for LinearPlanner {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> BTreeSet<String> {
        self.capabilities.clone()
    }

    async fn plan(&self, objective: &str, context: &PlanContext) -> PlanningResult<Plan> {
        let clauses = split_clauses(objective, &[".", ";", "\n", " then "]);
        if clauses.is_empty() {
            return Err(PlanningError::EmptyObjective);
        }
        let mut plan = Plan::new(&self.name, objective);
        let mut previous: Option<usize> = None;
        for clause in clauses {
            let depends_on = previous.map(|index| vec![index]).unwrap_or_default();
            previous = Some(plan.push_step(clause, depends_on));
        }
        plan.metadata = json!({
            "strategy": "linear",
            "context_keys": context.attributes.keys().collect::<Vec<_>>(),
        });
        Ok(plan)
    }
}

/// Splits an objective into independent work items joined by a final merge step.
#[derive(Debug, Clone)]
pub struct DecomposingPlanner {
    name: String,
    capabilities: BTreeSet<String>,
}

impl DecomposingPlanner {
    pub const ENTRYPOINT: &'static str = "decompose";

    pub fn new(name: impl Into<String>, capabilities: BTreeSet<String>) -> Self {
        Self {
            name: name.into(),
            capabilities,
        }
    }
}

#[async_trait]
impl Planner for DecomposingPlanner {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> BTreeSet<String> {
        self.capabilities.clone()
    }

    async fn plan(&self, objective: &str, _context: &PlanContext) -> PlanningResult<Plan> {
        let parts = split_clauses(objective, &[" and ", ",", ";", "\n"]);
        if parts.is_empty() {
            return Err(PlanningError::EmptyObjective);
        }
        let mut plan = Plan::new(&self.name, objective);
        let branches: Vec<usize> = parts
            .into_iter()
            .map(|part| plan.push_step(part, Vec::new()))
            .collect();
        if branches.len() > 1 {
            plan.push_step("integrate results", branches.clone());
        }
        plan.metadata = json!({ "strategy": "decompose", "branches": branches.len() });
        Ok(plan)
    }
}

fn split_clauses(objective: &str, separators: &[&str]) -> Vec<String> {
    let mut parts = vec![objective.to_string()];
    for separator in separators {
        parts = parts
            .iter()
            .flat_map(|part| part.split(separator).map(str::to_string).collect::<Vec<_>>())
            .collect();
    }
    parts
        .into_iter()
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

pub(crate) struct LinearFactory;

impl PlannerFactory for LinearFactory {
    fn instantiate(&self, manifest: &PlannerManifest) -> PlanningResult<Arc<dyn Planner>> {
        Ok(Arc::new(LinearPlanner::new(
            manifest.name.clone(),
            manifest.capabilities.clone(),
        )))
    }

    fn default_manifest(&self) -> Option<PlannerManifest> {
        Some(
            PlannerManifest::new(
                LinearPlanner::ENTRYPOINT,
                format!("{BUILTIN_PREFIX}{}", LinearPlanner::ENTRYPOINT),
            )
            .with_capabilities(["sequencing", "outline"])
            .with_reliability(0.7)
            .with_tier(PlannerTier::Stable)
            .with_production_ready(true),
        )
    }
}

pub(crate) struct DecomposingFactory;

impl PlannerFactory for DecomposingFactory {
    fn instantiate(&self, manifest: &PlannerManifest) -> PlanningResult<Arc<dyn Planner>> {
        Ok(Arc::new(DecomposingPlanner::new(
            manifest.name.clone(),
            manifest.capabilities.clone(),
        )))
    }

    fn default_manifest(&self) -> Option<PlannerManifest> {
        Some(
            PlannerManifest::new(
                DecomposingPlanner::ENTRYPOINT,
                format!("{BUILTIN_PREFIX}{}", DecomposingPlanner::ENTRYPOINT),
            )
            .with_capabilities(["decomposition", "parallel"])
            .with_reliability(0.6)
            .with_tier(PlannerTier::Beta),
        )
    }
}
