//! Process-wide registry plus free functions that delegate to it.
//!
//! Code that needs isolation (tests, multi-tenant hosts) should build its own
//! [`PlannerRegistry`] instead.

use std::sync::{Arc, OnceLock};

use crate::config::FactoryConfig;
use crate::error::RegistryResult;
use crate::planner::Planner;
use crate::registry::{
    DiscoveryReport, HealReport, HealthReport, PlannerRegistry, PlannerStats, PlannerSummary,
    RankedPlanner, Selection, SelectionRequest,
};

static GLOBAL: OnceLock<Arc<PlannerRegistry>> = OnceLock::new();

/// Installs `registry` as the process-wide instance. Returns it back if one is
/// already installed.
pub fn install(registry: Arc<PlannerRegistry>) -> Result<(), Arc<PlannerRegistry>> {
    GLOBAL.set(registry)
}

/// The process-wide instance, built from the environment on first use.
pub fn global() -> Arc<PlannerRegistry> {
    Arc::clone(GLOBAL.get_or_init(|| Arc::new(PlannerRegistry::new(FactoryConfig::from_env()))))
}

pub async fn discover(force: bool) -> RegistryResult<DiscoveryReport> {
    global().discover(force).await
}

pub async fn get_planner(name: &str) -> RegistryResult<Arc<dyn Planner>> {
    global().get_planner(name).await
}

pub async fn get_planner_with_override(name: &str) -> RegistryResult<Arc<dyn Planner>> {
    global().get_planner_with_override(name).await
}

pub async fn list_planners(include_quarantined: bool) -> RegistryResult<Vec<PlannerSummary>> {
    global().list_planners(include_quarantined).await
}

pub async fn rank(request: &SelectionRequest) -> RegistryResult<Vec<RankedPlanner>> {
    global().rank(request).await
}

pub async fn select_best_planner(request: &SelectionRequest) -> RegistryResult<Selection> {
    global().select_best_planner(request).await
}

pub async fn select_best_planner_name(request: &SelectionRequest) -> RegistryResult<String> {
    global().select_best_planner_name(request).await
}

pub async fn self_heal() -> RegistryResult<HealReport> {
    global().self_heal().await
}

pub async fn planner_stats() -> RegistryResult<PlannerStats> {
    global().planner_stats().await
}

pub async fn health_check(min_required: usize) -> RegistryResult<HealthReport> {
    global().health_check(min_required).await
}
