pub mod config;
pub mod error;
pub mod facade;
pub mod planner;
pub mod registry;

pub use config::{load_factory_config, FactoryConfig};
pub use error::{ConfigError, ErrorKind, RegistryError, RegistryResult, Result};
pub use planner::{
    Plan, PlanContext, PlanStep, Planner, PlannerCatalog, PlannerFactory, PlannerManifest,
    PlannerTier, PlanningError, PlanningResult,
};
pub use registry::{
    DeepContext, DiscoveryReport, HealReport, HealthReport, PlannerRegistry,
    PlannerRegistryBuilder, PlannerStats, PlannerStatus, PlannerSummary, RankedPlanner, Selection,
    SelectionRequest,
};
