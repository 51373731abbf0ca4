mod factory;
pub mod locks;
pub mod models;
pub mod ranking;
pub mod sandbox;
pub mod source;
pub mod telemetry;

pub use factory::{PlannerRegistry, PlannerRegistryBuilder, Selection, SelectionRequest};
pub use locks::{LockLedger, LockLevel};
pub use models::{
    DiscoveryReport, HealReport, HealthReport, PlannerRecord, PlannerStats, PlannerStatus,
    PlannerSummary, QuarantineCause,
};
pub use ranking::{
    capabilities_match_ratio, compute_deep_boosts, compute_rank_hint, rank_planners, DeepContext,
    RankOptions, RankedPlanner,
};
pub use sandbox::{PlannerModule, ProbeLauncher, SandboxLoader, SystemProbeLauncher};
pub use source::{default_source, CompositeSource, DirectorySource, PlannerSource, StaticSource};
pub use telemetry::{
    InstantiationSample, RingBuffer, SelectionSample, TelemetryManager, TelemetrySummary,
};
