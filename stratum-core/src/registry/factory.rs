use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::FactoryConfig;
use crate::error::{RegistryError, RegistryResult};
use crate::planner::manifest::normalize_capabilities;
use crate::planner::{Planner, PlannerCatalog};

use super::locks::{timed_lock, LockLedger, LockLevel, OrderedGuard};
use super::models::{
    DiscoveryReport, HealReport, HealthReport, PlannerRecord, PlannerStats, PlannerStatus,
    PlannerSummary, QuarantineCause,
};
use super::ranking::{rank_planners, DeepContext, RankOptions, RankedPlanner};
use super::sandbox::{candidate_name, PlannerModule, ProbeLauncher, SandboxLoader};
use super::source::{default_source, PlannerSource};
use super::telemetry::{SelectionSample, TelemetryManager};

const SELECTION_RETRIES: usize = 1;
const RECENT_SAMPLES: usize = 20;

/// Arguments for [`PlannerRegistry::select_best_planner`].
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionRequest {
    pub objective: String,
    pub required_capabilities: BTreeSet<String>,
    pub prefer_production: bool,
    pub auto_instantiate: bool,
    pub deep_context: Option<DeepContext>,
}

impl SelectionRequest {
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            objective: objective.into(),
            required_capabilities: BTreeSet::new(),
            prefer_production: false,
            auto_instantiate: true,
            deep_context: None,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.required_capabilities = normalize_capabilities(capabilities);
        self
    }

    pub fn prefer_production(mut self, value: bool) -> Self {
        self.prefer_production = value;
        self
    }

    pub fn auto_instantiate(mut self, value: bool) -> Self {
        self.auto_instantiate = value;
        self
    }

    pub fn with_deep_context(mut self, context: DeepContext) -> Self {
        self.deep_context = Some(context);
        self
    }
}

/// Outcome of a successful selection.
#[derive(Clone)]
pub struct Selection {
    pub name: String,
    pub score: f64,
    /// Present when the request asked for instantiation.
    pub instance: Option<Arc<dyn Planner>>,
    pub ranked: Vec<RankedPlanner>,
}

impl fmt::Debug for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selection")
            .field("name", &self.name)
            .field("score", &self.score)
            .field("instantiated", &self.instance.is_some())
            .field("ranked", &self.ranked)
            .finish()
    }
}

#[derive(Default)]
struct PlannerSlot {
    instance: Option<Arc<dyn Planner>>,
}

type SlotHandle = Arc<Mutex<PlannerSlot>>;

#[derive(Default)]
struct FactoryState {
    records: BTreeMap<String, PlannerRecord>,
    modules: HashMap<String, PlannerModule>,
    planner_locks: HashMap<String, SlotHandle>,
    discovered: bool,
}

pub struct PlannerRegistryBuilder {
    config: FactoryConfig,
    source: Option<Arc<dyn PlannerSource>>,
    catalog: Option<PlannerCatalog>,
    launcher: Option<Arc<dyn ProbeLauncher>>,
}

impl PlannerRegistryBuilder {
    pub fn new(config: FactoryConfig) -> Self {
        Self {
            config,
            source: None,
            catalog: None,
            launcher: None,
        }
    }

    pub fn source(mut self, source: impl PlannerSource + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn catalog(mut self, catalog: PlannerCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn ProbeLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn build(self) -> PlannerRegistry {
        let catalog = self.catalog.unwrap_or_else(PlannerCatalog::with_builtins);
        let source: Arc<dyn PlannerSource> = match self.source {
            Some(source) => source,
            None => Arc::new(default_source(&self.config, &catalog)),
        };
        let mut loader = SandboxLoader::new(Arc::new(catalog));
        if let Some(launcher) = self.launcher {
            loader = loader.with_launcher(launcher);
        }
        PlannerRegistry {
            telemetry: TelemetryManager::new(&self.config),
            config_snapshot: self.config.to_map(),
            config: self.config,
            source,
            loader,
            validation_lock: Mutex::new(()),
            state: Mutex::new(FactoryState::default()),
        }
    }
}

/// Discovers, validates, ranks and instantiates planners.
///
/// All methods take `&self`; share the registry behind an `Arc`.
pub struct PlannerRegistry {
    config: FactoryConfig,
    config_snapshot: BTreeMap<String, String>,
    source: Arc<dyn PlannerSource>,
    loader: SandboxLoader,
    validation_lock: Mutex<()>,
    state: Mutex<FactoryState>,
    telemetry: TelemetryManager,
}

impl PlannerRegistry {
    pub fn new(config: FactoryConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: FactoryConfig) -> PlannerRegistryBuilder {
        PlannerRegistryBuilder::new(config)
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    pub fn telemetry(&self) -> &TelemetryManager {
        &self.telemetry
    }

    /// Validates every candidate from the source and replaces the record table.
    ///
    /// Without `force` this is a no-op once a discovery pass has completed,
    /// even one that found no candidates. Sandbox runs happen
    /// under the validation lock only; the new table is swapped in under the
    /// state lock, so readers never wait on a candidate import.
    pub async fn discover(&self, force: bool) -> RegistryResult<DiscoveryReport> {
        let ledger = LockLedger::new();
        if !force && self.is_discovered(&ledger).await? {
            return Ok(DiscoveryReport {
                skipped: true,
                ..DiscoveryReport::default()
            });
        }

        let _validation = self.lock_validation(&ledger).await?;
        if !force && self.is_discovered(&ledger).await? {
            return Ok(DiscoveryReport {
                skipped: true,
                ..DiscoveryReport::default()
            });
        }

        let started = Instant::now();
        let locators = self.source.enumerate().map_err(|err| {
            warn!(target: "registry", error = %err, "planner enumeration failed");
            err
        })?;
        let limit = self.config.sandbox_timeout();
        let outcomes = join_all(locators.iter().map(|locator| {
            self.loader
                .import_in_sandbox(locator, limit, self.config.use_subprocess)
        }))
        .await;

        let mut records = BTreeMap::new();
        let mut modules = HashMap::new();
        for (locator, outcome) in locators.iter().zip(outcomes) {
            let record = match outcome {
                Ok(module) => {
                    let record = PlannerRecord::active(
                        locator.clone(),
                        module.manifest.clone(),
                        module.fingerprint.clone(),
                    );
                    if !records.contains_key(&record.name) {
                        modules.insert(record.name.clone(), module);
                    }
                    record
                }
                Err(err) => PlannerRecord::quarantined(
                    err.planner_name()
                        .map(str::to_string)
                        .unwrap_or_else(|| candidate_name(locator)),
                    locator.clone(),
                    QuarantineCause::from_error(&err),
                ),
            };
            if records.contains_key(&record.name) {
                warn!(
                    target: "registry",
                    planner = %record.name,
                    locator = %locator,
                    "duplicate planner name, keeping the first candidate"
                );
                continue;
            }
            records.insert(record.name.clone(), record);
        }

        let report = DiscoveryReport {
            skipped: false,
            active: names_with_status(&records, PlannerStatus::Active),
            quarantined: names_with_status(&records, PlannerStatus::Quarantined),
        };

        let mut state = self.lock_state(&ledger).await?;
        state.planner_locks = records
            .keys()
            .map(|name| (name.clone(), SlotHandle::default()))
            .collect();
        state.records = records;
        state.modules = modules;
        state.discovered = true;
        drop(state);

        info!(
            target: "registry",
            candidates = locators.len(),
            active = report.active.len(),
            quarantined = report.quarantined.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "planner discovery finished"
        );
        Ok(report)
    }

    /// Live instance of an active planner, created on first use.
    pub async fn get_planner(&self, name: &str) -> RegistryResult<Arc<dyn Planner>> {
        self.ensure_discovered().await?;
        self.acquire_instance(&LockLedger::new(), name, false).await
    }

    /// Like [`get_planner`](Self::get_planner) but also hands out quarantined
    /// planners that still have a validated module. Meant for diagnostics.
    pub async fn get_planner_with_override(&self, name: &str) -> RegistryResult<Arc<dyn Planner>> {
        self.ensure_discovered().await?;
        self.acquire_instance(&LockLedger::new(), name, true).await
    }

    pub async fn list_planners(&self, include_quarantined: bool) -> RegistryResult<Vec<PlannerSummary>> {
        self.ensure_discovered().await?;
        let ledger = LockLedger::new();
        let state = self.lock_state(&ledger).await?;
        Ok(state
            .records
            .values()
            .filter(|record| include_quarantined || record.is_active())
            .map(PlannerRecord::summary)
            .collect())
    }

    /// Every eligible candidate for `request`, best first.
    pub async fn rank(&self, request: &SelectionRequest) -> RegistryResult<Vec<RankedPlanner>> {
        self.ensure_discovered().await?;
        let snapshot = self.snapshot(&LockLedger::new()).await?;
        Ok(self.rank_snapshot(&snapshot, request))
    }

    /// Picks the best planner for `request` and, when asked, instantiates it.
    ///
    /// A failed instantiation quarantines the winner and reruns the selection
    /// once against the remaining candidates. A sample is recorded whatever the
    /// outcome.
    pub async fn select_best_planner(&self, request: &SelectionRequest) -> RegistryResult<Selection> {
        let started = Instant::now();
        let mut candidates = 0;
        let outcome = self.select(request, &mut candidates).await;
        self.record_selection(request, &outcome, candidates, started.elapsed());
        outcome
    }

    /// Ranking-only selection.
    pub async fn select_best_planner_name(&self, request: &SelectionRequest) -> RegistryResult<String> {
        let request = request.clone().auto_instantiate(false);
        self.select_best_planner(&request)
            .await
            .map(|selection| selection.name)
    }

    /// Re-validates every quarantined candidate and reactivates the ones that pass.
    pub async fn self_heal(&self) -> RegistryResult<HealReport> {
        let ledger = LockLedger::new();
        let _validation = self.lock_validation(&ledger).await?;

        let targets: Vec<(String, String)> = {
            let state = self.lock_state(&ledger).await?;
            state
                .records
                .values()
                .filter(|record| !record.is_active())
                .map(|record| (record.name.clone(), record.module_path.clone()))
                .collect()
        };
        if targets.is_empty() {
            return Ok(HealReport::default());
        }

        let limit = self.config.sandbox_timeout();
        let outcomes = join_all(targets.iter().map(|(_, locator)| {
            self.loader
                .import_in_sandbox(locator, limit, self.config.use_subprocess)
        }))
        .await;

        let mut report = HealReport::default();
        let mut guard = self.lock_state(&ledger).await?;
        let FactoryState {
            records,
            modules,
            planner_locks,
            ..
        } = &mut *guard;
        for ((name, _), outcome) in targets.into_iter().zip(outcomes) {
            let Some(record) = records.get_mut(&name) else {
                continue;
            };
            if record.is_active() {
                continue;
            }
            let outcome = outcome.and_then(|module| {
                if module.manifest.name == name {
                    Ok(module)
                } else {
                    Err(RegistryError::SandboxImportError {
                        name: name.clone(),
                        cause: format!("manifest now declares planner {}", module.manifest.name),
                    })
                }
            });
            match outcome {
                Ok(module) => {
                    record.reactivate(module.manifest.clone(), module.fingerprint.clone());
                    modules.insert(name.clone(), module);
                    planner_locks.insert(name.clone(), SlotHandle::default());
                    info!(target: "registry.heal", planner = %name, "planner recovered");
                    report.recovered.push(name);
                }
                Err(err) => {
                    debug!(target: "registry.heal", planner = %name, error = %err, "planner still failing");
                    record.quarantine(QuarantineCause::from_error(&err));
                    report.still_quarantined.push(name);
                }
            }
        }
        drop(guard);

        info!(
            target: "registry.heal",
            recovered = report.recovered.len(),
            still_quarantined = report.still_quarantined.len(),
            "self-heal pass finished"
        );
        Ok(report)
    }

    pub async fn planner_stats(&self) -> RegistryResult<PlannerStats> {
        let ledger = LockLedger::new();
        let state = self.lock_state(&ledger).await?;
        let mut by_status = BTreeMap::new();
        let mut by_tier = BTreeMap::new();
        let mut quarantine_causes = BTreeMap::new();
        for record in state.records.values() {
            *by_status.entry(record.status().to_string()).or_insert(0) += 1;
            *by_tier.entry(record.tier.to_string()).or_insert(0) += 1;
            if let Some(cause) = record.last_error() {
                quarantine_causes.insert(record.name.clone(), cause.clone());
            }
        }
        let total = state.records.len();
        drop(state);

        Ok(PlannerStats {
            total,
            by_status,
            by_tier,
            quarantine_causes,
            recent_selections: self.telemetry.get_selection_samples(RECENT_SAMPLES),
            recent_instantiations: self.telemetry.get_instantiation_samples(RECENT_SAMPLES),
            telemetry: self.telemetry.summary(),
        })
    }

    pub async fn health_check(&self, min_required: usize) -> RegistryResult<HealthReport> {
        let ledger = LockLedger::new();
        let state = self.lock_state(&ledger).await?;
        let active = state.records.values().filter(|record| record.is_active()).count();
        let quarantined = state.records.len() - active;
        Ok(HealthReport {
            healthy: active >= min_required,
            active,
            quarantined,
            min_required,
        })
    }

    /// `candidates` tracks the size of the latest ranking so failed selections
    /// still report how many planners were considered.
    async fn select(&self, request: &SelectionRequest, candidates: &mut usize) -> RegistryResult<Selection> {
        self.ensure_discovered().await?;
        let mut attempt = 0;
        loop {
            let ledger = LockLedger::new();
            let snapshot = self.snapshot(&ledger).await?;
            let ranked = self.rank_snapshot(&snapshot, request);
            *candidates = ranked.len();
            let choice = choose(&ranked, request.prefer_production)
                .cloned()
                .ok_or_else(|| RegistryError::NoActivePlanners {
                    required_capabilities: request.required_capabilities.iter().cloned().collect(),
                })?;

            if !request.auto_instantiate {
                return Ok(Selection {
                    name: choice.name,
                    score: choice.score,
                    instance: None,
                    ranked,
                });
            }

            match self.acquire_instance(&ledger, &choice.name, false).await {
                Ok(instance) => {
                    return Ok(Selection {
                        name: choice.name,
                        score: choice.score,
                        instance: Some(instance),
                        ranked,
                    })
                }
                Err(
                    err @ (RegistryError::PlannerInstantiation { .. }
                    | RegistryError::PlannerQuarantined { .. }
                    | RegistryError::PlannerNotFound { .. }),
                ) => {
                    if attempt >= SELECTION_RETRIES {
                        return Err(RegistryError::selection(&request.objective, err.to_string()));
                    }
                    warn!(
                        target: "registry.selection",
                        planner = %choice.name,
                        error = %err,
                        "selected planner unusable, retrying selection"
                    );
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn rank_snapshot(&self, snapshot: &[PlannerSummary], request: &SelectionRequest) -> Vec<RankedPlanner> {
        let options = RankOptions {
            min_reliability: self.config.min_reliability,
            strict_capabilities: self.config.strict_capabilities,
            use_deep_context: self.config.deep_fingerprint,
        };
        rank_planners(
            snapshot,
            &request.objective,
            &request.required_capabilities,
            request.deep_context.as_ref(),
            &options,
        )
    }

    /// Resolves `name` under the state lock, releases it, then instantiates under
    /// the planner's own lock.
    async fn acquire_instance(
        &self,
        ledger: &LockLedger,
        name: &str,
        allow_quarantined: bool,
    ) -> RegistryResult<Arc<dyn Planner>> {
        let (slot, module) = {
            let state = self.lock_state(ledger).await?;
            let record = state
                .records
                .get(name)
                .ok_or_else(|| RegistryError::PlannerNotFound {
                    name: name.to_string(),
                })?;
            if !record.is_active() && !allow_quarantined {
                return Err(RegistryError::PlannerQuarantined {
                    name: name.to_string(),
                    reason: record
                        .last_error()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "unknown".into()),
                });
            }
            let slot = state
                .planner_locks
                .get(name)
                .cloned()
                .ok_or_else(|| RegistryError::PlannerNotFound {
                    name: name.to_string(),
                })?;
            (slot, state.modules.get(name).cloned())
        };

        let mut guard = timed_lock(
            &slot,
            ledger,
            LockLevel::Planner,
            &format!("planner:{name}"),
            self.config.lock_timeout(),
        )
        .await?;
        if let Some(instance) = &guard.instance {
            return Ok(Arc::clone(instance));
        }

        let module = module.ok_or_else(|| RegistryError::PlannerInstantiation {
            name: name.to_string(),
            cause: "no validated module available".into(),
        })?;
        let started = Instant::now();
        match module.instantiate() {
            Ok(instance) => {
                self.telemetry
                    .record_instantiation(name, started.elapsed(), true);
                guard.instance = Some(Arc::clone(&instance));
                debug!(target: "registry", planner = %name, "planner instantiated");
                Ok(instance)
            }
            Err(err) => {
                self.telemetry
                    .record_instantiation(name, started.elapsed(), false);
                drop(guard);
                let error = RegistryError::PlannerInstantiation {
                    name: name.to_string(),
                    cause: err.to_string(),
                };
                self.quarantine(ledger, name, &error).await;
                Err(error)
            }
        }
    }

    async fn quarantine(&self, ledger: &LockLedger, name: &str, error: &RegistryError) {
        match self.lock_state(ledger).await {
            Ok(mut state) => {
                if let Some(record) = state.records.get_mut(name) {
                    if record.is_active() {
                        record.quarantine(QuarantineCause::from_error(error));
                        warn!(target: "registry", planner = %name, error = %error, "planner quarantined");
                    }
                }
            }
            Err(lock_err) => warn!(
                target: "registry",
                planner = %name,
                error = %lock_err,
                "could not record quarantine"
            ),
        }
    }

    async fn ensure_discovered(&self) -> RegistryResult<()> {
        self.discover(false).await.map(|_| ())
    }

    async fn is_discovered(&self, ledger: &LockLedger) -> RegistryResult<bool> {
        let state = self.lock_state(ledger).await?;
        Ok(state.discovered)
    }

    async fn snapshot(&self, ledger: &LockLedger) -> RegistryResult<Vec<PlannerSummary>> {
        let state = self.lock_state(ledger).await?;
        Ok(state.records.values().map(PlannerRecord::summary).collect())
    }

    async fn lock_state<'a>(&'a self, ledger: &'a LockLedger) -> RegistryResult<OrderedGuard<'a, FactoryState>> {
        timed_lock(
            &self.state,
            ledger,
            LockLevel::State,
            LockLevel::State.name(),
            self.config.lock_timeout(),
        )
        .await
    }

    async fn lock_validation<'a>(&'a self, ledger: &'a LockLedger) -> RegistryResult<OrderedGuard<'a, ()>> {
        timed_lock(
            &self.validation_lock,
            ledger,
            LockLevel::Validation,
            LockLevel::Validation.name(),
            self.config.lock_timeout(),
        )
        .await
    }

    fn record_selection(
        &self,
        request: &SelectionRequest,
        outcome: &RegistryResult<Selection>,
        candidate_count: usize,
        elapsed: Duration,
    ) {
        let winner = outcome
            .as_ref()
            .ok()
            .and_then(|selection| selection.ranked.iter().find(|entry| entry.name == selection.name));
        let sample = SelectionSample {
            objective_length: request.objective.chars().count(),
            required_capabilities: request.required_capabilities.iter().cloned().collect(),
            winner: winner.map(|entry| entry.name.clone()),
            score: winner.map(|entry| entry.score),
            candidate_count,
            deep_context: request.deep_context.is_some(),
            hotspot_count: request
                .deep_context
                .as_ref()
                .map(|context| context.hotspot_count)
                .unwrap_or(0),
            breakdown: winner.map(|entry| entry.breakdown.clone()).unwrap_or_default(),
            duration_ms: elapsed.as_secs_f64() * 1000.0,
            config: self.config_snapshot.clone(),
            error: outcome.as_ref().err().map(RegistryError::kind),
            recorded_at: Utc::now(),
        };
        match outcome {
            Ok(selection) => debug!(
                target: "registry.selection",
                planner = %selection.name,
                score = selection.score,
                candidates = selection.ranked.len(),
                elapsed_ms = sample.duration_ms,
                "planner selected"
            ),
            Err(err) => warn!(
                target: "registry.selection",
                kind = %err.kind(),
                elapsed_ms = sample.duration_ms,
                "planner selection failed: {err}"
            ),
        }
        self.telemetry.record_selection(sample);
    }
}

impl fmt::Debug for PlannerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlannerRegistry")
            .field("config", &self.config)
            .field("source", &self.source)
            .field("loader", &self.loader)
            .finish()
    }
}

/// Top candidate, or with `prefer_production` the best production-ready one
/// that covers as much as the top candidate does.
fn choose(ranked: &[RankedPlanner], prefer_production: bool) -> Option<&RankedPlanner> {
    let top = ranked.first()?;
    if !prefer_production {
        return Some(top);
    }
    ranked
        .iter()
        .find(|candidate| candidate.production_ready && candidate.match_ratio == top.match_ratio)
        .or(Some(top))
}

fn names_with_status(records: &BTreeMap<String, PlannerRecord>, status: PlannerStatus) -> Vec<String> {
    records
        .values()
        .filter(|record| record.status() == status)
        .map(|record| record.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::planner::{PlanContext, PlannerTier, PlanningError};
    use crate::registry::source::StaticSource;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ranked(name: &str, score: f64, ratio: f64, production_ready: bool) -> RankedPlanner {
        RankedPlanner {
            name: name.into(),
            score,
            rank_hint: score,
            match_ratio: ratio,
            production_ready,
            breakdown: BTreeMap::new(),
        }
    }

    fn write_manifest(dir: &Path, file: &str, body: &str) -> String {
        let path = dir.join(file);
        std::fs::write(&path, body).unwrap();
        path.display().to_string()
    }

    fn config() -> FactoryConfig {
        FactoryConfig::default()
            .with_sandbox_timeout(Duration::from_secs(2))
            .with_lock_timeout(Duration::from_secs(2))
    }

    #[test]
    fn prefer_production_keeps_coverage() {
        let list = vec![
            ranked("a", 1.6, 1.0, false),
            ranked("b", 1.5, 1.0, true),
            ranked("c", 0.4, 0.5, true),
        ];
        assert_eq!(choose(&list, false).unwrap().name, "a");
        assert_eq!(choose(&list, true).unwrap().name, "b");

        let no_prod = vec![ranked("a", 1.6, 1.0, false), ranked("c", 0.4, 0.5, true)];
        assert_eq!(choose(&no_prod, true).unwrap().name, "a");
        assert!(choose(&[], true).is_none());
    }

    #[test]
    fn request_normalises_capabilities() {
        let request = SelectionRequest::new("ship").with_capabilities([" X ", "y", "x"]);
        let expected: BTreeSet<String> = ["x", "y"].iter().map(|tag| tag.to_string()).collect();
        assert_eq!(request.required_capabilities, expected);
        assert!(request.auto_instantiate);
    }

    #[tokio::test]
    async fn discover_is_idempotent_unless_forced() {
        let registry = PlannerRegistry::builder(config())
            .source(StaticSource::new(["builtin:linear", "builtin:decompose"]))
            .build();
        let first = registry.discover(false).await.unwrap();
        assert!(!first.skipped);
        assert_eq!(first.active, vec!["decompose", "linear"]);

        assert!(registry.discover(false).await.unwrap().skipped);
        assert!(!registry.discover(true).await.unwrap().skipped);
    }

    #[tokio::test]
    async fn empty_source_counts_as_discovered() {
        let registry = PlannerRegistry::builder(config())
            .source(StaticSource::new(Vec::<String>::new()))
            .build();
        let first = registry.discover(false).await.unwrap();
        assert!(!first.skipped);
        assert!(first.active.is_empty());

        assert!(registry.discover(false).await.unwrap().skipped);
        assert!(registry.list_planners(true).await.unwrap().is_empty());
        let err = registry
            .select_best_planner(&SelectionRequest::new("anything"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoActivePlanners);
    }

    #[tokio::test]
    async fn duplicate_names_keep_first_locator() {
        let dir = tempfile::tempdir().unwrap();
        let copy = write_manifest(
            dir.path(),
            "linear_copy.toml",
            "name = \"linear\"\nentrypoint = \"builtin:linear\"\nreliability_score = 0.1\n",
        );
        let registry = PlannerRegistry::builder(config())
            .source(StaticSource::new(["builtin:linear".to_string(), copy]))
            .build();
        let report = registry.discover(false).await.unwrap();
        assert_eq!(report.active, vec!["linear"]);
        let listed = registry.list_planners(true).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].module_path, "builtin:linear");
    }

    #[tokio::test]
    async fn lookup_errors_are_typed() {
        let registry = PlannerRegistry::builder(config())
            .source(StaticSource::new(["builtin:linear", "builtin:missing"]))
            .build();
        let missing = registry.get_planner("nope").await.err().unwrap();
        assert_eq!(missing.kind(), ErrorKind::PlannerNotFound);

        let quarantined = registry.get_planner("missing").await.err().unwrap();
        assert_eq!(quarantined.kind(), ErrorKind::PlannerQuarantined);

        // quarantined at discovery, so there is no module to fall back on
        let overridden = registry.get_planner_with_override("missing").await.err().unwrap();
        assert_eq!(overridden.kind(), ErrorKind::PlannerInstantiation);

        let planner = registry.get_planner("linear").await.unwrap();
        let again = registry.get_planner("linear").await.unwrap();
        assert!(Arc::ptr_eq(&planner, &again));
    }

    #[tokio::test]
    async fn failed_instantiation_quarantines_and_retries_once() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut catalog = PlannerCatalog::with_builtins();
        let counter = Arc::clone(&attempts);
        catalog.register_fn("custom:broken", move |manifest| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(PlanningError::Configuration(format!("{} refuses to start", manifest.name)))
        });

        let dir = tempfile::tempdir().unwrap();
        let broken = write_manifest(
            dir.path(),
            "broken.toml",
            "name = \"broken\"\nentrypoint = \"custom:broken\"\ncapabilities = [\"x\"]\nreliability_score = 1.0\ntier = \"stable\"\nproduction_ready = true\n",
        );
        let fallback = write_manifest(
            dir.path(),
            "fallback.toml",
            "name = \"fallback\"\nentrypoint = \"builtin:linear\"\ncapabilities = [\"x\"]\nreliability_score = 0.5\n",
        );
        let registry = PlannerRegistry::builder(config())
            .catalog(catalog)
            .source(StaticSource::new([broken, fallback]))
            .build();

        let request = SelectionRequest::new("do the thing").with_capabilities(["x"]);
        assert_eq!(registry.select_best_planner_name(&request).await.unwrap(), "broken");

        let selection = registry.select_best_planner(&request).await.unwrap();
        assert_eq!(selection.name, "fallback");
        assert!(selection.instance.is_some());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        let listed = registry.list_planners(false).await.unwrap();
        assert_eq!(listed.len(), 1);
        let stats = registry.planner_stats().await.unwrap();
        assert_eq!(
            stats.quarantine_causes["broken"].kind,
            ErrorKind::PlannerInstantiation
        );
        assert_eq!(stats.telemetry.instantiation_failures, 1);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let mut catalog = PlannerCatalog::new();
        catalog.register_fn("custom:broken", |_| {
            Err(PlanningError::Configuration("always broken".into()))
        });
        let dir = tempfile::tempdir().unwrap();
        let locators: Vec<String> = ["one", "two", "three"]
            .iter()
            .map(|name| {
                write_manifest(
                    dir.path(),
                    &format!("{name}.toml"),
                    &format!("name = \"{name}\"\nentrypoint = \"custom:broken\"\n"),
                )
            })
            .collect();
        let registry = PlannerRegistry::builder(config())
            .catalog(catalog)
            .source(StaticSource::new(locators))
            .build();

        let err = registry
            .select_best_planner(&SelectionRequest::new("anything"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PlannerSelection);
        let samples = registry.telemetry().get_selection_samples(1);
        assert_eq!(samples[0].error, Some(ErrorKind::PlannerSelection));
        assert_eq!(samples[0].candidate_count, 2, "size of the last ranking");
        // two attempts consumed, the third candidate untouched
        let health = registry.health_check(1).await.unwrap();
        assert_eq!(health.active, 1);
        assert_eq!(health.quarantined, 2);
    }

    #[tokio::test]
    async fn no_candidates_is_reported_and_sampled() {
        let registry = PlannerRegistry::builder(config())
            .source(StaticSource::new(["builtin:linear"]))
            .build();
        let request = SelectionRequest::new("plan").with_capabilities(["telepathy"]);
        let request = SelectionRequest {
            prefer_production: true,
            ..request
        };
        let err = registry.select_best_planner(&request).await.err().unwrap();
        match err {
            RegistryError::NoActivePlanners {
                required_capabilities,
            } => assert_eq!(required_capabilities, vec!["telepathy".to_string()]),
            other => panic!("unexpected error {other:?}"),
        }

        let samples = registry.telemetry().get_selection_samples(10);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].error, Some(ErrorKind::NoActivePlanners));
        assert_eq!(samples[0].config["min_reliability"], "0.3");
    }

    #[tokio::test]
    async fn self_heal_reactivates_fixed_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let locator = write_manifest(dir.path(), "flaky.toml", "name = \"flaky\"\nentrypoint = \"builtin:nowhere\"\n");
        let registry = PlannerRegistry::builder(config())
            .source(StaticSource::new([locator.clone()]))
            .build();
        let report = registry.discover(false).await.unwrap();
        assert_eq!(report.quarantined, vec!["flaky"]);

        let still = registry.self_heal().await.unwrap();
        assert_eq!(still.still_quarantined, vec!["flaky"]);

        std::fs::write(
            &locator,
            "name = \"flaky\"\nentrypoint = \"builtin:linear\"\ntier = \"beta\"\n",
        )
        .unwrap();
        let healed = registry.self_heal().await.unwrap();
        assert_eq!(healed.recovered, vec!["flaky"]);

        let listed = registry.list_planners(false).await.unwrap();
        assert_eq!(listed[0].tier, PlannerTier::Beta);
        assert!(listed[0].last_error.is_none());
        assert_eq!(listed[0].failure_count, 2);
        assert!(registry.get_planner("flaky").await.is_ok());
    }

    #[tokio::test]
    async fn renamed_manifest_stays_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let locator = write_manifest(dir.path(), "old.toml", "name = \"old\"\nentrypoint = \"builtin:none\"\n");
        let registry = PlannerRegistry::builder(config())
            .source(StaticSource::new([locator.clone()]))
            .build();
        registry.discover(false).await.unwrap();
        std::fs::write(&locator, "name = \"new\"\nentrypoint = \"builtin:linear\"\n").unwrap();
        let report = registry.self_heal().await.unwrap();
        assert_eq!(report.still_quarantined, vec!["old"]);
    }

    #[tokio::test]
    async fn stats_and_health_reflect_records() {
        let registry = PlannerRegistry::builder(config())
            .source(StaticSource::new(["builtin:linear", "builtin:decompose", "builtin:ghost"]))
            .build();
        registry.discover(false).await.unwrap();
        let stats = registry.planner_stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status["active"], 2);
        assert_eq!(stats.by_status["quarantined"], 1);
        assert_eq!(stats.by_tier["stable"], 1);
        assert!(stats.quarantine_causes.contains_key("ghost"));

        assert!(registry.health_check(2).await.unwrap().healthy);
        assert!(!registry.health_check(3).await.unwrap().healthy);
    }

    #[tokio::test]
    async fn manifest_metadata_drives_ranking() {
        let dir = tempfile::tempdir().unwrap();
        let strong = write_manifest(
            dir.path(),
            "strong.toml",
            "name = \"strong\"\nentrypoint = \"builtin:linear\"\ncapabilities = [\"x\", \"y\"]\nreliability_score = 0.9\ntier = \"stable\"\n",
        );
        let registry = PlannerRegistry::builder(config())
            .source(StaticSource::new([strong]))
            .build();
        let ranked = registry
            .rank(&SelectionRequest::new("plan").with_capabilities(["x", "y"]))
            .await
            .unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].name, "strong");
        assert_eq!(ranked[0].match_ratio, 1.0);

        let planner = registry.get_planner("strong").await.unwrap();
        let plan = planner
            .plan("draft. review. publish", &PlanContext::default())
            .await
            .unwrap();
        assert_eq!(plan.planner, "strong");
        assert_eq!(plan.steps.len(), 3);
    }
}
