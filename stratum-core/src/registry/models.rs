use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, RegistryError};
use crate::planner::{PlannerManifest, PlannerTier};

use super::telemetry::{InstantiationSample, SelectionSample, TelemetrySummary};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlannerStatus {
    Active,
    Quarantined,
}

impl PlannerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlannerStatus::Active => "active",
            PlannerStatus::Quarantined => "quarantined",
        }
    }
}

impl fmt::Display for PlannerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlannerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(PlannerStatus::Active),
            "quarantined" => Ok(PlannerStatus::Quarantined),
            other => Err(format!("unknown planner status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuarantineCause {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl QuarantineCause {
    pub fn from_error(error: &RegistryError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            at: Utc::now(),
        }
    }
}

impl fmt::Display for QuarantineCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Registry entry for one discovered candidate.
///
/// Status and `last_error` are private so they can only change together.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannerRecord {
    pub name: String,
    pub module_path: String,
    pub capabilities: BTreeSet<String>,
    pub reliability_score: f64,
    pub tier: PlannerTier,
    pub production_ready: bool,
    pub description: Option<String>,
    pub fingerprint: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub last_checked_at: DateTime<Utc>,
    pub failure_count: u32,
    status: PlannerStatus,
    last_error: Option<QuarantineCause>,
}

impl PlannerRecord {
    pub fn active(
        module_path: impl Into<String>,
        manifest: PlannerManifest,
        fingerprint: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: manifest.name.clone(),
            module_path: module_path.into(),
            capabilities: manifest.capabilities.clone(),
            reliability_score: manifest.reliability_score,
            tier: manifest.tier,
            production_ready: manifest.production_ready,
            description: manifest.description.clone(),
            fingerprint,
            discovered_at: now,
            last_checked_at: now,
            failure_count: 0,
            status: PlannerStatus::Active,
            last_error: None,
        }
    }

    /// Record for a candidate that never loaded; metadata falls back to defaults.
    pub fn quarantined(
        name: impl Into<String>,
        module_path: impl Into<String>,
        cause: QuarantineCause,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            module_path: module_path.into(),
            capabilities: BTreeSet::new(),
            reliability_score: 0.0,
            tier: PlannerTier::Experimental,
            production_ready: false,
            description: None,
            fingerprint: None,
            discovered_at: now,
            last_checked_at: now,
            failure_count: 1,
            status: PlannerStatus::Quarantined,
            last_error: Some(cause),
        }
    }

    pub fn status(&self) -> PlannerStatus {
        self.status
    }

    pub fn last_error(&self) -> Option<&QuarantineCause> {
        self.last_error.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.status == PlannerStatus::Active
    }

    pub fn quarantine(&mut self, cause: QuarantineCause) {
        self.last_checked_at = cause.at;
        self.status = PlannerStatus::Quarantined;
        self.last_error = Some(cause);
        self.failure_count = self.failure_count.saturating_add(1);
    }

    /// Returns to active with metadata refreshed from the manifest that just validated.
    pub fn reactivate(&mut self, manifest: PlannerManifest, fingerprint: Option<String>) {
        self.capabilities = manifest.capabilities.clone();
        self.reliability_score = manifest.reliability_score;
        self.tier = manifest.tier;
        self.production_ready = manifest.production_ready;
        self.description = manifest.description.clone();
        self.fingerprint = fingerprint;
        self.last_checked_at = Utc::now();
        self.status = PlannerStatus::Active;
        self.last_error = None;
    }

    pub fn summary(&self) -> PlannerSummary {
        PlannerSummary {
            name: self.name.clone(),
            module_path: self.module_path.clone(),
            capabilities: self.capabilities.clone(),
            reliability_score: self.reliability_score,
            tier: self.tier,
            production_ready: self.production_ready,
            status: self.status,
            last_error: self.last_error.clone(),
            description: self.description.clone(),
            fingerprint: self.fingerprint.clone(),
            failure_count: self.failure_count,
            discovered_at: self.discovered_at,
            last_checked_at: self.last_checked_at,
        }
    }
}

/// Detached metadata copy handed to callers and to the ranking engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannerSummary {
    pub name: String,
    pub module_path: String,
    pub capabilities: BTreeSet<String>,
    pub reliability_score: f64,
    pub tier: PlannerTier,
    pub production_ready: bool,
    pub status: PlannerStatus,
    pub last_error: Option<QuarantineCause>,
    pub description: Option<String>,
    pub fingerprint: Option<String>,
    pub failure_count: u32,
    pub discovered_at: DateTime<Utc>,
    pub last_checked_at: DateTime<Utc>,
}

impl PlannerSummary {
    pub fn is_active(&self) -> bool {
        self.status == PlannerStatus::Active
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryReport {
    pub skipped: bool,
    pub active: Vec<String>,
    pub quarantined: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HealReport {
    pub recovered: Vec<String>,
    pub still_quarantined: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    pub healthy: bool,
    pub active: usize,
    pub quarantined: usize,
    pub min_required: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_tier: BTreeMap<String, usize>,
    pub quarantine_causes: BTreeMap<String, QuarantineCause>,
    pub recent_selections: Vec<SelectionSample>,
    pub recent_instantiations: Vec<InstantiationSample>,
    pub telemetry: TelemetrySummary,
}
