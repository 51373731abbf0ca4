use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const DEFAULT_RELIABILITY: f64 = 0.5;
/// Longest run a manifest may grant its planner process.
pub const MAX_PLANNER_TIMEOUT_S: f64 = 3_600.0;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid manifest toml: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid manifest: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlannerTier {
    #[default]
    Experimental,
    Beta,
    Stable,
}

impl PlannerTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlannerTier::Experimental => "experimental",
            PlannerTier::Beta => "beta",
            PlannerTier::Stable => "stable",
        }
    }

    pub fn ordinal(&self) -> u8 {
        match self {
            PlannerTier::Experimental => 0,
            PlannerTier::Beta => 1,
            PlannerTier::Stable => 2,
        }
    }
}

impl fmt::Display for PlannerTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlannerTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "experimental" => Ok(PlannerTier::Experimental),
            "beta" => Ok(PlannerTier::Beta),
            "stable" => Ok(PlannerTier::Stable),
            other => Err(format!("unknown planner tier: {other}")),
        }
    }
}

/// On-disk description of a planner candidate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannerManifest {
    pub name: String,
    pub entrypoint: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default = "default_reliability")]
    pub reliability_score: f64,
    #[serde(default)]
    pub tier: PlannerTier,
    #[serde(default)]
    pub production_ready: bool,
    #[serde(default)]
    pub description: Option<String>,
    /// Command run in a child process to prove the candidate loads.
    #[serde(default)]
    pub probe: Vec<String>,
    /// Program used by the `command` entrypoint to produce plans.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub timeout_s: Option<f64>,
}

fn default_reliability() -> f64 {
    DEFAULT_RELIABILITY
}

impl PlannerManifest {
    pub fn new(name: impl Into<String>, entrypoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entrypoint: entrypoint.into(),
            capabilities: BTreeSet::new(),
            reliability_score: DEFAULT_RELIABILITY,
            tier: PlannerTier::Experimental,
            production_ready: false,
            description: None,
            probe: Vec::new(),
            command: Vec::new(),
            timeout_s: None,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_reliability(mut self, score: f64) -> Self {
        self.reliability_score = score;
        self
    }

    pub fn with_tier(mut self, tier: PlannerTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_production_ready(mut self, value: bool) -> Self {
        self.production_ready = value;
        self
    }

    pub fn parse(source: &str) -> Result<Self, ManifestError> {
        let manifest: PlannerManifest = toml::from_str(source)?;
        manifest.validated()
    }

    /// Normalises capability tags and rejects manifests the registry cannot key on.
    pub fn validated(mut self) -> Result<Self, ManifestError> {
        self.name = self.name.trim().to_string();
        if !name_pattern().is_match(&self.name) {
            return Err(ManifestError::Invalid(format!(
                "planner name {:?} must be alphanumeric with '-', '_' or '.'",
                self.name
            )));
        }
        self.entrypoint = self.entrypoint.trim().to_string();
        if self.entrypoint.is_empty() {
            return Err(ManifestError::Invalid(format!(
                "planner {} declares no entrypoint",
                self.name
            )));
        }

        let mut capabilities = BTreeSet::new();
        for raw in &self.capabilities {
            let tag = raw.trim().to_lowercase();
            if !capability_pattern().is_match(&tag) {
                return Err(ManifestError::Invalid(format!(
                    "planner {} declares invalid capability {raw:?}",
                    self.name
                )));
            }
            capabilities.insert(tag);
        }
        self.capabilities = capabilities;

        if !self.reliability_score.is_finite() {
            self.reliability_score = DEFAULT_RELIABILITY;
        }
        self.reliability_score = self.reliability_score.clamp(0.0, 1.0);
        self.probe.retain(|arg| !arg.is_empty());
        self.timeout_s = self
            .timeout_s
            .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
            .map(|seconds| seconds.min(MAX_PLANNER_TIMEOUT_S));
        Ok(self)
    }
}

pub fn fingerprint(source: &[u8]) -> String {
    hex::encode(Sha256::digest(source))
}

pub fn normalize_capabilities<I, S>(capabilities: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    capabilities
        .into_iter()
        .map(|tag| tag.as_ref().trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect()
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").expect("valid regex"))
}

fn capability_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_.:\-]*$").expect("valid regex"))
}
