use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    #[error("planner {name} not found")]
    PlannerNotFound { name: String },
    #[error("planner {name} is quarantined: {reason}")]
    PlannerQuarantined { name: String, reason: String },
    #[error("sandbox import of {name} timed out after {timeout_s:.2}s")]
    SandboxTimeout { name: String, timeout_s: f64 },
    #[error("sandbox import of {name} failed: {cause}")]
    SandboxImportError { name: String, cause: String },
    #[error("no active planners satisfy capabilities {required_capabilities:?}")]
    NoActivePlanners { required_capabilities: Vec<String> },
    #[error("planner selection failed for objective {objective_excerpt:?}: {cause}")]
    PlannerSelection {
        objective_excerpt: String,
        cause: String,
    },
    #[error("planner {name} failed to instantiate: {cause}")]
    PlannerInstantiation { name: String, cause: String },
    #[error("timed out after {timeout_s:.2}s waiting for {resource} lock")]
    LockTimeout { resource: String, timeout_s: f64 },
    #[error("planner discovery failed: {cause}")]
    Discovery { cause: String },
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::PlannerNotFound { .. } => ErrorKind::PlannerNotFound,
            RegistryError::PlannerQuarantined { .. } => ErrorKind::PlannerQuarantined,
            RegistryError::SandboxTimeout { .. } => ErrorKind::SandboxTimeout,
            RegistryError::SandboxImportError { .. } => ErrorKind::SandboxImportError,
            RegistryError::NoActivePlanners { .. } => ErrorKind::NoActivePlanners,
            RegistryError::PlannerSelection { .. } => ErrorKind::PlannerSelection,
            RegistryError::PlannerInstantiation { .. } => ErrorKind::PlannerInstantiation,
            RegistryError::LockTimeout { .. } => ErrorKind::LockTimeout,
            RegistryError::Discovery { .. } => ErrorKind::Discovery,
        }
    }

    /// Lock timeouts are the only failures a caller should retry as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::LockTimeout { .. })
    }

    /// Planner the error is about, when it names one.
    pub fn planner_name(&self) -> Option<&str> {
        match self {
            RegistryError::PlannerNotFound { name }
            | RegistryError::PlannerQuarantined { name, .. }
            | RegistryError::SandboxTimeout { name, .. }
            | RegistryError::SandboxImportError { name, .. }
            | RegistryError::PlannerInstantiation { name, .. } => Some(name),
            _ => None,
        }
    }

    pub(crate) fn selection(objective: &str, cause: impl Into<String>) -> Self {
        RegistryError::PlannerSelection {
            objective_excerpt: excerpt(objective, OBJECTIVE_EXCERPT_CHARS),
            cause: cause.into(),
        }
    }
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PlannerNotFound,
    PlannerQuarantined,
    SandboxTimeout,
    SandboxImportError,
    NoActivePlanners,
    PlannerSelection,
    PlannerInstantiation,
    LockTimeout,
    Discovery,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PlannerNotFound => "planner_not_found",
            ErrorKind::PlannerQuarantined => "planner_quarantined",
            ErrorKind::SandboxTimeout => "sandbox_timeout",
            ErrorKind::SandboxImportError => "sandbox_import_error",
            ErrorKind::NoActivePlanners => "no_active_planners",
            ErrorKind::PlannerSelection => "planner_selection",
            ErrorKind::PlannerInstantiation => "planner_instantiation",
            ErrorKind::LockTimeout => "lock_timeout",
            ErrorKind::Discovery => "discovery",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const OBJECTIVE_EXCERPT_CHARS: usize = 80;

fn excerpt(value: &str, max_chars: usize) -> String {
    let mut chars = value.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}
