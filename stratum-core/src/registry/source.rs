use std::fmt;
use std::path::PathBuf;

use walkdir::WalkDir;

use crate::config::FactoryConfig;
use crate::error::{RegistryError, RegistryResult};
use crate::planner::PlannerCatalog;

const MANIFEST_EXTENSION: &str = "toml";

/// Enumerates candidate locators for discovery.
///
/// Only a failure to enumerate at all is an error; a broken candidate is the
/// sandbox's concern.
pub trait PlannerSource: Send + Sync + fmt::Debug {
    fn enumerate(&self) -> RegistryResult<Vec<String>>;
}

/// Fixed list of locators.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    locators: Vec<String>,
}

impl StaticSource {
    pub fn new<I, S>(locators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            locators: locators.into_iter().map(Into::into).collect(),
        }
    }
}

impl PlannerSource for StaticSource {
    fn enumerate(&self) -> RegistryResult<Vec<String>> {
        Ok(self.locators.clone())
    }
}

/// Every `*.toml` manifest below a directory, in path order.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PlannerSource for DirectorySource {
    fn enumerate(&self) -> RegistryResult<Vec<String>> {
        if !self.root.is_dir() {
            return Err(RegistryError::Discovery {
                cause: format!("planner directory {} not found", self.root.display()),
            });
        }

        let mut locators = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(|err| RegistryError::Discovery {
                cause: format!("cannot walk {}: {err}", self.root.display()),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(MANIFEST_EXTENSION) {
                locators.push(path.display().to_string());
            }
        }
        Ok(locators)
    }
}

/// Concatenation of several sources, in order.
#[derive(Debug, Default)]
pub struct CompositeSource {
    sources: Vec<Box<dyn PlannerSource>>,
}

impl CompositeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: impl PlannerSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }
}

impl PlannerSource for CompositeSource {
    fn enumerate(&self) -> RegistryResult<Vec<String>> {
        let mut locators = Vec::new();
        for source in &self.sources {
            locators.extend(source.enumerate()?);
        }
        Ok(locators)
    }
}

/// Compiled-in planners plus the configured manifest directory, if any.
pub fn default_source(config: &FactoryConfig, catalog: &PlannerCatalog) -> CompositeSource {
    let source = CompositeSource::new().with_source(StaticSource::new(catalog.builtin_locators()));
    match &config.planner_dir {
        Some(dir) => source.with_source(DirectorySource::new(dir)),
        None => source,
    }
}
