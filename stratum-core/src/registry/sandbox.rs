use std::fmt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::{timeout_at, Instant as TokioInstant};
use tracing::{debug, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::planner::manifest::fingerprint;
use crate::planner::{Planner, PlannerCatalog, PlannerFactory, PlannerManifest, PlanningResult, BUILTIN_PREFIX};

/// Runs a candidate's probe command in a child process.
///
/// Implementations must tie the child's lifetime to the returned future so a
/// dropped future terminates the process.
#[async_trait]
pub trait ProbeLauncher: Send + Sync {
    async fn run(&self, program: &Path, args: &[String]) -> std::io::Result<ExitStatus>;
}

pub struct SystemProbeLauncher;

#[async_trait]
impl ProbeLauncher for SystemProbeLauncher {
    async fn run(&self, program: &Path, args: &[String]) -> std::io::Result<ExitStatus> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        child.wait().await
    }
}

/// A candidate that passed validation and can be instantiated in-process.
#[derive(Clone)]
pub struct PlannerModule {
    pub locator: String,
    pub manifest: PlannerManifest,
    pub fingerprint: Option<String>,
    factory: Arc<dyn PlannerFactory>,
}

impl PlannerModule {
    pub fn instantiate(&self) -> PlanningResult<Arc<dyn Planner>> {
        self.factory.instantiate(&self.manifest)
    }
}

impl fmt::Debug for PlannerModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlannerModule")
            .field("locator", &self.locator)
            .field("manifest", &self.manifest)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

#[derive(Clone)]
pub struct SandboxLoader {
    catalog: Arc<PlannerCatalog>,
    launcher: Arc<dyn ProbeLauncher>,
}

impl SandboxLoader {
    pub fn new(catalog: Arc<PlannerCatalog>) -> Self {
        Self {
            catalog,
            launcher: Arc::new(SystemProbeLauncher),
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ProbeLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Validates `locator` and returns the loaded module.
    ///
    /// The whole import (manifest read, probe process, entrypoint resolution)
    /// shares one deadline. On expiry the in-flight probe future is dropped,
    /// which kills the child. Once the manifest is read, failures carry the
    /// declared planner name rather than the locator's.
    pub async fn import_in_sandbox(
        &self,
        locator: &str,
        limit: Duration,
        use_subprocess: bool,
    ) -> RegistryResult<PlannerModule> {
        let started = Instant::now();
        let result = self.import(locator, limit, use_subprocess).await;
        match &result {
            Ok(module) => debug!(
                target: "registry.sandbox",
                locator,
                planner = %module.manifest.name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "candidate validated"
            ),
            Err(err) => warn!(
                target: "registry.sandbox",
                locator,
                kind = %err.kind(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "candidate rejected: {err}"
            ),
        }
        result
    }

    /// Best-effort variant: any failure yields `fallback`.
    pub async fn safe_import(
        &self,
        locator: &str,
        limit: Duration,
        use_subprocess: bool,
        fallback: Option<PlannerModule>,
    ) -> Option<PlannerModule> {
        match self.import_in_sandbox(locator, limit, use_subprocess).await {
            Ok(module) => Some(module),
            Err(_) => fallback,
        }
    }

    async fn import(&self, locator: &str, limit: Duration, use_subprocess: bool) -> RegistryResult<PlannerModule> {
        let deadline = TokioInstant::now() + limit;
        let expired = |name: String| RegistryError::SandboxTimeout {
            name,
            timeout_s: limit.as_secs_f64(),
        };

        let (manifest, digest) = timeout_at(deadline, self.load_manifest(locator))
            .await
            .map_err(|_| expired(candidate_name(locator)))??;
        if use_subprocess && !manifest.probe.is_empty() {
            timeout_at(deadline, self.probe(&manifest))
                .await
                .map_err(|_| expired(manifest.name.clone()))??;
        }
        let factory = self
            .catalog
            .resolve(&manifest.entrypoint)
            .ok_or_else(|| RegistryError::SandboxImportError {
                name: manifest.name.clone(),
                cause: format!("unknown entrypoint {}", manifest.entrypoint),
            })?;
        Ok(PlannerModule {
            locator: locator.to_string(),
            manifest,
            fingerprint: digest,
            factory,
        })
    }

    async fn load_manifest(&self, locator: &str) -> RegistryResult<(PlannerManifest, Option<String>)> {
        let name = candidate_name(locator);
        let import_error = |cause: String| RegistryError::SandboxImportError {
            name: name.clone(),
            cause,
        };

        if locator.starts_with(BUILTIN_PREFIX) {
            let manifest = self
                .catalog
                .resolve(locator)
                .and_then(|factory| factory.default_manifest())
                .ok_or_else(|| import_error(format!("no builtin planner registered as {locator}")))?
                .validated()
                .map_err(|err| import_error(err.to_string()))?;
            let digest = serde_json::to_vec(&manifest)
                .ok()
                .map(|bytes| fingerprint(&bytes));
            return Ok((manifest, digest));
        }

        let source = tokio::fs::read_to_string(locator)
            .await
            .map_err(|err| import_error(format!("cannot read manifest: {err}")))?;
        let manifest =
            PlannerManifest::parse(&source).map_err(|err| import_error(err.to_string()))?;
        Ok((manifest, Some(fingerprint(source.as_bytes()))))
    }

    async fn probe(&self, manifest: &PlannerManifest) -> RegistryResult<()> {
        let (program, args) = manifest
            .probe
            .split_first()
            .ok_or_else(|| RegistryError::SandboxImportError {
                name: manifest.name.clone(),
                cause: "empty probe command".into(),
            })?;
        let status = self
            .launcher
            .run(Path::new(program), args)
            .await
            .map_err(|err| RegistryError::SandboxImportError {
                name: manifest.name.clone(),
                cause: format!("failed to spawn probe {program}: {err}"),
            })?;
        if !status.success() {
            return Err(RegistryError::SandboxImportError {
                name: manifest.name.clone(),
                cause: format!("probe exited with status {:?}", status.code()),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for SandboxLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxLoader")
            .field("catalog", &self.catalog)
            .finish()
    }
}

/// Name used for a candidate before its manifest is known.
pub fn candidate_name(locator: &str) -> String {
    if let Some(entrypoint) = locator.strip_prefix(BUILTIN_PREFIX) {
        return entrypoint.to_string();
    }
    Path::new(locator)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| locator.to_string())
}
