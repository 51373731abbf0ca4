use std::collections::BTreeSet;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::manifest::{PlannerManifest, MAX_PLANNER_TIMEOUT_S};
use super::{Plan, PlanContext, PlanStep, Planner, PlannerFactory, PlanningError, PlanningResult};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct CommandRequest<'a> {
    planner: &'a str,
    objective: &'a str,
    context: &'a PlanContext,
}

#[derive(Debug, Deserialize)]
struct CommandResponse {
    steps: Vec<ResponseStep>,
    #[serde(default)]
    metadata: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ResponseStep {
    Text(String),
    Detailed {
        description: String,
        #[serde(default)]
        depends_on: Vec<usize>,
    },
}

/// Out-of-process planner: the request goes to stdin as JSON, the plan comes
/// back on stdout as JSON.
#[derive(Debug, Clone)]
pub struct CommandPlanner {
    name: String,
    capabilities: BTreeSet<String>,
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandPlanner {
    pub fn new(
        name: impl Into<String>,
        capabilities: BTreeSet<String>,
        argv: Vec<String>,
        timeout: Duration,
    ) -> PlanningResult<Self> {
        if argv.is_empty() {
            return Err(PlanningError::Configuration(
                "command planner requires a non-empty command".into(),
            ));
        }
        Ok(Self {
            name: name.into(),
            capabilities,
            argv,
            timeout,
        })
    }

    /// Feeds the request and collects the output under one deadline. Expiry
    /// drops the child, which kills it.
    async fn run(&self, payload: Vec<u8>) -> PlanningResult<Vec<u8>> {
        let mut child = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take();
        let exchange = async move {
            let feed = async {
                if let Some(mut stdin) = stdin {
                    stdin.write_all(&payload).await?;
                    stdin.shutdown().await?;
                }
                Ok::<(), io::Error>(())
            };
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            let output = output?;
            match fed {
                // the exit status decides for a child that stopped reading
                Err(err) if err.kind() != io::ErrorKind::BrokenPipe => Err(err),
                _ => Ok(output),
            }
        };

        let output = match timeout(self.timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(PlanningError::Timeout {
                    after_s: self.timeout.as_secs_f64(),
                })
            }
        };
        if !output.status.success() {
            return Err(PlanningError::Process {
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl Planner for CommandPlanner {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> BTreeSet<String> {
        self.capabilities.clone()
    }

    async fn plan(&self, objective: &str, context: &PlanContext) -> PlanningResult<Plan> {
        if objective.trim().is_empty() {
            return Err(PlanningError::EmptyObjective);
        }
        let payload = serde_json::to_vec(&CommandRequest {
            planner: &self.name,
            objective,
            context,
        })?;
        debug!(target: "planner.command", planner = %self.name, program = %self.argv[0], "invoking planner process");
        let stdout = self.run(payload).await?;
        let response: CommandResponse = serde_json::from_slice(&stdout)?;

        let mut plan = Plan::new(&self.name, objective);
        plan.steps = response
            .steps
            .into_iter()
            .enumerate()
            .map(|(index, step)| match step {
                ResponseStep::Text(description) => PlanStep {
                    index,
                    description,
                    depends_on: Vec::new(),
                },
                ResponseStep::Detailed {
                    description,
                    depends_on,
                } => PlanStep {
                    index,
                    description,
                    depends_on: depends_on.into_iter().filter(|dep| *dep < index).collect(),
                },
            })
            .collect();
        plan.metadata = response.metadata;
        Ok(plan)
    }
}

pub(crate) struct CommandFactory;

impl PlannerFactory for CommandFactory {
    fn instantiate(&self, manifest: &PlannerManifest) -> PlanningResult<Arc<dyn Planner>> {
        let timeout = manifest
            .timeout_s
            .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
            .and_then(|seconds| Duration::try_from_secs_f64(seconds.min(MAX_PLANNER_TIMEOUT_S)).ok())
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT);
        let planner = CommandPlanner::new(
            manifest.name.clone(),
            manifest.capabilities.clone(),
            manifest.command.clone(),
            timeout,
        )?;
        Ok(Arc::new(planner))
    }
}
