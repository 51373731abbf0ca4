use std::io::{self, Write};
use std::path::PathBuf;

use chrono::SecondsFormat;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use stratum_core::{
    load_factory_config, DiscoveryReport, FactoryConfig, HealReport, HealthReport, Plan,
    PlanContext, PlannerRegistry, PlannerStats, PlannerSummary, RankedPlanner, SelectionRequest,
};
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] stratum_core::ConfigError),
    #[error("registry error: {0}")]
    Registry(#[from] stratum_core::RegistryError),
    #[error("planning error: {0}")]
    Planning(#[from] stratum_core::PlanningError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("unhealthy: {active} active planners, {min_required} required")]
    Unhealthy { active: usize, min_required: usize },
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Planner registry control interface", long_about = None)]
pub struct Cli {
    /// Factory configuration file (TOML); defaults to FACTORY_* environment variables
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Directory scanned for planner manifests
    #[arg(long)]
    pub planner_dir: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Log registry activity to stderr
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate every candidate and rebuild the registry
    Discover(DiscoverArgs),
    /// List discovered planners
    List(ListArgs),
    /// Rank planners for an objective and pick the best one
    Select(SelectArgs),
    /// Re-validate quarantined planners
    Heal,
    /// Counts, quarantine causes and telemetry
    Stats,
    /// Fail unless enough planners are active
    Health(HealthArgs),
    /// Print shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct DiscoverArgs {
    /// Rediscover even when records already exist
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Include quarantined planners
    #[arg(long, default_value_t = false)]
    pub all: bool,
}

#[derive(Args, Debug)]
pub struct SelectArgs {
    /// Objective to plan for
    #[arg(long)]
    pub objective: String,
    /// Required capability (repeatable)
    #[arg(long = "capability", value_name = "TAG")]
    pub capabilities: Vec<String>,
    /// Prefer production-ready planners with equal coverage
    #[arg(long, default_value_t = false)]
    pub prefer_production: bool,
    /// Instantiate the winner
    #[arg(long, default_value_t = false)]
    pub instantiate: bool,
    /// Instantiate the winner and print its plan for the objective
    #[arg(long, default_value_t = false)]
    pub plan: bool,
}

#[derive(Args, Debug)]
pub struct HealthArgs {
    /// Minimum number of active planners
    #[arg(long, default_value_t = 1)]
    pub min: usize,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    #[arg(value_enum)]
    pub shell: Shell,
}

/// Installs the stderr log subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

pub async fn run(cli: Cli) -> Result<()> {
    let mut stdout = io::stdout();
    run_with(&cli, &mut stdout).await
}

/// Executes `cli`, writing the rendered result to `out`.
pub async fn run_with<W: Write>(cli: &Cli, out: &mut W) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        clap_complete::generate(args.shell, &mut Cli::command(), "stratumctl", out);
        return Ok(());
    }

    let registry = build_registry(cli)?;
    match &cli.command {
        Commands::Discover(args) => {
            let report = registry.discover(args.force).await?;
            render(out, &report, cli.format)?;
        }
        Commands::List(args) => {
            let planners = registry.list_planners(args.all).await?;
            render(out, &planners, cli.format)?;
        }
        Commands::Select(args) => {
            let outcome = select(&registry, args).await?;
            render(out, &outcome, cli.format)?;
        }
        Commands::Heal => {
            registry.discover(false).await?;
            let report = registry.self_heal().await?;
            render(out, &report, cli.format)?;
        }
        Commands::Stats => {
            registry.discover(false).await?;
            let stats = registry.planner_stats().await?;
            render(out, &stats, cli.format)?;
        }
        Commands::Health(args) => {
            registry.discover(false).await?;
            let report = registry.health_check(args.min).await?;
            render(out, &report, cli.format)?;
            if !report.healthy {
                return Err(AppError::Unhealthy {
                    active: report.active,
                    min_required: report.min_required,
                });
            }
        }
        Commands::Completions(_) => {}
    }
    Ok(())
}

fn build_registry(cli: &Cli) -> Result<PlannerRegistry> {
    let mut config = match &cli.config {
        Some(path) => load_factory_config(path)?,
        None => FactoryConfig::from_env(),
    };
    if let Some(dir) = &cli.planner_dir {
        config = config.with_planner_dir(dir);
    }
    info!(target: "stratumctl", config = ?config.to_map(), "registry configured");
    Ok(PlannerRegistry::new(config))
}

#[derive(Debug, Serialize)]
struct SelectOutcome {
    planner: String,
    score: f64,
    instantiated: bool,
    ranked: Vec<RankedPlanner>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plan: Option<Plan>,
}

async fn select(registry: &PlannerRegistry, args: &SelectArgs) -> Result<SelectOutcome> {
    let request = SelectionRequest::new(args.objective.clone())
        .with_capabilities(&args.capabilities)
        .prefer_production(args.prefer_production)
        .auto_instantiate(args.instantiate || args.plan);
    let selection = registry.select_best_planner(&request).await?;

    let plan = match (&selection.instance, args.plan) {
        (Some(planner), true) => {
            debug!(target: "stratumctl", planner = %selection.name, "running planner");
            Some(planner.plan(&args.objective, &PlanContext::default()).await?)
        }
        _ => None,
    };
    Ok(SelectOutcome {
        planner: selection.name,
        score: selection.score,
        instantiated: selection.instance.is_some(),
        ranked: selection.ranked,
        plan,
    })
}

fn render<W, T>(out: &mut W, value: &T, format: OutputFormat) -> Result<()>
where
    W: Write,
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => writeln!(out, "{}", value.display())?,
        OutputFormat::Json => writeln!(out, "{}", serde_json::to_string_pretty(value)?)?,
    }
    Ok(())
}

trait DisplayFallback {
    fn display(&self) -> String;
}

impl DisplayFallback for DiscoveryReport {
    fn display(&self) -> String {
        if self.skipped {
            return "discovery skipped, registry already populated".to_string();
        }
        format!(
            "active: {}\nquarantined: {}",
            list_or_dash(&self.active),
            list_or_dash(&self.quarantined)
        )
    }
}

impl DisplayFallback for Vec<PlannerSummary> {
    fn display(&self) -> String {
        if self.is_empty() {
            return "no planners".to_string();
        }
        let mut lines = Vec::new();
        for planner in self {
            let capabilities: Vec<&str> = planner.capabilities.iter().map(String::as_str).collect();
            let mut line = format!(
                "{} | {} | tier={} | reliability={:.2} | caps={} | checked={}",
                planner.name,
                planner.status,
                planner.tier,
                planner.reliability_score,
                if capabilities.is_empty() {
                    "-".to_string()
                } else {
                    capabilities.join(",")
                },
                planner
                    .last_checked_at
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
            );
            if planner.production_ready {
                line.push_str(" | production");
            }
            if let Some(cause) = &planner.last_error {
                line.push_str(&format!(" | error={cause}"));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

impl DisplayFallback for SelectOutcome {
    fn display(&self) -> String {
        let mut lines = vec![format!("selected {} (score {:.3})", self.planner, self.score)];
        for (position, entry) in self.ranked.iter().enumerate() {
            lines.push(format!(
                "  {}. {} score={:.3} match={:.2}",
                position + 1,
                entry.name,
                entry.score,
                entry.match_ratio
            ));
        }
        if let Some(plan) = &self.plan {
            lines.push("plan:".to_string());
            for step in &plan.steps {
                let depends = if step.depends_on.is_empty() {
                    String::new()
                } else {
                    let indices: Vec<String> =
                        step.depends_on.iter().map(ToString::to_string).collect();
                    format!(" (after {})", indices.join(","))
                };
                lines.push(format!("  [{}] {}{}", step.index, step.description, depends));
            }
        }
        lines.join("\n")
    }
}

impl DisplayFallback for HealReport {
    fn display(&self) -> String {
        format!(
            "recovered: {}\nstill quarantined: {}",
            list_or_dash(&self.recovered),
            list_or_dash(&self.still_quarantined)
        )
    }
}

impl DisplayFallback for PlannerStats {
    fn display(&self) -> String {
        let mut lines = vec![format!("planners: {}", self.total)];
        for (status, count) in &self.by_status {
            lines.push(format!("  status {status}: {count}"));
        }
        for (tier, count) in &self.by_tier {
            lines.push(format!("  tier {tier}: {count}"));
        }
        for (name, cause) in &self.quarantine_causes {
            lines.push(format!("  quarantined {name}: {cause}"));
        }
        lines.push(format!(
            "selections: {} ({} failed), instantiations: {} ({} failed)",
            self.telemetry.selections_total,
            self.telemetry.selection_failures,
            self.telemetry.instantiations_total,
            self.telemetry.instantiation_failures
        ));
        lines.join("\n")
    }
}

impl DisplayFallback for HealthReport {
    fn display(&self) -> String {
        format!(
            "[{}] {} active, {} quarantined, {} required",
            if self.healthy { "ok" } else { "fail" },
            self.active,
            self.quarantined,
            self.min_required
        )
    }
}

fn list_or_dash(names: &[String]) -> String {
    if names.is_empty() {
        "-".to_string()
    } else {
        names.join(", ")
    }
}
