//! CLI command definitions for fleetsched.
//!
//! `run` starts a scheduler with demo agents from a YAML manifest, the other
//! commands are operational tools against a live store.

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::{AgentExecution, Interval, PriorityScheduler, StaticIntervals};
use crate::store::{MemoryStore, RedisStore, SchedulerStore};
use async_trait::async_trait;
use clap::Parser;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Default Redis URL when neither `--redis-url` nor `REDIS_URL` is set.
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Cluster-coordinated scheduler for periodic caching agents.
#[derive(Parser)]
#[command(name = "fleetsched")]
#[command(about = "Cluster-coordinated scheduler for periodic caching agents")]
#[command(version)]
#[command(
    long_about = "fleetsched runs periodic agents across a fleet of identical processes, coordinated through Redis sorted sets.\n\nExample usage:\n  fleetsched run --agents agents.yaml --redis-url redis://localhost:6379\n  fleetsched inspect prices quotes"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the scheduler until Ctrl-C.
    Run(RunArgs),

    /// Show the waiting and working scores of agent types.
    Inspect(InspectArgs),

    /// Release the orphan-cleanup leadership key if held by the given owner.
    ReleaseLeadership(ReleaseLeadershipArgs),

    /// Print the effective configuration after file and environment overrides.
    CheckConfig(CheckConfigArgs),
}

/// Store and configuration options shared by every command.
#[derive(Parser, Debug, Clone)]
pub struct StoreArgs {
    /// YAML configuration file. Without it, defaults plus SCHEDULER_* variables apply.
    #[arg(short = 'c', long)]
    pub config: Option<String>,

    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Use an in-process store instead of Redis.
    #[arg(long)]
    pub in_memory: bool,
}

/// Arguments for `fleetsched run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// YAML manifest of demo agents.
    #[arg(short = 'a', long)]
    pub agents: String,

    /// Print Prometheus metrics on exit.
    #[arg(long)]
    pub print_metrics: bool,
}

/// Arguments for `fleetsched inspect`.
#[derive(Parser, Debug)]
pub struct InspectArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Agent types to look up.
    #[arg(required = true)]
    pub agent_types: Vec<String>,
}

/// Arguments for `fleetsched release-leadership`.
#[derive(Parser, Debug)]
pub struct ReleaseLeadershipArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Owner id that must currently hold the key.
    #[arg(long)]
    pub owner: String,
}

/// Arguments for `fleetsched check-config`.
#[derive(Parser, Debug)]
pub struct CheckConfigArgs {
    /// YAML configuration file.
    #[arg(short = 'c', long)]
    pub config: Option<String>,
}

/// One agent in the demo manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_interval_ms")]
    pub error_interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Simulated work per run.
    #[serde(default)]
    pub work_ms: u64,
    /// Probability in [0, 1] that a run fails.
    #[serde(default)]
    pub failure_rate: f64,
}

fn default_interval_ms() -> u64 {
    60_000
}

fn default_timeout_ms() -> u64 {
    300_000
}

/// Demo agent manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentManifest {
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
}

impl AgentManifest {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read agent manifest {}: {}", path.display(), e))?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
        let manifest: AgentManifest = serde_yaml::from_str(contents)?;
        for spec in &manifest.agents {
            if spec.name.trim().is_empty() {
                return Err(anyhow::anyhow!("Agent manifest contains an empty name"));
            }
            if !(0.0..=1.0).contains(&spec.failure_rate) {
                return Err(anyhow::anyhow!(
                    "Agent {} has failure_rate {} outside [0, 1]",
                    spec.name,
                    spec.failure_rate
                ));
            }
        }
        Ok(manifest)
    }

    /// Interval table for the manifest's agents.
    pub fn intervals(&self) -> StaticIntervals {
        self.agents
            .iter()
            .fold(StaticIntervals::default(), |table, spec| {
                table.with_agent(
                    spec.name.clone(),
                    Interval::new(spec.interval_ms, spec.error_interval_ms, spec.timeout_ms),
                )
            })
    }
}

/// Agent that sleeps and fails at a configured rate.
#[derive(Debug, Clone)]
pub struct DemoAgent {
    work: Duration,
    failure_rate: f64,
}

impl DemoAgent {
    pub fn new(spec: &AgentSpec) -> Self {
        Self {
            work: Duration::from_millis(spec.work_ms),
            failure_rate: spec.failure_rate.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl AgentExecution for DemoAgent {
    async fn execute(&self, agent_type: &str) -> anyhow::Result<()> {
        tokio::time::sleep(self.work).await;
        if rand::rng().random_bool(self.failure_rate) {
            return Err(anyhow::anyhow!("simulated failure in {}", agent_type));
        }
        Ok(())
    }
}

/// Parse command-line arguments and return the CLI structure.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_scheduler_command(args).await,
        Commands::Inspect(args) => run_inspect_command(args).await,
        Commands::ReleaseLeadership(args) => run_release_leadership_command(args).await,
        Commands::CheckConfig(args) => run_check_config_command(args),
    }
}

fn load_config(path: Option<&str>) -> anyhow::Result<SchedulerConfig> {
    let config = match path {
        Some(path) => SchedulerConfig::from_file(path)?,
        None => SchedulerConfig::from_env()?,
    };
    Ok(config)
}

async fn open_store(
    args: &StoreArgs,
    config: &SchedulerConfig,
) -> anyhow::Result<Arc<dyn SchedulerStore>> {
    let store: Arc<dyn SchedulerStore> = if args.in_memory {
        info!("Using in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        info!(redis_url = %args.redis_url, "Connecting to Redis");
        Arc::new(RedisStore::connect(&args.redis_url, &config.keys).await?)
    };
    Ok(store)
}

async fn run_scheduler_command(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(args.store.config.as_deref())?;
    let manifest = AgentManifest::from_file(&args.agents)?;
    if manifest.agents.is_empty() {
        warn!(manifest = %args.agents, "Agent manifest is empty");
    }
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }

    let shutdown_timeout = config.shutdown_timeout();
    let store = open_store(&args.store, &config).await?;
    let scheduler = PriorityScheduler::builder(store, config)
        .with_intervals(Arc::new(manifest.intervals()))
        .build();

    scheduler.initialize().await?;
    for spec in &manifest.agents {
        let outcome = scheduler
            .register_agent(&spec.name, Arc::new(DemoAgent::new(spec)))
            .await;
        info!(agent_type = %spec.name, ?outcome, "Registered agent");
    }

    scheduler.start()?;
    info!(agents = manifest.agents.len(), "Scheduler running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C");

    let report = scheduler.shutdown().await?;
    println!("{}", serde_json::to_string_pretty(&scheduler.stats())?);
    if args.print_metrics {
        print!("{}", export_metrics());
    }

    if !report.drained {
        return Err(SchedulerError::ShutdownTimeout(shutdown_timeout).into());
    }
    Ok(())
}

async fn run_inspect_command(args: InspectArgs) -> anyhow::Result<()> {
    let config = load_config(args.store.config.as_deref())?;
    let store = open_store(&args.store, &config).await?;
    store.initialize().await?;

    let scores = store.score_agents(&args.agent_types).await?;
    let owner = store.leadership_owner().await?;

    #[derive(Serialize)]
    struct InspectOutput {
        leadership_owner: Option<String>,
        agents: Vec<crate::store::AgentScores>,
    }

    let output = InspectOutput {
        leadership_owner: owner,
        agents: scores,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_release_leadership_command(args: ReleaseLeadershipArgs) -> anyhow::Result<()> {
    let config = load_config(args.store.config.as_deref())?;
    let store = open_store(&args.store, &config).await?;
    store.initialize().await?;

    if store.release_leadership(&args.owner).await? {
        info!(owner = %args.owner, "Leadership released");
        Ok(())
    } else {
        let current = store.leadership_owner().await?;
        Err(anyhow::anyhow!(
            "Leadership not held by {} (current owner: {})",
            args.owner,
            current.as_deref().unwrap_or("none")
        ))
    }
}

fn run_check_config_command(args: CheckConfigArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::IntervalProvider;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "fleetsched",
            "run",
            "--agents",
            "agents.yaml",
            "--in-memory",
            "--log-level",
            "debug",
        ])
        .expect("parse");
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.agents, "agents.yaml");
                assert!(args.store.in_memory);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_inspect_requires_agents() {
        assert!(Cli::try_parse_from(["fleetsched", "inspect"]).is_err());
    }

    #[test]
    fn test_manifest_parsing() {
        let yaml = r#"
agents:
  - name: prices
    interval_ms: 1000
    error_interval_ms: 5000
    timeout_ms: 30000
    work_ms: 50
    failure_rate: 0.25
  - name: quotes
"#;
        let manifest = AgentManifest::from_yaml(yaml).expect("manifest");
        assert_eq!(manifest.agents.len(), 2);
        assert_eq!(manifest.agents[1].interval_ms, 60_000);

        let intervals = manifest.intervals();
        assert_eq!(intervals.interval("prices"), Interval::new(1_000, 5_000, 30_000));
        assert_eq!(intervals.interval("quotes"), Interval::new(60_000, 60_000, 300_000));
    }

    #[test]
    fn test_manifest_rejects_bad_failure_rate() {
        let yaml = "agents:\n  - name: a\n    failure_rate: 1.5\n";
        assert!(AgentManifest::from_yaml(yaml).is_err());
    }

    fn spec(failure_rate: f64) -> AgentSpec {
        AgentSpec {
            name: "demo".to_string(),
            interval_ms: 1,
            error_interval_ms: 1,
            timeout_ms: 1,
            work_ms: 0,
            failure_rate,
        }
    }

    #[tokio::test]
    async fn test_demo_agent_outcomes() {
        assert!(DemoAgent::new(&spec(0.0)).execute("demo").await.is_ok());
        assert!(DemoAgent::new(&spec(1.0)).execute("demo").await.is_err());
    }
}
