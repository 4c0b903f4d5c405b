//! relay CLI tool.

use clap::{Args, Parser, Subcommand};
use relay_core::EventKind;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Run path-filtered CI jobs locally", long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, env = "RELAY_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow file
    Validate {
        /// Path to the workflow file
        #[arg(default_value = "relay.kdl")]
        path: PathBuf,
    },
    /// Show which jobs an event would start
    Match {
        /// Path to the workflow file
        #[arg(default_value = "relay.kdl")]
        path: PathBuf,

        #[command(flatten)]
        event: EventArgs,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the jobs an event starts, on this machine
    Run {
        /// Path to the workflow file
        #[arg(default_value = "relay.kdl")]
        path: PathBuf,

        #[command(flatten)]
        event: EventArgs,

        #[command(flatten)]
        engine: EngineArgs,

        /// Only run these jobs (if they match)
        #[arg(long = "job")]
        jobs: Vec<String>,
    },
}

/// The repository event to evaluate.
#[derive(Args, Debug, Clone)]
pub struct EventArgs {
    /// Event kind: push or pull_request
    #[arg(long, default_value = "push")]
    pub kind: EventKind,

    /// Target branch
    #[arg(long, default_value = "main")]
    pub branch: String,

    /// A changed path (repeatable)
    #[arg(long = "path")]
    pub paths: Vec<String>,

    /// Read changed paths from `git diff --name-only` output ("-" for stdin)
    #[arg(long)]
    pub diff: Option<PathBuf>,

    /// Head commit to check out
    #[arg(long)]
    pub sha: Option<String>,
}

/// Engine settings; flags override the config file.
#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// Engine configuration file
    #[arg(long, env = "RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Runner label (repeatable)
    #[arg(long = "label", env = "RELAY_LABELS", value_delimiter = ',')]
    pub labels: Vec<String>,

    /// Parent directory of run workspaces
    #[arg(long, env = "RELAY_WORKSPACE_ROOT")]
    pub workspace_root: Option<PathBuf>,

    /// Parent directory of cached resources
    #[arg(long, env = "RELAY_CACHE_ROOT")]
    pub cache_root: Option<PathBuf>,

    /// Repository cloned by checkout steps
    #[arg(long, env = "RELAY_REPOSITORY")]
    pub repository: Option<String>,

    /// Runs executing at the same time
    #[arg(long, env = "RELAY_MAX_CONCURRENT_RUNS")]
    pub max_concurrent_runs: Option<usize>,

    /// Default step timeout, e.g. 90s, 30m, 2h
    #[arg(long, env = "RELAY_STEP_TIMEOUT", value_parser = parse_timeout)]
    pub step_timeout: Option<Duration>,

    /// Keep run workspaces after the run
    #[arg(long)]
    pub keep_workspaces: bool,

    /// Report jobs the trigger filter rejected
    #[arg(long)]
    pub audit_skipped: bool,
}

fn parse_timeout(value: &str) -> Result<Duration, String> {
    relay_config::parse_duration(value).ok_or_else(|| format!("invalid duration '{}'", value))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Match { path, event, json } => {
            commands::select::show_matches(&path, &event, json)?;
        }
        Commands::Run {
            path,
            event,
            engine,
            jobs,
        } => {
            commands::run::run_local(&path, &event, &engine, &jobs).await?;
        }
    }

    Ok(())
}
