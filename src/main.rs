use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use conductor::config::Config;
use conductor::manifest::GraphManifest;
use conductor::orchestration::Scheduler;
use conductor::progress::ProgressSnapshot;
use conductor::resilience::CircuitBreakerRegistry;
use conductor::Result;

/// Conductor - dependency-aware task orchestration with circuit breaking and live progress
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)\n    CONDUCTOR_LOG=<dir>   Full log filter directive, e.g. conductor=trace")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file to use instead of ~/.conductor/conductor.toml
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute a graph manifest; progress goes to stderr, the result to stdout
    Run {
        /// Path to a TOML or JSON graph manifest
        manifest: PathBuf,

        /// Maximum tasks running at once
        #[arg(long)]
        concurrency: Option<usize>,

        /// Whole-run deadline in seconds
        #[arg(long)]
        deadline: Option<u64>,

        /// Suppress progress lines
        #[arg(long, short = 'q')]
        quiet: bool,
    },

    /// Check that a manifest builds a valid graph
    Validate {
        /// Path to a TOML or JSON graph manifest
        manifest: PathBuf,
    },

    /// Show the effective configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    conductor::log::init_with_debug(cli.debug);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Run {
            manifest,
            concurrency,
            deadline,
            quiet,
        } => run_manifest(&config, &manifest, concurrency, deadline, quiet).await,
        Command::Validate { manifest } => run_validate(&manifest),
        Command::Config { init } => run_config(&config, cli.config.as_deref(), init),
    }
}

async fn run_manifest(
    config: &Config,
    path: &Path,
    concurrency: Option<usize>,
    deadline_secs: Option<u64>,
    quiet: bool,
) -> Result<ExitCode> {
    let manifest = GraphManifest::from_path(path)?;
    let mut graph = manifest.to_graph()?;

    let concurrency = concurrency
        .or(manifest.concurrency_limit)
        .unwrap_or(config.scheduler.concurrency_limit);
    let deadline = deadline_secs
        .or(manifest.deadline_secs)
        .map(std::time::Duration::from_secs)
        .unwrap_or_else(|| config.deadline());

    let progress = config.progress_config();
    let publisher = config.progress_publisher();
    let mut subscription = publisher.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(snapshot) = subscription.recv().await {
            if !quiet {
                eprintln!("{}", format_snapshot(&snapshot));
            }
        }
    });

    let scheduler = Scheduler::new(
        config.retry_policy(),
        Arc::new(CircuitBreakerRegistry::new(config.breaker_config())),
        publisher,
    )
    .with_progress_config(progress)
    .with_cancel_grace(config.cancel_grace())
    .with_merge_strategy(manifest.merge.strategy());

    let result = scheduler.execute_all(&mut graph, concurrency, deadline).await;

    // Dropping the last publisher handle ends the subscription.
    drop(scheduler);
    let _ = printer.await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(if result.is_partial {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}

fn run_validate(path: &Path) -> Result<ExitCode> {
    let manifest = GraphManifest::from_path(path)?;
    let graph = manifest.to_graph()?;
    let stages = graph.stage_weights();
    println!(
        "ok: {} tasks, {} dependencies, {} stages",
        graph.task_count(),
        graph.dependency_count(),
        stages.len()
    );
    for task in graph.topological_order()? {
        println!("  {} [{}] stage={}", task.id, task.priority, task.stage);
    }
    Ok(ExitCode::SUCCESS)
}

fn run_config(config: &Config, path: Option<&Path>, init: bool) -> Result<ExitCode> {
    if init {
        let target = match path {
            Some(path) => path.to_path_buf(),
            None => Config::config_path()?,
        };
        config.save_to(&target)?;
        eprintln!("wrote {}", target.display());
    }
    print!("{}", toml::to_string_pretty(config)?);
    Ok(ExitCode::SUCCESS)
}

fn format_snapshot(snapshot: &ProgressSnapshot) -> String {
    let stage = snapshot
        .per_stage
        .get(&snapshot.current_stage)
        .and_then(|s| s.message.as_deref())
        .map(|m| format!("{} ({})", snapshot.current_stage, m))
        .unwrap_or_else(|| snapshot.current_stage.clone());
    format!(
        "[{:>5.1}%] {:<12} {}",
        snapshot.overall_progress * 100.0,
        snapshot.status.to_string(),
        stage
    )
}
