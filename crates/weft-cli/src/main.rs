mod config;
mod workflow_file;

use clap::{Parser, Subcommand};
use config::{WeftConfig, DEFAULT_CONFIG_PATH};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use weft_cache::Cache;
use weft_orchestrator::{
    CheckpointStore, FileCheckpointStore, ProgressTracker, Scheduler, SystemProbe, WorkflowRunner,
    WorkflowStatus,
};
use weft_workers::Coordinator;
use workflow_file::WorkflowFile;

#[derive(Parser)]
#[command(name = "weft", about = "Weft — workflow orchestration runtime", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every configured worker and supervise them until Ctrl-C
    Workers,
    /// Run a workflow file
    Run {
        /// Workflow TOML file
        file: PathBuf,
        /// Skip steps completed by a previous run of the same workflow
        #[arg(long)]
        resume: bool,
    },
    /// Inspect stored checkpoints
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Inspect or clear the cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List workflows that have a checkpoint
    List,
    /// Print one checkpoint as JSON
    Show { workflow_id: String },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Print entry counts and sizes per tier
    Stats,
    /// Remove every entry from every tier
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = WeftConfig::load(&cli.config).await?;

    match cli.command {
        Commands::Workers => serve_workers(&config).await?,
        Commands::Run { file, resume } => run_workflow(&config, file, resume).await?,
        Commands::Checkpoints { action } => {
            let store = FileCheckpointStore::new(config.checkpoint_dir()).await?;
            match action {
                CheckpointAction::List => {
                    let ids = store.list().await?;
                    if ids.is_empty() {
                        println!("No checkpoints in {}", store.dir().display());
                    }
                    for id in ids {
                        if let Some(checkpoint) = store.load(&id).await? {
                            println!(
                                "{id}  {:.1}%  {} step(s) done  {} error(s)  saved {}",
                                checkpoint.overall_progress,
                                checkpoint.completed_steps.len(),
                                checkpoint.errors.len(),
                                checkpoint.timestamp.to_rfc3339()
                            );
                        }
                    }
                }
                CheckpointAction::Show { workflow_id } => match store.load(&workflow_id).await? {
                    Some(checkpoint) => println!("{}", serde_json::to_string_pretty(&checkpoint)?),
                    None => anyhow::bail!("No checkpoint for workflow '{workflow_id}'"),
                },
            }
        }
        Commands::Cache { action } => {
            let cache = Cache::open(config.cache.clone()).await?;
            match action {
                CacheAction::Stats => {
                    println!("{}", serde_json::to_string_pretty(&cache.stats().await)?);
                }
                CacheAction::Clear => {
                    cache.clear().await;
                    println!("Cache cleared");
                }
            }
        }
    }

    Ok(())
}

async fn serve_workers(config: &WeftConfig) -> anyhow::Result<()> {
    let coordinator = Arc::new(Coordinator::new(config.coordinator_config())?);
    if coordinator.worker_names().is_empty() {
        println!("No workers configured.");
        println!("Declare workers in weft.toml under [[workers]]");
        return Ok(());
    }

    for (name, result) in coordinator.start_all().await {
        match result {
            Ok(port) => info!(worker = %name, port, "Worker ready"),
            Err(e) => warn!(worker = %name, error = %e, "Worker failed to start"),
        }
    }
    coordinator.start_health_loop();

    let mut optimize = tokio::time::interval(config.coordinator.health_check_interval());
    optimize.tick().await;
    loop {
        tokio::select! {
            _ = optimize.tick() => {
                for action in coordinator.optimize_resources().await {
                    info!(worker = %action.worker, kind = ?action.kind, detail = %action.detail, "Resource optimization");
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                break;
            }
        }
    }

    coordinator.shutdown().await;
    Ok(())
}

async fn run_workflow(config: &WeftConfig, file: PathBuf, resume: bool) -> anyhow::Result<()> {
    let definition = WorkflowFile::load(&file).await?.into_definition();

    let cache = Arc::new(Cache::open(config.cache.clone()).await?);
    cache.start_sweeper();

    let scheduler = Arc::new(Scheduler::new(config.scheduler.clone()).with_cache(Arc::clone(&cache)));
    if config.scheduler.adaptive {
        scheduler.start_adaptive_scaling(
            Arc::new(SystemProbe::default()),
            config.scheduler.adaptive_interval(),
        );
    }

    let store = FileCheckpointStore::new(config.checkpoint_dir()).await?;
    let tracker = Arc::new(ProgressTracker::new(config.tracker.clone(), Arc::new(store)));
    tracker.start_bottleneck_analysis();

    // steps that name a worker get restarts served by a live coordinator
    let coordinator = if config.coordinator_config().workers.is_empty() {
        None
    } else {
        let coordinator = Arc::new(Coordinator::new(config.coordinator_config())?);
        for (name, result) in coordinator.start_all().await {
            if let Err(e) = result {
                warn!(worker = %name, error = %e, "Worker failed to start");
            }
        }
        coordinator.start_health_loop();
        coordinator.serve_restart_requests(tracker.subscribe_restart_requests());
        Some(coordinator)
    };

    let runner = WorkflowRunner::new(
        Arc::clone(&scheduler),
        Arc::clone(&tracker),
        Some(Arc::clone(&cache)),
    );
    let result = if resume {
        runner.resume(definition).await
    } else {
        runner.run(definition).await
    };

    scheduler.shutdown();
    tracker.shutdown();
    cache.shutdown();
    if let Some(coordinator) = coordinator {
        coordinator.shutdown().await;
    }

    let snapshot = result?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    if snapshot.status != WorkflowStatus::Completed {
        anyhow::bail!("Workflow '{}' finished {}", snapshot.id, snapshot.status);
    }
    Ok(())
}
