//! orchd CLI entry point

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tokio::sync::mpsc;
use tracing::info;

use orchd::cli::{Cli, Command, OutputFormat, log_path};
use orchd::config::Config;
use orchd::daemon::DaemonManager;
use orchd::domain::{Feature, FeatureStatus, generate_id};
use orchd::manifest;
use orchd::pool::WorkerPool;
use orchd::scheduler::Scheduler;
use orchd::state::StateManager;
use orchd::telemetry::TelemetrySink;
use orchd::worker::{CommandCapability, WorkerKind, WorkerSet};
use orchd::worktree::WorktreeManager;

fn setup_logging(verbose: bool) -> Result<()> {
    let path = log_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let log_file = fs::File::create(&path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (verbose: {})", verbose);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose).context("Failed to setup logging")?;
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Run { manifest, project } => cmd_run(&config, &manifest, project).await,
        Command::Validate { manifest } => cmd_validate(&manifest),
        Command::Status {
            project,
            detailed,
            format,
        } => cmd_status(&config, project, detailed, format).await,
        Command::Logs { follow, lines } => cmd_logs(follow, lines).await,
        Command::Stop => cmd_stop(),
    }
}

/// Load a manifest and drive the project to quiescence
async fn cmd_run(config: &Config, manifest_path: &PathBuf, project: Option<String>) -> Result<()> {
    config.validate()?;

    let manifest = manifest::load(manifest_path)?;
    let project_id = project
        .or_else(|| manifest.project.clone())
        .unwrap_or_else(|| {
            let stem = manifest_path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "project".to_string());
            generate_id("proj", &stem)
        });

    let features = manifest.instantiate(&project_id)?;
    println!(
        "Loaded {} features for project {}",
        features.len(),
        project_id.bold()
    );

    let state = StateManager::spawn(config.store_dir())?;
    for feature in features {
        if let Err(e) = state.create_feature(feature).await {
            eyre::bail!("failed to load feature into store: {}", e);
        }
    }

    let pool = Arc::new(WorkerPool::new(config.pool.capacity));
    let workers = WorkerSet::new(
        Arc::new(CommandCapability::new(WorkerKind::Coder, &config.workers.coder_command)),
        Arc::new(CommandCapability::new(
            WorkerKind::Validator,
            &config.workers.validator_command,
        )),
        Arc::new(CommandCapability::new(
            WorkerKind::Reviewer,
            &config.workers.reviewer_command,
        )),
    );
    let worktree = Arc::new(WorktreeManager::new(config.worktree.clone()));
    let telemetry = if config.telemetry.enabled {
        TelemetrySink::to_file(config.telemetry_path())
    } else {
        TelemetrySink::disabled()
    };

    let mut scheduler = Scheduler::new(
        project_id.clone(),
        config.scheduler.clone(),
        config.lifecycle.clone(),
        state.clone(),
        pool,
        workers,
        worktree,
        telemetry,
    );

    let daemon = DaemonManager::new();
    daemon.write_pid()?;

    // SIGTERM (od stop) and ctrl-c both request a graceful shutdown
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
        let _ = shutdown_tx.send(()).await;
    });

    let summary = scheduler.run(shutdown_rx).await;
    daemon.clear();
    let summary = summary?;

    println!();
    println!(
        "{} completed, {} failed, {} escalated, {} blocked",
        summary.completed.to_string().green(),
        summary.failed.to_string().red(),
        summary.escalated.to_string().yellow(),
        summary.blocked.to_string().dimmed(),
    );
    if summary.escalated > 0 {
        println!(
            "{}",
            "Escalated features hold in review with retained sandboxes; resolve and re-run.".yellow()
        );
    }

    state.shutdown().await;
    Ok(())
}

/// Validate a manifest's dependency graph without running it
fn cmd_validate(manifest_path: &PathBuf) -> Result<()> {
    let manifest = manifest::load(manifest_path)?;
    match manifest.instantiate("validate") {
        Ok(features) => {
            println!(
                "{} {} features, dependency graph is acyclic",
                "ok:".green().bold(),
                features.len()
            );
            Ok(())
        }
        Err(e) => {
            println!("{} {}", "invalid:".red().bold(), e);
            Err(e.into())
        }
    }
}

/// Show feature status
async fn cmd_status(config: &Config, project: Option<String>, detailed: bool, format: OutputFormat) -> Result<()> {
    if matches!(format, OutputFormat::Text) {
        let daemon = DaemonManager::new();
        match daemon.running_pid() {
            Some(pid) => println!("orchestrator running (pid {})", pid),
            None => println!("orchestrator not running"),
        }
    }

    let state = StateManager::spawn(config.store_dir())?;
    let features = state
        .list_features(project, None)
        .await
        .map_err(|e| eyre::eyre!("list features: {}", e))?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&features)?);
        }
        OutputFormat::Text => {
            if features.is_empty() {
                println!("No features found");
            }
            for feature in &features {
                print_feature(feature);
                if detailed {
                    let runs = state
                        .list_runs(&feature.id)
                        .await
                        .map_err(|e| eyre::eyre!("list runs: {}", e))?;
                    for run in runs {
                        println!(
                            "    {} {} ({})",
                            run.worker.dimmed(),
                            run.status,
                            run.id.dimmed()
                        );
                    }
                }
            }
        }
    }

    state.shutdown().await;
    Ok(())
}

fn print_feature(feature: &Feature) {
    let status = match feature.status {
        FeatureStatus::Completed => feature.status.to_string().green(),
        FeatureStatus::Failed => feature.status.to_string().red(),
        FeatureStatus::InProgress => feature.status.to_string().cyan(),
        FeatureStatus::Review if feature.conflict_escalated => "review (conflict)".to_string().yellow(),
        FeatureStatus::Review => feature.status.to_string().yellow(),
        FeatureStatus::Pending => feature.status.to_string().normal(),
    };

    print!(
        "{:<12} {} {}",
        status,
        feature.id.bold(),
        format!("attempt {} / iteration {}", feature.attempt, feature.iteration).dimmed()
    );
    if let Some(error) = &feature.last_error {
        print!("  {}", error.red());
    }
    println!();
}

/// Show (and optionally follow) the log file
async fn cmd_logs(follow: bool, lines: usize) -> Result<()> {
    let path = log_path();
    if !path.exists() {
        println!("No log file at {}", path.display());
        return Ok(());
    }

    let content = fs::read_to_string(&path)?;
    let all: Vec<&str> = content.lines().collect();
    for line in all.iter().skip(all.len().saturating_sub(lines)) {
        println!("{}", line);
    }

    if follow {
        let mut offset = content.len() as u64;
        loop {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            let metadata = fs::metadata(&path)?;
            if metadata.len() > offset {
                use std::io::{Read, Seek, SeekFrom};
                let mut file = fs::File::open(&path)?;
                file.seek(SeekFrom::Start(offset))?;
                let mut fresh = String::new();
                file.read_to_string(&mut fresh)?;
                print!("{}", fresh);
                offset = metadata.len();
            }
        }
    }

    Ok(())
}

/// Signal a running orchestrator to shut down
fn cmd_stop() -> Result<()> {
    let daemon = DaemonManager::new();
    if daemon.stop()? {
        println!("Shutdown requested");
    } else {
        println!("No orchestrator running");
    }
    Ok(())
}
