//! CLI command definitions

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// orchd - feature-graph build orchestrator
#[derive(Parser)]
#[command(
    name = "od",
    about = "Drives a dependency graph of features through isolated build-test-review lifecycles",
    version,
    after_help = "Logs are written to: ~/.local/share/orchd/logs/orchd.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Load a plan manifest and drive the project to quiescence
    Run {
        /// Path to the plan manifest (YAML)
        manifest: PathBuf,

        /// Project id (defaults to the manifest's project name)
        #[arg(short, long)]
        project: Option<String>,
    },

    /// Check a plan manifest's dependency graph without running anything
    Validate {
        /// Path to the plan manifest (YAML)
        manifest: PathBuf,
    },

    /// Show feature status for a project
    Status {
        /// Project id (all projects if omitted)
        #[arg(short, long)]
        project: Option<String>,

        /// Include per-feature run history
        #[arg(short, long)]
        detailed: bool,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show daemon logs
    Logs {
        /// Follow log output (like tail -f)
        #[arg(short, long)]
        follow: bool,

        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },

    /// Stop a running orchestrator
    Stop,
}

/// Output format for status
#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Path of the main log file
pub fn log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("orchd")
        .join("logs")
        .join("orchd.log")
}
