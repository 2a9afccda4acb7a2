//! Command-line interface.
//!
//! Loads the site configuration, layers command-line overrides on top and
//! dispatches to the pipeline.

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use tracing::debug;

use crate::config::ProcessingConfig;
use crate::models::ProcessingStats;
use crate::processor::GhgProcessor;

#[derive(Parser, Debug)]
#[command(name = "ghg_processor")]
#[command(about = "Group, filter and batch eddy-covariance GHG archives for flux processing")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Scan, parse, group, filter and prepare batch runs
    Run(RunArgs),
    /// Build or extend the file inventory only
    Scan(RunArgs),
    /// Print the resolved configuration
    Describe(RunArgs),
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub struct RunArgs {
    /// Site configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Site identifier used in descriptor names
    #[arg(long)]
    pub site_id: Option<String>,

    /// First interval to include (YYYY-MM-DD or YYYY-MM-DD HH:MM)
    #[arg(long)]
    pub start: Option<String>,

    /// Last interval to include; a bare date includes the whole day
    #[arg(long)]
    pub end: Option<String>,

    /// Raw file directory (repeatable, replaces configured sources)
    #[arg(long = "source-dir", value_name = "DIR")]
    pub source_dirs: Vec<PathBuf>,

    /// Key of the file type to scan for
    #[arg(long)]
    pub file_type: Option<String>,

    /// Delete the metadata and output directories first
    #[arg(long)]
    pub reset: bool,

    /// Number of worker tasks
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Leave one core free for other work
    #[arg(long)]
    pub priority: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl RunArgs {
    pub fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }

    /// Configuration file values with command-line overrides applied
    pub fn resolve_config(&self) -> Result<ProcessingConfig> {
        let mut config = match &self.config {
            Some(path) => ProcessingConfig::from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => ProcessingConfig::default(),
        };

        if let Some(site_id) = &self.site_id {
            config = config.with_site_id(site_id.clone());
        }
        if self.start.is_some() || self.end.is_some() {
            let start = self.start.clone().or(config.date_range.start.clone());
            let end = self.end.clone().or(config.date_range.end.clone());
            config = config.with_date_range(start, end);
        }
        if !self.source_dirs.is_empty() {
            config = config.with_source_dirs(self.source_dirs.clone());
        }
        if let Some(file_type) = &self.file_type {
            config = config.with_file_type(file_type.clone());
        }
        if let Some(workers) = self.workers {
            config = config.with_workers(workers);
        } else if self.priority {
            config = config.with_workers(num_cpus::get().saturating_sub(1).max(1));
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

/// Set up structured logging for a run
pub fn setup_logging(args: &RunArgs) {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let log_level = args.log_level();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ghg_processor={}", log_level)));

    let result = if args.quiet {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_level(true)
                    .with_writer(std::io::stderr)
                    .compact(),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_level(true)
                    .with_timer(fmt::time::uptime())
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };
    if result.is_ok() {
        debug!("Logging initialized at level: {}", log_level);
    }
}

/// Execute one subcommand
pub async fn run(command: Commands) -> Result<Option<ProcessingStats>> {
    match command {
        Commands::Run(args) => {
            setup_logging(&args);
            let processor = GhgProcessor::new(args.resolve_config()?)?;
            if args.reset {
                processor.reset().await.context("Reset failed")?;
            }
            let stats = processor.process().await?;
            Ok(Some(stats))
        }
        Commands::Scan(args) => {
            setup_logging(&args);
            let processor = GhgProcessor::new(args.resolve_config()?)?;
            if args.reset {
                processor.reset().await.context("Reset failed")?;
            }
            let stats = processor.scan().await?;
            Ok(Some(stats))
        }
        Commands::Describe(args) => {
            let config = args.resolve_config()?;
            let text = toml::to_string_pretty(&config).context("Cannot render configuration")?;
            println!("{}", "Resolved configuration".bright_green().bold());
            println!("{}", text);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_command() {
        let args = Args::try_parse_from([
            "ghg_processor",
            "run",
            "--site-id",
            "BB",
            "--source-dir",
            "/data/a",
            "--source-dir",
            "/data/b",
            "--start",
            "2024-01-01",
            "--workers",
            "3",
            "-v",
        ])
        .unwrap();
        let Some(Commands::Run(run)) = args.command else {
            panic!("expected run");
        };
        assert_eq!(run.log_level(), "debug");

        let config = run.resolve_config().unwrap();
        assert_eq!(config.site_id, "BB");
        assert_eq!(config.workers, 3);
        assert_eq!(config.paths.source_dirs.len(), 2);
        assert_eq!(config.date_range.start.as_deref(), Some("2024-01-01"));
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Args::try_parse_from(["ghg_processor", "scan", "-v", "-q"]).is_err());
    }

    #[test]
    fn test_unknown_file_type_is_rejected() {
        let args = RunArgs {
            file_type: Some("nope".to_string()),
            ..RunArgs::default()
        };
        assert!(args.resolve_config().is_err());
    }

    #[test]
    fn test_config_file_overrides() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("site.toml");
        std::fs::write(
            &path,
            "site_id = \"AIU\"\nworkers = 2\n[paths]\nsource_dirs = [\"raw\"]\n",
        )
        .unwrap();

        let args = RunArgs {
            config: Some(path),
            workers: Some(6),
            ..RunArgs::default()
        };
        let config = args.resolve_config().unwrap();
        assert_eq!(config.site_id, "AIU");
        assert_eq!(config.workers, 6);
        assert_eq!(config.paths.source_dirs, vec![temp_dir.path().join("raw")]);
    }
}
