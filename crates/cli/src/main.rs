//! SnapGrid CLI - Main Entry Point
//!
//! Runs visual test suites through the session scheduler, crawls page
//! resources and manages the scheduler configuration.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod http_fetcher;
mod output;
mod suite;

use commands::{config, crawl, run};
use snapgrid_core::SchedulerConfig;

/// SnapGrid CLI - bounded-concurrency visual test sessions
#[derive(Parser)]
#[command(name = "snapgrid")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(long, env = "SNAPGRID_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a YAML suite against the simulated server
    Run(run::RunArgs),

    /// Collect the resources referenced by one or more URLs
    Crawl(crawl::CrawlArgs),

    /// Manage the configuration file
    #[command(subcommand)]
    Config(config::ConfigCommands),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let config_path = cli.config.unwrap_or_else(snapgrid_core::default_config_path);

    match cli.command {
        Commands::Run(args) => {
            let config = SchedulerConfig::load(&config_path)?;
            let passed = run::execute(args, config, cli.format).await?;
            if !passed {
                output::print_error("Some tests did not pass");
                std::process::exit(1);
            }
        }
        Commands::Crawl(args) => {
            let config = SchedulerConfig::load(&config_path)?;
            crawl::execute(args, config.crawler, cli.format).await?;
        }
        Commands::Config(cmd) => config::execute(cmd, &config_path, cli.format)?,
        Commands::Version => {
            println!("SnapGrid CLI v{}", snapgrid_core::VERSION);
        }
    }

    Ok(())
}
