//! Config Commands

use anyhow::{bail, Result};
use clap::Subcommand;
use snapgrid_core::SchedulerConfig;
use std::path::Path;

use crate::output::{print_success, print_value, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,
}

pub fn execute(cmd: ConfigCommands, path: &Path, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            SchedulerConfig::default().save(path)?;
            print_success(&format!("Wrote {}", path.display()));
        }

        ConfigCommands::Show => {
            let config = SchedulerConfig::load(path)?;
            match format {
                OutputFormat::Json | OutputFormat::Yaml => print_value(&config, format),
                OutputFormat::Table | OutputFormat::Plain => {
                    println!("# {}", path.display());
                    print!("{}", toml::to_string_pretty(&config)?);
                }
            }
        }
    }
    Ok(())
}
