//! Configuration view and validation commands: `cardsync config`.

use anyhow::{Context, Result};

use super::super::ConfigCommands;
use cardsync::config::CardsyncConfig;

pub fn cmd_config(config: &CardsyncConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No cardsync.toml found at {}", config_path.display());
                println!("Using defaults. Run 'cardsync config init' to create one.");
            }
            println!();
            println!("Effective values (with env overrides):");
            println!();
            let rendered =
                toml::to_string_pretty(&config.toml).context("Failed to render configuration")?;
            println!("{}", rendered);
            println!("Resolved paths:");
            println!("  database = {}", config.db_path().display());
            println!("  blobs    = {}", config.blob_dir().display());
            if let Some(dir) = config.log_dir() {
                println!("  logs     = {}", dir.display());
            }
        }
        Some(ConfigCommands::Validate) => {
            if !config_path.exists() {
                println!("No cardsync.toml found. Using defaults.");
            }
            let warnings = config.toml.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if config.write_default()? {
                println!("Created cardsync.toml at {}", config_path.display());
                println!();
                println!("You can now customize:");
                println!("  - [sync] reconcile mode and retry policies");
                println!("  - [autosave] debounce window");
                println!("  - [uploads] allowed types, size limit and signing secret");
            } else {
                println!("cardsync.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
            }
        }
    }

    Ok(())
}
