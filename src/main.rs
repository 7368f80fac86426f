use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use cardsync::config::{CardsyncConfig, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "cardsync")]
#[command(version, about = "Optimistic, realtime-synced kanban store")]
pub struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log format: text or json. Overrides cardsync.toml.
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .cardsync/, a default config, and the provisioned database
    Init,
    /// Run the reference backend (REST + websocket change feed)
    Serve {
        /// Port to listen on. Overrides config and CARDSYNC_PORT.
        #[arg(short, long)]
        port: Option<u16>,
        /// Database path. Overrides config and CARDSYNC_DB_PATH.
        #[arg(long)]
        db_path: Option<PathBuf>,
        /// Bind to all interfaces and allow any CORS origin
        #[arg(long)]
        dev: bool,
    },
    /// Show, validate or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default cardsync.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = CardsyncConfig::new(project_dir)?;

    let format = cli.log_format.unwrap_or(config.toml.logging.format);
    let log_dir = config.log_dir();
    let _guard = cardsync::logging::init(
        &config.toml.logging,
        format,
        cli.verbose,
        log_dir.as_deref(),
    )?;

    match &cli.command {
        Commands::Init => cmd::cmd_init(&config)?,
        Commands::Serve { port, db_path, dev } => {
            cmd::cmd_serve(&config, *port, db_path.clone(), *dev).await?
        }
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
