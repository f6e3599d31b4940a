//! Cadenza CLI, the main entry point.
//!
//! Commands:
//! - `run`    Start the runtime and drive it with JSON lines on stdin
//! - `check`  Validate a configuration against the built-in operations
//! - `init`   Write a default configuration file

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "cadenza",
    about = "Cadenza: job-driven AI response pipeline runtime",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding named configuration files
    #[arg(long, global = true, env = "CADENZA_CONFIG_DIR", default_value = "configs")]
    config_dir: PathBuf,

    /// Named configuration to load from the config directory
    #[arg(short, long, global = true, env = "CADENZA_CONFIG")]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the runtime: jobs are read from stdin, events written to stdout
    Run,

    /// Validate the configuration and list available operations
    Check,

    /// Write a default configuration to the config directory
    Init {
        /// Name of the file to write
        #[arg(default_value = "default")]
        name: String,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the event stream.
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run => {
            let config = commands::load_config(&cli.config_dir, cli.config.as_deref())?;
            commands::run::run(config).await?
        }
        Commands::Check => {
            let config = commands::load_config(&cli.config_dir, cli.config.as_deref())?;
            commands::check::run(&config)?
        }
        Commands::Init { name, force } => commands::init::run(&cli.config_dir, &name, force)?,
    }

    Ok(())
}
