//! Outbox relay - publishes committed outbox records to Kafka.

mod app;
mod settings;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use outbox_config_and_utils::{init_logging, Config, Paths};

/// Outbox relay command-line interface.
#[derive(Parser)]
#[command(name = "outbox-relay")]
#[command(about = "Relay committed outbox records to Kafka in order")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Config file. Defaults to ~/.outbox-relay/config.json
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Base directory for the default config and database. Defaults to ~/.outbox-relay
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay in the foreground until Ctrl-C
    Run,
    /// Show the backlog and the current lock holder
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Write one record to the outbox in its own transaction
    Enqueue {
        #[arg(short, long)]
        topic: String,
        #[arg(short, long)]
        key: Option<String>,
        #[arg(short, long)]
        payload: String,
        /// Envelope header as name=value; repeatable
        #[arg(long = "header", value_name = "NAME=VALUE")]
        headers: Vec<String>,
    },
    /// Clear the relay lock held by an owner
    ReleaseLock {
        /// Owner to release for; defaults to the configured owner, then the current holder
        #[arg(long)]
        owner: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load(&paths)?,
    };
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    config.validate()?;

    init_logging(&config.log_level, config.log_format);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => app::run_relay(&config, &paths).await?,
        Commands::Status { json } => app::check_status(&config, &paths, json).await?,
        Commands::Enqueue {
            topic,
            key,
            payload,
            headers,
        } => app::enqueue(&config, &paths, topic, key, payload, &headers).await?,
        Commands::ReleaseLock { owner } => app::release_lock(&config, &paths, owner).await?,
    }

    Ok(())
}
