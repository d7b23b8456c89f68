//! Exposes the command line application.
use std::path::{Path, PathBuf};

use aki_launcher_service::config::Config;
use aki_launcher_service::metrics;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::cache;
use crate::launch;
use crate::logging;

/// Launcher commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Start the local game server and stream its output until interrupted.
    Server {
        /// Arguments passed on to the server.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Launch the game client and wait for it to exit.
    Client {
        /// Arguments passed on to the client.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Inspect and clean the launcher caches.
    #[command(subcommand)]
    Cache(CacheCommand),
}

/// Cache maintenance commands.
#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// List the keys of all cached entries.
    List {
        /// Only list keys starting with this prefix.
        #[arg(long, default_value = "")]
        prefix: String,
    },

    /// Remove cached entries.
    Clear {
        /// Only remove keys starting with this prefix.
        #[arg(long, default_value = "")]
        prefix: String,
    },

    /// Evict expired entries and delete orphaned payloads.
    Sweep,
}

/// Command line interface parser.
#[derive(Parser, Debug)]
#[command(name = "aki-launcher", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    logging::init_logging(&config);
    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        );
    }

    match cli.command {
        Command::Server { args } => launch::run_server(config, args).context("failed to run the server")?,
        Command::Client { args } => launch::run_client(config, args).context("failed to run the client")?,
        Command::Cache(command) => cache::execute(config, command).context("failed to maintain caches")?,
    }

    Ok(())
}
