//! symon - system monitor daemon
//!
//! Samples host metrics once per second, keeps a bounded history and
//! streams every subscriber its own windowed averages over Server-Sent
//! Events.

mod client;
mod config;
mod core;
mod readers;
mod server;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::client::Show;
use crate::config::{Config, LogConfig};
use crate::core::app::App;

#[derive(Parser)]
#[command(name = "symon")]
#[command(author = "Symon Contributors")]
#[command(version)]
#[command(about = "System monitor streaming averaged host metrics", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging (overrides log.level)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "SYMON_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default)
    Serve {
        /// Address to listen on, overrides server.listen
        #[arg(short, long, env = "SYMON_LISTEN")]
        listen: Option<String>,
    },

    /// Subscribe to a running daemon and print its stats
    Client {
        /// Daemon base URL
        #[arg(short, long, default_value = "http://127.0.0.1:8000")]
        addr: String,

        /// Metric group to show
        #[arg(short, long, value_enum, default_value = "la")]
        show: Show,

        /// Send stats every N seconds
        #[arg(short, default_value = "1")]
        n: i64,

        /// Average stats over the last M seconds
        #[arg(short, default_value = "1")]
        m: i64,
    },

    /// Write a default configuration file
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

fn setup_logging(
    verbosity: u8,
    log: &LogConfig,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = match verbosity {
        0 => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&log.level))
            .with_context(|| format!("invalid log level {:?}", log.level))?,
        v => {
            let level = match v {
                1 => Level::INFO,
                2 => Level::DEBUG,
                _ => Level::TRACE,
            };
            EnvFilter::from_default_env().add_directive(level.into())
        }
    };

    match &log.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create log directory {}", dir.display()))?;

            let file_appender = tracing_appender::rolling::daily(dir, "symon.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
            Ok(None)
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let path = path.or_else(|| Config::default_path().filter(|p| p.exists()));
    match path {
        Some(path) => Config::load(&path),
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Init { force }) = &cli.command {
        let path = cli
            .config
            .clone()
            .or_else(Config::default_path)
            .context("cannot determine the config directory, pass --config")?;
        return config::init_config(&path, *force);
    }

    let mut config = load_config(cli.config)?;

    // Keep the guard alive for the duration of the program
    let _logging_guard = setup_logging(cli.verbose, &config.log)?;

    match cli.command {
        Some(Commands::Client { addr, show, n, m }) => {
            client::run(&addr, show, n, m).await?;
        }
        Some(Commands::Serve { listen }) => {
            if let Some(listen) = listen {
                config.server.listen = listen;
                config.validate()?;
            }
            App::new(config).run().await?;
        }
        Some(Commands::Init { .. }) => {}
        None => {
            App::new(config).run().await?;
        }
    }

    Ok(())
}
