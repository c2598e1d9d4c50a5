//! Switchboard Daemon - Provider Broker Host
//!
//! Hosts a [`Broker`] for the providers named in the configuration file,
//! keeps its background sweeps running and logs a periodic status snapshot.
//!
//! # Usage
//!
//! ```bash
//! # Start with the default config (~/.config/switchboard/switchboard.toml)
//! switchboard-daemon
//!
//! # With config file
//! switchboard-daemon --config /etc/switchboard/switchboard.toml
//!
//! # Health-check every provider and exit
//! switchboard-daemon --check
//!
//! # Verbose logging
//! RUST_LOG=debug switchboard-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown
//! - `SIGHUP`: Reload provider records from the config file

mod pid;
mod runner;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use switchboard_core::config::{default_config_path, load_config_from_path, ConfigOverrides};
use switchboard_core::Broker;

/// Switchboard Daemon - resilient multi-provider broker
#[derive(Parser, Debug)]
#[command(name = "switchboard-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "SWITCHBOARD_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// PID file path
    #[arg(long, env = "SWITCHBOARD_PID_FILE", value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Seconds between status snapshots (0 disables them)
    #[arg(long, default_value_t = 60)]
    status_interval_secs: u64,

    /// Health-check every provider and exit; fails if a required provider fails
    #[arg(long)]
    check: bool,

    /// Override the default requests per minute
    #[arg(long, value_name = "N")]
    requests_per_minute: Option<u32>,

    /// Disable rate limiting
    #[arg(long)]
    no_rate_limit: bool,

    /// Override the pool size per provider
    #[arg(long, value_name = "N")]
    max_connections: Option<usize>,

    /// Override the default overall deadline (milliseconds)
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "SWITCHBOARD_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    /// Command-line overrides for the loaded configuration
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(rpm) = self.requests_per_minute {
            overrides = overrides.with_requests_per_minute(rpm);
        }
        if self.no_rate_limit {
            overrides = overrides.without_rate_limit();
        }
        if let Some(max) = self.max_connections {
            overrides = overrides.with_max_connections(max);
        }
        if let Some(ms) = self.timeout_ms {
            overrides = overrides.with_default_timeout_ms(ms);
        }
        overrides
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "switchboard_daemon={level},switchboard_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("Switchboard Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config =
        load_config_from_path(config_path.clone()).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    info!(
        source = %config.source(),
        path = ?config.config_file_path,
        providers = config.providers.len(),
        "Configuration loaded"
    );

    let broker = Broker::builder(config)
        .build()
        .context("Invalid broker configuration")?;

    if args.check {
        let failed_required = runner::check_providers(&broker).await;
        broker.shutdown().await;
        if failed_required.is_empty() {
            info!("All required providers passed");
            return Ok(());
        }
        anyhow::bail!("Required providers failed: {}", failed_required.join(", "));
    }

    let pid_file = pid::PidFile::claim(args.pid_file.clone().unwrap_or_else(pid::default_path))?;

    broker.start();
    let result = runner::run(&broker, config_path, args.status_interval_secs).await;

    info!("Shutting down...");
    broker.shutdown().await;
    drop(pid_file);

    match result {
        Ok(()) => {
            info!("Switchboard daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
