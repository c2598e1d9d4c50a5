//! Daemon main loop
//!
//! Waits for signals, logs a status snapshot on a fixed cadence and reloads
//! provider records on `SIGHUP`. The broker's own sweeps run independently.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use switchboard_core::config::load_config_from_path;
use switchboard_core::Broker;

/// Run until SIGTERM or SIGINT
pub async fn run(broker: &Broker, config_path: Option<PathBuf>, status_interval_secs: u64) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    // A zero interval turns the status log off; the ticker still needs a period
    let status_enabled = status_interval_secs > 0;
    let mut ticker = tokio::time::interval(Duration::from_secs(status_interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating shutdown");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating shutdown");
                return Ok(());
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading providers");
                if let Err(e) = reload_providers(broker, config_path.clone()).await {
                    warn!(error = %e, "Provider reload failed, keeping current providers");
                }
            }
            _ = ticker.tick() => {
                if status_enabled {
                    log_status(broker);
                }
            }
        }
    }
}

fn log_status(broker: &Broker) {
    let snapshot = json!({
        "providers": broker.provider_stats(),
        "pools": broker.pool_status(),
        "sessions": broker.session_stats(),
    });
    info!(status = %snapshot, "Broker status");
}

/// Bring the broker's providers in line with the config file
///
/// Records in the file are upserted; records no longer in the file are
/// removed. Other sections only take effect on restart.
async fn reload_providers(broker: &Broker, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config_from_path(config_path)?;
    config.validate()?;

    let wanted: HashSet<String> = config.providers.iter().map(|p| p.id.clone()).collect();
    for provider in broker.providers() {
        if !wanted.contains(&provider.id) {
            broker.remove_provider(&provider.id).await?;
        }
    }
    for provider in config.providers {
        broker.upsert_provider(provider).await?;
    }
    info!(providers = wanted.len(), "Providers reloaded");
    Ok(())
}

/// Health-check every provider; returns the ids of required providers that
/// failed
pub async fn check_providers(broker: &Broker) -> Vec<String> {
    let mut failed_required = Vec::new();
    for provider in broker.providers() {
        let outcome = match broker.test(&provider.id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(provider = %provider.id, error = %e, "Health check could not run");
                if provider.is_required {
                    failed_required.push(provider.id);
                }
                continue;
            }
        };
        if outcome.success {
            info!(
                provider = %provider.id,
                capability = %provider.capability,
                elapsed_ms = outcome.execution_time_ms,
                "Provider healthy"
            );
        } else {
            warn!(
                provider = %provider.id,
                capability = %provider.capability,
                required = provider.is_required,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "Provider unhealthy"
            );
            if provider.is_required {
                failed_required.push(provider.id);
            }
        }
    }
    failed_required
}
