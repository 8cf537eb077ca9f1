mod collector;
mod config;
mod dispatcher;
mod handlers;
mod health;
mod session;
mod state;
mod transport;
mod upgrade;
mod watchdog;

use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{exit_code, AgentConfig, Args};
use crate::health::{task_pulse, HealthCollector};
use crate::state::AgentState;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match AgentConfig::load(&args).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return exit_code::CONFIG_INVALID;
        }
    };

    let health = Arc::new(HealthCollector::new());
    let (outbound_tx, outbound_rx) = mpsc::channel(256);
    let state = Arc::new(AgentState::new(config, Arc::clone(&health), outbound_tx));

    info!(host_id = state.config.host_id, server = %state.config.server, "fleetwatch-agent starting");

    let cancel = CancellationToken::new();

    let (transport_pulse, transport_monitor) = task_pulse("transport");
    let (collector_pulse, collector_monitor) = task_pulse("collector");
    health.register_monitor(transport_monitor);
    health.register_monitor(collector_monitor);

    let mut transport_handle = {
        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        tokio::spawn(async move { transport::run(state, outbound_rx, transport_pulse, cancel).await })
    };

    let collector_handle = {
        let state = Arc::clone(&state);
        let monitor_interval = state.monitor_interval.subscribe();
        tokio::spawn(async move {
            collector::run(state, collector_pulse, monitor_interval).await;
        })
    };

    let reaper_handle = {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            session::run_idle_reaper(state).await;
        })
    };

    let watchdog_handle = {
        let health = Arc::clone(&health);
        tokio::spawn(async move {
            watchdog::run(health).await;
        })
    };

    let final_code = tokio::select! {
        result = &mut transport_handle => {
            match result {
                Ok(Some(code)) => {
                    error!("transport gave up permanently, shutting down");
                    code
                }
                Ok(None) | Err(_) => exit_code::FATAL,
            }
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "failed to listen for shutdown signal");
                exit_code::FATAL
            } else {
                info!("shutting down");
                exit_code::OK
            }
        }
    };

    cancel.cancel();
    transport_handle.abort();
    collector_handle.abort();
    reaper_handle.abort();
    watchdog_handle.abort();

    final_code
}
