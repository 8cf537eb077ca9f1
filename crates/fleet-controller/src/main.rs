mod alerts;
mod api;
mod auth;
mod config;
mod hub;
mod state;
mod store;
mod upgrade_orchestrator;
mod websocket;

use std::net::SocketAddr;

use clap::Parser;
use tracing::{info, warn};

use crate::config::{load_settings, Args};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!(config = %args.config.display(), db = %args.db_path.display(), "fleetwatch-controller starting");

    let settings = load_settings(&args.config).await.unwrap_or_else(|e| {
        warn!(error = %e, "failed to load settings, using defaults");
        Default::default()
    });

    let db = store::open_pool(&args.db_path)?;
    bootstrap_admin(&db)?;

    let jwt_secret = args.jwt_secret.clone().unwrap_or_else(|| {
        warn!("JWT_SECRET not set, generating an ephemeral secret (tokens won't survive a restart)");
        uuid::Uuid::new_v4().to_string()
    });

    let app_state = AppState::new(db.clone(), settings, args.config.clone(), jwt_secret);

    {
        let state = app_state.clone();
        tokio::spawn(async move {
            store::run_retention_loop(db, move || {
                // `state` is moved into the closure once and read every
                // sweep, so a live `POST /api/settings` change to
                // retention_days takes effect on the next tick.
                let settings = state.inner.clone();
                read_retention_days(&settings)
            })
            .await;
        });
    }

    let app = api::build_router(app_state);

    let addr: SocketAddr = ([0, 0, 0, 0], args.port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "controller listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// `store::run_retention_loop` takes a `Fn() -> i64` so the sweep always
/// reads the live setting rather than the value at startup.
fn read_retention_days(inner: &std::sync::Arc<crate::state::AppStateInner>) -> i64 {
    inner.settings.try_read().map(|s| s.retention_days).unwrap_or(fleet_protocol::constants::DEFAULT_RETENTION_DAYS)
}

/// Seeds a default `admin`/`admin123` account the first time the database
/// has no users at all, matching the teacher's own "start usable out of the
/// box, rotate credentials later" bootstrap posture.
fn bootstrap_admin(db: &store::DbPool) -> anyhow::Result<()> {
    let conn = db.get()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
    if count == 0 {
        let hash = auth::hash_password("admin123")?;
        conn.execute(
            "INSERT INTO users (username, password_hash, role) VALUES ('admin', ?1, 'admin')",
            rusqlite::params![hash],
        )?;
        warn!("no users found, created default admin/admin123 — change this password immediately");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("shutting down");
}
