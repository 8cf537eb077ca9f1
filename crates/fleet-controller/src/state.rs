//! Shared application state for the controller, mirroring the teacher's
//! `Arc<AppStateInner>` clone-cheap handle pattern so every Axum handler and
//! background task can hold its own `AppState` without threading lifetimes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use crate::alerts::AlertEvaluator;
use crate::auth::RateLimiter;
use crate::config::SystemSettings;
use crate::hub::Hub;
use crate::store::DbPool;
use crate::upgrade_orchestrator::ReleaseResolver;

#[derive(Clone)]
pub struct AppState {
    pub inner: Arc<AppStateInner>,
}

pub struct AppStateInner {
    pub start_time: Instant,
    pub db: DbPool,
    pub hub: Hub,
    pub alert_evaluator: AlertEvaluator,
    pub release_resolver: ReleaseResolver,
    pub settings: RwLock<SystemSettings>,
    pub settings_path: PathBuf,
    pub jwt_secret: String,
    pub rate_limiter: RateLimiter,
    pub heartbeat_timeout_secs: i64,
}

impl AppState {
    pub fn new(db: DbPool, settings: SystemSettings, settings_path: PathBuf, jwt_secret: String) -> Self {
        let heartbeat_timeout_secs = fleet_protocol::constants::DEFAULT_HEARTBEAT_TIMEOUT.as_secs() as i64;
        Self {
            inner: Arc::new(AppStateInner {
                start_time: Instant::now(),
                db,
                hub: Hub::new(),
                alert_evaluator: AlertEvaluator::new(),
                release_resolver: ReleaseResolver::new(),
                settings: RwLock::new(settings),
                settings_path,
                jwt_secret,
                rate_limiter: RateLimiter::new(),
                heartbeat_timeout_secs,
            }),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }
}

impl std::ops::Deref for AppState {
    type Target = AppStateInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
