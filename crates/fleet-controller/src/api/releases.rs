use axum::extract::State;
use axum::Json;
use fleet_protocol::error::{ErrorKind, FleetError};
use serde::Deserialize;

use crate::api::{ApiError, ApiResult};
use crate::auth::{require_admin, AuthUser};
use crate::state::AppState;
use crate::upgrade_orchestrator::{self, BatchSummary, ReleaseInfo};

pub async fn latest(State(state): State<AppState>) -> ApiResult<Json<ReleaseInfo>> {
    let settings = state.settings.read().await.clone();
    let release = state
        .release_resolver
        .resolve(&settings.release_repo, &settings.release_channel, settings.release_mirror.as_deref())
        .await
        .map_err(|e| ApiError(FleetError::new(ErrorKind::TransientIo, e)))?;
    Ok(Json(release))
}

#[derive(Debug, Deserialize)]
pub struct UpgradeHostsRequest {
    pub host_ids: Vec<i64>,
    pub target_version: Option<String>,
    pub channel: Option<String>,
}

pub async fn upgrade_hosts(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Json(req): Json<UpgradeHostsRequest>,
) -> ApiResult<Json<BatchSummary>> {
    require_admin(&user)?;

    let settings = state.settings.read().await.clone();
    let channel = req.channel.as_deref().unwrap_or(&settings.release_channel);
    let mut release = state
        .release_resolver
        .resolve(&settings.release_repo, channel, settings.release_mirror.as_deref())
        .await
        .map_err(|e| ApiError(FleetError::new(ErrorKind::TransientIo, e)))?;
    if let Some(target_version) = req.target_version {
        release.version = target_version;
    }

    let summary = upgrade_orchestrator::dispatch_batch(&state, req.host_ids, release).await;
    Ok(Json(summary))
}
