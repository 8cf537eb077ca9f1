use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use fleet_protocol::error::{ErrorKind, FleetError};
use fleet_protocol::model::MonitorSample;
use serde::{Deserialize, Serialize};

use crate::api::{ApiError, ApiResult};
use crate::auth::AuthUser;
use crate::state::AppState;
use crate::store::Host;

#[derive(Debug, Deserialize)]
pub struct CreateHostRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct CreateHostResponse {
    pub host: Host,
    pub shared_secret: String,
}

pub async fn create(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Json(req): Json<CreateHostRequest>,
) -> ApiResult<Json<CreateHostResponse>> {
    let (id, shared_secret) = crate::store::create_host(&state.db, &req.name, Some(user.sub))?;
    let host = crate::store::get_host(&state.db, id, state.heartbeat_timeout_secs)?
        .ok_or_else(|| ApiError(FleetError::new(ErrorKind::Fatal, "host vanished immediately after creation")))?;
    Ok(Json(CreateHostResponse { host, shared_secret }))
}

pub async fn list(AuthUser(user): AuthUser, State(state): State<AppState>) -> ApiResult<Json<Vec<Host>>> {
    let owner = if user.role == "admin" { None } else { Some(user.sub) };
    let hosts = crate::store::list_hosts(&state.db, owner, state.heartbeat_timeout_secs)?;
    Ok(Json(hosts))
}

pub async fn get_one(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Host>> {
    let host = authorize_host(&state, &user, id, true)?;
    Ok(Json(host))
}

/// Roles: `admin` operates on any host; `user` is restricted to hosts it
/// owns (or, for read access, hosts explicitly marked `allow_public_view`).
fn authorize_host(state: &AppState, user: &crate::auth::Claims, host_id: i64, for_read: bool) -> ApiResult<Host> {
    let host = crate::store::get_host(&state.db, host_id, state.heartbeat_timeout_secs)?
        .ok_or_else(|| ApiError(FleetError::new(ErrorKind::NotFound, "host not found")))?;
    if user.role == "admin" || host.owner_id == Some(user.sub) {
        return Ok(host);
    }
    if for_read && host.allow_public_view {
        return Ok(host);
    }
    Err(ApiError(FleetError::new(ErrorKind::PermissionDenied, "not permitted for this host")))
}

#[derive(Debug, Deserialize)]
pub struct UpdateHostRequest {
    pub tags: Option<String>,
    pub allow_public_view: Option<bool>,
}

pub async fn update(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateHostRequest>,
) -> ApiResult<Json<Host>> {
    authorize_host(&state, &user, id, false)?;
    let conn = state.db.get().map_err(|e| ApiError(FleetError::new(ErrorKind::TransientIo, e.to_string())))?;
    if let Some(tags) = req.tags {
        conn.execute("UPDATE hosts SET tags = ?1 WHERE id = ?2", rusqlite::params![tags, id])?;
    }
    if let Some(visible) = req.allow_public_view {
        conn.execute(
            "UPDATE hosts SET allow_public_view = ?1 WHERE id = ?2",
            rusqlite::params![visible as i64, id],
        )?;
    }
    drop(conn);
    crate::store::get_host(&state.db, id, state.heartbeat_timeout_secs)?
        .map(Json)
        .ok_or_else(|| ApiError(FleetError::new(ErrorKind::NotFound, "host not found")))
}

pub async fn remove(AuthUser(user): AuthUser, State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<()> {
    authorize_host(&state, &user, id, false)?;
    crate::store::delete_host(&state.db, id)?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct RegisterHostRequest {
    pub host_id: i64,
    pub shared_secret: String,
    pub agent_version: String,
    pub system_info: fleet_protocol::model::SystemInfo,
}

/// Bootstrap endpoint an Agent calls once over plain HTTP before it knows
/// the WS endpoint is reachable, mirroring the spec's two-phase join: HTTP
/// registration confirms the shared secret, then the Agent opens `/ws/agent`
/// and sends `register` again to establish the live session.
pub async fn register(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<RegisterHostRequest>,
) -> ApiResult<()> {
    if !state.rate_limiter.check_registration(&addr.ip().to_string()) {
        return Err(ApiError(FleetError::new(ErrorKind::RateLimited, "too many registration attempts")));
    }
    if !crate::store::verify_shared_secret(&state.db, req.host_id, &req.shared_secret)? {
        return Err(ApiError(FleetError::new(ErrorKind::AuthFailed, "invalid shared secret")));
    }
    crate::store::touch_heartbeat(&state.db, req.host_id, &req.agent_version)?;
    Ok(())
}

/// HTTP fallback for agents that cannot hold a persistent `/ws/agent`
/// connection: the same ingestion path `websocket::handle_agent_message`
/// takes for a `monitor.sample` frame, gated by the `X-Secret-Key` header
/// instead of the WS session's prior `register`.
pub async fn submit_sample(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(sample): Json<MonitorSample>,
) -> ApiResult<()> {
    let secret = headers
        .get("X-Secret-Key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError(FleetError::new(ErrorKind::AuthFailed, "missing X-Secret-Key header")))?;

    if !crate::store::verify_shared_secret(&state.db, id, secret)? {
        return Err(ApiError(FleetError::new(ErrorKind::AuthFailed, "invalid shared secret")));
    }

    crate::store::insert_sample(&state.db, id, &sample)?;
    state.alert_evaluator.evaluate(&state.db, id, &sample).await;
    if let Ok(value) = serde_json::to_value(&sample) {
        state.hub.broadcast(&format!("host:{id}"), value).await;
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct SamplesQuery {
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub limit: Option<i64>,
}

pub async fn samples(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<SamplesQuery>,
) -> ApiResult<Json<Vec<MonitorSample>>> {
    authorize_host(&state, &user, id, true)?;
    let samples = crate::store::query_samples(&state.db, id, q.from, q.to, q.limit)?;
    Ok(Json(samples))
}
