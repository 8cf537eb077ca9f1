use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::alerts::{AlertIncident, AlertRule, NotificationChannel, RuleKind};
use crate::api::ApiResult;
use crate::auth::AuthUser;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    pub host_id: i64,
    pub kind: RuleKind,
    pub threshold: f64,
    pub sustain_seconds: i64,
}

pub async fn create_rule(
    AuthUser(_user): AuthUser,
    State(state): State<AppState>,
    Json(req): Json<CreateRuleRequest>,
) -> ApiResult<Json<i64>> {
    let id = crate::alerts::create_rule(&state.db, req.host_id, req.kind, req.threshold, req.sustain_seconds)?;
    Ok(Json(id))
}

pub async fn list_rules(AuthUser(_user): AuthUser, State(state): State<AppState>) -> ApiResult<Json<Vec<AlertRule>>> {
    Ok(Json(crate::alerts::list_rules(&state.db)?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateRuleRequest {
    pub threshold: f64,
    pub sustain_seconds: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

pub async fn update_rule(
    AuthUser(_user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateRuleRequest>,
) -> ApiResult<()> {
    crate::alerts::update_rule(&state.db, id, req.threshold, req.sustain_seconds, req.enabled)?;
    Ok(())
}

pub async fn delete_rule(AuthUser(_user): AuthUser, State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<()> {
    crate::alerts::delete_rule(&state.db, id)?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct CreateChannelRequest {
    pub kind: String,
    pub name: String,
    pub config_json: String,
}

pub async fn create_channel(
    AuthUser(_user): AuthUser,
    State(state): State<AppState>,
    Json(req): Json<CreateChannelRequest>,
) -> ApiResult<Json<i64>> {
    let id = crate::alerts::create_channel(&state.db, &req.kind, &req.name, &req.config_json)?;
    Ok(Json(id))
}

pub async fn list_channels(
    AuthUser(_user): AuthUser,
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<NotificationChannel>>> {
    Ok(Json(crate::alerts::list_channels(&state.db)?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateChannelRequest {
    pub name: String,
    pub config_json: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

pub async fn update_channel(
    AuthUser(_user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateChannelRequest>,
) -> ApiResult<()> {
    crate::alerts::update_channel(&state.db, id, &req.name, &req.config_json, req.enabled)?;
    Ok(())
}

pub async fn delete_channel(AuthUser(_user): AuthUser, State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<()> {
    crate::alerts::delete_channel(&state.db, id)?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct IncidentsQuery {
    pub resolved: Option<bool>,
}

pub async fn list_incidents(
    AuthUser(_user): AuthUser,
    State(state): State<AppState>,
    Query(q): Query<IncidentsQuery>,
) -> ApiResult<Json<Vec<AlertIncident>>> {
    Ok(Json(crate::alerts::list_incidents(&state.db, q.resolved)?))
}
