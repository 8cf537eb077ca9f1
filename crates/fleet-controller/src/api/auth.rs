use axum::extract::{ConnectInfo, State};
use axum::Json;
use fleet_protocol::error::{ErrorKind, FleetError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::api::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginUser {
    pub id: i64,
    pub username: String,
    pub role: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: LoginUser,
}

pub async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    if !state.rate_limiter.check_login(&addr.ip().to_string()) {
        return Err(ApiError(FleetError::new(ErrorKind::RateLimited, "too many login attempts")));
    }

    let conn = state.db.get().map_err(|e| ApiError(FleetError::new(ErrorKind::TransientIo, e.to_string())))?;
    let row: Option<(i64, String, String)> = conn
        .query_row(
            "SELECT id, password_hash, role FROM users WHERE username = ?1",
            rusqlite::params![req.username],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .ok();

    let (user_id, hash, role) = row.ok_or_else(|| ApiError(FleetError::new(ErrorKind::AuthFailed, "invalid credentials")))?;

    if !crate::auth::verify_password(&req.password, &hash) {
        return Err(ApiError(FleetError::new(ErrorKind::AuthFailed, "invalid credentials")));
    }

    let token = crate::auth::mint_token(&state.jwt_secret, user_id, &req.username, &role)?;
    Ok(Json(LoginResponse {
        token,
        user: LoginUser { id: user_id, username: req.username, role },
    }))
}
