use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub db_ok: bool,
    pub uptime_secs: u64,
    pub connected_agents: usize,
}

pub async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let db_ok = match state.db.get() {
        Ok(conn) => conn.query_row::<i64, _, _>("SELECT 1", [], |row| row.get(0)).is_ok(),
        Err(_) => false,
    };
    let connected_agents = state.hub.connected_host_ids().await.len();

    Json(HealthResponse {
        ok: db_ok,
        db_ok,
        uptime_secs: state.uptime_secs(),
        connected_agents,
    })
}
