pub mod alerts;
pub mod auth;
pub mod health;
pub mod hosts;
pub mod releases;
pub mod settings;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use fleet_protocol::error::FleetError;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::websocket;

/// Thin wrapper turning `FleetError` into the `{error, code, timestamp}`
/// envelope every REST endpoint returns on failure.
pub struct ApiError(pub FleetError);

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        ApiError(e)
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(e: rusqlite::Error) -> Self {
        ApiError(FleetError::new(fleet_protocol::error::ErrorKind::TransientIo, e.to_string()))
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError(FleetError::new(fleet_protocol::error::ErrorKind::Fatal, e.to_string()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "error": self.0.to_string(),
            "code": kind.code(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/api/auth/login", post(auth::login))
        .route("/api/hosts", get(hosts::list).post(hosts::create))
        .route("/api/hosts/register", post(hosts::register))
        .route("/api/hosts/:id", get(hosts::get_one).put(hosts::update).delete(hosts::remove))
        .route("/api/hosts/:id/samples", get(hosts::samples).post(hosts::submit_sample))
        .route("/api/hosts/upgrade", post(releases::upgrade_hosts))
        .route("/api/releases/latest", get(releases::latest))
        .route("/api/alerts/rules", get(alerts::list_rules).post(alerts::create_rule))
        .route("/api/alerts/rules/:id", put(alerts::update_rule).delete(alerts::delete_rule))
        .route("/api/alerts/channels", get(alerts::list_channels).post(alerts::create_channel))
        .route("/api/alerts/channels/:id", put(alerts::update_channel).delete(alerts::delete_channel))
        .route("/api/alerts/incidents", get(alerts::list_incidents))
        .route("/api/settings", get(settings::get_settings).post(settings::put_settings))
        .route("/api/health", get(health::get_health));

    Router::new()
        .merge(api_routes)
        .route("/ws/agent", get(websocket::ws_agent_handler))
        .route("/ws/hosts", get(websocket::ws_hosts_handler))
        .route("/ws/hosts/:id", get(websocket::ws_host_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
