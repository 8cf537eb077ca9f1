use axum::extract::State;
use axum::Json;

use crate::api::ApiResult;
use crate::auth::{require_admin, AuthUser};
use crate::config::SystemSettings;
use crate::state::AppState;

pub async fn get_settings(State(state): State<AppState>) -> Json<SystemSettings> {
    Json(state.settings.read().await.clone())
}

pub async fn put_settings(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Json(new_settings): Json<SystemSettings>,
) -> ApiResult<Json<SystemSettings>> {
    require_admin(&user)?;

    {
        let mut settings = state.settings.write().await;
        *settings = new_settings.clone();
    }
    crate::config::save_settings(&state.settings_path, &new_settings).await?;
    Ok(Json(new_settings))
}
