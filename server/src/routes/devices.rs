//! Device registry routes.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};

use crate::auth::AuthUser;
use crate::db::DeviceRecord;
use crate::error::Result;
use crate::handlers::{handle_list_devices, handle_register_device};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/devices", get(list_handler).post(register_handler))
}

/// POST /devices
async fn register_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(device): Json<DeviceRecord>,
) -> Result<StatusCode> {
    handle_register_device(&state.pool, &auth.identity, device).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /devices
async fn list_handler(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Vec<DeviceRecord>>> {
    Ok(Json(handle_list_devices(&state.pool, &auth.identity).await?))
}
