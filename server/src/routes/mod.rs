//! HTTP route definitions.

mod devices;
mod health;
mod sync;
mod ws;

pub use health::HealthResponse;

use crate::AppState;
use axum::Router;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(sync::routes())
        .merge(devices::routes())
        .merge(ws::routes())
}
