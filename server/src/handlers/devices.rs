//! Device registry handlers.

use crate::db::{self, DeviceRecord};
use crate::error::{AppError, Result};
use sqlx::PgPool;

pub async fn handle_register_device(
    pool: &PgPool,
    identity: &str,
    device: DeviceRecord,
) -> Result<()> {
    if device.device_id.trim().is_empty() {
        return Err(AppError::BadRequest("deviceId must not be empty".into()));
    }
    db::upsert_device(pool, identity, &device).await?;
    tracing::debug!(identity = %identity, device_id = %device.device_id, "device registered");
    Ok(())
}

pub async fn handle_list_devices(pool: &PgPool, identity: &str) -> Result<Vec<DeviceRecord>> {
    Ok(db::list_devices(pool, identity).await?)
}
