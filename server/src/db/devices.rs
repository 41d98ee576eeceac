//! Device registry, one row per (identity, device).

use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};

/// A registered client device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub device_id: String,
    pub name: String,
    pub platform: String,
    pub last_seen: u64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for DeviceRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        let last_seen: i64 = row.try_get("last_seen")?;
        Ok(DeviceRecord {
            device_id: row.try_get("device_id")?,
            name: row.try_get("name")?,
            platform: row.try_get("platform")?,
            last_seen: last_seen.max(0) as u64,
        })
    }
}

/// Insert or refresh a device.
pub async fn upsert_device(
    pool: &PgPool,
    identity: &str,
    device: &DeviceRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO devices (identity, device_id, name, platform, last_seen)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (identity, device_id) DO UPDATE SET
            name = EXCLUDED.name,
            platform = EXCLUDED.platform,
            last_seen = GREATEST(devices.last_seen, EXCLUDED.last_seen)
        "#,
    )
    .bind(identity)
    .bind(&device.device_id)
    .bind(&device.name)
    .bind(&device.platform)
    .bind(device.last_seen as i64)
    .execute(pool)
    .await?;

    Ok(())
}

/// All devices registered for an identity, most recently seen first.
pub async fn list_devices(pool: &PgPool, identity: &str) -> Result<Vec<DeviceRecord>, sqlx::Error> {
    sqlx::query_as::<_, DeviceRecord>(
        r#"
        SELECT device_id, name, platform, last_seen
        FROM devices
        WHERE identity = $1
        ORDER BY last_seen DESC, device_id ASC
        "#,
    )
    .bind(identity)
    .fetch_all(pool)
    .await
}
