//! Device registry: idempotent registration, check-in bookkeeping, the
//! inactivity sweep and the single `assigned_master_id` column.

use crate::errors::{Error, Result};
use crate::model::{Device, DeviceStatus, MasterInstance};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use sqlx::types::Json;
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

/// Descriptive fields a device reports about itself.
///
/// `None` leaves the stored value untouched on re-registration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Registration {
    pub external_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
    #[serde(default)]
    pub hardware_info: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub check_in_interval_secs: Option<i64>,
}

impl Registration {
    pub fn new(external_id: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            device_type: Some(device_type.into()),
            ..Self::default()
        }
    }
}

/// Capacity guard shared by every write of `assigned_master_id`.
/// Binds: ?1 master id, ?3 device id, ?4 max devices (0 = unlimited).
const CAPACITY_GUARD: &str = "(?4 = 0 OR (SELECT COUNT(*) FROM devices d \
     WHERE d.assigned_master_id = ?1 AND d.id != ?3) < ?4)";

/// Creates the device or refreshes its descriptive fields.
pub async fn register(
    conn: &mut SqliteConnection,
    registration: &Registration,
    default_interval_secs: i64,
    now: DateTime<Utc>,
) -> Result<Device> {
    let capabilities = registration.capabilities.clone().map(Json);

    let device = sqlx::query_as::<_, Device>(
        r#"
        INSERT INTO devices
            (external_id, name, device_type, capabilities, hardware_info, firmware_version,
             check_in_interval_secs, status, created_at, updated_at)
        VALUES
            (?1, COALESCE(?2, ''), COALESCE(?3, 'unknown'), COALESCE(?4, '[]'),
             COALESCE(?5, ''), COALESCE(?6, ''), COALESCE(?7, ?8), 'pending', ?9, ?9)
        ON CONFLICT(external_id) DO UPDATE SET
            name = COALESCE(?2, devices.name),
            device_type = COALESCE(?3, devices.device_type),
            capabilities = COALESCE(?4, devices.capabilities),
            hardware_info = COALESCE(?5, devices.hardware_info),
            firmware_version = COALESCE(?6, devices.firmware_version),
            check_in_interval_secs = COALESCE(?7, devices.check_in_interval_secs),
            updated_at = ?9
        RETURNING *
        "#,
    )
    .bind(&registration.external_id)
    .bind(&registration.name)
    .bind(&registration.device_type)
    .bind(capabilities)
    .bind(&registration.hardware_info)
    .bind(&registration.firmware_version)
    .bind(registration.check_in_interval_secs)
    .bind(default_interval_secs)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    debug!(device = %device.external_id, id = device.id, "Device registered");
    Ok(device)
}

/// Records a check-in: `last_check_in = now`, `status = active`.
pub async fn touch(
    conn: &mut SqliteConnection,
    external_id: &str,
    now: DateTime<Utc>,
) -> Result<Device> {
    sqlx::query_as::<_, Device>(
        "UPDATE devices SET last_check_in = ?1, status = 'active', updated_at = ?1 \
         WHERE external_id = ?2 RETURNING *",
    )
    .bind(now)
    .bind(external_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| Error::not_found("device", external_id))
}

pub async fn find(conn: &mut SqliteConnection, external_id: &str) -> Result<Option<Device>> {
    let device = sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE external_id = ?")
        .bind(external_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(device)
}

pub async fn get(conn: &mut SqliteConnection, external_id: &str) -> Result<Device> {
    find(conn, external_id)
        .await?
        .ok_or_else(|| Error::not_found("device", external_id))
}

pub async fn get_by_id(conn: &mut SqliteConnection, id: i64) -> Result<Device> {
    sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found("device", id))
}

pub async fn list(conn: &mut SqliteConnection, status: Option<DeviceStatus>) -> Result<Vec<Device>> {
    let devices = sqlx::query_as::<_, Device>(
        "SELECT * FROM devices WHERE (?1 IS NULL OR status = ?1) ORDER BY id",
    )
    .bind(status)
    .fetch_all(&mut *conn)
    .await?;
    Ok(devices)
}

/// Explicit admin status change.
pub async fn set_status(
    conn: &mut SqliteConnection,
    external_id: &str,
    status: DeviceStatus,
    now: DateTime<Utc>,
) -> Result<Device> {
    let device = sqlx::query_as::<_, Device>(
        "UPDATE devices SET status = ?1, updated_at = ?2 WHERE external_id = ?3 RETURNING *",
    )
    .bind(status)
    .bind(now)
    .bind(external_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| Error::not_found("device", external_id))?;

    info!(device = %external_id, ?status, "Device status set by admin");
    Ok(device)
}

/// Points the device at `master_id`, refusing when the master is full.
pub async fn assign_master(
    conn: &mut SqliteConnection,
    external_id: &str,
    master_id: i64,
    now: DateTime<Utc>,
) -> Result<Device> {
    let device = get(conn, external_id).await?;
    let master = sqlx::query_as::<_, MasterInstance>("SELECT * FROM master_instances WHERE id = ?")
        .bind(master_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found("master", master_id))?;

    let query = format!(
        "UPDATE devices SET assigned_master_id = ?1, updated_at = ?2 WHERE id = ?3 AND {}",
        CAPACITY_GUARD
    );
    let updated = sqlx::query(&query)
        .bind(master.id)
        .bind(now)
        .bind(device.id)
        .bind(master.max_devices)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    if updated == 0 {
        return Err(Error::CapacityExceeded {
            master_id: master.id,
            max_devices: master.max_devices,
        });
    }

    info!(device = %external_id, master = %master.name, "Device assigned to master");
    get_by_id(conn, device.id).await
}

/// Moves the device from `observed` to `target` only if nobody changed it in
/// between and `target` still has room. Returns whether the write landed.
pub(crate) async fn compare_and_set_master(
    conn: &mut SqliteConnection,
    device_id: i64,
    observed: Option<i64>,
    target: Option<&MasterInstance>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let updated = match target {
        Some(master) => {
            let query = format!(
                "UPDATE devices SET assigned_master_id = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND assigned_master_id IS ?5 AND {}",
                CAPACITY_GUARD
            );
            sqlx::query(&query)
                .bind(master.id)
                .bind(now)
                .bind(device_id)
                .bind(master.max_devices)
                .bind(observed)
                .execute(&mut *conn)
                .await?
        }
        None => {
            sqlx::query(
                "UPDATE devices SET assigned_master_id = NULL, updated_at = ?1 \
                 WHERE id = ?2 AND assigned_master_id IS ?3",
            )
            .bind(now)
            .bind(device_id)
            .bind(observed)
            .execute(&mut *conn)
            .await?
        }
    };
    Ok(updated.rows_affected() == 1)
}

/// Marks active devices inactive once they missed `stale_factor` check-in intervals.
pub async fn sweep_inactive(
    conn: &mut SqliteConnection,
    now: DateTime<Utc>,
    stale_factor: u32,
) -> Result<u64> {
    let candidates: Vec<(i64, DateTime<Utc>, i64)> = sqlx::query_as(
        "SELECT id, last_check_in, check_in_interval_secs FROM devices \
         WHERE status = 'active' AND last_check_in IS NOT NULL",
    )
    .fetch_all(&mut *conn)
    .await?;

    let mut marked = 0;
    for (id, last_check_in, interval_secs) in candidates {
        let cutoff = interval_secs
            .max(1)
            .checked_mul(i64::from(stale_factor))
            .and_then(Duration::try_seconds)
            .and_then(|silence| now.checked_sub_signed(silence));
        let Some(cutoff) = cutoff else {
            warn!(device_id = id, interval_secs, "Check-in interval too large to go stale");
            continue;
        };
        if last_check_in >= cutoff {
            continue;
        }

        // A check-in that landed meanwhile moves last_check_in past the cutoff.
        let result = sqlx::query(
            "UPDATE devices SET status = 'inactive', updated_at = ?1 \
             WHERE id = ?2 AND status = 'active' AND last_check_in < ?3",
        )
        .bind(now)
        .bind(id)
        .bind(cutoff)
        .execute(&mut *conn)
        .await?;
        marked += result.rows_affected();
    }

    if marked > 0 {
        info!("Marked {} devices inactive", marked);
    }
    Ok(marked)
}

/// Default owners for telemetry the device submits without explicit owners.
pub async fn bind_owner(
    conn: &mut SqliteConnection,
    external_id: &str,
    owner_id: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let device = get(conn, external_id).await?;
    sqlx::query(
        "INSERT INTO device_owners (device_id, owner_id, created_at) VALUES (?, ?, ?) \
         ON CONFLICT(device_id, owner_id) DO NOTHING",
    )
    .bind(device.id)
    .bind(owner_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn owners_of(conn: &mut SqliteConnection, device_id: i64) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> =
        sqlx::query_as("SELECT owner_id FROM device_owners WHERE device_id = ? ORDER BY owner_id")
            .bind(device_id)
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Remembers the configuration hash last delivered to the device.
pub async fn record_config_hash(
    conn: &mut SqliteConnection,
    device_id: i64,
    hash: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE devices SET config_hash = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(hash)
        .bind(now)
        .bind(device_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
