//! Master arbitration.
//!
//! Every device points at no more than one master through the
//! `devices.assigned_master_id` column. Arbitration picks the enabled master
//! that accepts the device type and still has room, preferring the lowest
//! `priority`, then the earliest creation. The result is written with a
//! compare-and-set on the previously observed value, so concurrent
//! re-arbitrations settle on one answer without a lock.

use crate::errors::{Error, Result};
use crate::model::{Device, MasterInstance};
use crate::registry::{self, Registration};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

const MAX_ARBITRATION_ROUNDS: usize = 3;

#[derive(Debug, Clone, Deserialize)]
pub struct NewMaster {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub max_devices: i64,
    #[serde(default)]
    pub allowed_device_types: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_priority() -> i64 {
    100
}

impl NewMaster {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            enabled: default_enabled(),
            priority: default_priority(),
            max_devices: 0,
            allowed_device_types: Vec::new(),
        }
    }
}

/// Partial update of a master; `None` keeps the stored value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MasterUpdate {
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub priority: Option<i64>,
    pub status: Option<String>,
    pub max_devices: Option<i64>,
    pub allowed_device_types: Option<Vec<String>>,
}

impl MasterUpdate {
    /// Whether the change can alter which master a device should get.
    fn affects_selection(&self) -> bool {
        self.enabled.is_some()
            || self.priority.is_some()
            || self.max_devices.is_some()
            || self.allowed_device_types.is_some()
    }
}

/// How a device is being run, as reported back on check-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Assignment {
    Managed { master_id: i64, master_name: String },
    Standalone,
}

impl From<Option<&MasterInstance>> for Assignment {
    fn from(master: Option<&MasterInstance>) -> Self {
        match master {
            Some(m) => Assignment::Managed {
                master_id: m.id,
                master_name: m.name.clone(),
            },
            None => Assignment::Standalone,
        }
    }
}

fn validate_master_fields(priority: i64, max_devices: i64) -> Result<()> {
    if max_devices < 0 {
        return Err(Error::Validation(format!(
            "max_devices must not be negative, got {}",
            max_devices
        )));
    }
    if priority < 0 {
        return Err(Error::Validation(format!(
            "priority must not be negative, got {}",
            priority
        )));
    }
    Ok(())
}

pub async fn create_master(
    conn: &mut SqliteConnection,
    new: &NewMaster,
    now: DateTime<Utc>,
) -> Result<MasterInstance> {
    if new.name.trim().is_empty() {
        return Err(Error::Validation("master name cannot be empty".to_string()));
    }
    validate_master_fields(new.priority, new.max_devices)?;

    let master = sqlx::query_as::<_, MasterInstance>(
        r#"
        INSERT INTO master_instances
            (name, description, enabled, priority, status, max_devices, allowed_device_types,
             created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
        RETURNING *
        "#,
    )
    .bind(&new.name)
    .bind(&new.description)
    .bind(new.enabled)
    .bind(new.priority)
    .bind(if new.enabled { "active" } else { "inactive" })
    .bind(new.max_devices)
    .bind(Json(&new.allowed_device_types))
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    info!(master = %master.name, id = master.id, "Master instance created");
    rearbitrate_all(conn, now).await?;
    Ok(master)
}

pub async fn update_master(
    conn: &mut SqliteConnection,
    id: i64,
    update: &MasterUpdate,
    now: DateTime<Utc>,
) -> Result<MasterInstance> {
    let current = get_master(conn, id).await?;
    validate_master_fields(
        update.priority.unwrap_or(current.priority),
        update.max_devices.unwrap_or(current.max_devices),
    )?;

    let master = sqlx::query_as::<_, MasterInstance>(
        r#"
        UPDATE master_instances SET
            description = COALESCE(?1, description),
            enabled = COALESCE(?2, enabled),
            priority = COALESCE(?3, priority),
            status = COALESCE(?4, status),
            max_devices = COALESCE(?5, max_devices),
            allowed_device_types = COALESCE(?6, allowed_device_types),
            updated_at = ?7
        WHERE id = ?8
        RETURNING *
        "#,
    )
    .bind(&update.description)
    .bind(update.enabled)
    .bind(update.priority)
    .bind(&update.status)
    .bind(update.max_devices)
    .bind(update.allowed_device_types.as_ref().map(Json))
    .bind(now)
    .bind(id)
    .fetch_one(&mut *conn)
    .await?;

    info!(master = %master.name, enabled = master.enabled, priority = master.priority, "Master instance updated");
    if update.affects_selection() {
        rearbitrate_all(conn, now).await?;
    }
    Ok(master)
}

pub async fn get_master(conn: &mut SqliteConnection, id: i64) -> Result<MasterInstance> {
    find_master(conn, id)
        .await?
        .ok_or_else(|| Error::not_found("master", id))
}

pub async fn find_master(conn: &mut SqliteConnection, id: i64) -> Result<Option<MasterInstance>> {
    let master = sqlx::query_as::<_, MasterInstance>("SELECT * FROM master_instances WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(master)
}

pub async fn list_masters(conn: &mut SqliteConnection) -> Result<Vec<MasterInstance>> {
    let masters = sqlx::query_as::<_, MasterInstance>(
        "SELECT * FROM master_instances ORDER BY priority ASC, created_at ASC, id ASC",
    )
    .fetch_all(&mut *conn)
    .await?;
    Ok(masters)
}

/// The master `device` should be assigned to right now, if any.
pub async fn select_master(
    conn: &mut SqliteConnection,
    device: &Device,
) -> Result<Option<MasterInstance>> {
    let masters = sqlx::query_as::<_, MasterInstance>(
        "SELECT * FROM master_instances WHERE enabled = 1 \
         ORDER BY priority ASC, created_at ASC, id ASC",
    )
    .fetch_all(&mut *conn)
    .await?;

    for master in masters {
        if !master.accepts(&device.device_type) {
            continue;
        }

        if master.is_limited() {
            let (assigned,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM devices WHERE assigned_master_id = ? AND id != ?",
            )
            .bind(master.id)
            .bind(device.id)
            .fetch_one(&mut *conn)
            .await?;

            if assigned >= master.max_devices {
                debug!(master = %master.name, assigned, "Master at capacity, skipping");
                continue;
            }
        }

        return Ok(Some(master));
    }

    Ok(None)
}

/// Brings the device's assignment in line with [`select_master`].
///
/// Returns the master the device ends up with; `None` means standalone.
pub async fn arbitrate(
    conn: &mut SqliteConnection,
    device: &Device,
    now: DateTime<Utc>,
) -> Result<Option<MasterInstance>> {
    let mut observed = device.clone();

    for _ in 0..MAX_ARBITRATION_ROUNDS {
        let target = select_master(conn, &observed).await?;
        let target_id = target.as_ref().map(|m| m.id);

        if target_id == observed.assigned_master_id {
            return Ok(target);
        }

        if registry::compare_and_set_master(
            conn,
            observed.id,
            observed.assigned_master_id,
            target.as_ref(),
            now,
        )
        .await?
        {
            match &target {
                Some(m) => info!(device = %observed.external_id, master = %m.name, "Device assigned"),
                None => info!(device = %observed.external_id, "Device left unassigned, standalone mode"),
            }
            return Ok(target);
        }

        // Someone else moved the device or filled the master; look again.
        debug!(device = %observed.external_id, "Assignment changed underneath, re-arbitrating");
        observed = registry::get_by_id(conn, observed.id).await?;
    }

    warn!(
        device = %observed.external_id,
        "Arbitration did not settle, keeping current assignment"
    );
    match observed.assigned_master_id {
        Some(id) => find_master(conn, id).await,
        None => Ok(None),
    }
}

/// Re-runs arbitration for every device, oldest first. Returns how many moved.
pub async fn rearbitrate_all(conn: &mut SqliteConnection, now: DateTime<Utc>) -> Result<usize> {
    let devices = registry::list(conn, None).await?;
    let mut moved = 0;

    for device in devices {
        let before = device.assigned_master_id;
        let after = arbitrate(conn, &device, now).await?.map(|m| m.id);
        if before != after {
            moved += 1;
        }
    }

    if moved > 0 {
        info!("Re-arbitration moved {} devices", moved);
    }
    Ok(moved)
}

/// Admin registration. A re-registration may change the device type, so the
/// assignment is always re-checked.
pub async fn register_device(
    conn: &mut SqliteConnection,
    registration: &Registration,
    default_interval_secs: i64,
    now: DateTime<Utc>,
) -> Result<Device> {
    let device = registry::register(conn, registration, default_interval_secs, now).await?;
    arbitrate(conn, &device, now).await?;
    registry::get_by_id(conn, device.id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::registry::register;
    use chrono::Duration;

    async fn device(conn: &mut SqliteConnection, id: &str, device_type: &str) -> Device {
        register(conn, &Registration::new(id, device_type), 300, Utc::now())
            .await
            .unwrap()
    }

    fn master(name: &str, priority: i64) -> NewMaster {
        let mut m = NewMaster::new(name);
        m.priority = priority;
        m
    }

    #[tokio::test]
    async fn test_lowest_priority_wins() {
        let pool = memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();

        create_master(&mut conn, &master("backup", 5), now).await.unwrap();
        let primary = create_master(&mut conn, &master("primary", 1), now)
            .await
            .unwrap();

        let d1 = device(&mut conn, "D1", "esp32").await;
        let assigned = arbitrate(&mut conn, &d1, now).await.unwrap();
        assert_eq!(assigned.map(|m| m.id), Some(primary.id));
    }

    #[tokio::test]
    async fn test_tie_broken_by_creation_time() {
        let pool = memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();

        let older = create_master(&mut conn, &master("older", 1), now - Duration::hours(1))
            .await
            .unwrap();
        create_master(&mut conn, &master("newer", 1), now).await.unwrap();

        let d1 = device(&mut conn, "D1", "esp32").await;
        let assigned = arbitrate(&mut conn, &d1, now).await.unwrap();
        assert_eq!(assigned.map(|m| m.id), Some(older.id));
    }

    #[tokio::test]
    async fn test_type_filter_and_standalone_fallback() {
        let pool = memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();

        let mut m = master("fermentation", 1);
        m.allowed_device_types = vec!["esp32_fermentation".to_string()];
        create_master(&mut conn, &m, now).await.unwrap();

        let other = device(&mut conn, "other", "esp8266").await;
        assert!(arbitrate(&mut conn, &other, now).await.unwrap().is_none());
        let stored = registry::get(&mut conn, "other").await.unwrap();
        assert_eq!(stored.assigned_master_id, None);
        assert_eq!(Assignment::from(None), Assignment::Standalone);
    }

    #[tokio::test]
    async fn test_reregistration_with_new_type_rearbitrates() {
        let pool = memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();

        let mut m = master("fermentation", 1);
        m.allowed_device_types = vec!["esp32_fermentation".to_string()];
        let m = create_master(&mut conn, &m, now).await.unwrap();

        let first = Registration::new("D1", "esp32_fermentation");
        let managed = register_device(&mut conn, &first, 300, now).await.unwrap();
        assert_eq!(managed.assigned_master_id, Some(m.id));

        let again = register_device(&mut conn, &first, 300, now).await.unwrap();
        assert_eq!(again.assigned_master_id, Some(m.id));

        let retyped = Registration::new("D1", "esp8266");
        let standalone = register_device(&mut conn, &retyped, 300, now).await.unwrap();
        assert_eq!(standalone.device_type, "esp8266");
        assert_eq!(standalone.assigned_master_id, None);
    }

    #[tokio::test]
    async fn test_capacity_spills_to_next_master() {
        let pool = memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();

        let mut small = master("small", 1);
        small.max_devices = 1;
        let small = create_master(&mut conn, &small, now).await.unwrap();
        let big = create_master(&mut conn, &master("big", 2), now).await.unwrap();

        let a = device(&mut conn, "a", "t").await;
        let b = device(&mut conn, "b", "t").await;
        assert_eq!(arbitrate(&mut conn, &a, now).await.unwrap().map(|m| m.id), Some(small.id));
        assert_eq!(arbitrate(&mut conn, &b, now).await.unwrap().map(|m| m.id), Some(big.id));
    }

    #[tokio::test]
    async fn test_rearbitration_is_idempotent() {
        let pool = memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();

        let mut small = master("small", 1);
        small.max_devices = 2;
        create_master(&mut conn, &small, now).await.unwrap();
        create_master(&mut conn, &master("big", 2), now).await.unwrap();
        for id in ["a", "b", "c", "d"] {
            device(&mut conn, id, "t").await;
        }

        rearbitrate_all(&mut conn, now).await.unwrap();
        let first: Vec<Option<i64>> = registry::list(&mut conn, None)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.assigned_master_id)
            .collect();

        assert_eq!(rearbitrate_all(&mut conn, now).await.unwrap(), 0);
        let second: Vec<Option<i64>> = registry::list(&mut conn, None)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.assigned_master_id)
            .collect();
        assert_eq!(first, second);
        assert!(first.iter().all(|m| m.is_some()));
    }

    #[tokio::test]
    async fn test_disabling_master_moves_devices() {
        let pool = memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();

        let primary = create_master(&mut conn, &master("primary", 1), now)
            .await
            .unwrap();
        let backup = create_master(&mut conn, &master("backup", 2), now)
            .await
            .unwrap();
        let d1 = device(&mut conn, "D1", "t").await;
        arbitrate(&mut conn, &d1, now).await.unwrap();

        let update = MasterUpdate {
            enabled: Some(false),
            ..MasterUpdate::default()
        };
        update_master(&mut conn, primary.id, &update, now).await.unwrap();

        let stored = registry::get(&mut conn, "D1").await.unwrap();
        assert_eq!(stored.assigned_master_id, Some(backup.id));
    }

    #[tokio::test]
    async fn test_stale_observation_loses_the_write() {
        let pool = memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();

        let m1 = create_master(&mut conn, &master("m1", 1), now).await.unwrap();
        let m2 = create_master(&mut conn, &master("m2", 2), now).await.unwrap();
        let d1 = device(&mut conn, "D1", "t").await;

        // Two arbiters both observed "unassigned"; only the first write lands.
        assert!(registry::compare_and_set_master(&mut conn, d1.id, None, Some(&m1), now)
            .await
            .unwrap());
        assert!(!registry::compare_and_set_master(&mut conn, d1.id, None, Some(&m2), now)
            .await
            .unwrap());

        // The loser re-arbitrates from the fresh row and agrees.
        let settled = arbitrate(&mut conn, &d1, now).await.unwrap();
        assert_eq!(settled.map(|m| m.id), Some(m1.id));
    }

    #[tokio::test]
    async fn test_rejects_negative_capacity() {
        let pool = memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let mut m = master("bad", 1);
        m.max_devices = -1;
        assert!(matches!(
            create_master(&mut conn, &m, Utc::now()).await,
            Err(Error::Validation(_))
        ));
    }
}
