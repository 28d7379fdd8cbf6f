//! Server-side device configuration.
//!
//! A device's configuration is derived from its master assignment and the
//! most specific active template of that master (device-specific first, then
//! device-type, then master-wide). Devices echo back the hash they hold, and
//! the full body is only sent when it differs.

use crate::errors::{Error, Result};
use crate::model::{ConfigTemplate, Device, MasterInstance};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use sqlx::types::Json;
use sqlx::SqliteConnection;
use tracing::info;

/// Settings a standalone device runs with.
const FALLBACK_POLLING_INTERVAL_SECS: i64 = 60;

#[derive(Debug, Clone, Deserialize)]
pub struct NewConfigTemplate {
    pub name: String,
    #[serde(default)]
    pub device_external_id: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    pub data: Value,
    #[serde(default = "default_version")]
    pub version: i64,
    #[serde(default = "default_priority")]
    pub priority: i64,
}

fn default_version() -> i64 {
    1
}

fn default_priority() -> i64 {
    100
}

/// Configuration body plus its hash.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedConfig {
    pub hash: String,
    pub body: Value,
}

pub async fn create_template(
    conn: &mut SqliteConnection,
    master_id: i64,
    new: &NewConfigTemplate,
    now: DateTime<Utc>,
) -> Result<ConfigTemplate> {
    if !new.data.is_object() {
        return Err(Error::Validation(
            "configuration data must be a JSON object".to_string(),
        ));
    }
    if new.device_external_id.is_some() && new.device_type.is_some() {
        return Err(Error::Validation(
            "a template targets either one device or one device type".to_string(),
        ));
    }

    let template = sqlx::query_as::<_, ConfigTemplate>(
        r#"
        INSERT INTO config_templates
            (master_id, device_external_id, device_type, name, data, version, active, priority, created_at)
        SELECT ?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8
        WHERE EXISTS (SELECT 1 FROM master_instances WHERE id = ?1)
        RETURNING *
        "#,
    )
    .bind(master_id)
    .bind(&new.device_external_id)
    .bind(&new.device_type)
    .bind(&new.name)
    .bind(Json(&new.data))
    .bind(new.version)
    .bind(new.priority)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| Error::not_found("master", master_id))?;

    info!(master_id, template = %template.name, "Configuration template created");
    Ok(template)
}

/// The template that applies to `device` under `master`, if any.
pub async fn template_for(
    conn: &mut SqliteConnection,
    device: &Device,
    master: &MasterInstance,
) -> Result<Option<ConfigTemplate>> {
    let template = sqlx::query_as::<_, ConfigTemplate>(
        r#"
        SELECT * FROM config_templates
        WHERE master_id = ?1 AND active = 1
          AND (device_external_id = ?2
               OR (device_external_id IS NULL AND (device_type = ?3 OR device_type IS NULL)))
        ORDER BY
            CASE WHEN device_external_id IS NOT NULL THEN 0
                 WHEN device_type IS NOT NULL THEN 1
                 ELSE 2 END,
            priority ASC,
            id ASC
        LIMIT 1
        "#,
    )
    .bind(master.id)
    .bind(&device.external_id)
    .bind(&device.device_type)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(template)
}

/// Computes the configuration `device` should be running.
pub async fn resolve(
    conn: &mut SqliteConnection,
    device: &Device,
    master: Option<&MasterInstance>,
) -> Result<ResolvedConfig> {
    let body = match master {
        Some(master) => {
            let template = template_for(conn, device, master).await?;
            let (template_meta, settings) = match template {
                Some(t) => (
                    json!({ "id": t.id, "name": t.name, "version": t.version }),
                    t.data.0,
                ),
                None => (Value::Null, fallback_settings()),
            };
            json!({
                "mode": "managed",
                "master": { "id": master.id, "name": master.name },
                "check_in_interval": device.check_in_interval_secs,
                "template": template_meta,
                "settings": settings,
            })
        }
        None => json!({
            "mode": "standalone",
            "master": Value::Null,
            "check_in_interval": device.check_in_interval_secs,
            "template": Value::Null,
            "settings": fallback_settings(),
        }),
    };

    Ok(ResolvedConfig {
        hash: config_hash(&body),
        body,
    })
}

fn fallback_settings() -> Value {
    json!({
        "polling_interval": FALLBACK_POLLING_INTERVAL_SECS,
        "sensor_mappings": [],
    })
}

/// SHA-256 over the key-sorted JSON encoding.
pub fn config_hash(value: &Value) -> String {
    let canonical = canonicalize(value);
    let encoded = canonical.to_string();
    hex::encode(Sha256::digest(encoded.as_bytes()))
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitration::{create_master, NewMaster};
    use crate::db::memory_pool;
    use crate::registry::{register, Registration};

    #[test]
    fn test_hash_ignores_key_order() {
        let a = json!({ "b": 1, "a": { "y": [1, 2], "x": null } });
        let b = json!({ "a": { "x": null, "y": [1, 2] }, "b": 1 });
        assert_eq!(config_hash(&a), config_hash(&b));
        assert_ne!(config_hash(&a), config_hash(&json!({ "b": 2 })));
        assert_eq!(config_hash(&a).len(), 64);
    }

    #[tokio::test]
    async fn test_most_specific_template_wins() {
        let pool = memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();

        let master = create_master(&mut conn, &NewMaster::new("m"), now).await.unwrap();
        let device = register(&mut conn, &Registration::new("D1", "esp32"), 300, now)
            .await
            .unwrap();

        let by_type = NewConfigTemplate {
            name: "esp32 default".to_string(),
            device_external_id: None,
            device_type: Some("esp32".to_string()),
            data: json!({ "polling_interval": 30 }),
            version: 1,
            priority: 100,
        };
        create_template(&mut conn, master.id, &by_type, now).await.unwrap();
        let resolved = resolve(&mut conn, &device, Some(&master)).await.unwrap();
        assert_eq!(resolved.body["settings"]["polling_interval"], 30);

        let by_device = NewConfigTemplate {
            name: "D1 override".to_string(),
            device_external_id: Some("D1".to_string()),
            device_type: None,
            data: json!({ "polling_interval": 10 }),
            version: 2,
            priority: 100,
        };
        create_template(&mut conn, master.id, &by_device, now).await.unwrap();
        let overridden = resolve(&mut conn, &device, Some(&master)).await.unwrap();
        assert_eq!(overridden.body["settings"]["polling_interval"], 10);
        assert_ne!(resolved.hash, overridden.hash);
    }

    #[tokio::test]
    async fn test_standalone_config_is_stable() {
        let pool = memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();

        let device = register(&mut conn, &Registration::new("D1", "esp32"), 300, now)
            .await
            .unwrap();
        let first = resolve(&mut conn, &device, None).await.unwrap();
        let second = resolve(&mut conn, &device, None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.body["mode"], "standalone");
    }

    #[tokio::test]
    async fn test_template_needs_object_and_master() {
        let pool = memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let mut new = NewConfigTemplate {
            name: "x".to_string(),
            device_external_id: None,
            device_type: None,
            data: json!([1, 2]),
            version: 1,
            priority: 100,
        };
        assert!(matches!(
            create_template(&mut conn, 1, &new, Utc::now()).await,
            Err(Error::Validation(_))
        ));

        new.data = json!({});
        assert!(matches!(
            create_template(&mut conn, 999, &new, Utc::now()).await,
            Err(Error::NotFound { .. })
        ));
    }
}
