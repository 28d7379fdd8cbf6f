use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Pending,
    Active,
    Inactive,
    Error,
}

/// A registered remote sensor device
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: i64,
    pub external_id: String,
    pub name: String,
    pub device_type: String,
    pub capabilities: Json<Vec<String>>,
    pub hardware_info: String,
    pub firmware_version: String,
    pub assigned_master_id: Option<i64>,
    pub config_hash: Option<String>,
    pub status: DeviceStatus,
    pub last_check_in: Option<DateTime<Utc>>,
    pub check_in_interval_secs: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An authority that owns configuration for a subset of devices
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MasterInstance {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub priority: i64,
    pub status: String,
    /// 0 means no limit
    pub max_devices: i64,
    /// Empty means every device type
    pub allowed_device_types: Json<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MasterInstance {
    pub fn accepts(&self, device_type: &str) -> bool {
        self.allowed_device_types.0.is_empty()
            || self.allowed_device_types.0.iter().any(|t| t == device_type)
    }

    pub fn is_limited(&self) -> bool {
        self.max_devices > 0
    }
}

/// Configuration body served to devices of one master
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConfigTemplate {
    pub id: i64,
    pub master_id: i64,
    pub device_external_id: Option<String>,
    pub device_type: Option<String>,
    pub name: String,
    pub data: Json<serde_json::Value>,
    pub version: i64,
    pub active: bool,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Sent,
    Acknowledged,
    Failed,
    Expired,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Acknowledged | CommandStatus::Failed | CommandStatus::Expired
        )
    }
}

/// A queued instruction for one device
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Command {
    pub id: i64,
    pub device_id: i64,
    pub command_type: String,
    pub payload: Json<serde_json::Value>,
    pub priority: i64,
    pub status: CommandStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub result: Option<Json<serde_json::Value>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The single canonical copy of a measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reading {
    pub id: i64,
    pub sensor_type: String,
    pub value: String,
    pub recorded_at: DateTime<Utc>,
    pub source: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    #[default]
    Primary,
    Secondary,
    Reference,
}

/// Inclusive run of reading ids consumed by one owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OwnerLink {
    pub id: i64,
    pub owner_id: i64,
    pub sensor_type: String,
    pub start_reading_id: i64,
    pub end_reading_id: i64,
    pub link_type: LinkType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OwnerLink {
    pub fn reading_count(&self) -> i64 {
        self.end_reading_id - self.start_reading_id + 1
    }

    pub fn contains(&self, reading_id: i64) -> bool {
        (self.start_reading_id..=self.end_reading_id).contains(&reading_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master(types: &[&str]) -> MasterInstance {
        MasterInstance {
            id: 1,
            name: "m".to_string(),
            description: String::new(),
            enabled: true,
            priority: 1,
            status: "active".to_string(),
            max_devices: 0,
            allowed_device_types: Json(types.iter().map(|t| t.to_string()).collect()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_master_without_type_list_accepts_everything() {
        assert!(master(&[]).accepts("esp32"));
        assert!(!master(&[]).is_limited());
    }

    #[test]
    fn test_master_type_list_filters() {
        let m = master(&["esp32_fermentation"]);
        assert!(m.accepts("esp32_fermentation"));
        assert!(!m.accepts("esp8266"));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!CommandStatus::Pending.is_terminal());
        assert!(!CommandStatus::Sent.is_terminal());
        assert!(CommandStatus::Acknowledged.is_terminal());
        assert!(CommandStatus::Failed.is_terminal());
        assert!(CommandStatus::Expired.is_terminal());
    }
}
