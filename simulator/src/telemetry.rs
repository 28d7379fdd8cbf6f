use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of `POST /api/v1/checkin`.
#[derive(Debug, Clone, Serialize)]
pub struct CheckIn {
    pub device_id: String,
    pub device_type: String,
    pub firmware_version: String,
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
    pub telemetry: Vec<Reading>,
    pub acks: Vec<CommandAck>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    pub sensor_type: String,
    pub value: Value,
    pub recorded_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_ids: Option<Vec<i64>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandAck {
    pub command_id: i64,
    pub success: bool,
    pub result: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckInReply {
    pub mode: String,
    #[serde(default)]
    pub master_name: Option<String>,
    pub config: ConfigReply,
    pub commands: Vec<Command>,
    pub check_in_interval_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigReply {
    pub status: String,
    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Command {
    pub id: i64,
    pub command_type: String,
    #[serde(default)]
    pub payload: Value,
    pub attempt: i64,
}

pub const CAPABILITIES: [&str; 3] = ["temperature", "humidity", "battery"];

/// One reading per capability, with occasional outliers.
pub fn generate_readings(rng: &mut impl Rng, owners: Option<&[i64]>) -> Vec<Reading> {
    let temperature = if rng.gen_bool(0.05) {
        rng.gen_range(-50.0..100.0) // 5% outliers
    } else {
        rng.gen_range(15.0..35.0)
    };

    let humidity = if rng.gen_bool(0.05) {
        rng.gen_range(0.0..100.0)
    } else {
        rng.gen_range(30.0..80.0)
    };

    let battery = if rng.gen_bool(0.02) {
        rng.gen_range(0.0..20.0) // 2% low battery
    } else {
        rng.gen_range(20.0..100.0)
    };

    let now = Utc::now();
    let owner_ids = owners.map(|o| o.to_vec());
    [
        ("temperature", format!("{:.2} C", temperature)),
        ("humidity", format!("{:.1} %", humidity)),
        ("battery", format!("{:.0} %", battery)),
    ]
    .into_iter()
    .map(|(sensor_type, value)| Reading {
        sensor_type: sensor_type.to_string(),
        value: Value::String(value),
        recorded_at: now,
        owner_ids: owner_ids.clone(),
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_reading_per_capability() {
        let mut rng = rand::thread_rng();
        let readings = generate_readings(&mut rng, Some(&[42]));
        assert_eq!(readings.len(), CAPABILITIES.len());
        assert!(readings.iter().all(|r| r.owner_ids.as_deref() == Some(&[42][..])));
    }

    #[test]
    fn test_reply_parses_standalone_response() {
        let body = r#"{
            "mode": "standalone",
            "config": { "status": "unchanged" },
            "commands": [],
            "acks": [],
            "telemetry": [],
            "check_in_interval_secs": 300,
            "server_time": "2024-01-01T00:00:00Z"
        }"#;
        let reply: CheckInReply = serde_json::from_str(body).unwrap();
        assert_eq!(reply.mode, "standalone");
        assert!(reply.master_name.is_none());
        assert!(reply.config.hash.is_none());
    }
}
