//! The check-in round trip.
//!
//! Devices are pull-only: they post their identity, telemetry and command
//! acknowledgments, and get back their assignment, configuration (when the
//! hash they hold is stale) and the next commands to run. Everything except
//! alarm evaluation happens in one transaction whose first statement is a
//! write, so concurrent check-ins for the same device are serialized by the
//! database and a failure leaves no partial state behind.

use crate::alarm::AlarmEvaluator;
use crate::arbitration::{self, Assignment};
use crate::collaborators::OwnerDirectory;
use crate::config::CheckInSettings;
use crate::device_config;
use crate::dispatcher::{self, AckOutcome, DeliveredCommand};
use crate::errors::Result;
use crate::metrics::{CHECKINS_TOTAL, CHECKIN_FAILURES_TOTAL, CHECKIN_LATENCY_SECONDS};
use crate::model::{MasterInstance, Reading};
use crate::registry::{self, Registration};
use crate::telemetry::{self, IngestReport, NewReading, OwnerCheck};
use crate::validate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckInRequest {
    pub device_id: String,
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
    /// Hash of the configuration the device is running.
    #[serde(default)]
    pub config_hash: Option<String>,
    #[serde(default)]
    pub telemetry: Vec<TelemetryItem>,
    #[serde(default)]
    pub acks: Vec<CommandAck>,
}

impl CheckInRequest {
    pub fn registration(&self) -> Registration {
        Registration {
            external_id: self.device_id.clone(),
            name: self.name.clone(),
            device_type: self.device_type.clone(),
            capabilities: self.capabilities.clone(),
            hardware_info: self.hardware_info.clone(),
            firmware_version: self.firmware_version.clone(),
            check_in_interval_secs: self.check_in_interval_secs,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryItem {
    pub sensor_type: String,
    /// String or scalar; stored as text.
    pub value: Value,
    #[serde(default)]
    pub recorded_at: Option<DateTime<Utc>>,
    /// `None` falls back to the device's owner bindings.
    #[serde(default)]
    pub owner_ids: Option<Vec<i64>>,
}

impl TelemetryItem {
    pub fn value_text(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn to_reading(&self, source: &str, now: DateTime<Utc>) -> NewReading {
        NewReading {
            sensor_type: self.sensor_type.clone(),
            value: self.value_text(),
            recorded_at: self.recorded_at.unwrap_or(now),
            source: source.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandAck {
    pub command_id: i64,
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConfigStatus {
    Changed { hash: String, body: Value },
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AckStatus {
    pub command_id: i64,
    pub outcome: AckOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckInResponse {
    #[serde(flatten)]
    pub assignment: Assignment,
    pub config: ConfigStatus,
    pub commands: Vec<DeliveredCommand>,
    pub acks: Vec<AckStatus>,
    pub telemetry: Vec<IngestReport>,
    pub check_in_interval_secs: i64,
    pub server_time: DateTime<Utc>,
}

#[derive(Clone)]
pub struct CheckInHandler {
    pool: SqlitePool,
    settings: CheckInSettings,
    owners: Arc<dyn OwnerDirectory>,
    alarms: AlarmEvaluator,
}

impl CheckInHandler {
    pub fn new(
        pool: SqlitePool,
        settings: CheckInSettings,
        owners: Arc<dyn OwnerDirectory>,
        alarms: AlarmEvaluator,
    ) -> Self {
        Self {
            pool,
            settings,
            owners,
            alarms,
        }
    }

    pub fn settings(&self) -> &CheckInSettings {
        &self.settings
    }

    pub async fn handle(&self, request: CheckInRequest) -> Result<CheckInResponse> {
        self.handle_at(request, Utc::now()).await
    }

    pub async fn handle_at(
        &self,
        request: CheckInRequest,
        now: DateTime<Utc>,
    ) -> Result<CheckInResponse> {
        let timer = CHECKIN_LATENCY_SECONDS.start_timer();
        validate::validate_checkin(&request, self.settings.max_telemetry_batch)?;

        let default_owners = if request.telemetry.iter().any(|t| t.owner_ids.is_none()) {
            self.bound_owners(&request.device_id).await?
        } else {
            Vec::new()
        };
        let requested = request
            .telemetry
            .iter()
            .flat_map(|t| t.owner_ids.as_deref().unwrap_or(default_owners.as_slice()))
            .copied()
            .collect::<Vec<_>>();
        let check = telemetry::check_owners(self.owners.as_ref(), requested).await;

        let (mut response, stored) = match self.apply(&request, &default_owners, &check, now).await
        {
            Ok(applied) => applied,
            Err(e) => {
                CHECKIN_FAILURES_TOTAL.inc();
                warn!(device = %request.device_id, "Check-in rolled back: {}", e);
                return Err(e);
            }
        };

        for (report, reading) in response.telemetry.iter_mut().zip(stored.iter()) {
            match self
                .alarms
                .evaluate(reading, Some(request.device_id.as_str()), &report.linked, now)
                .await
            {
                Ok(fired) => report.alarms = fired,
                Err(e) => warn!(reading_id = reading.id, "Alarm evaluation failed: {}", e),
            }
        }

        CHECKINS_TOTAL.inc();
        timer.observe_duration();
        info!(
            device = %request.device_id,
            readings = response.telemetry.len(),
            acks = response.acks.len(),
            commands = response.commands.len(),
            "Check-in handled"
        );
        Ok(response)
    }

    async fn bound_owners(&self, external_id: &str) -> Result<Vec<i64>> {
        let mut conn = self.pool.acquire().await?;
        match registry::find(&mut conn, external_id).await? {
            Some(device) => registry::owners_of(&mut conn, device.id).await,
            None => Ok(Vec::new()),
        }
    }

    async fn apply(
        &self,
        request: &CheckInRequest,
        default_owners: &[i64],
        check: &OwnerCheck,
        now: DateTime<Utc>,
    ) -> Result<(CheckInResponse, Vec<Reading>)> {
        let mut tx = self.pool.begin().await?;

        registry::register(
            &mut tx,
            &request.registration(),
            self.settings.check_in_interval_secs,
            now,
        )
        .await?;
        let device = registry::touch(&mut tx, &request.device_id, now).await?;

        let master: Option<MasterInstance> = match device.assigned_master_id {
            None => arbitration::arbitrate(&mut tx, &device, now).await?,
            Some(id) => arbitration::find_master(&mut tx, id).await?,
        };

        let mut reports = Vec::with_capacity(request.telemetry.len());
        let mut stored = Vec::with_capacity(request.telemetry.len());
        for item in &request.telemetry {
            let owners = item.owner_ids.as_deref().unwrap_or(default_owners);
            let (linked, rejected) = check.partition(owners);
            let reading = telemetry::ingest(
                &mut tx,
                &item.to_reading(&device.external_id, now),
                &linked,
                now,
            )
            .await?;
            reports.push(IngestReport {
                reading_id: reading.id,
                linked,
                rejected,
                alarms: Vec::new(),
            });
            stored.push(reading);
        }

        let mut acks = Vec::with_capacity(request.acks.len());
        for ack in &request.acks {
            let outcome = dispatcher::ack(
                &mut tx,
                ack.command_id,
                Some(device.id),
                ack.success,
                ack.result.clone(),
                now,
            )
            .await?;
            acks.push(AckStatus {
                command_id: ack.command_id,
                outcome,
            });
        }

        let resolved = device_config::resolve(&mut tx, &device, master.as_ref()).await?;
        let config = if request.config_hash.as_deref() == Some(resolved.hash.as_str()) {
            ConfigStatus::Unchanged
        } else {
            registry::record_config_hash(&mut tx, device.id, &resolved.hash, now).await?;
            debug!(device = %device.external_id, hash = %resolved.hash, "Sending configuration");
            ConfigStatus::Changed {
                hash: resolved.hash,
                body: resolved.body,
            }
        };

        let commands = dispatcher::claim_next(
            &mut tx,
            device.id,
            self.settings.claim_limit,
            now,
            self.settings.retry_window,
        )
        .await?;

        tx.commit().await?;

        let response = CheckInResponse {
            assignment: Assignment::from(master.as_ref()),
            config,
            commands,
            acks,
            telemetry: reports,
            check_in_interval_secs: device.check_in_interval_secs,
            server_time: now,
        };
        Ok((response, stored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitration::{create_master, NewMaster};
    use crate::collaborators::{MemoryNotificationSink, StaticOwnerDirectory};
    use crate::db::memory_pool;
    use crate::errors::Error;
    use crate::model::DeviceStatus;
    use serde_json::json;

    async fn handler(pool: &SqlitePool, owners: &[i64]) -> CheckInHandler {
        CheckInHandler::new(
            pool.clone(),
            CheckInSettings::default(),
            Arc::new(StaticOwnerDirectory::new(owners.iter().copied())),
            AlarmEvaluator::new(pool.clone(), Arc::new(MemoryNotificationSink::new())),
        )
    }

    fn request(device_id: &str) -> CheckInRequest {
        CheckInRequest {
            device_id: device_id.to_string(),
            device_type: Some("esp32".to_string()),
            ..CheckInRequest::default()
        }
    }

    #[tokio::test]
    async fn test_first_check_in_registers_and_sends_config() {
        let pool = memory_pool().await.unwrap();
        let handler = handler(&pool, &[]).await;

        let response = handler.handle(request("D1")).await.unwrap();
        assert_eq!(response.assignment, Assignment::Standalone);
        let hash = match &response.config {
            ConfigStatus::Changed { hash, .. } => hash.clone(),
            ConfigStatus::Unchanged => panic!("first check-in must carry configuration"),
        };

        let mut conn = pool.acquire().await.unwrap();
        let device = registry::get(&mut conn, "D1").await.unwrap();
        assert_eq!(device.status, DeviceStatus::Active);
        assert_eq!(device.config_hash.as_deref(), Some(hash.as_str()));
        drop(conn);

        let mut again = request("D1");
        again.config_hash = Some(hash);
        let second = handler.handle(again).await.unwrap();
        assert_eq!(second.config, ConfigStatus::Unchanged);
    }

    #[tokio::test]
    async fn test_check_in_assigns_master() {
        let pool = memory_pool().await.unwrap();
        {
            let mut conn = pool.acquire().await.unwrap();
            create_master(&mut conn, &NewMaster::new("M1"), Utc::now()).await.unwrap();
        }
        let handler = handler(&pool, &[]).await;

        let response = handler.handle(request("D1")).await.unwrap();
        match response.assignment {
            Assignment::Managed { master_name, .. } => assert_eq!(master_name, "M1"),
            Assignment::Standalone => panic!("expected a managed device"),
        }
    }

    #[tokio::test]
    async fn test_telemetry_uses_bindings_and_reports_rejections() {
        let pool = memory_pool().await.unwrap();
        let handler = handler(&pool, &[42]).await;
        handler.handle(request("D1")).await.unwrap();
        {
            let mut conn = pool.acquire().await.unwrap();
            registry::bind_owner(&mut conn, "D1", 42, Utc::now()).await.unwrap();
        }

        let mut req = request("D1");
        req.telemetry = vec![
            TelemetryItem {
                sensor_type: "temp".to_string(),
                value: json!(21.5),
                recorded_at: None,
                owner_ids: None,
            },
            TelemetryItem {
                sensor_type: "temp".to_string(),
                value: json!("22 C"),
                recorded_at: None,
                owner_ids: Some(vec![42, 77]),
            },
        ];
        let response = handler.handle(req).await.unwrap();

        assert_eq!(response.telemetry.len(), 2);
        assert_eq!(response.telemetry[0].linked, vec![42]);
        assert!(response.telemetry[0].rejected.is_empty());
        assert_eq!(response.telemetry[1].linked, vec![42]);
        assert_eq!(response.telemetry[1].rejected[0].owner_id, 77);

        let mut conn = pool.acquire().await.unwrap();
        let links = telemetry::links_for(&mut conn, 42, Some("temp")).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].reading_count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_request_changes_nothing() {
        let pool = memory_pool().await.unwrap();
        let handler = handler(&pool, &[]).await;

        let mut req = request("D1");
        req.telemetry = vec![TelemetryItem {
            sensor_type: String::new(),
            value: json!(1),
            recorded_at: None,
            owner_ids: None,
        }];
        assert!(matches!(handler.handle(req).await, Err(Error::Validation(_))));

        let mut conn = pool.acquire().await.unwrap();
        assert!(registry::find(&mut conn, "D1").await.unwrap().is_none());
    }

    #[test]
    fn test_value_text() {
        let item = |value: Value| TelemetryItem {
            sensor_type: "temp".to_string(),
            value,
            recorded_at: None,
            owner_ids: None,
        };
        assert_eq!(item(json!("21.5 C")).value_text(), "21.5 C");
        assert_eq!(item(json!(21.5)).value_text(), "21.5");
        assert_eq!(item(json!(true)).value_text(), "true");
    }
}
