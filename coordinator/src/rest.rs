use crate::alarm::{AlarmRule, AlarmRuleStore, NewAlarmRule};
use crate::arbitration::{self, Assignment, MasterUpdate, NewMaster};
use crate::checkin::{AckStatus, CheckInHandler, CheckInRequest, CheckInResponse};
use crate::collaborators::OwnerDirectory;
use crate::db;
use crate::device_config::{self, NewConfigTemplate};
use crate::dispatcher::{self, NewCommand};
use crate::errors::Error;
use crate::model::{
    Command, CommandStatus, ConfigTemplate, Device, DeviceStatus, LinkType, MasterInstance,
    OwnerLink, Reading,
};
use crate::ranges::IdRange;
use crate::registry::{self, Registration};
use crate::telemetry::{
    self, CompactReport, IngestReport, NewReading, RangeSummary, ReadingStats, TelemetryStore,
    TimeRange,
};
use crate::validate;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::error::ErrorKind;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub checkin: CheckInHandler,
    pub owners: Arc<dyn OwnerDirectory>,
    pub alarm_rules: AlarmRuleStore,
    pub telemetry: TelemetryStore,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/checkin", post(check_in))
        .route("/api/v1/devices", get(list_devices).post(register_device))
        .route("/api/v1/devices/:external_id", get(get_device))
        .route("/api/v1/devices/:external_id/status", put(set_device_status))
        .route("/api/v1/devices/:external_id/master", put(assign_device_master))
        .route("/api/v1/devices/:external_id/owners", post(bind_device_owner))
        .route(
            "/api/v1/devices/:external_id/commands",
            get(list_commands).post(enqueue_command),
        )
        .route("/api/v1/commands/:id/cancel", post(cancel_command))
        .route("/api/v1/commands/:id/ack", post(ack_command))
        .route("/api/v1/masters", get(list_masters).post(create_master))
        .route("/api/v1/masters/:id", patch(update_master))
        .route("/api/v1/masters/:id/configs", post(create_config_template))
        .route("/api/v1/readings", post(ingest_reading))
        .route("/api/v1/readings/owners", get(owners_for_readings))
        .route("/api/v1/owners/:owner_id/readings", get(get_readings))
        .route("/api/v1/owners/:owner_id/ranges", get(get_ranges))
        .route("/api/v1/owners/:owner_id/ranges/import", post(import_ranges))
        .route("/api/v1/owners/:owner_id/ranges/compact", post(compact_ranges))
        .route("/api/v1/alarm-rules", get(list_alarm_rules).post(create_alarm_rule))
        .route("/api/v1/alarm-rules/:id/active", put(set_alarm_rule_active))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Result<&'static str, AppError> {
    sqlx::query("SELECT 1").execute(&state.pool).await?;
    Ok("ok")
}

async fn check_in(
    State(state): State<AppState>,
    Json(request): Json<CheckInRequest>,
) -> Result<Json<CheckInResponse>, AppError> {
    let response = state.checkin.handle(request).await.map_err(AppError::check_in)?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct DeviceListQuery {
    status: Option<DeviceStatus>,
}

async fn list_devices(
    State(state): State<AppState>,
    Query(params): Query<DeviceListQuery>,
) -> Result<Json<Vec<Device>>, AppError> {
    let mut conn = state.pool.acquire().await?;
    Ok(Json(registry::list(&mut conn, params.status).await?))
}

#[derive(Debug, Serialize)]
pub struct DeviceDetail {
    #[serde(flatten)]
    device: Device,
    owners: Vec<i64>,
    assignment: Assignment,
}

async fn get_device(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
) -> Result<Json<DeviceDetail>, AppError> {
    let mut conn = state.pool.acquire().await?;
    let device = registry::get(&mut conn, &external_id).await?;
    let owners = registry::owners_of(&mut conn, device.id).await?;
    let master = match device.assigned_master_id {
        Some(id) => arbitration::find_master(&mut conn, id).await?,
        None => None,
    };
    Ok(Json(DeviceDetail {
        assignment: Assignment::from(master.as_ref()),
        device,
        owners,
    }))
}

async fn register_device(
    State(state): State<AppState>,
    Json(registration): Json<Registration>,
) -> Result<(StatusCode, Json<Device>), AppError> {
    validate::validate_registration(&registration)?;
    let now = Utc::now();

    let mut tx = state.pool.begin().await?;
    let device = arbitration::register_device(
        &mut tx,
        &registration,
        state.checkin.settings().check_in_interval_secs,
        now,
    )
    .await?;
    tx.commit().await?;

    Ok((StatusCode::CREATED, Json(device)))
}

#[derive(Debug, Deserialize)]
pub struct StatusBody {
    status: DeviceStatus,
}

async fn set_device_status(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
    Json(body): Json<StatusBody>,
) -> Result<Json<Device>, AppError> {
    let mut conn = state.pool.acquire().await?;
    let device = registry::set_status(&mut conn, &external_id, body.status, Utc::now()).await?;
    Ok(Json(device))
}

#[derive(Debug, Deserialize)]
pub struct MasterBody {
    master_id: i64,
}

async fn assign_device_master(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
    Json(body): Json<MasterBody>,
) -> Result<Json<Device>, AppError> {
    let mut tx = state.pool.begin().await?;
    let device = registry::assign_master(&mut tx, &external_id, body.master_id, Utc::now()).await?;
    tx.commit().await?;
    Ok(Json(device))
}

#[derive(Debug, Deserialize)]
pub struct OwnerBody {
    owner_id: i64,
}

async fn bind_device_owner(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
    Json(body): Json<OwnerBody>,
) -> Result<StatusCode, AppError> {
    if !state.owners.owner_exists(body.owner_id).await? {
        return Err(Error::not_found("owner", body.owner_id).into());
    }
    let mut conn = state.pool.acquire().await?;
    registry::bind_owner(&mut conn, &external_id, body.owner_id, Utc::now()).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct EnqueueBody {
    command_type: String,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    max_attempts: Option<u32>,
    #[serde(default)]
    ttl_secs: Option<u64>,
}

async fn enqueue_command(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
    Json(body): Json<EnqueueBody>,
) -> Result<(StatusCode, Json<Command>), AppError> {
    let settings = state.checkin.settings();
    let new = NewCommand {
        command_type: body.command_type,
        payload: body.payload.unwrap_or_else(|| json!({})),
        priority: body.priority.unwrap_or(100),
        max_attempts: body.max_attempts.unwrap_or(settings.default_max_attempts),
        ttl: body
            .ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(settings.default_command_ttl),
    };

    let mut conn = state.pool.acquire().await?;
    let command = dispatcher::enqueue(&mut conn, &external_id, &new, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(command)))
}

#[derive(Debug, Deserialize)]
pub struct CommandListQuery {
    status: Option<CommandStatus>,
}

async fn list_commands(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
    Query(params): Query<CommandListQuery>,
) -> Result<Json<Vec<Command>>, AppError> {
    let mut conn = state.pool.acquire().await?;
    Ok(Json(dispatcher::list(&mut conn, &external_id, params.status).await?))
}

async fn cancel_command(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Command>, AppError> {
    let mut conn = state.pool.acquire().await?;
    Ok(Json(dispatcher::cancel(&mut conn, id, Utc::now()).await?))
}

#[derive(Debug, Deserialize)]
pub struct AckBody {
    success: bool,
    #[serde(default)]
    result: Option<Value>,
}

async fn ack_command(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<AckBody>,
) -> Result<Json<AckStatus>, AppError> {
    let mut conn = state.pool.acquire().await?;
    let outcome = dispatcher::ack(&mut conn, id, None, body.success, body.result, Utc::now()).await?;
    Ok(Json(AckStatus {
        command_id: id,
        outcome,
    }))
}

async fn list_masters(State(state): State<AppState>) -> Result<Json<Vec<MasterInstance>>, AppError> {
    let mut conn = state.pool.acquire().await?;
    Ok(Json(arbitration::list_masters(&mut conn).await?))
}

async fn create_master(
    State(state): State<AppState>,
    Json(new): Json<NewMaster>,
) -> Result<(StatusCode, Json<MasterInstance>), AppError> {
    let mut tx = state.pool.begin().await?;
    let master = arbitration::create_master(&mut tx, &new, Utc::now()).await?;
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(master)))
}

async fn update_master(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(update): Json<MasterUpdate>,
) -> Result<Json<MasterInstance>, AppError> {
    let mut tx = state.pool.begin().await?;
    let master = arbitration::update_master(&mut tx, id, &update, Utc::now()).await?;
    tx.commit().await?;
    Ok(Json(master))
}

async fn create_config_template(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(new): Json<NewConfigTemplate>,
) -> Result<(StatusCode, Json<ConfigTemplate>), AppError> {
    let mut conn = state.pool.acquire().await?;
    let template = device_config::create_template(&mut conn, id, &new, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

#[derive(Debug, Deserialize)]
pub struct IngestBody {
    #[serde(flatten)]
    reading: NewReading,
    #[serde(default)]
    owner_ids: Vec<i64>,
}

/// Readings that do not arrive through a device check-in (manual entry, imports).
async fn ingest_reading(
    State(state): State<AppState>,
    Json(body): Json<IngestBody>,
) -> Result<(StatusCode, Json<IngestReport>), AppError> {
    let report = state
        .telemetry
        .ingest(&body.reading, &body.owner_ids, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(report)))
}

#[derive(Debug, Deserialize)]
pub struct IdRangeQuery {
    start: i64,
    end: i64,
}

async fn owners_for_readings(
    State(state): State<AppState>,
    Query(params): Query<IdRangeQuery>,
) -> Result<Json<Vec<OwnerLink>>, AppError> {
    if params.end < params.start {
        return Err(Error::Validation("end must not be before start".to_string()).into());
    }
    let mut conn = state.pool.acquire().await?;
    let links = telemetry::owners_for_range(&mut conn, params.start, params.end).await?;
    Ok(Json(links))
}

#[derive(Debug, Deserialize)]
pub struct ReadingsQuery {
    sensor_type: Option<String>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    limit: Option<u32>,
    #[serde(default)]
    stats: bool,
}

#[derive(Debug, Serialize)]
pub struct ReadingsResponse {
    readings: Vec<Reading>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<ReadingStats>,
}

async fn get_readings(
    State(state): State<AppState>,
    Path(owner_id): Path<i64>,
    Query(params): Query<ReadingsQuery>,
) -> Result<Json<ReadingsResponse>, AppError> {
    let limit = params.limit.unwrap_or(100).min(1000);
    let window = TimeRange {
        start: params.start,
        end: params.end,
    };
    let sensor_type = params.sensor_type.as_deref();

    let mut conn = state.pool.acquire().await?;
    let readings =
        telemetry::get_readings(&mut conn, owner_id, sensor_type, window, Some(limit)).await?;
    let stats = if params.stats {
        Some(telemetry::reading_stats(&mut conn, owner_id, sensor_type, window).await?)
    } else {
        None
    };

    Ok(Json(ReadingsResponse { readings, stats }))
}

#[derive(Debug, Deserialize)]
pub struct RangesQuery {
    sensor_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RangesResponse {
    summary: Vec<RangeSummary>,
    links: Vec<OwnerLink>,
}

async fn get_ranges(
    State(state): State<AppState>,
    Path(owner_id): Path<i64>,
    Query(params): Query<RangesQuery>,
) -> Result<Json<RangesResponse>, AppError> {
    let mut conn = state.pool.acquire().await?;
    let summary = telemetry::range_summary(&mut conn, owner_id).await?;
    let links = telemetry::links_for(&mut conn, owner_id, params.sensor_type.as_deref()).await?;
    Ok(Json(RangesResponse { summary, links }))
}

#[derive(Debug, Deserialize)]
pub struct ImportBody {
    sensor_type: String,
    #[serde(default)]
    link_type: LinkType,
    reading_ids: Vec<i64>,
}

async fn import_ranges(
    State(state): State<AppState>,
    Path(owner_id): Path<i64>,
    Json(body): Json<ImportBody>,
) -> Result<Json<Vec<IdRange>>, AppError> {
    if !state.owners.owner_exists(owner_id).await? {
        return Err(Error::not_found("owner", owner_id).into());
    }
    let mut tx = state.pool.begin().await?;
    let inserted = telemetry::import_links(
        &mut tx,
        owner_id,
        &body.sensor_type,
        body.link_type,
        &body.reading_ids,
        Utc::now(),
    )
    .await?;
    tx.commit().await?;
    Ok(Json(inserted))
}

#[derive(Debug, Deserialize)]
pub struct CompactBody {
    sensor_type: String,
}

async fn compact_ranges(
    State(state): State<AppState>,
    Path(owner_id): Path<i64>,
    Json(body): Json<CompactBody>,
) -> Result<Json<CompactReport>, AppError> {
    let mut tx = state.pool.begin().await?;
    let report = telemetry::compact_links(&mut tx, owner_id, &body.sensor_type, Utc::now()).await?;
    tx.commit().await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct AlarmRulesQuery {
    sensor_type: Option<String>,
}

async fn list_alarm_rules(
    State(state): State<AppState>,
    Query(params): Query<AlarmRulesQuery>,
) -> Result<Json<Vec<AlarmRule>>, AppError> {
    let rules = state
        .alarm_rules
        .list_active(params.sensor_type.as_deref())
        .await?;
    Ok(Json(rules))
}

async fn create_alarm_rule(
    State(state): State<AppState>,
    Json(new): Json<NewAlarmRule>,
) -> Result<(StatusCode, Json<AlarmRule>), AppError> {
    let rule = state.alarm_rules.create(&new, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

#[derive(Debug, Deserialize)]
pub struct ActiveBody {
    active: bool,
}

async fn set_alarm_rule_active(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<ActiveBody>,
) -> Result<StatusCode, AppError> {
    state.alarm_rules.set_active(id, body.active).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub struct AppError {
    error: anyhow::Error,
    /// A rolled-back check-in is always safe for the device to repeat.
    store_failure_retryable: bool,
}

impl AppError {
    fn check_in(err: Error) -> Self {
        Self {
            error: err.into(),
            store_failure_retryable: true,
        }
    }

    fn status(&self) -> (StatusCode, bool) {
        match self.error.downcast_ref::<Error>() {
            Some(Error::Validation(_)) | Some(Error::Json(_)) => (StatusCode::BAD_REQUEST, false),
            Some(Error::NotFound { .. }) => (StatusCode::NOT_FOUND, false),
            Some(Error::CapacityExceeded { .. }) => (StatusCode::CONFLICT, false),
            Some(Error::Collaborator(_)) => (StatusCode::SERVICE_UNAVAILABLE, true),
            Some(Error::Database(e)) => self.store_status(e),
            _ => match self.error.downcast_ref::<sqlx::Error>() {
                Some(e) => self.store_status(e),
                None => (StatusCode::INTERNAL_SERVER_ERROR, false),
            },
        }
    }

    fn store_status(&self, err: &sqlx::Error) -> (StatusCode, bool) {
        if self.store_failure_retryable || db::is_transient_error(err) {
            return (StatusCode::SERVICE_UNAVAILABLE, true);
        }
        match err.as_database_error().map(|e| e.kind()) {
            Some(ErrorKind::UniqueViolation) | Some(ErrorKind::ForeignKeyViolation) => {
                (StatusCode::CONFLICT, false)
            }
            Some(ErrorKind::NotNullViolation) | Some(ErrorKind::CheckViolation) => {
                (StatusCode::BAD_REQUEST, false)
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, false),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, retryable) = self.status();
        if status.is_server_error() {
            error!("API error: {}", self.error);
        }
        (
            status,
            Json(json!({ "error": self.error.to_string(), "retryable": retryable })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self {
            error: err.into(),
            store_failure_retryable: false,
        }
    }
}
