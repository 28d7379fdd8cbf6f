//! Per-device command queue.
//!
//! Commands move `pending -> sent -> acknowledged | failed`, or to `expired`
//! once `expires_at` passes. The delivery that uses the last attempt moves the
//! command straight to `failed`. Every transition is a conditional update keyed on
//! the state the caller observed, so two check-ins racing for the same
//! command cannot both deliver it: the loser's update matches no row and the
//! command is simply not part of its response.

use crate::errors::{Error, Result};
use crate::metrics::{CLAIM_CONFLICTS_TOTAL, COMMANDS_CLAIMED_TOTAL, COMMANDS_EXHAUSTED_TOTAL};
use crate::model::{Command, CommandStatus};
use crate::registry;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::types::Json;
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

/// A command to put on a device's queue.
#[derive(Debug, Clone)]
pub struct NewCommand {
    pub command_type: String,
    pub payload: Value,
    pub priority: i64,
    pub max_attempts: u32,
    pub ttl: std::time::Duration,
}

/// A command as handed to the device in a check-in response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveredCommand {
    pub id: i64,
    pub command_type: String,
    pub payload: Value,
    pub priority: i64,
    pub attempt: i64,
    pub max_attempts: i64,
    pub expires_at: DateTime<Utc>,
}

/// What happened to an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    Accepted,
    UnknownCommand,
    WrongDevice,
    NotDelivered,
    AlreadyFinal,
}

pub async fn enqueue(
    conn: &mut SqliteConnection,
    external_id: &str,
    new: &NewCommand,
    now: DateTime<Utc>,
) -> Result<Command> {
    if new.command_type.trim().is_empty() {
        return Err(Error::Validation("command type cannot be empty".to_string()));
    }
    if new.max_attempts == 0 {
        return Err(Error::Validation("max_attempts must be at least 1".to_string()));
    }
    let ttl = Duration::from_std(new.ttl)
        .map_err(|e| Error::Validation(format!("ttl out of range: {}", e)))?;
    if ttl <= Duration::zero() {
        return Err(Error::Validation("ttl must be positive".to_string()));
    }

    let expires_at = now
        .checked_add_signed(ttl)
        .ok_or_else(|| Error::Validation(format!("ttl of {}s is too far out", ttl.num_seconds())))?;

    let device = registry::get(conn, external_id).await?;
    let command = sqlx::query_as::<_, Command>(
        r#"
        INSERT INTO commands
            (device_id, command_type, payload, priority, status, attempts, max_attempts,
             created_at, expires_at)
        VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6, ?7)
        RETURNING *
        "#,
    )
    .bind(device.id)
    .bind(&new.command_type)
    .bind(Json(&new.payload))
    .bind(new.priority)
    .bind(i64::from(new.max_attempts))
    .bind(now)
    .bind(expires_at)
    .fetch_one(&mut *conn)
    .await?;

    info!(
        device = %external_id,
        command_id = command.id,
        command_type = %command.command_type,
        "Command queued"
    );
    Ok(command)
}

/// Hands out up to `limit` deliverable commands for the device.
///
/// Deliverable means unexpired and either `pending`, or `sent` without an
/// acknowledgment for longer than `retry_window` with attempts left. Each
/// delivery increments `attempts`; the one reaching `max_attempts` is still
/// handed out but leaves the command `failed`, so it is never offered again.
pub async fn claim_next(
    conn: &mut SqliteConnection,
    device_id: i64,
    limit: u32,
    now: DateTime<Utc>,
    retry_window: std::time::Duration,
) -> Result<Vec<DeliveredCommand>> {
    let cutoff = retry_cutoff(now, retry_window)?;

    if limit == 0 {
        return Ok(Vec::new());
    }

    let candidates = sqlx::query_as::<_, Command>(
        r#"
        SELECT * FROM commands
        WHERE device_id = ?1
          AND expires_at > ?2
          AND (status = 'pending'
               OR (status = 'sent' AND last_sent_at <= ?3 AND attempts < max_attempts))
        ORDER BY priority ASC, created_at ASC, id ASC
        LIMIT ?4
        "#,
    )
    .bind(device_id)
    .bind(now)
    .bind(cutoff)
    .bind(i64::from(limit))
    .fetch_all(&mut *conn)
    .await?;

    let mut delivered = Vec::with_capacity(candidates.len());
    for command in candidates {
        if let Some(status) = try_claim(conn, &command, now).await? {
            COMMANDS_CLAIMED_TOTAL.inc();
            if status == CommandStatus::Failed {
                COMMANDS_EXHAUSTED_TOTAL.inc();
                info!(command_id = command.id, "Last attempt delivered, command failed");
            }
            delivered.push(DeliveredCommand {
                id: command.id,
                command_type: command.command_type,
                payload: command.payload.0,
                priority: command.priority,
                attempt: command.attempts + 1,
                max_attempts: command.max_attempts,
                expires_at: command.expires_at,
            });
        } else {
            CLAIM_CONFLICTS_TOTAL.inc();
            debug!(command_id = command.id, "Command claimed by a concurrent check-in");
        }
    }

    Ok(delivered)
}

/// Delivers one observed command and returns its new status: `sent`, or
/// `failed` when this was the last attempt. `None` means someone else got
/// there first.
pub(crate) async fn try_claim(
    conn: &mut SqliteConnection,
    observed: &Command,
    now: DateTime<Utc>,
) -> Result<Option<CommandStatus>> {
    let status = sqlx::query_scalar::<_, CommandStatus>(
        r#"
        UPDATE commands
        SET attempts = attempts + 1,
            last_sent_at = ?1,
            status = CASE WHEN attempts + 1 >= max_attempts THEN 'failed' ELSE 'sent' END,
            result = CASE WHEN attempts + 1 >= max_attempts THEN ?5 ELSE result END,
            completed_at = CASE WHEN attempts + 1 >= max_attempts THEN ?1 ELSE completed_at END
        WHERE id = ?2
          AND status = ?3
          AND attempts = ?4
          AND attempts < max_attempts
          AND expires_at > ?1
        RETURNING status
        "#,
    )
    .bind(now)
    .bind(observed.id)
    .bind(observed.status)
    .bind(observed.attempts)
    .bind(Json(json!({ "error": "max attempts exhausted without acknowledgment" })))
    .fetch_optional(&mut *conn)
    .await?;

    Ok(status)
}

/// Applies a device's acknowledgment. Stale or foreign acks are reported, not raised.
pub async fn ack(
    conn: &mut SqliteConnection,
    command_id: i64,
    device_id: Option<i64>,
    success: bool,
    result: Option<Value>,
    now: DateTime<Utc>,
) -> Result<AckOutcome> {
    let status = if success {
        CommandStatus::Acknowledged
    } else {
        CommandStatus::Failed
    };

    let updated = sqlx::query(
        r#"
        UPDATE commands
        SET status = ?1, result = ?2, completed_at = ?3
        WHERE id = ?4 AND status = 'sent' AND (?5 IS NULL OR device_id = ?5)
        "#,
    )
    .bind(status)
    .bind(result.map(Json))
    .bind(now)
    .bind(command_id)
    .bind(device_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if updated == 1 {
        debug!(command_id, ?status, "Command acknowledged");
        return Ok(AckOutcome::Accepted);
    }

    let outcome = match find(conn, command_id).await? {
        None => AckOutcome::UnknownCommand,
        Some(c) if device_id.is_some_and(|d| d != c.device_id) => AckOutcome::WrongDevice,
        Some(c) if c.status.is_terminal() => AckOutcome::AlreadyFinal,
        Some(_) => AckOutcome::NotDelivered,
    };
    warn!(command_id, ?outcome, "Acknowledgment ignored");
    Ok(outcome)
}

/// Admin cancellation: a non-final command becomes `failed`.
pub async fn cancel(
    conn: &mut SqliteConnection,
    command_id: i64,
    now: DateTime<Utc>,
) -> Result<Command> {
    let cancelled = sqlx::query_as::<_, Command>(
        r#"
        UPDATE commands
        SET status = 'failed', result = ?1, completed_at = ?2
        WHERE id = ?3 AND status IN ('pending', 'sent')
        RETURNING *
        "#,
    )
    .bind(Json(json!({ "cancelled": true })))
    .bind(now)
    .bind(command_id)
    .fetch_optional(&mut *conn)
    .await?;

    match cancelled {
        Some(command) => {
            info!(command_id, "Command cancelled");
            Ok(command)
        }
        None => match find(conn, command_id).await? {
            None => Err(Error::not_found("command", command_id)),
            Some(c) => Err(Error::Validation(format!(
                "command {} is already {:?}",
                command_id, c.status
            ))),
        },
    }
}

pub async fn find(conn: &mut SqliteConnection, command_id: i64) -> Result<Option<Command>> {
    let command = sqlx::query_as::<_, Command>("SELECT * FROM commands WHERE id = ?")
        .bind(command_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(command)
}

pub async fn get(conn: &mut SqliteConnection, command_id: i64) -> Result<Command> {
    find(conn, command_id)
        .await?
        .ok_or_else(|| Error::not_found("command", command_id))
}

pub async fn list(
    conn: &mut SqliteConnection,
    external_id: &str,
    status: Option<CommandStatus>,
) -> Result<Vec<Command>> {
    let device = registry::get(conn, external_id).await?;
    let commands = sqlx::query_as::<_, Command>(
        r#"
        SELECT * FROM commands
        WHERE device_id = ?1 AND (?2 IS NULL OR status = ?2)
        ORDER BY priority ASC, created_at ASC, id ASC
        "#,
    )
    .bind(device.id)
    .bind(status)
    .fetch_all(&mut *conn)
    .await?;
    Ok(commands)
}

/// Every non-final command past `expires_at` becomes `expired`.
pub async fn expire_overdue(conn: &mut SqliteConnection, now: DateTime<Utc>) -> Result<u64> {
    let expired = sqlx::query(
        "UPDATE commands SET status = 'expired', completed_at = ?1 \
         WHERE status IN ('pending', 'sent') AND expires_at <= ?1",
    )
    .bind(now)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if expired > 0 {
        info!("Expired {} commands", expired);
    }
    Ok(expired)
}

fn retry_cutoff(now: DateTime<Utc>, retry_window: std::time::Duration) -> Result<DateTime<Utc>> {
    let window = Duration::from_std(retry_window)
        .map_err(|e| Error::Validation(format!("retry window out of range: {}", e)))?;
    now.checked_sub_signed(window).ok_or_else(|| {
        Error::Validation(format!("retry window of {}s is too long", window.num_seconds()))
    })
}
