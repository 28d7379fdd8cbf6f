//! Interfaces to the systems the coordinator depends on but does not own:
//! the record store that owns telemetry consumers, and the notification sink.

use crate::errors::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::{info, warn};

/// Answers whether an owner reference points at a live record.
#[async_trait]
pub trait OwnerDirectory: Send + Sync {
    async fn owner_exists(&self, owner_id: i64) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// What an emitted notification is about.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationScope {
    pub rule_id: i64,
    pub sensor_type: String,
    pub reading_id: i64,
    pub device: Option<String>,
    pub owner_ids: Vec<i64>,
}

/// Delivers alarm notifications. Delivery channels live behind this trait.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn emit_notification(
        &self,
        title: &str,
        message: &str,
        priority: NotificationPriority,
        scope: &NotificationScope,
    ) -> Result<()>;
}

/// Looks owners up in a table of the record store database.
#[derive(Debug, Clone)]
pub struct SqlOwnerDirectory {
    pool: SqlitePool,
    query: String,
}

impl SqlOwnerDirectory {
    pub fn new(pool: SqlitePool, table: &str) -> Result<Self> {
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::Validation(format!(
                "invalid record store table name: {:?}",
                table
            )));
        }

        Ok(Self {
            pool,
            query: format!("SELECT 1 FROM \"{}\" WHERE id = ? LIMIT 1", table),
        })
    }
}

#[async_trait]
impl OwnerDirectory for SqlOwnerDirectory {
    async fn owner_exists(&self, owner_id: i64) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(&self.query)
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Collaborator(format!("record store lookup failed: {}", e)))?;
        Ok(row.is_some())
    }
}

/// Fixed owner set, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticOwnerDirectory {
    owners: HashSet<i64>,
}

impl StaticOwnerDirectory {
    pub fn new<I: IntoIterator<Item = i64>>(owners: I) -> Self {
        Self {
            owners: owners.into_iter().collect(),
        }
    }
}

#[async_trait]
impl OwnerDirectory for StaticOwnerDirectory {
    async fn owner_exists(&self, owner_id: i64) -> Result<bool> {
        Ok(self.owners.contains(&owner_id))
    }
}

/// Writes notifications to the log under the `notifications` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn emit_notification(
        &self,
        title: &str,
        message: &str,
        priority: NotificationPriority,
        scope: &NotificationScope,
    ) -> Result<()> {
        match priority {
            NotificationPriority::High | NotificationPriority::Critical => warn!(
                target: "notifications",
                rule_id = scope.rule_id,
                reading_id = scope.reading_id,
                sensor_type = %scope.sensor_type,
                device = ?scope.device,
                owners = ?scope.owner_ids,
                ?priority,
                "{}: {}",
                title,
                message
            ),
            _ => info!(
                target: "notifications",
                rule_id = scope.rule_id,
                reading_id = scope.reading_id,
                sensor_type = %scope.sensor_type,
                device = ?scope.device,
                owners = ?scope.owner_ids,
                ?priority,
                "{}: {}",
                title,
                message
            ),
        }
        Ok(())
    }
}

/// A notification captured by [`MemoryNotificationSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedNotification {
    pub title: String,
    pub message: String,
    pub priority: NotificationPriority,
    pub scope: NotificationScope,
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct MemoryNotificationSink {
    sent: Mutex<Vec<EmittedNotification>>,
}

impl MemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitted(&self) -> Vec<EmittedNotification> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for MemoryNotificationSink {
    async fn emit_notification(
        &self,
        title: &str,
        message: &str,
        priority: NotificationPriority,
        scope: &NotificationScope,
    ) -> Result<()> {
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| Error::Collaborator("notification buffer poisoned".to_string()))?;
        sent.push(EmittedNotification {
            title: title.to_string(),
            message: message.to_string(),
            priority,
            scope: scope.clone(),
        });
        Ok(())
    }
}
