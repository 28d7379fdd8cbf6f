//! Threshold alarms over stored readings.
//!
//! Evaluation runs after the reading is committed. A rule fires at most once
//! per cooldown window: the slot is claimed with a conditional upsert on
//! `alarm_firings`, and only the claimer emits.

use crate::collaborators::{NotificationPriority, NotificationScope, NotificationSink};
use crate::errors::{Error, Result};
use crate::metrics::ALARMS_FIRED_TOTAL;
use crate::model::Reading;
use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info, warn};

const EQUALS_TOLERANCE: f64 = 0.01;
/// One year.
pub const MAX_COOLDOWN_MINUTES: i64 = 365 * 24 * 60;

lazy_static! {
    static ref LEADING_NUMBER: Regex = Regex::new(r"^(-?\d+(?:\.\d+)?)").unwrap();
}

/// Leading signed decimal of a reading value, e.g. `"232724 bytes"` -> `232724.0`.
/// Falls back to a plain float parse for forms like `".5"` or `"+5"`.
pub fn numeric_value(text: &str) -> Option<f64> {
    let text = text.trim();
    LEADING_NUMBER
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .or_else(|| text.parse().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    GreaterThan,
    LessThan,
    Equals,
    Between,
}

impl Condition {
    pub fn holds(self, value: f64, threshold: f64, secondary: Option<f64>) -> bool {
        match self {
            Condition::GreaterThan => value > threshold,
            Condition::LessThan => value < threshold,
            Condition::Equals => (value - threshold).abs() < EQUALS_TOLERANCE,
            Condition::Between => match secondary {
                Some(other) => threshold.min(other) <= value && value <= threshold.max(other),
                None => false,
            },
        }
    }
}

/// Which readings a rule looks at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Device,
    Owner,
    #[default]
    Global,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AlarmRule {
    pub id: i64,
    pub name: String,
    pub scope: ScopeKind,
    pub scope_device: Option<String>,
    pub scope_owner: Option<i64>,
    pub sensor_type: String,
    pub condition: Condition,
    pub threshold: f64,
    pub threshold_secondary: Option<f64>,
    pub cooldown_minutes: i64,
    pub title: String,
    pub message: String,
    pub priority: NotificationPriority,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl AlarmRule {
    fn applies_to(&self, device: Option<&str>, owners: &[i64]) -> bool {
        match self.scope {
            ScopeKind::Global => true,
            ScopeKind::Device => self.scope_device.is_some() && self.scope_device.as_deref() == device,
            ScopeKind::Owner => self.scope_owner.is_some_and(|o| owners.contains(&o)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewAlarmRule {
    pub name: String,
    #[serde(default)]
    pub scope: ScopeKind,
    #[serde(default)]
    pub scope_device: Option<String>,
    #[serde(default)]
    pub scope_owner: Option<i64>,
    pub sensor_type: String,
    pub condition: Condition,
    pub threshold: f64,
    #[serde(default)]
    pub threshold_secondary: Option<f64>,
    #[serde(default = "default_cooldown")]
    pub cooldown_minutes: i64,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub priority: NotificationPriority,
}

fn default_cooldown() -> i64 {
    60
}

impl NewAlarmRule {
    fn validate(&self) -> Result<()> {
        if self.sensor_type.trim().is_empty() {
            return Err(Error::Validation("alarm rule needs a sensor type".to_string()));
        }
        if !(0..=MAX_COOLDOWN_MINUTES).contains(&self.cooldown_minutes) {
            return Err(Error::Validation(format!(
                "cooldown must be between 0 and {} minutes",
                MAX_COOLDOWN_MINUTES
            )));
        }
        if self.condition == Condition::Between && self.threshold_secondary.is_none() {
            return Err(Error::Validation(
                "between needs a secondary threshold".to_string(),
            ));
        }
        match self.scope {
            ScopeKind::Device if self.scope_device.is_none() => Err(Error::Validation(
                "device scoped rule needs scope_device".to_string(),
            )),
            ScopeKind::Owner if self.scope_owner.is_none() => Err(Error::Validation(
                "owner scoped rule needs scope_owner".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Rule administration. The evaluator itself only reads rules.
#[derive(Debug, Clone)]
pub struct AlarmRuleStore {
    pool: SqlitePool,
}

impl AlarmRuleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: &NewAlarmRule, now: DateTime<Utc>) -> Result<AlarmRule> {
        new.validate()?;
        let rule = sqlx::query_as::<_, AlarmRule>(
            r#"
            INSERT INTO alarm_rules
                (name, scope, scope_device, scope_owner, sensor_type, condition, threshold,
                 threshold_secondary, cooldown_minutes, title, message, priority, active, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 1, ?13)
            RETURNING *
            "#,
        )
        .bind(&new.name)
        .bind(new.scope)
        .bind(&new.scope_device)
        .bind(new.scope_owner)
        .bind(&new.sensor_type)
        .bind(new.condition)
        .bind(new.threshold)
        .bind(new.threshold_secondary)
        .bind(new.cooldown_minutes)
        .bind(&new.title)
        .bind(&new.message)
        .bind(new.priority)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        info!(rule_id = rule.id, sensor_type = %rule.sensor_type, "Alarm rule created");
        Ok(rule)
    }

    pub async fn list_active(&self, sensor_type: Option<&str>) -> Result<Vec<AlarmRule>> {
        let rules = sqlx::query_as::<_, AlarmRule>(
            "SELECT * FROM alarm_rules WHERE active = 1 AND (?1 IS NULL OR sensor_type = ?1) ORDER BY id",
        )
        .bind(sensor_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(rules)
    }

    pub async fn set_active(&self, rule_id: i64, active: bool) -> Result<()> {
        let updated = sqlx::query("UPDATE alarm_rules SET active = ?1 WHERE id = ?2")
            .bind(active)
            .bind(rule_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(Error::not_found("alarm rule", rule_id));
        }
        Ok(())
    }
}

/// An alarm that fired and was handed to the sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FiredAlarm {
    pub rule_id: i64,
    pub rule_name: String,
    pub reading_id: i64,
    pub value: f64,
}

#[derive(Clone)]
pub struct AlarmEvaluator {
    pool: SqlitePool,
    sink: Arc<dyn NotificationSink>,
}

impl AlarmEvaluator {
    pub fn new(pool: SqlitePool, sink: Arc<dyn NotificationSink>) -> Self {
        Self { pool, sink }
    }

    /// Checks one committed reading against the active rules for its sensor type.
    ///
    /// `device` is the submitting device's external id, `owners` the owners
    /// the reading was linked to. Values without a leading number are skipped.
    pub async fn evaluate(
        &self,
        reading: &Reading,
        device: Option<&str>,
        owners: &[i64],
        now: DateTime<Utc>,
    ) -> Result<Vec<FiredAlarm>> {
        let rules = sqlx::query_as::<_, AlarmRule>(
            "SELECT * FROM alarm_rules WHERE active = 1 AND sensor_type = ? ORDER BY id",
        )
        .bind(&reading.sensor_type)
        .fetch_all(&self.pool)
        .await?;
        if rules.is_empty() {
            return Ok(Vec::new());
        }

        let Some(value) = numeric_value(&reading.value) else {
            debug!(reading_id = reading.id, value = %reading.value, "Reading is not numeric, skipping alarms");
            return Ok(Vec::new());
        };

        let mut fired = Vec::new();
        for rule in rules {
            if !rule.applies_to(device, owners)
                || !rule.condition.holds(value, rule.threshold, rule.threshold_secondary)
            {
                continue;
            }
            if !self.claim_cooldown(&rule, now).await? {
                debug!(rule_id = rule.id, "Alarm still cooling down");
                continue;
            }

            let scope = NotificationScope {
                rule_id: rule.id,
                sensor_type: reading.sensor_type.clone(),
                reading_id: reading.id,
                device: device.map(str::to_string),
                owner_ids: owners.to_vec(),
            };
            if let Err(e) = self
                .sink
                .emit_notification(&rule.title, &rule.message, rule.priority, &scope)
                .await
            {
                warn!(rule_id = rule.id, "Failed to emit alarm notification: {}", e);
            }

            ALARMS_FIRED_TOTAL.inc();
            info!(rule_id = rule.id, reading_id = reading.id, value, "Alarm fired");
            fired.push(FiredAlarm {
                rule_id: rule.id,
                rule_name: rule.name,
                reading_id: reading.id,
                value,
            });
        }

        Ok(fired)
    }

    /// A cooldown reaching past the calendar never expires: the rule fires once.
    async fn claim_cooldown(&self, rule: &AlarmRule, now: DateTime<Utc>) -> Result<bool> {
        let cutoff = Duration::try_minutes(rule.cooldown_minutes)
            .and_then(|cooldown| now.checked_sub_signed(cooldown));
        let claimed = sqlx::query(
            r#"
            INSERT INTO alarm_firings (rule_id, last_fired_at) VALUES (?1, ?2)
            ON CONFLICT(rule_id) DO UPDATE SET last_fired_at = excluded.last_fired_at
            WHERE ?3 IS NOT NULL AND alarm_firings.last_fired_at <= ?3
            "#,
        )
        .bind(rule.id)
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(claimed == 1)
    }
}
