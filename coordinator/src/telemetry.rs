//! Shared telemetry store.
//!
//! Every measurement is stored once in `telemetry_readings`. Owners consume
//! readings through `owner_links`, inclusive `(start, end)` runs of reading
//! ids per `(owner, sensor_type, link_type)`. Ingest extends the owner's most
//! recent run in place when the new id is the next one, and opens a new run
//! otherwise.

use crate::alarm::{numeric_value, AlarmEvaluator, FiredAlarm};
use crate::collaborators::OwnerDirectory;
use crate::errors::{Error, Result};
use crate::metrics::{LINKS_REJECTED_TOTAL, RANGES_OPENED_TOTAL, READINGS_INGESTED_TOTAL};
use crate::model::{LinkType, OwnerLink, Reading};
use crate::ranges::{self, IdRange};
use crate::validate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct NewReading {
    pub sensor_type: String,
    pub value: String,
    pub recorded_at: DateTime<Utc>,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedLink {
    pub owner_id: i64,
    pub reason: String,
}

/// Result of storing one reading.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub reading_id: i64,
    pub linked: Vec<i64>,
    pub rejected: Vec<RejectedLink>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alarms: Vec<FiredAlarm>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Extended { link_id: i64 },
    Opened { link_id: i64 },
}

/// Inclusive bounds on `recorded_at`; either side may be open.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReadingStats {
    pub count: usize,
    pub numeric_count: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub first_recorded_at: Option<DateTime<Utc>>,
    pub last_recorded_at: Option<DateTime<Utc>>,
}

impl ReadingStats {
    pub fn from_readings(readings: &[Reading]) -> Self {
        let mut stats = ReadingStats {
            count: readings.len(),
            first_recorded_at: readings.iter().map(|r| r.recorded_at).min(),
            last_recorded_at: readings.iter().map(|r| r.recorded_at).max(),
            ..Self::default()
        };

        let mut sum = 0.0;
        for value in readings.iter().filter_map(|r| numeric_value(&r.value)) {
            stats.numeric_count += 1;
            sum += value;
            stats.min = Some(stats.min.map_or(value, |m| m.min(value)));
            stats.max = Some(stats.max.map_or(value, |m| m.max(value)));
        }
        if stats.numeric_count > 0 {
            stats.mean = Some(sum / stats.numeric_count as f64);
        }
        stats
    }
}

/// Per `(sensor_type, link_type)` view of one owner's links.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeSummary {
    pub sensor_type: String,
    pub link_type: LinkType,
    pub ranges: usize,
    pub first_reading_id: i64,
    pub last_reading_id: i64,
    pub readings_covered: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactReport {
    pub ranges_before: usize,
    pub ranges_after: usize,
}

/// Stores the canonical reading and links it to each owner.
///
/// Owners must already be known to exist; see [`check_owners`].
pub async fn ingest(
    conn: &mut SqliteConnection,
    new: &NewReading,
    owners: &[i64],
    now: DateTime<Utc>,
) -> Result<Reading> {
    let reading = sqlx::query_as::<_, Reading>(
        "INSERT INTO telemetry_readings (sensor_type, value, recorded_at, source) \
         VALUES (?1, ?2, ?3, ?4) RETURNING *",
    )
    .bind(&new.sensor_type)
    .bind(&new.value)
    .bind(new.recorded_at)
    .bind(&new.source)
    .fetch_one(&mut *conn)
    .await?;

    let distinct: BTreeSet<i64> = owners.iter().copied().collect();
    for owner_id in distinct {
        link_reading(conn, owner_id, &reading.sensor_type, LinkType::Primary, reading.id, now)
            .await?;
    }

    READINGS_INGESTED_TOTAL.inc();
    Ok(reading)
}

/// Adds `reading_id` to the owner's links for `sensor_type`.
pub async fn link_reading(
    conn: &mut SqliteConnection,
    owner_id: i64,
    sensor_type: &str,
    link_type: LinkType,
    reading_id: i64,
    now: DateTime<Utc>,
) -> Result<LinkOutcome> {
    let latest = sqlx::query_as::<_, OwnerLink>(
        r#"
        SELECT * FROM owner_links
        WHERE owner_id = ?1 AND sensor_type = ?2 AND link_type = ?3
        ORDER BY end_reading_id DESC, id DESC
        LIMIT 1
        "#,
    )
    .bind(owner_id)
    .bind(sensor_type)
    .bind(link_type)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(link) = latest {
        if link.end_reading_id.checked_add(1) == Some(reading_id) {
            let extended = sqlx::query(
                "UPDATE owner_links SET end_reading_id = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND end_reading_id = ?4",
            )
            .bind(reading_id)
            .bind(now)
            .bind(link.id)
            .bind(link.end_reading_id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
            if extended == 1 {
                return Ok(LinkOutcome::Extended { link_id: link.id });
            }
            debug!(owner_id, link_id = link.id, "Range moved underneath us, opening a new one");
        } else if link.end_reading_id >= reading_id {
            warn!(
                owner_id,
                sensor_type,
                reading_id,
                link_end = link.end_reading_id,
                "Reading id is not past the owner's latest range"
            );
        }
    }

    let (link_id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO owner_links
            (owner_id, sensor_type, start_reading_id, end_reading_id, link_type, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?3, ?4, ?5, ?5)
        RETURNING id
        "#,
    )
    .bind(owner_id)
    .bind(sensor_type)
    .bind(reading_id)
    .bind(link_type)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    RANGES_OPENED_TOTAL.inc();
    Ok(LinkOutcome::Opened { link_id })
}

/// Owners that exist, and a rejection per owner that does not.
#[derive(Debug, Default)]
pub struct OwnerCheck {
    pub valid: BTreeSet<i64>,
    pub rejected: BTreeMap<i64, String>,
}

impl OwnerCheck {
    /// Splits `owners` into links to make and links to report.
    pub fn partition(&self, owners: &[i64]) -> (Vec<i64>, Vec<RejectedLink>) {
        let mut linked = Vec::new();
        let mut rejected = Vec::new();
        for owner_id in owners.iter().copied().collect::<BTreeSet<_>>() {
            match self.rejected.get(&owner_id) {
                Some(reason) => rejected.push(RejectedLink {
                    owner_id,
                    reason: reason.clone(),
                }),
                None => linked.push(owner_id),
            }
        }
        (linked, rejected)
    }
}

/// Asks the directory about each distinct owner once. Lookup failures reject the owner.
pub async fn check_owners<I>(directory: &dyn OwnerDirectory, owners: I) -> OwnerCheck
where
    I: IntoIterator<Item = i64>,
{
    let mut check = OwnerCheck::default();
    for owner_id in owners.into_iter().collect::<BTreeSet<_>>() {
        match directory.owner_exists(owner_id).await {
            Ok(true) => {
                check.valid.insert(owner_id);
            }
            Ok(false) => {
                LINKS_REJECTED_TOTAL.inc();
                check.rejected.insert(owner_id, "owner does not exist".to_string());
            }
            Err(e) => {
                LINKS_REJECTED_TOTAL.inc();
                warn!(owner_id, "Owner lookup failed: {}", e);
                check.rejected.insert(owner_id, format!("owner lookup failed: {}", e));
            }
        }
    }
    check
}

/// Readings linked to `owner_id`, newest first.
pub async fn get_readings(
    conn: &mut SqliteConnection,
    owner_id: i64,
    sensor_type: Option<&str>,
    range: TimeRange,
    limit: Option<u32>,
) -> Result<Vec<Reading>> {
    let readings = sqlx::query_as::<_, Reading>(
        r#"
        SELECT r.* FROM telemetry_readings r
        WHERE EXISTS (
                SELECT 1 FROM owner_links l
                WHERE l.owner_id = ?1
                  AND l.sensor_type = r.sensor_type
                  AND r.id BETWEEN l.start_reading_id AND l.end_reading_id)
          AND (?2 IS NULL OR r.sensor_type = ?2)
          AND (?3 IS NULL OR r.recorded_at >= ?3)
          AND (?4 IS NULL OR r.recorded_at <= ?4)
        ORDER BY r.recorded_at DESC, r.id DESC
        LIMIT ?5
        "#,
    )
    .bind(owner_id)
    .bind(sensor_type)
    .bind(range.start)
    .bind(range.end)
    .bind(limit.map_or(-1, i64::from))
    .fetch_all(&mut *conn)
    .await?;
    Ok(readings)
}

pub async fn reading_stats(
    conn: &mut SqliteConnection,
    owner_id: i64,
    sensor_type: Option<&str>,
    range: TimeRange,
) -> Result<ReadingStats> {
    let readings = get_readings(conn, owner_id, sensor_type, range, None).await?;
    Ok(ReadingStats::from_readings(&readings))
}

pub async fn links_for(
    conn: &mut SqliteConnection,
    owner_id: i64,
    sensor_type: Option<&str>,
) -> Result<Vec<OwnerLink>> {
    let links = sqlx::query_as::<_, OwnerLink>(
        r#"
        SELECT * FROM owner_links
        WHERE owner_id = ?1 AND (?2 IS NULL OR sensor_type = ?2)
        ORDER BY sensor_type, link_type, start_reading_id, id
        "#,
    )
    .bind(owner_id)
    .bind(sensor_type)
    .fetch_all(&mut *conn)
    .await?;
    Ok(links)
}

pub async fn range_summary(conn: &mut SqliteConnection, owner_id: i64) -> Result<Vec<RangeSummary>> {
    let links = links_for(conn, owner_id, None).await?;

    let mut summaries: Vec<RangeSummary> = Vec::new();
    for group in links.chunk_by(|a, b| a.sensor_type == b.sensor_type && a.link_type == b.link_type) {
        let covered: i64 = ranges::merge(group.iter().map(as_range))
            .iter()
            .map(IdRange::count)
            .sum();
        summaries.push(RangeSummary {
            sensor_type: group[0].sensor_type.clone(),
            link_type: group[0].link_type,
            ranges: group.len(),
            first_reading_id: group.iter().map(|l| l.start_reading_id).min().unwrap_or_default(),
            last_reading_id: group.iter().map(|l| l.end_reading_id).max().unwrap_or_default(),
            readings_covered: covered,
        });
    }
    Ok(summaries)
}

/// Links of any owner that overlap `[start, end]`.
pub async fn owners_for_range(
    conn: &mut SqliteConnection,
    start: i64,
    end: i64,
) -> Result<Vec<OwnerLink>> {
    let links = sqlx::query_as::<_, OwnerLink>(
        r#"
        SELECT * FROM owner_links
        WHERE start_reading_id <= ?2 AND end_reading_id >= ?1
        ORDER BY owner_id, sensor_type, start_reading_id
        "#,
    )
    .bind(start)
    .bind(end)
    .fetch_all(&mut *conn)
    .await?;
    Ok(links)
}

/// Links a batch of existing reading ids to an owner in as few ranges as possible.
///
/// Ids the owner already covers are dropped, so importing the same set twice
/// inserts nothing the second time. Returns the ranges inserted.
pub async fn import_links(
    conn: &mut SqliteConnection,
    owner_id: i64,
    sensor_type: &str,
    link_type: LinkType,
    ids: &[i64],
    now: DateTime<Utc>,
) -> Result<Vec<IdRange>> {
    if let Some(bad) = ids.iter().find(|id| **id <= 0) {
        return Err(Error::Validation(format!("invalid reading id: {}", bad)));
    }

    let existing: Vec<IdRange> = links_for(conn, owner_id, Some(sensor_type))
        .await?
        .iter()
        .filter(|l| l.link_type == link_type)
        .map(as_range)
        .collect();

    let fresh = ranges::compress(ranges::uncovered(ids.iter().copied(), &existing));
    for range in &fresh {
        sqlx::query(
            r#"
            INSERT INTO owner_links
                (owner_id, sensor_type, start_reading_id, end_reading_id, link_type, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            "#,
        )
        .bind(owner_id)
        .bind(sensor_type)
        .bind(range.start)
        .bind(range.end)
        .bind(link_type)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    }

    info!(
        owner_id,
        sensor_type,
        ids = ids.len(),
        ranges = fresh.len(),
        "Imported owner links"
    );
    Ok(fresh)
}

/// Merges overlapping or adjacent ranges of the same link type.
///
/// The surviving row of each merged group is extended and the absorbed rows
/// deleted. Coverage is unchanged.
pub async fn compact_links(
    conn: &mut SqliteConnection,
    owner_id: i64,
    sensor_type: &str,
    now: DateTime<Utc>,
) -> Result<CompactReport> {
    let links = links_for(conn, owner_id, Some(sensor_type)).await?;
    let mut report = CompactReport {
        ranges_before: links.len(),
        ranges_after: 0,
    };

    for group in links.chunk_by(|a, b| a.link_type == b.link_type) {
        let mut survivor = &group[0];
        let mut merged = as_range(survivor);
        let mut absorbed: Vec<i64> = Vec::new();

        for link in &group[1..] {
            if merged.joins(&as_range(link)) {
                merged.end = merged.end.max(link.end_reading_id);
                absorbed.push(link.id);
            } else {
                settle(conn, survivor, merged, now).await?;
                report.ranges_after += 1;
                survivor = link;
                merged = as_range(link);
            }
        }
        settle(conn, survivor, merged, now).await?;
        report.ranges_after += 1;

        for id in absorbed {
            sqlx::query("DELETE FROM owner_links WHERE id = ?")
                .bind(id)
                .execute(&mut *conn)
                .await?;
        }
    }

    if report.ranges_after < report.ranges_before {
        info!(
            owner_id,
            sensor_type,
            before = report.ranges_before,
            after = report.ranges_after,
            "Compacted owner links"
        );
    }
    Ok(report)
}

async fn settle(
    conn: &mut SqliteConnection,
    survivor: &OwnerLink,
    merged: IdRange,
    now: DateTime<Utc>,
) -> Result<()> {
    if merged.end != survivor.end_reading_id {
        sqlx::query("UPDATE owner_links SET end_reading_id = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(merged.end)
            .bind(now)
            .bind(survivor.id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

fn as_range(link: &OwnerLink) -> IdRange {
    IdRange {
        start: link.start_reading_id,
        end: link.end_reading_id,
    }
}

/// Standalone ingest entry point: owner validation, one transaction, then alarms.
#[derive(Clone)]
pub struct TelemetryStore {
    pool: SqlitePool,
    owners: Arc<dyn OwnerDirectory>,
    alarms: AlarmEvaluator,
}

impl TelemetryStore {
    pub fn new(pool: SqlitePool, owners: Arc<dyn OwnerDirectory>, alarms: AlarmEvaluator) -> Self {
        Self {
            pool,
            owners,
            alarms,
        }
    }

    pub async fn ingest(
        &self,
        new: &NewReading,
        owner_ids: &[i64],
        now: DateTime<Utc>,
    ) -> Result<IngestReport> {
        validate::validate_reading(new)?;

        let check = check_owners(self.owners.as_ref(), owner_ids.iter().copied()).await;
        let (linked, rejected) = check.partition(owner_ids);

        let mut tx = self.pool.begin().await?;
        let reading = ingest(&mut tx, new, &linked, now).await?;
        tx.commit().await?;

        let alarms = match self
            .alarms
            .evaluate(&reading, Some(new.source.as_str()), &linked, now)
            .await
        {
            Ok(fired) => fired,
            Err(e) => {
                warn!(reading_id = reading.id, "Alarm evaluation failed: {}", e);
                Vec::new()
            }
        };

        Ok(IngestReport {
            reading_id: reading.id,
            linked,
            rejected,
            alarms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{MemoryNotificationSink, StaticOwnerDirectory};
    use crate::db::memory_pool;
    use chrono::Duration;

    fn new_reading(sensor_type: &str, value: &str) -> NewReading {
        NewReading {
            sensor_type: sensor_type.to_string(),
            value: value.to_string(),
            recorded_at: Utc::now(),
            source: "D1".to_string(),
        }
    }

    async fn ranges_of(conn: &mut SqliteConnection, owner_id: i64) -> Vec<(i64, i64)> {
        links_for(conn, owner_id, None)
            .await
            .unwrap()
            .iter()
            .map(|l| (l.start_reading_id, l.end_reading_id))
            .collect()
    }

    #[tokio::test]
    async fn test_consecutive_readings_extend_one_range() {
        let pool = memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();

        for _ in 0..5 {
            ingest(&mut conn, &new_reading("temp", "20"), &[42], now).await.unwrap();
        }
        assert_eq!(ranges_of(&mut conn, 42).await, vec![(1, 5)]);
    }

    #[tokio::test]
    async fn test_gap_opens_a_new_range() {
        let pool = memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();

        // ids 1..=16; owner 42 consumes 10,11,12,15,16 of its sensor type
        for id in 1..=16 {
            let owners: &[i64] = if [10, 11, 12, 15, 16].contains(&id) { &[42] } else { &[] };
            let reading = ingest(&mut conn, &new_reading("temp", "20"), owners, now)
                .await
                .unwrap();
            assert_eq!(reading.id, id);
        }

        assert_eq!(ranges_of(&mut conn, 42).await, vec![(10, 12), (15, 16)]);

        let readings = get_readings(&mut conn, 42, Some("temp"), TimeRange::default(), None)
            .await
            .unwrap();
        let ids: Vec<i64> = readings.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![16, 15, 12, 11, 10]);
    }

    #[tokio::test]
    async fn test_reading_shared_between_owners_is_stored_once() {
        let pool = memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();

        let reading = ingest(&mut conn, &new_reading("temp", "21.5"), &[1, 2, 2], now)
            .await
            .unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM telemetry_readings")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(ranges_of(&mut conn, 1).await, vec![(reading.id, reading.id)]);
        assert_eq!(ranges_of(&mut conn, 2).await, vec![(reading.id, reading.id)]);
        assert_eq!(owners_for_range(&mut conn, reading.id, reading.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sensor_types_do_not_mix() {
        let pool = memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();

        ingest(&mut conn, &new_reading("temp", "20"), &[42], now).await.unwrap();
        ingest(&mut conn, &new_reading("humidity", "55"), &[42], now).await.unwrap();
        ingest(&mut conn, &new_reading("temp", "21"), &[42], now).await.unwrap();

        let temps = get_readings(&mut conn, 42, Some("temp"), TimeRange::default(), None)
            .await
            .unwrap();
        assert_eq!(temps.len(), 2);
        assert!(temps.iter().all(|r| r.sensor_type == "temp"));

        let summary = range_summary(&mut conn, 42).await.unwrap();
        assert_eq!(summary.len(), 2);
        let temp = summary.iter().find(|s| s.sensor_type == "temp").unwrap();
        assert_eq!(temp.ranges, 2);
        assert_eq!(temp.readings_covered, 2);
    }

    #[tokio::test]
    async fn test_time_window_and_limit() {
        let pool = memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let t0 = Utc::now();

        for minute in 0..5 {
            let mut new = new_reading("temp", &format!("{}", 20 + minute));
            new.recorded_at = t0 + Duration::minutes(minute);
            ingest(&mut conn, &new, &[42], t0).await.unwrap();
        }

        let window = TimeRange {
            start: Some(t0 + Duration::minutes(1)),
            end: Some(t0 + Duration::minutes(3)),
        };
        let readings = get_readings(&mut conn, 42, None, window, None).await.unwrap();
        assert_eq!(readings.len(), 3);

        let latest = get_readings(&mut conn, 42, None, TimeRange::default(), Some(2))
            .await
            .unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].value, "24");

        let stats = reading_stats(&mut conn, 42, Some("temp"), TimeRange::default())
            .await
            .unwrap();
        assert_eq!(stats.count, 5);
        assert_eq!(stats.min, Some(20.0));
        assert_eq!(stats.max, Some(24.0));
        assert_eq!(stats.mean, Some(22.0));
    }

    #[test]
    fn test_stats_skip_non_numeric() {
        let readings: Vec<Reading> = ["10 C", "open", "30"]
            .iter()
            .enumerate()
            .map(|(i, v)| Reading {
                id: i as i64 + 1,
                sensor_type: "temp".to_string(),
                value: v.to_string(),
                recorded_at: Utc::now(),
                source: "D1".to_string(),
            })
            .collect();
        let stats = ReadingStats::from_readings(&readings);
        assert_eq!(stats.count, 3);
        assert_eq!(stats.numeric_count, 2);
        assert_eq!(stats.mean, Some(20.0));
        assert_eq!(ReadingStats::from_readings(&[]), ReadingStats::default());
    }

    #[tokio::test]
    async fn test_import_is_idempotent() {
        let pool = memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();

        let inserted = import_links(&mut conn, 7, "temp", LinkType::Primary, &[16, 10, 12, 11, 15], now)
            .await
            .unwrap();
        assert_eq!(inserted, vec![IdRange::new(10, 12).unwrap(), IdRange::new(15, 16).unwrap()]);

        let again = import_links(&mut conn, 7, "temp", LinkType::Primary, &[10, 11, 12, 15, 16], now)
            .await
            .unwrap();
        assert!(again.is_empty());

        let partial = import_links(&mut conn, 7, "temp", LinkType::Primary, &[12, 13], now)
            .await
            .unwrap();
        assert_eq!(partial, vec![IdRange::single(13)]);

        assert!(matches!(
            import_links(&mut conn, 7, "temp", LinkType::Primary, &[0], now).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_compaction_keeps_coverage() {
        let pool = memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();

        for ids in [&[10, 11, 12][..], &[13][..], &[15, 16][..], &[16, 17][..], &[30][..]] {
            for range in ranges::compress(ids.iter().copied()) {
                sqlx::query(
                    "INSERT INTO owner_links (owner_id, sensor_type, start_reading_id, end_reading_id, \
                     link_type, created_at, updated_at) VALUES (7, 'temp', ?1, ?2, 'primary', ?3, ?3)",
                )
                .bind(range.start)
                .bind(range.end)
                .bind(now)
                .execute(&mut *conn)
                .await
                .unwrap();
            }
        }

        let report = compact_links(&mut conn, 7, "temp", now).await.unwrap();
        assert_eq!(report.ranges_before, 5);
        assert_eq!(report.ranges_after, 3);
        assert_eq!(ranges_of(&mut conn, 7).await, vec![(10, 13), (15, 17), (30, 30)]);

        let again = compact_links(&mut conn, 7, "temp", now).await.unwrap();
        assert_eq!(again.ranges_before, again.ranges_after);
    }

    #[tokio::test]
    async fn test_store_skips_unknown_owner_but_keeps_reading() {
        let pool = memory_pool().await.unwrap();
        let sink = Arc::new(MemoryNotificationSink::new());
        let store = TelemetryStore::new(
            pool.clone(),
            Arc::new(StaticOwnerDirectory::new([42])),
            AlarmEvaluator::new(pool.clone(), sink),
        );

        let report = store
            .ingest(&new_reading("temp", "20"), &[42, 99], Utc::now())
            .await
            .unwrap();
        assert_eq!(report.linked, vec![42]);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].owner_id, 99);

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(ranges_of(&mut conn, 42).await, vec![(report.reading_id, report.reading_id)]);
        assert!(ranges_of(&mut conn, 99).await.is_empty());
    }
}
