use crate::config::CheckInSettings;
use crate::db::retry_transient;
use crate::dispatcher;
use crate::errors::Result;
use crate::metrics::{COMMANDS_EXPIRED_TOTAL, DEVICES_MARKED_INACTIVE_TOTAL};
use crate::registry;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub commands_expired: u64,
    pub devices_inactive: u64,
}

/// Periodic housekeeping: expired commands and silent devices.
pub async fn run_sweeper(pool: SqlitePool, every: Duration, settings: CheckInSettings) {
    info!("Starting sweeper with interval={}s", every.as_secs());

    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let start = Instant::now();
        let outcome = retry_transient("sweep", || sweep_once(&pool, Utc::now(), &settings)).await;
        match outcome {
            Ok(report) if report != SweepReport::default() => info!(
                expired = report.commands_expired,
                inactive = report.devices_inactive,
                "Sweep finished in {:.3}s",
                start.elapsed().as_secs_f64()
            ),
            Ok(_) => debug!("Sweep found nothing to do"),
            Err(e) => error!("Sweep failed: {}", e),
        }
    }
}

/// One sweep, in a single transaction.
pub async fn sweep_once(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    settings: &CheckInSettings,
) -> Result<SweepReport> {
    let mut tx = pool.begin().await?;

    let commands_expired = dispatcher::expire_overdue(&mut tx, now).await?;
    let devices_inactive = registry::sweep_inactive(&mut tx, now, settings.stale_factor).await?;

    tx.commit().await?;

    COMMANDS_EXPIRED_TOTAL.inc_by(commands_expired as f64);
    DEVICES_MARKED_INACTIVE_TOTAL.inc_by(devices_inactive as f64);

    Ok(SweepReport {
        commands_expired,
        devices_inactive,
    })
}
