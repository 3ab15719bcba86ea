//! Rolling 24 hour window of sync cycle statistics, and the decision when an
//! aggregated summary of them is due.

use crate::database::{Database, SyncStat};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

/// Number of hourly buckets aggregated.
const WINDOW_HOURS: i64 = 24;

/// Buckets outlive the window by an hour so that the oldest one is complete
/// while it is still aggregated.
const BUCKET_TTL_HOURS: i64 = WINDOW_HOURS + 1;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Totals over the stats recorded in a time span.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Summary {
    pub total_new: u64,
    pub total_updated: u64,
    pub total_duration: Duration,
    pub sync_count: usize,
    pub time_range: String,
}

pub struct SyncStatsAggregator {
    clock: Box<dyn Clock>,
    interval: Duration,
}

impl SyncStatsAggregator {
    /// Creates an aggregator whose summaries are due every `interval`.
    pub fn new(clock: Box<dyn Clock>, interval: Duration) -> Self {
        Self { clock, interval }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Appends the stats of one sync cycle to the current hour's bucket.
    pub async fn record(
        &self,
        db: &mut dyn Database,
        new_games: u64,
        updated_games: u64,
        duration: Duration,
    ) -> Result<()> {
        let now = self.clock.now();
        let stat = SyncStat {
            timestamp: now,
            new_games,
            updated_games,
            duration,
        };
        db.record_sync_stat(
            &bucket(now),
            &stat,
            now + TimeDelta::hours(BUCKET_TTL_HOURS),
        )
        .await
        .context("record sync stat")
    }

    /// The time of the last summary. Without one, an hour ago.
    pub async fn last_flush(&self, db: &mut dyn Database) -> Result<DateTime<Utc>> {
        let last = db.last_flush().await.context("read last flush")?;
        Ok(last.unwrap_or_else(|| self.clock.now() - TimeDelta::hours(1)))
    }

    /// Whether at least the configured interval passed since the last
    /// summary.
    pub async fn should_flush(&self, db: &mut dyn Database) -> Result<bool> {
        let last = self.last_flush(db).await?;
        let interval = TimeDelta::from_std(self.interval).context("interval out of range")?;
        Ok(self.clock.now() - last >= interval)
    }

    pub async fn mark_flushed(&self, db: &mut dyn Database) -> Result<()> {
        db.set_last_flush(self.clock.now())
            .await
            .context("write last flush")
    }

    /// Sums the stats recorded after `since` in the last 24 hourly buckets.
    pub async fn aggregate(&self, db: &mut dyn Database, since: DateTime<Utc>) -> Result<Summary> {
        let now = self.clock.now();
        let mut stats = Vec::new();
        for hour in 0..WINDOW_HOURS {
            let bucket = bucket(now - TimeDelta::hours(hour));
            let entries = db
                .sync_stats(&bucket, now)
                .await
                .with_context(|| format!("read bucket {bucket}"))?;
            stats.extend(entries.into_iter().filter(|stat| stat.timestamp > since));
        }
        stats.sort_by_key(|stat| stat.timestamp);

        let time_range = match stats.as_slice() {
            [] => "No data".to_string(),
            [only] => format!("Last sync: {}", only.timestamp.format("%H:%M:%S")),
            [first, .., last] => format!(
                "{} - {}",
                first.timestamp.format("%H:%M"),
                last.timestamp.format("%H:%M")
            ),
        };
        Ok(Summary {
            total_new: stats.iter().map(|stat| stat.new_games).sum(),
            total_updated: stats.iter().map(|stat| stat.updated_games).sum(),
            total_duration: stats.iter().map(|stat| stat.duration).sum(),
            sync_count: stats.len(),
            time_range,
        })
    }
}

fn bucket(time: DateTime<Utc>) -> String {
    time.format("sync_stats_%Y%m%d%H").to_string()
}
