// SQLite store for watermarks, the hourly log and the issue log.
// Every read and write goes through a TrafficTx; dropping one without commit() rolls back.

mod blob;

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::instrument;

use crate::aggregate::HostUpdate;
use crate::models::{Counters, HourKey, HourlyLogEntry, Issue, SnapshotRecord, UserCounters};

pub struct TrafficRepo {
    pool: SqlitePool,
}

impl TrafficRepo {
    pub async fn connect(path: &str) -> anyhow::Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new().connect_with(opts).await?;
        Ok(Self { pool })
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (key TEXT PRIMARY KEY, value INTEGER NOT NULL)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS last_snapshot (
                hostname TEXT PRIMARY KEY,
                captured_at_us INTEGER NOT NULL,
                counters BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hourly_log (
                hour_start INTEGER NOT NULL,
                hostname TEXT NOT NULL,
                user_id TEXT NOT NULL,
                down INTEGER NOT NULL,
                up INTEGER NOT NULL,
                PRIMARY KEY (hour_start, hostname, user_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS issue_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at_us INTEGER NOT NULL,
                message TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_issue_log_created_at ON issue_log(created_at_us, id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO schema_version (key, value) VALUES ('traffic', 1)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn begin(&self) -> anyhow::Result<TrafficTx> {
        Ok(TrafficTx {
            tx: self.pool.begin().await?,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// One all-or-nothing unit of work against the store.
pub struct TrafficTx {
    tx: sqlx::Transaction<'static, Sqlite>,
}

fn to_i64(v: u64) -> anyhow::Result<i64> {
    i64::try_from(v).map_err(|_| anyhow::anyhow!("counter {} does not fit the store", v))
}

fn from_i64(v: i64) -> anyhow::Result<u64> {
    u64::try_from(v).map_err(|_| anyhow::anyhow!("negative counter {} in store", v))
}

fn time_from_micros(us: i64) -> anyhow::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(us).ok_or_else(|| anyhow::anyhow!("timestamp {} out of range", us))
}

fn time_from_secs(secs: i64) -> anyhow::Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| anyhow::anyhow!("timestamp {} out of range", secs))
}

impl TrafficTx {
    pub async fn commit(self) -> anyhow::Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> anyhow::Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }

    /// All watermarks, by hostname.
    #[instrument(skip(self), fields(repo = "traffic", operation = "last_snapshots"))]
    pub async fn last_snapshots(&mut self) -> anyhow::Result<HashMap<String, SnapshotRecord>> {
        let rows = sqlx::query("SELECT hostname, captured_at_us, counters FROM last_snapshot")
            .fetch_all(&mut *self.tx)
            .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let hostname: String = row.try_get("hostname")?;
            out.insert(hostname, Self::parse_last_snapshot_row(&row)?);
        }
        Ok(out)
    }

    pub async fn get_last_snapshot(&mut self, hostname: &str) -> anyhow::Result<Option<SnapshotRecord>> {
        let row = sqlx::query("SELECT captured_at_us, counters FROM last_snapshot WHERE hostname = $1")
            .bind(hostname)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(|r| Self::parse_last_snapshot_row(&r)).transpose()
    }

    /// Stores `snapshot` as the host's watermark. Refuses to move it backwards.
    #[instrument(skip(self, snapshot), fields(repo = "traffic", operation = "put_last_snapshot", at = %snapshot.captured_at))]
    pub async fn put_last_snapshot(&mut self, hostname: &str, snapshot: &SnapshotRecord) -> anyhow::Result<()> {
        let counters = blob::with_version_prefix(
            blob::BLOB_VERSION_COUNTERS,
            wincode::serialize(&snapshot.to_stored()).map_err(|e| anyhow::anyhow!("wincode: {}", e))?,
        );
        let r = sqlx::query(
            r#"
            INSERT INTO last_snapshot (hostname, captured_at_us, counters) VALUES ($1, $2, $3)
            ON CONFLICT(hostname) DO UPDATE SET
                captured_at_us = excluded.captured_at_us,
                counters = excluded.counters
            WHERE excluded.captured_at_us >= last_snapshot.captured_at_us
            "#,
        )
        .bind(hostname)
        .bind(snapshot.captured_at.timestamp_micros())
        .bind(counters)
        .execute(&mut *self.tx)
        .await?;
        anyhow::ensure!(
            r.rows_affected() == 1,
            "{}: watermark would move back to {}",
            hostname,
            snapshot.captured_at
        );
        Ok(())
    }

    pub async fn get_hourly(&mut self, key: &HourKey) -> anyhow::Result<Option<Counters>> {
        let row = sqlx::query(
            "SELECT down, up FROM hourly_log WHERE hour_start = $1 AND hostname = $2 AND user_id = $3",
        )
        .bind(key.hour_start.timestamp())
        .bind(&key.hostname)
        .bind(&key.user_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Counters::new(
            from_i64(row.try_get("down")?)?,
            from_i64(row.try_get("up")?)?,
        )))
    }

    /// Adds `amount` into the entry at `key`, creating it when missing.
    pub async fn add_hourly(&mut self, key: &HourKey, amount: Counters) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO hourly_log (hour_start, hostname, user_id, down, up) VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT(hour_start, hostname, user_id) DO UPDATE SET
                down = down + excluded.down,
                up = up + excluded.up
            "#,
        )
        .bind(key.hour_start.timestamp())
        .bind(&key.hostname)
        .bind(&key.user_id)
        .bind(to_i64(amount.down)?)
        .bind(to_i64(amount.up)?)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Entries with hour_start >= `min_hour`, ascending by (hour, host, user).
    #[instrument(skip(self), fields(repo = "traffic", operation = "hourly_from"))]
    pub async fn hourly_from(&mut self, min_hour: DateTime<Utc>) -> anyhow::Result<Vec<HourlyLogEntry>> {
        let rows = sqlx::query(
            "SELECT hour_start, hostname, user_id, down, up FROM hourly_log
             WHERE hour_start >= $1 ORDER BY hour_start ASC, hostname ASC, user_id ASC",
        )
        .bind(min_hour.timestamp())
        .fetch_all(&mut *self.tx)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(HourlyLogEntry {
                key: HourKey {
                    hour_start: time_from_secs(row.try_get("hour_start")?)?,
                    hostname: row.try_get("hostname")?,
                    user_id: row.try_get("user_id")?,
                },
                down: from_i64(row.try_get("down")?)?,
                up: from_i64(row.try_get("up")?)?,
            });
        }
        Ok(out)
    }

    pub async fn push_issue(&mut self, at: DateTime<Utc>, message: &str) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO issue_log (created_at_us, message) VALUES ($1, $2)")
            .bind(at.timestamp_micros())
            .bind(message)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// The whole issue log, oldest first.
    #[instrument(skip(self), fields(repo = "traffic", operation = "issues"))]
    pub async fn issues(&mut self) -> anyhow::Result<Vec<Issue>> {
        let rows = sqlx::query("SELECT created_at_us, message FROM issue_log ORDER BY created_at_us ASC, id ASC")
            .fetch_all(&mut *self.tx)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Issue {
                created_at: time_from_micros(row.try_get("created_at_us")?)?,
                message: row.try_get("message")?,
            });
        }
        Ok(out)
    }

    /// Writes one host's aggregation result: hourly additions, issues stamped `now`, watermark.
    #[instrument(
        skip(self, update),
        fields(repo = "traffic", operation = "apply_update", host = %update.hostname, entries = update.hourly.len())
    )]
    pub async fn apply_update(&mut self, update: &HostUpdate, now: DateTime<Utc>) -> anyhow::Result<()> {
        for (key, amount) in &update.hourly {
            self.add_hourly(key, *amount).await?;
        }
        for message in &update.issues {
            self.push_issue(now, message).await?;
        }
        if let Some(last) = &update.last_snapshot {
            self.put_last_snapshot(&update.hostname, last).await?;
        }
        Ok(())
    }

    fn parse_last_snapshot_row(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<SnapshotRecord> {
        let captured_at = time_from_micros(row.try_get("captured_at_us")?)?;
        let data: Vec<u8> = row.try_get("counters")?;
        let stored: Vec<UserCounters> =
            wincode::deserialize(blob::blob_payload(&data, blob::BLOB_VERSION_COUNTERS)?)
                .map_err(|e| anyhow::anyhow!("wincode deserialize counters: {}", e))?;
        Ok(SnapshotRecord::from_stored(captured_at, stored))
    }
}
