// Cumulative counters -> hourly per-user deltas.
// Pure: consumes one host's ordered snapshots and returns what to add to the store.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, warn};

use crate::models::{Counters, HourKey, SnapshotRecord};

const US_PER_SEC: i64 = 1_000_000;
const US_PER_HOUR: i64 = 3600 * US_PER_SEC;
/// 1.5x the nominal hourly snapshot interval.
const GAP_THRESHOLD_US: i64 = 5400 * US_PER_SEC;
const GAP_SLACK_US: i64 = 1800 * US_PER_SEC;

#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("{host}: snapshot at {got} is older than the last processed one at {last}")]
    TimeRegression {
        host: String,
        last: DateTime<Utc>,
        got: DateTime<Utc>,
    },
}

/// Changes one host contributes to the run's transaction.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct HostUpdate {
    pub hostname: String,
    /// Amounts to add into the hourly log.
    pub hourly: BTreeMap<HourKey, Counters>,
    pub issues: Vec<String>,
    /// New watermark; None when nothing newer than the stored one was processed.
    pub last_snapshot: Option<SnapshotRecord>,
}

/// Start of the clock hour containing `dt`.
pub fn hour_start(dt: DateTime<Utc>) -> DateTime<Utc> {
    let us = dt.timestamp_micros();
    DateTime::from_timestamp_micros(us - us.rem_euclid(US_PER_HOUR)).unwrap_or(dt)
}

/// Splits `amount` over the clock hours of (prev, cur], weighted by overlap.
/// Buckets are walked in order; each share is rounded from what is still left,
/// so the shares always add up to `amount`.
pub fn prorate(
    prev: DateTime<Utc>,
    cur: DateTime<Utc>,
    amount: u64,
) -> Vec<(DateTime<Utc>, u64)> {
    let mut shares = Vec::new();
    if cur <= prev {
        return shares;
    }
    let hour = TimeDelta::hours(1);
    let mut remaining = amount;
    let mut remaining_us = (cur - prev).num_microseconds().unwrap_or(i64::MAX);
    let mut bucket = hour_start(prev);

    while bucket < cur {
        let left = bucket.max(prev);
        let right = (bucket + hour).min(cur);
        let overlap_us = (right - left).num_microseconds().unwrap_or(0);

        let share = if right == cur {
            remaining
        } else {
            let est = remaining as f64 * overlap_us as f64 / remaining_us as f64;
            (est.round_ties_even() as u64).min(remaining)
        };
        shares.push((bucket, share));

        remaining -= share;
        remaining_us -= overlap_us;
        bucket += hour;
    }
    shares
}

/// Estimated number of hourly snapshots missing in a gap, if it is a gap at all.
pub fn missed_snapshots(prev: DateTime<Utc>, cur: DateTime<Utc>) -> Option<i64> {
    let gap_us = (cur - prev).num_microseconds()?;
    (gap_us > GAP_THRESHOLD_US).then(|| (gap_us - GAP_SLACK_US).div_euclid(US_PER_HOUR))
}

/// Per-user delta between two snapshots. None on counter reset or no traffic.
fn delta(prev: Counters, cur: Counters) -> Option<Counters> {
    if cur.down < prev.down || cur.up < prev.up || cur == prev {
        return None;
    }
    Some(Counters::new(cur.down - prev.down, cur.up - prev.up))
}

fn add_pair(
    hourly: &mut BTreeMap<HourKey, Counters>,
    hostname: &str,
    user_id: &str,
    prev: &SnapshotRecord,
    cur: &SnapshotRecord,
    amounts: Counters,
) {
    let down = prorate(prev.captured_at, cur.captured_at, amounts.down);
    let up = prorate(prev.captured_at, cur.captured_at, amounts.up);
    for ((hour, d), (_, u)) in down.into_iter().zip(up) {
        if d == 0 && u == 0 {
            continue;
        }
        let slot = hourly
            .entry(HourKey::new(hour, hostname, user_id))
            .or_default();
        slot.down += d;
        slot.up += u;
    }
}

/// Walks `last` then `new` in capture order and accumulates hourly deltas.
/// Without `last`, the first new snapshot is only a baseline.
pub fn apply(
    hostname: &str,
    last: Option<&SnapshotRecord>,
    new: &BTreeMap<DateTime<Utc>, SnapshotRecord>,
) -> Result<HostUpdate, AggregateError> {
    let mut update = HostUpdate {
        hostname: hostname.to_string(),
        ..Default::default()
    };
    let mut prev = last;
    let mut advanced = false;

    for cur in new.values() {
        if let Some(p) = prev {
            if cur.captured_at < p.captured_at {
                return Err(AggregateError::TimeRegression {
                    host: hostname.to_string(),
                    last: p.captured_at,
                    got: cur.captured_at,
                });
            }
            if cur.captured_at == p.captured_at {
                debug!(host = hostname, at = %cur.captured_at, "duplicate capture time, skipped");
                continue;
            }

            if let Some(missed) = missed_snapshots(p.captured_at, cur.captured_at) {
                let msg = format!(
                    "{hostname}: missed {missed} snapshot(s) between {} and {}",
                    p.captured_at.format("%Y%m%d-%H%M"),
                    cur.captured_at.format("%Y%m%d-%H%M"),
                );
                warn!("{}", msg);
                update.issues.push(msg);
            }

            for (user_id, counters) in &cur.counters {
                if let Some(amounts) = delta(p.counters_of(user_id), *counters) {
                    add_pair(&mut update.hourly, hostname, user_id, p, cur, amounts);
                }
            }
        }
        prev = Some(cur);
        advanced = true;
    }

    if advanced {
        update.last_snapshot = prev.cloned();
    }
    Ok(update)
}
