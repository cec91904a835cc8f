// Persistent hourly log rows and the issue log

use chrono::{DateTime, Utc};

/// Composite key of the hourly log, ordered hour first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HourKey {
    pub hour_start: DateTime<Utc>,
    pub hostname: String,
    pub user_id: String,
}

impl HourKey {
    pub fn new(hour_start: DateTime<Utc>, hostname: &str, user_id: &str) -> Self {
        Self {
            hour_start,
            hostname: hostname.to_string(),
            user_id: user_id.to_string(),
        }
    }
}

/// Accumulated bytes for one (hour, host, user).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HourlyLogEntry {
    pub key: HourKey,
    pub down: u64,
    pub up: u64,
}

impl HourlyLogEntry {
    pub fn total(&self) -> u64 {
        self.down.saturating_add(self.up)
    }
}

/// One anomaly message, append-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub created_at: DateTime<Utc>,
    pub message: String,
}
