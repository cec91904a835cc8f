// Snapshot bodies, per-user counters and remote directory entries

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use wincode::{SchemaRead, SchemaWrite};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot body is not a JSON object")]
    NotAnObject,
    #[error("snapshot has no \"{0}\" key")]
    MissingDatetime(String),
    #[error("invalid capture datetime {0:?}")]
    BadDatetime(String),
    #[error("invalid counters for user {user:?}: {value}")]
    BadCounters { user: String, value: String },
}

/// Names of the two reserved, non-user keys in a snapshot body.
#[derive(Debug, Clone)]
pub struct SnapshotKeys {
    pub datetime: String,
    pub comment: String,
}

impl Default for SnapshotKeys {
    fn default() -> Self {
        Self {
            datetime: "__datetime".into(),
            comment: "__comment".into(),
        }
    }
}

/// Cumulative (downloaded, uploaded) bytes of one user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub down: u64,
    pub up: u64,
}

impl Counters {
    pub const fn new(down: u64, up: u64) -> Self {
        Self { down, up }
    }
}

/// Stored form of one user's counters (BLOB in last_snapshot).
#[derive(Debug, Clone, PartialEq, Eq, SchemaRead, SchemaWrite)]
pub struct UserCounters {
    pub user_id: String,
    pub down: u64,
    pub up: u64,
}

/// One host's counters captured at an instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub captured_at: DateTime<Utc>,
    pub counters: BTreeMap<String, Counters>,
}

impl SnapshotRecord {
    pub fn new(captured_at: DateTime<Utc>) -> Self {
        Self {
            captured_at,
            counters: BTreeMap::new(),
        }
    }

    /// Builder used mostly by tests.
    pub fn with_user(mut self, user_id: &str, down: u64, up: u64) -> Self {
        self.counters
            .insert(user_id.to_string(), Counters::new(down, up));
        self
    }

    /// Parse a fetched body: user id => [down, up] plus the reserved keys.
    /// The capture time comes from the body, never from the file name.
    pub fn from_json(body: &Value, keys: &SnapshotKeys) -> Result<Self, SnapshotError> {
        let obj = body.as_object().ok_or(SnapshotError::NotAnObject)?;
        let dt_raw = obj
            .get(&keys.datetime)
            .and_then(Value::as_str)
            .ok_or_else(|| SnapshotError::MissingDatetime(keys.datetime.clone()))?;
        let captured_at = parse_capture_datetime(dt_raw)?;

        let mut counters = BTreeMap::new();
        for (user_id, value) in obj {
            if *user_id == keys.datetime || *user_id == keys.comment {
                continue;
            }
            let pair = value
                .as_array()
                .filter(|a| a.len() == 2)
                .and_then(|a| Some((a[0].as_u64()?, a[1].as_u64()?)));
            let Some((down, up)) = pair else {
                return Err(SnapshotError::BadCounters {
                    user: user_id.clone(),
                    value: value.to_string(),
                });
            };
            counters.insert(user_id.clone(), Counters::new(down, up));
        }

        Ok(Self {
            captured_at,
            counters,
        })
    }

    /// Counters of `user_id`, (0, 0) when the user is absent.
    pub fn counters_of(&self, user_id: &str) -> Counters {
        self.counters.get(user_id).copied().unwrap_or_default()
    }

    pub fn to_stored(&self) -> Vec<UserCounters> {
        self.counters
            .iter()
            .map(|(user_id, c)| UserCounters {
                user_id: user_id.clone(),
                down: c.down,
                up: c.up,
            })
            .collect()
    }

    pub fn from_stored(captured_at: DateTime<Utc>, stored: Vec<UserCounters>) -> Self {
        let counters = stored
            .into_iter()
            .map(|u| (u.user_id, Counters::new(u.down, u.up)))
            .collect();
        Self {
            captured_at,
            counters,
        }
    }
}

/// ISO-8601 capture time. Offset-less values are taken as UTC.
pub fn parse_capture_datetime(s: &str) -> Result<DateTime<Utc>, SnapshotError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    Err(SnapshotError::BadDatetime(s.to_string()))
}

/// Entry of a remote directory listing: `{"type": "directory"|"file", "name": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DirEntry {
    Directory { name: String },
    File { name: String },
}

impl DirEntry {
    pub fn name(&self) -> &str {
        match self {
            DirEntry::Directory { name } | DirEntry::File { name } => name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DirEntry::Directory { .. } => "directory",
            DirEntry::File { .. } => "file",
        }
    }
}
