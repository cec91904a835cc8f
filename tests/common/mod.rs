// Shared test helpers
#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use vpnstat::models::SnapshotRecord;
use vpnstat::traffic_repo::TrafficRepo;

pub fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

/// Snapshot with `(user, down, up)` counters.
pub fn snapshot(at: DateTime<Utc>, users: &[(&str, u64, u64)]) -> SnapshotRecord {
    users
        .iter()
        .fold(SnapshotRecord::new(at), |s, (u, d, up)| s.with_user(u, *d, *up))
}

pub async fn temp_repo() -> (TempDir, TrafficRepo) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("traffic.db");
    let repo = TrafficRepo::connect(path.to_str().unwrap()).await.unwrap();
    repo.init().await.unwrap();
    (dir, repo)
}
