// TrafficRepo tests: additive hourly log, range scan, watermarks, issues, rollback

mod common;

use chrono::TimeDelta;
use common::{snapshot, temp_repo, utc};
use vpnstat::aggregate::HostUpdate;
use vpnstat::models::{Counters, HourKey};

#[tokio::test]
async fn traffic_repo_connect_and_init_twice() {
    let (_dir, repo) = temp_repo().await;
    repo.init().await.unwrap();
    let mut tx = repo.begin().await.unwrap();
    assert!(tx.last_snapshots().await.unwrap().is_empty());
    assert!(tx.issues().await.unwrap().is_empty());
}

#[tokio::test]
async fn add_hourly_accumulates() {
    let (_dir, repo) = temp_repo().await;
    let key = HourKey::new(utc(2025, 3, 15, 13, 0), "vpn1", "alice");

    let mut tx = repo.begin().await.unwrap();
    assert_eq!(tx.get_hourly(&key).await.unwrap(), None);
    tx.add_hourly(&key, Counters::new(10, 1)).await.unwrap();
    tx.add_hourly(&key, Counters::new(5, 2)).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = repo.begin().await.unwrap();
    assert_eq!(tx.get_hourly(&key).await.unwrap(), Some(Counters::new(15, 3)));
}

#[tokio::test]
async fn hourly_from_scans_ascending_from_lower_bound() {
    let (_dir, repo) = temp_repo().await;
    let mut tx = repo.begin().await.unwrap();
    for (h, host, user) in [(15, "vpn1", "bob"), (13, "vpn2", "alice"), (14, "vpn1", "alice"), (15, "vpn1", "alice")] {
        let key = HourKey::new(utc(2025, 3, 15, h, 0), host, user);
        tx.add_hourly(&key, Counters::new(1, 1)).await.unwrap();
    }
    tx.commit().await.unwrap();

    let mut tx = repo.begin().await.unwrap();
    let rows = tx.hourly_from(utc(2025, 3, 15, 14, 0)).await.unwrap();
    let keys: Vec<(u32, &str, &str)> = rows
        .iter()
        .map(|r| {
            (
                chrono::Timelike::hour(&r.key.hour_start),
                r.key.hostname.as_str(),
                r.key.user_id.as_str(),
            )
        })
        .collect();
    assert_eq!(
        keys,
        vec![(14, "vpn1", "alice"), (15, "vpn1", "alice"), (15, "vpn1", "bob")]
    );
}

#[tokio::test]
async fn last_snapshot_round_trip() {
    let (_dir, repo) = temp_repo().await;
    let snap = snapshot(
        utc(2025, 3, 15, 13, 45),
        &[("alice", 100, 200), ("bob-phone", u64::from(u32::MAX) * 4, 0)],
    );

    let mut tx = repo.begin().await.unwrap();
    tx.put_last_snapshot("vpn1", &snap).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = repo.begin().await.unwrap();
    assert_eq!(tx.get_last_snapshot("vpn1").await.unwrap(), Some(snap.clone()));
    assert_eq!(tx.get_last_snapshot("vpn2").await.unwrap(), None);
    let all = tx.last_snapshots().await.unwrap();
    assert_eq!(all.get("vpn1"), Some(&snap));
}

#[tokio::test]
async fn watermark_never_moves_back() {
    let (_dir, repo) = temp_repo().await;
    let newer = snapshot(utc(2025, 3, 15, 14, 0), &[]);
    let older = snapshot(utc(2025, 3, 15, 13, 0), &[]);

    let mut tx = repo.begin().await.unwrap();
    tx.put_last_snapshot("vpn1", &newer).await.unwrap();
    assert!(tx.put_last_snapshot("vpn1", &older).await.is_err());
    assert_eq!(
        tx.get_last_snapshot("vpn1").await.unwrap().map(|s| s.captured_at),
        Some(newer.captured_at)
    );
}

#[tokio::test]
async fn dropped_transaction_rolls_back() {
    let (_dir, repo) = temp_repo().await;
    let key = HourKey::new(utc(2025, 3, 15, 13, 0), "vpn1", "alice");
    {
        let mut tx = repo.begin().await.unwrap();
        tx.add_hourly(&key, Counters::new(10, 10)).await.unwrap();
        tx.push_issue(utc(2025, 3, 15, 13, 5), "lost").await.unwrap();
        tx.put_last_snapshot("vpn1", &snapshot(utc(2025, 3, 15, 13, 0), &[]))
            .await
            .unwrap();
    }

    let mut tx = repo.begin().await.unwrap();
    assert_eq!(tx.get_hourly(&key).await.unwrap(), None);
    assert!(tx.issues().await.unwrap().is_empty());
    assert!(tx.last_snapshots().await.unwrap().is_empty());
}

#[tokio::test]
async fn same_instant_issues_keep_insertion_order() {
    let (_dir, repo) = temp_repo().await;
    let now = utc(2025, 3, 15, 13, 0);
    let mut tx = repo.begin().await.unwrap();
    tx.push_issue(now + TimeDelta::minutes(1), "third").await.unwrap();
    tx.push_issue(now, "first").await.unwrap();
    tx.push_issue(now, "second").await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = repo.begin().await.unwrap();
    let messages: Vec<String> = tx.issues().await.unwrap().into_iter().map(|i| i.message).collect();
    assert_eq!(messages, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn apply_update_writes_everything() {
    let (_dir, repo) = temp_repo().await;
    let now = utc(2025, 3, 15, 16, 0);
    let last = snapshot(utc(2025, 3, 15, 15, 15), &[("alice", 150, 250)]);
    let update = HostUpdate {
        hostname: "vpn1".into(),
        hourly: [(
            HourKey::new(utc(2025, 3, 15, 15, 0), "vpn1", "alice"),
            Counters::new(8, 8),
        )]
        .into_iter()
        .collect(),
        issues: vec!["vpn1: something".into()],
        last_snapshot: Some(last.clone()),
    };

    let mut tx = repo.begin().await.unwrap();
    tx.apply_update(&update, now).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = repo.begin().await.unwrap();
    assert_eq!(tx.get_last_snapshot("vpn1").await.unwrap(), Some(last));
    let issues = tx.issues().await.unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].created_at, now);
    assert_eq!(tx.hourly_from(utc(2025, 3, 15, 0, 0)).await.unwrap().len(), 1);
}
