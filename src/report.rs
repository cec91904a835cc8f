// Trailing-window traffic report and its atomic report.json writer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use tracing::{info, instrument, warn};

use crate::models::{GroupTotal, HourlyLogEntry, Issue, Report};
use crate::traffic_repo::TrafficRepo;

pub const REPORT_FILE: &str = "report.json";
const REPORT_TMP_FILE: &str = "report.json.tmp";
const BYTES_PER_GB: f64 = (1u64 << 30) as f64;

/// Sub-identities ("alice-phone") roll up to their base id ("alice").
pub fn base_user_id(user_id: &str) -> &str {
    user_id.split('-').next().unwrap_or(user_id)
}

fn gigabytes(bytes: u64) -> f64 {
    (bytes as f64 / BYTES_PER_GB * 100.0).round_ties_even() / 100.0
}

/// Groups `entries` by base user id and pairs the totals with the issue log.
pub fn build_report(entries: &[HourlyLogEntry], issues: &[Issue]) -> Report {
    let mut totals: HashMap<&str, u64> = HashMap::new();
    for entry in entries {
        let slot = totals.entry(base_user_id(&entry.key.user_id)).or_default();
        *slot = slot.saturating_add(entry.total());
    }

    let mut by_bytes: Vec<(&str, u64)> = totals.into_iter().collect();
    by_bytes.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    let stats: Vec<GroupTotal> = by_bytes
        .into_iter()
        .map(|(uid, bytes)| (uid.to_string(), gigabytes(bytes)))
        .collect();

    let issues = issues
        .iter()
        .map(|i| {
            (
                i.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                i.message.clone(),
            )
        })
        .collect();

    Report { stats, issues }
}

pub struct ReportBuilder<'a> {
    repo: &'a TrafficRepo,
    window: TimeDelta,
}

impl<'a> ReportBuilder<'a> {
    pub fn new(repo: &'a TrafficRepo, window_days: u32) -> Self {
        Self {
            repo,
            window: TimeDelta::try_days(i64::from(window_days)).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Reads hour_start >= now - window plus every issue, in one transaction.
    #[instrument(skip(self), fields(operation = "build_report"))]
    pub async fn build(&self, now: DateTime<Utc>) -> anyhow::Result<Report> {
        let from = now.checked_sub_signed(self.window).ok_or_else(|| {
            anyhow::anyhow!(
                "report window of {} days before {} is out of range",
                self.window.num_days(),
                now
            )
        })?;
        let mut tx = self.repo.begin().await?;
        let entries = tx.hourly_from(from).await?;
        let issues = tx.issues().await?;
        tx.commit().await?;
        Ok(build_report(&entries, &issues))
    }
}

/// A fully written temp file waiting to replace report.json.
/// Dropping it without `commit` removes the temp file and leaves the old report alone.
pub struct StagedReport {
    tmp: PathBuf,
    dest: PathBuf,
    committed: bool,
}

impl StagedReport {
    pub fn temp_path(&self) -> &Path {
        &self.tmp
    }

    pub fn commit(mut self) -> anyhow::Result<PathBuf> {
        std::fs::rename(&self.tmp, &self.dest).map_err(|e| {
            anyhow::anyhow!(
                "renaming {} to {}: {}",
                self.tmp.display(),
                self.dest.display(),
                e
            )
        })?;
        self.committed = true;
        Ok(self.dest.clone())
    }
}

impl Drop for StagedReport {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.tmp);
        }
    }
}

/// Writes and syncs report.json.tmp in `dir`.
pub fn stage_report(dir: &Path, report: &Report) -> anyhow::Result<StagedReport> {
    std::fs::create_dir_all(dir)?;
    let staged = StagedReport {
        tmp: dir.join(REPORT_TMP_FILE),
        dest: dir.join(REPORT_FILE),
        committed: false,
    };
    let body = serde_json::to_vec_pretty(report)?;
    let written = std::fs::File::create(&staged.tmp).and_then(|mut f| {
        std::io::Write::write_all(&mut f, &body)?;
        f.sync_all()
    });
    if let Err(e) = written {
        // Drop removes the partial temp file
        return Err(anyhow::anyhow!("writing {}: {}", staged.tmp.display(), e));
    }
    Ok(staged)
}

/// Replaces `dir`/report.json atomically.
pub fn write_report(dir: &Path, report: &Report) -> anyhow::Result<PathBuf> {
    let path = stage_report(dir, report)?.commit()?;
    info!(
        path = %path.display(),
        groups = report.stats.len(),
        issues = report.issues.len(),
        "report written"
    );
    if report.stats.is_empty() {
        warn!("report has no traffic in the window");
    }
    Ok(path)
}
