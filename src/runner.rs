// One report run: crawl every server, fold the new snapshots into the store, rebuild report.json.
// Phase 1 (crawl + aggregate) is one transaction; phase 2 (report read) is another.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::{error, info, instrument, warn};

use crate::aggregate;
use crate::config::AppConfig;
use crate::crawler::{HttpFetcher, SnapshotCrawler, SnapshotLayout};
use crate::report::{ReportBuilder, write_report};
use crate::timecheck::{Consensus, ConsensusChecker, TimeSource};
use crate::traffic_repo::TrafficRepo;

/// What one run did.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub hosts: usize,
    pub failed_hosts: usize,
    pub new_snapshots: usize,
    pub hourly_entries: usize,
    pub issues: usize,
    pub report_path: PathBuf,
}

/// Fails unless the local clock is within the fatal drift bound.
pub async fn ensure_clock<S: TimeSource>(
    checker: &ConsensusChecker<S>,
    attempts: u32,
) -> anyhow::Result<f64> {
    match checker.verify(attempts).await {
        Consensus::Synced { offset, .. } => Ok(offset),
        Consensus::FatalDrift { offset } => {
            anyhow::bail!("system time is off by {:.2} seconds, refusing to run", offset)
        }
        Consensus::Indeterminate { measured } => anyhow::bail!(
            "could not verify system time after {} attempts ({} servers answered)",
            attempts,
            measured
        ),
    }
}

pub struct Runner {
    config: AppConfig,
    repo: Arc<TrafficRepo>,
    crawler: SnapshotCrawler,
}

impl Runner {
    pub fn new(config: AppConfig, repo: Arc<TrafficRepo>, crawler: SnapshotCrawler) -> Self {
        Self {
            config,
            repo,
            crawler,
        }
    }

    /// Builds the HTTP client and crawler from `config`.
    pub fn from_config(config: AppConfig, repo: Arc<TrafficRepo>) -> anyhow::Result<Self> {
        let fetcher = Arc::new(HttpFetcher::new(&config.http).context("building HTTP client")?);
        let crawler = SnapshotCrawler::new(fetcher, SnapshotLayout::from(&config.snapshots));
        Ok(Self::new(config, repo, crawler))
    }

    #[instrument(skip(self), fields(operation = "run"))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> anyhow::Result<RunSummary> {
        let mut summary = self.ingest(now).await?;

        let report = ReportBuilder::new(&self.repo, self.config.report.window_days)
            .build(now)
            .await
            .context("reading report window")?;
        summary.report_path = write_report(Path::new(&self.config.report.dir), &report)?;

        info!(
            hosts = summary.hosts,
            failed_hosts = summary.failed_hosts,
            new_snapshots = summary.new_snapshots,
            hourly_entries = summary.hourly_entries,
            issues = summary.issues,
            "run complete"
        );
        Ok(summary)
    }

    /// Phase 1. Any error returns before commit, so the transaction rolls back.
    async fn ingest(&self, now: DateTime<Utc>) -> anyhow::Result<RunSummary> {
        let mut tx = self.repo.begin().await?;
        let last = tx.last_snapshots().await.context("loading watermarks")?;
        let since: HashMap<String, DateTime<Utc>> = last
            .iter()
            .map(|(host, snap)| (host.clone(), snap.captured_at))
            .collect();

        let results = self
            .crawler
            .fetch_all(&self.config.snapshots.urls, &since)
            .await;

        let mut summary = RunSummary {
            hosts: results.len(),
            ..Default::default()
        };
        for result in results {
            let snapshots = match result.snapshots {
                Ok(s) => s,
                Err(e) if self.config.http.skip_failed_hosts => {
                    let msg = format!("{}: crawl failed: {}", result.hostname, e);
                    warn!("{}", msg);
                    tx.push_issue(now, &msg).await?;
                    summary.failed_hosts += 1;
                    summary.issues += 1;
                    continue;
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e).context(format!("crawling {}", result.url)));
                }
            };

            let update = aggregate::apply(&result.hostname, last.get(&result.hostname), &snapshots)?;
            tx.apply_update(&update, now)
                .await
                .with_context(|| format!("storing updates for {}", result.hostname))?;
            summary.new_snapshots += snapshots.len();
            summary.hourly_entries += update.hourly.len();
            summary.issues += update.issues.len();
        }

        tx.commit().await.context("committing run")?;
        Ok(summary)
    }

    /// Runs on every `cron` tick (UTC) until the process stops. A failed run is logged only.
    pub async fn run_scheduled<S: TimeSource>(
        &self,
        cron_expr: &str,
        checker: &ConsensusChecker<S>,
    ) -> anyhow::Result<()> {
        let schedule = cron::Schedule::from_str(cron_expr)
            .map_err(|e| anyhow::anyhow!("schedule.cron {:?}: {}", cron_expr, e))?;
        info!(cron = %cron_expr, "scheduled mode");
        loop {
            let now = Utc::now();
            let Some(next) = schedule.after(&now).next() else {
                anyhow::bail!("schedule {:?} has no upcoming run", cron_expr);
            };
            let delay = (next - now).to_std().unwrap_or(Duration::from_secs(1));
            tokio::time::sleep(delay).await;

            if let Err(e) = ensure_clock(checker, self.config.time_check.attempts).await {
                error!(error = %e, "skipping run");
                continue;
            }
            if let Err(e) = self.run_once(Utc::now()).await {
                error!("run failed: {:#}", e);
            }
        }
    }
}
