use serde::Deserialize;

use crate::models::SnapshotKeys;

const MAX_WINDOW_DAYS: u32 = 3650;
const MAX_TRIES: u32 = 100;
const MAX_RETRY_PAUSE_INITIAL_SECS: f64 = 60.0;
const MAX_RETRY_PAUSE_MULTIPLIER: f64 = 10.0;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub report: ReportConfig,
    pub snapshots: SnapshotsConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub time_check: TimeCheckConfig,
    #[serde(default)]
    pub schedule: Option<ScheduleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    /// Directory receiving report.json.
    pub dir: String,
    #[serde(default = "default_window_days")]
    pub window_days: u32,
}

fn default_window_days() -> u32 {
    7
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotsConfig {
    /// Base URLs of the per-server snapshot trees.
    pub urls: Vec<String>,
    #[serde(default = "default_datetime_key")]
    pub datetime_key: String,
    #[serde(default = "default_comment_key")]
    pub comment_key: String,
    /// chrono format of the timestamp suffix in snapshot file names.
    #[serde(default = "default_suffix_format")]
    pub filename_suffix_format: String,
    #[serde(default = "default_suffix_length")]
    pub filename_suffix_length: usize,
}

fn default_datetime_key() -> String {
    "__datetime".into()
}

fn default_comment_key() -> String {
    "__comment".into()
}

fn default_suffix_format() -> String {
    "%Y%m%d-%H%M%S".into()
}

fn default_suffix_length() -> usize {
    15
}

impl SnapshotsConfig {
    pub fn keys(&self) -> SnapshotKeys {
        SnapshotKeys {
            datetime: self.datetime_key.clone(),
            comment: self.comment_key.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Max simultaneous requests per remote host.
    pub limit_per_host: usize,
    /// Attempts per request before the host crawl fails.
    pub tries: u32,
    /// First retry pause; the actual pause is drawn from [p, 1.5p].
    pub retry_pause_initial_secs: f64,
    pub retry_pause_multiplier: f64,
    pub request_timeout_secs: u64,
    /// Record a failed host as an issue instead of failing the run.
    pub skip_failed_hosts: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            limit_per_host: 4,
            tries: 5,
            retry_pause_initial_secs: 1.0,
            retry_pause_multiplier: 2.0,
            request_timeout_secs: 30,
            skip_failed_hosts: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeCheckConfig {
    /// Distinct server measurements needed for a verdict.
    pub required: usize,
    pub fatal_drift_secs: f64,
    pub warn_drift_secs: f64,
    pub request_timeout_secs: u64,
    /// Rounds tried before giving up as indeterminate.
    pub attempts: u32,
    /// Overrides the built-in pool.ntp.org list when non-empty.
    pub servers: Vec<String>,
}

impl Default for TimeCheckConfig {
    fn default() -> Self {
        Self {
            required: 5,
            fatal_drift_secs: 10.0,
            warn_drift_secs: 1.0,
            request_timeout_secs: 2,
            attempts: 5,
            servers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Cron expression with seconds field, evaluated in UTC (e.g. "0 5 * * * *").
    pub cron: String,
}

impl AppConfig {
    /// Path from the first CLI argument, else CONFIG_FILE, else config.toml.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::args()
            .nth(1)
            .or_else(|| std::env::var("CONFIG_FILE").ok())
            .unwrap_or_else(|| "config.toml".into());
        Self::load_from_path(&path)
    }

    pub fn load_from_path(path: &str) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {}", path, e))?;
        Self::load_from_str(&s)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.database.path.is_empty(),
            "database.path must be non-empty"
        );
        anyhow::ensure!(!self.report.dir.is_empty(), "report.dir must be non-empty");
        anyhow::ensure!(
            (1..=MAX_WINDOW_DAYS).contains(&self.report.window_days),
            "report.window_days must be in 1..={}, got {}",
            MAX_WINDOW_DAYS,
            self.report.window_days
        );

        let snaps = &self.snapshots;
        anyhow::ensure!(!snaps.urls.is_empty(), "snapshots.urls must be non-empty");
        for url in &snaps.urls {
            let parsed = reqwest::Url::parse(url)
                .map_err(|e| anyhow::anyhow!("snapshots.urls: invalid URL {:?}: {}", url, e))?;
            anyhow::ensure!(
                parsed.host_str().is_some(),
                "snapshots.urls: URL {:?} has no host",
                url
            );
        }
        anyhow::ensure!(
            !snaps.datetime_key.is_empty() && !snaps.comment_key.is_empty(),
            "snapshots.datetime_key and snapshots.comment_key must be non-empty"
        );
        anyhow::ensure!(
            snaps.datetime_key != snaps.comment_key,
            "snapshots.datetime_key and snapshots.comment_key must differ"
        );
        let mut rendered = String::new();
        // chrono reports unknown specifiers as a fmt error instead of text
        std::fmt::Write::write_fmt(
            &mut rendered,
            format_args!(
                "{}",
                chrono::DateTime::<chrono::Utc>::UNIX_EPOCH.format(&snaps.filename_suffix_format)
            ),
        )
        .map_err(|_| {
            anyhow::anyhow!(
                "snapshots.filename_suffix_format {:?} is not a valid chrono format",
                snaps.filename_suffix_format
            )
        })?;
        anyhow::ensure!(
            rendered.len() == snaps.filename_suffix_length,
            "snapshots.filename_suffix_length is {} but snapshots.filename_suffix_format renders {} chars",
            snaps.filename_suffix_length,
            rendered.len()
        );

        let http = &self.http;
        anyhow::ensure!(
            http.limit_per_host > 0,
            "http.limit_per_host must be > 0, got {}",
            http.limit_per_host
        );
        anyhow::ensure!(
            (1..=MAX_TRIES).contains(&http.tries),
            "http.tries must be in 1..={}, got {}",
            MAX_TRIES,
            http.tries
        );
        anyhow::ensure!(
            http.retry_pause_initial_secs > 0.0
                && http.retry_pause_initial_secs <= MAX_RETRY_PAUSE_INITIAL_SECS,
            "http.retry_pause_initial_secs must be in (0, {}], got {}",
            MAX_RETRY_PAUSE_INITIAL_SECS,
            http.retry_pause_initial_secs
        );
        anyhow::ensure!(
            (1.0..=MAX_RETRY_PAUSE_MULTIPLIER).contains(&http.retry_pause_multiplier),
            "http.retry_pause_multiplier must be in [1, {}], got {}",
            MAX_RETRY_PAUSE_MULTIPLIER,
            http.retry_pause_multiplier
        );
        anyhow::ensure!(
            http.request_timeout_secs > 0,
            "http.request_timeout_secs must be > 0, got {}",
            http.request_timeout_secs
        );

        let tc = &self.time_check;
        anyhow::ensure!(
            tc.required >= 2,
            "time_check.required must be >= 2, got {}",
            tc.required
        );
        anyhow::ensure!(
            tc.warn_drift_secs > 0.0 && tc.warn_drift_secs < tc.fatal_drift_secs,
            "time_check.warn_drift_secs must be in (0, fatal_drift_secs), got {}",
            tc.warn_drift_secs
        );
        anyhow::ensure!(
            tc.request_timeout_secs > 0,
            "time_check.request_timeout_secs must be > 0, got {}",
            tc.request_timeout_secs
        );
        anyhow::ensure!(
            tc.attempts > 0,
            "time_check.attempts must be > 0, got {}",
            tc.attempts
        );
        anyhow::ensure!(
            tc.servers.is_empty() || tc.servers.len() >= tc.required,
            "time_check.servers must list at least {} hosts, got {}",
            tc.required,
            tc.servers.len()
        );

        if let Some(schedule) = &self.schedule {
            <cron::Schedule as std::str::FromStr>::from_str(&schedule.cron)
                .map_err(|e| anyhow::anyhow!("schedule.cron {:?}: {}", schedule.cron, e))?;
        }
        Ok(())
    }
}
