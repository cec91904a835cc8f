// makerep: crawl snapshots, update the traffic store, write report.json.
// Exit codes: 0 ok, 1 failure, 130 interrupted.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;
use vpnstat::*;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

async fn run() -> Result<()> {
    let app_config = config::AppConfig::load()?;

    let pool = Arc::new(if app_config.time_check.servers.is_empty() {
        timecheck::NtpServerPool::default()
    } else {
        timecheck::NtpServerPool::new(app_config.time_check.servers.clone())
    });
    let checker = timecheck::ConsensusChecker::from_config(&app_config.time_check, pool);
    runner::ensure_clock(&checker, app_config.time_check.attempts).await?;

    let repo = Arc::new(
        traffic_repo::TrafficRepo::connect(&app_config.database.path)
            .await
            .with_context(|| format!("opening {}", app_config.database.path))?,
    );
    repo.init().await?;

    let schedule = app_config.schedule.clone();
    let runner = runner::Runner::from_config(app_config, repo.clone())?;
    let result = match schedule {
        Some(s) => runner.run_scheduled(&s.cron, &checker).await,
        None => runner.run_once(chrono::Utc::now()).await.map(|_| ()),
    };
    repo.close().await;
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(LocalTimer)
        .with_env_filter(filter)
        .init();
    tracing::info!("{}", version::banner());

    tokio::select! {
        result = run() => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!("{:#}", e);
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            ExitCode::from(130)
        }
    }
}
