// checktime: is the local clock close enough to NTP to run makerep?
// Exit codes: 0 correct, 1 too far off, 2 could not measure.

use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use vpnstat::config::{AppConfig, TimeCheckConfig};
use vpnstat::timecheck::{Consensus, ConsensusChecker, NtpServerPool};
use vpnstat::version;

/// Uses [time_check] from the config file when one is given or present, defaults otherwise.
fn time_check_config() -> anyhow::Result<TimeCheckConfig> {
    let explicit = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CONFIG_FILE").ok());
    match explicit {
        Some(path) => Ok(AppConfig::load_from_path(&path)?.time_check),
        None if std::path::Path::new("config.toml").exists() => {
            Ok(AppConfig::load_from_path("config.toml")?.time_check)
        }
        None => Ok(TimeCheckConfig::default()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::debug!("{}", version::banner());

    let config = match time_check_config() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("{:#}", e);
            return ExitCode::from(2);
        }
    };
    let pool = Arc::new(if config.servers.is_empty() {
        NtpServerPool::default()
    } else {
        NtpServerPool::new(config.servers.clone())
    });
    let checker = ConsensusChecker::from_config(&config, pool);

    match checker.verify(config.attempts).await {
        Consensus::Synced { .. } => ExitCode::SUCCESS,
        Consensus::FatalDrift { offset } => {
            tracing::error!("system time is off by {:.2} seconds", offset);
            ExitCode::from(1)
        }
        Consensus::Indeterminate { measured } => {
            tracing::error!(
                "failed to measure time offset after {} attempts ({} servers answered)",
                config.attempts,
                measured
            );
            ExitCode::from(2)
        }
    }
}
