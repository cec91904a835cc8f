// Local clock check against a pool of NTP servers. Gates every time-sensitive run.

mod pool;
pub mod sntp;

pub use pool::{NtpServerPool, default_hostnames};

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream;
use tracing::{debug, info, instrument, warn};

use crate::config::TimeCheckConfig;

/// Outcome of one consensus round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Consensus {
    /// Representative offset in seconds; `warning` when above the warn threshold.
    Synced { offset: f64, warning: bool },
    /// Fewer distinct answers than required. Retryable.
    Indeterminate { measured: usize },
    /// Representative offset above the fatal threshold.
    FatalDrift { offset: f64 },
}

#[derive(Debug, Clone)]
pub struct ConsensusParams {
    pub required: usize,
    pub fatal_drift_secs: f64,
    pub warn_drift_secs: f64,
    pub request_timeout: Duration,
}

impl From<&TimeCheckConfig> for ConsensusParams {
    fn from(c: &TimeCheckConfig) -> Self {
        Self {
            required: c.required,
            fatal_drift_secs: c.fatal_drift_secs,
            warn_drift_secs: c.warn_drift_secs,
            request_timeout: Duration::from_secs(c.request_timeout_secs),
        }
    }
}

/// Name resolution and one offset measurement. Real impl: DNS + SNTP.
pub trait TimeSource: Send + Sync {
    fn resolve(&self, hostname: &str) -> impl Future<Output = anyhow::Result<IpAddr>> + Send;

    fn offset(
        &self,
        addr: IpAddr,
        timeout: Duration,
    ) -> impl Future<Output = anyhow::Result<f64>> + Send;
}

pub struct NtpTimeSource;

impl TimeSource for NtpTimeSource {
    async fn resolve(&self, hostname: &str) -> anyhow::Result<IpAddr> {
        let mut addrs = tokio::net::lookup_host((hostname, sntp::NTP_PORT)).await?;
        addrs
            .next()
            .map(|a| a.ip())
            .ok_or_else(|| anyhow::anyhow!("{} resolved to no address", hostname))
    }

    async fn offset(&self, addr: IpAddr, timeout: Duration) -> anyhow::Result<f64> {
        Ok(sntp::query(SocketAddr::new(addr, sntp::NTP_PORT), timeout).await?)
    }
}

enum Measurement {
    Offset(IpAddr, f64),
    /// Address already measured (or in flight) under another hostname.
    Duplicate,
    Failed(anyhow::Error),
}

pub struct ConsensusChecker<S> {
    source: S,
    pool: Arc<NtpServerPool>,
    params: ConsensusParams,
}

impl ConsensusChecker<NtpTimeSource> {
    pub fn from_config(config: &TimeCheckConfig, pool: Arc<NtpServerPool>) -> Self {
        Self::new(NtpTimeSource, pool, ConsensusParams::from(config))
    }
}

impl<S: TimeSource> ConsensusChecker<S> {
    pub fn new(source: S, pool: Arc<NtpServerPool>, params: ConsensusParams) -> Self {
        Self {
            source,
            pool,
            params,
        }
    }

    pub fn pool(&self) -> &Arc<NtpServerPool> {
        &self.pool
    }

    /// One round: query servers with `required + 2` in flight, stop at `required`
    /// distinct addresses, drop whatever is still pending.
    #[instrument(skip(self), fields(operation = "time_check", required = self.params.required))]
    pub async fn check(&self) -> Consensus {
        let required = self.params.required;
        let candidates = self.pool.candidates();
        let claimed: Mutex<HashSet<IpAddr>> = Mutex::new(HashSet::new());

        let mut offsets: HashMap<IpAddr, f64> = HashMap::new();
        let mut unresponsive: HashSet<String> = HashSet::new();
        {
            let claimed = &claimed;
            let mut measurements = stream::iter(candidates)
                .map(|host| async move {
                    let m = self.measure(&host, claimed).await;
                    (host, m)
                })
                .buffer_unordered(required + 2);

            while let Some((host, m)) = measurements.next().await {
                match m {
                    Measurement::Offset(addr, offset) => {
                        debug!(host = %host, %addr, offset, "ntp answer");
                        offsets.insert(addr, offset.abs());
                        if offsets.len() >= required {
                            break;
                        }
                    }
                    Measurement::Duplicate => {}
                    Measurement::Failed(e) => {
                        debug!(host = %host, error = %e, "ntp server did not answer");
                        unresponsive.insert(host);
                    }
                }
            }
            // dropping the stream cancels requests still in flight
        }

        self.pool.demote(&unresponsive);

        if offsets.len() < required {
            warn!(
                required,
                completed = offsets.len(),
                "not enough time measurements"
            );
            return Consensus::Indeterminate {
                measured: offsets.len(),
            };
        }

        let values: Vec<f64> = offsets.into_values().collect();
        match select_representative(&values) {
            Some(offset) => self.classify(offset),
            None => Consensus::Indeterminate {
                measured: values.len(),
            },
        }
    }

    /// Repeats `check` until it is determinate or `attempts` rounds ran.
    pub async fn verify(&self, attempts: u32) -> Consensus {
        let mut last = Consensus::Indeterminate { measured: 0 };
        for attempt in 1..=attempts {
            last = self.check().await;
            match last {
                Consensus::Synced { offset, .. } => {
                    info!(
                        "the system time is correct, current offset is {:.2} ms",
                        offset * 1000.0
                    );
                    return last;
                }
                Consensus::FatalDrift { .. } => return last,
                Consensus::Indeterminate { measured } => {
                    debug!(attempt, attempts, measured, "time check indeterminate");
                }
            }
        }
        last
    }

    fn classify(&self, offset: f64) -> Consensus {
        if offset > self.params.fatal_drift_secs {
            warn!("system time differs from NTP by {:.2} seconds", offset);
            Consensus::FatalDrift { offset }
        } else if offset > self.params.warn_drift_secs {
            warn!("system time differs from NTP by {:.2} seconds", offset);
            Consensus::Synced {
                offset,
                warning: true,
            }
        } else {
            Consensus::Synced {
                offset,
                warning: false,
            }
        }
    }

    async fn measure(&self, host: &str, claimed: &Mutex<HashSet<IpAddr>>) -> Measurement {
        let timeout = self.params.request_timeout;
        let addr = match tokio::time::timeout(timeout, self.source.resolve(host)).await {
            Ok(Ok(addr)) => addr,
            Ok(Err(e)) => return Measurement::Failed(e),
            Err(_) => {
                return Measurement::Failed(anyhow::anyhow!("resolving {} timed out", host));
            }
        };
        {
            let mut claimed = claimed.lock().unwrap_or_else(|e| e.into_inner());
            if !claimed.insert(addr) {
                return Measurement::Duplicate;
            }
        }
        match tokio::time::timeout(timeout, self.source.offset(addr, timeout)).await {
            Ok(Ok(offset)) => Measurement::Offset(addr, offset),
            Ok(Err(e)) => Measurement::Failed(e),
            Err(_) => Measurement::Failed(anyhow::anyhow!("{} ({}) timed out", host, addr)),
        }
    }
}

/// Second-smallest absolute offset. None with fewer than two readings.
pub fn select_representative(offsets: &[f64]) -> Option<f64> {
    if offsets.len() < 2 {
        return None;
    }
    let mut abs: Vec<f64> = offsets.iter().map(|o| o.abs()).collect();
    abs.sort_by(f64::total_cmp);
    Some(abs[1])
}
