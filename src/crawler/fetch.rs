// JSON GET with per-host connection cap and jittered exponential backoff.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::debug;

use super::CrawlError;
use crate::config::HttpConfig;

/// Upper bound for a single backoff pause.
pub const MAX_PAUSE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first one included.
    pub tries: u32,
    pub pause_initial: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// First pause, drawn from [initial, 1.5 * initial].
    fn first_pause(&self) -> Duration {
        let base = self.pause_initial.as_secs_f64();
        let secs = rand::thread_rng().gen_range(base..=base * 1.5);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_PAUSE)
            .min(MAX_PAUSE)
    }

    /// Pause after `pause`, grown by the multiplier and capped at `MAX_PAUSE`.
    pub fn next_pause(&self, pause: Duration) -> Duration {
        Duration::try_from_secs_f64(pause.as_secs_f64() * self.multiplier)
            .unwrap_or(MAX_PAUSE)
            .min(MAX_PAUSE)
    }
}

impl From<&HttpConfig> for RetryPolicy {
    fn from(c: &HttpConfig) -> Self {
        Self {
            tries: c.tries,
            pause_initial: Duration::try_from_secs_f64(c.retry_pause_initial_secs)
                .unwrap_or(MAX_PAUSE)
                .min(MAX_PAUSE),
            multiplier: c.retry_pause_multiplier,
        }
    }
}

pub struct HttpFetcher {
    client: reqwest::Client,
    limit_per_host: usize,
    permits: Mutex<HashMap<String, Arc<Semaphore>>>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: &HttpConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .pool_max_idle_per_host(config.limit_per_host)
            .build()?;
        Ok(Self::with_client(
            client,
            config.limit_per_host,
            RetryPolicy::from(config),
        ))
    }

    pub fn with_client(client: reqwest::Client, limit_per_host: usize, retry: RetryPolicy) -> Self {
        Self {
            client,
            limit_per_host,
            permits: Mutex::new(HashMap::new()),
            retry,
        }
    }

    /// GET `url` as JSON. Connection errors, non-2xx and non-JSON bodies are retried;
    /// exhaustion is a `RetriesExhausted` error.
    pub async fn get_json(&self, url: &str) -> Result<Value, CrawlError> {
        let host = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| CrawlError::BadUrl(url.to_string()))?;
        let permits = self.host_permits(&host);

        let mut pause = self.retry.first_pause();
        let mut attempt = 1;
        loop {
            let result = {
                let _permit = permits
                    .acquire()
                    .await
                    .map_err(|e| CrawlError::Join(e.to_string()))?;
                self.try_once(url).await
            };
            match result {
                Ok(value) => return Ok(value),
                Err(last) if attempt >= self.retry.tries => {
                    return Err(CrawlError::RetriesExhausted {
                        url: url.to_string(),
                        attempts: attempt,
                        last,
                    });
                }
                Err(e) => {
                    debug!(url, attempt, error = %e, pause_ms = pause.as_millis() as u64, "retrying");
                }
            }
            tokio::time::sleep(pause).await;
            pause = self.retry.next_pause(pause);
            attempt += 1;
        }
    }

    async fn try_once(&self, url: &str) -> Result<Value, String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("HTTP status {status}"));
        }
        let body: Bytes = resp
            .bytes()
            .await
            .map_err(|e| format!("reading body: {e}"))?;
        serde_json::from_slice(&body).map_err(|e| format!("response content is not JSON: {e}"))
    }

    fn host_permits(&self, host: &str) -> Arc<Semaphore> {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        permits
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.limit_per_host)))
            .clone()
    }
}
