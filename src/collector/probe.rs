//! TCP and HTTP liveness probes
//!
//! TCP dials retry on a tiered schedule (1 s, then 3 s by default) so a
//! single dropped SYN does not read as an outage. HTTP probes make one GET;
//! any response, whatever its status, means the endpoint is alive.

use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::net::TcpStream;
use tracing::debug;

use super::client::ClientError;
use super::CollectorConfig;
use crate::metrics;
use crate::models::{Job, Protocol};
use crate::utils::retry::{with_retry, RetrySchedule};
use crate::utils::truncate_text;

const MAX_MESSAGE_CHARS: usize = 512;

/// Result of one probe cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub success: bool,
    pub message: String,
}

impl ProbeOutcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: truncate_text(&message.into(), MAX_MESSAGE_CHARS),
        }
    }
}

/// Executes probes for jobs
pub struct Prober {
    timeout: Duration,
    tcp_schedule: RetrySchedule,
    http: Client,
}

impl Prober {
    pub fn new(timeout: Duration, tcp_schedule: RetrySchedule) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Init(e.to_string()))?;
        Ok(Self {
            timeout,
            tcp_schedule,
            http,
        })
    }

    pub fn from_config(config: &CollectorConfig) -> Result<Self, ClientError> {
        Self::new(config.probe_timeout(), RetrySchedule::tiered(config.tcp_retry_delays()))
    }

    /// Probe `job` once, including any retries its protocol allows
    pub async fn probe(&self, job: &Job) -> ProbeOutcome {
        let started = Instant::now();
        let outcome = match job.protocol {
            Protocol::Tcp => self.probe_tcp(&job.url).await,
            Protocol::Http => self.probe_http(&job.url).await,
        };
        metrics::record_probe(job.protocol.as_str(), outcome.success, started.elapsed().as_secs_f64());
        debug!(job = %job.key(), success = outcome.success, message = %outcome.message, "Probe finished");
        outcome
    }

    async fn probe_tcp(&self, addr: &str) -> ProbeOutcome {
        let timeout = self.timeout;
        let dialed = with_retry(&self.tcp_schedule, |attempt| async move {
            match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_)) => Ok(attempt + 1),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
            }
        })
        .await;

        match dialed {
            Ok(1) => ProbeOutcome::ok(format!("connected to {addr}")),
            Ok(attempts) => ProbeOutcome::ok(format!("connected to {addr} after {attempts} attempts")),
            Err(e) => ProbeOutcome::failed(format!(
                "dial {addr} failed after {} attempts: {e}",
                self.tcp_schedule.max_attempts()
            )),
        }
    }

    async fn probe_http(&self, url: &str) -> ProbeOutcome {
        match self.http.get(url).send().await {
            Ok(response) => ProbeOutcome::ok(format!("GET {url} answered {}", response.status().as_u16())),
            Err(e) => ProbeOutcome::failed(format!("GET {url} failed: {e}")),
        }
    }
}
