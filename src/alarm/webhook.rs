//! HTTP alarm sink
//!
//! Posts each alarm as JSON to an alarm storage/relay endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error};

use super::{AlarmError, AlarmOptions, AlarmResult, AlarmSink, AlarmSource};
use crate::utils::retry::{with_retry_if, RetrySchedule};

/// Webhook sink configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Endpoint URL
    pub url: String,
    /// Optional authentication token (sent as Bearer token)
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Custom headers to include in requests
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Maximum retry attempts on failure
    #[serde(default = "default_retries")]
    pub max_retries: u32,
}

fn default_timeout() -> u64 {
    10
}

fn default_retries() -> u32 {
    3
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
            headers: HashMap::new(),
            timeout_secs: default_timeout(),
            max_retries: default_retries(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("Webhook URL cannot be empty".to_string());
        }
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err("Webhook URL must start with http:// or https://".to_string());
        }
        if self.timeout_secs == 0 {
            return Err("Timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Alarm sink posting JSON payloads over HTTP
///
/// # Payload Format
///
/// ```json
/// {
///   "id": "alarm-uuid",
///   "source": "policy",
///   "name": "health_check_failed",
///   "category": "default",
///   "severity": "critical",
///   "cluster": "zoneX",
///   "module": "svc-a",
///   "target": "10.0.0.1:9100",
///   "message": "...",
///   "receivers": ["ops"],
///   "dedup_key": "health_check_failed:zoneX/TCP-10.0.0.1:9100",
///   "convergence_window_secs": 300,
///   "created_at": "2024-01-01T12:00:00Z"
/// }
/// ```
pub struct WebhookSink {
    config: WebhookConfig,
    client: Client,
    schedule: RetrySchedule,
}

impl WebhookSink {
    pub fn new(config: WebhookConfig) -> AlarmResult<Self> {
        config.validate().map_err(AlarmError::InvalidConfig)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AlarmError::InvalidConfig(format!("Failed to create HTTP client: {e}")))?;

        let schedule = RetrySchedule::exponential(
            config.max_retries,
            Duration::from_secs(1),
            Duration::from_secs(8),
        );

        Ok(Self {
            config,
            client,
            schedule,
        })
    }

    /// Override the backoff between attempts
    pub fn with_schedule(mut self, schedule: RetrySchedule) -> Self {
        self.schedule = schedule;
        self
    }

    fn build_payload(&self, options: &AlarmOptions, source: AlarmSource) -> serde_json::Value {
        serde_json::json!({
            "id": options.id,
            "source": source.as_str(),
            "name": options.name,
            "category": options.category,
            "severity": options.severity.as_str(),
            "cluster": options.cluster,
            "module": options.module,
            "target": options.target,
            "message": options.message,
            "receivers": options.receivers,
            "dedup_key": options.dedup_key,
            "convergence_window_secs": options.convergence_window_secs,
            "created_at": options.created_at.to_rfc3339(),
        })
    }

    async fn post(&self, payload: &serde_json::Value) -> AlarmResult<()> {
        let mut request = self.client.post(&self.config.url);
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }

        let response = request.json(payload).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read response body".to_string());
        Err(AlarmError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl AlarmSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send_alarm(&self, options: &AlarmOptions, source: AlarmSource) -> AlarmResult<()> {
        let payload = self.build_payload(options, source);

        // Client errors (4xx) are not retried
        let result = with_retry_if(&self.schedule, |_| self.post(&payload), AlarmError::is_recoverable).await;

        match &result {
            Ok(()) => debug!(url = %self.config.url, alarm = %options.name, "Alarm delivered"),
            Err(e) => error!(url = %self.config.url, alarm = %options.name, error = %e, "Failed to deliver alarm"),
        }
        result
    }
}
