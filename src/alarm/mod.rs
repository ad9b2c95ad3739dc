//! Alarm delivery
//!
//! Every producer (endpoint classifier, policy center) talks to a single
//! [`AlarmSink`]. Concrete sinks are chosen from configuration at startup
//! and composed rather than branched on:
//!
//! ```text
//!                      ┌──────────────────┐
//!   classifier ──────▶ │ MaintenanceGate  │  drops alarms inside a window
//!   policy     ──────▶ └────────┬─────────┘
//!                               ▼
//!                      ┌──────────────────┐
//!                      │    MultiSink     │  fan-out
//!                      └───┬──────────┬───┘
//!                          ▼          ▼
//!                     WebhookSink   LogSink
//! ```
//!
//! Sinks own deduplication: an alarm carries a `dedup_key` and an optional
//! convergence window, and repeated firings within that window are the
//! sink's to collapse.

pub mod maintenance;
pub mod webhook;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::coordination::CoordError;

pub use maintenance::{MaintenanceGate, MaintenanceWindow, MaintenanceWindows};
pub use webhook::{WebhookConfig, WebhookSink};

/// Result type for alarm operations
pub type AlarmResult<T> = Result<T, AlarmError>;

/// Errors raised while delivering alarms
#[derive(Debug, Error)]
pub enum AlarmError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The sink answered with a non-success status
    #[error("Sink rejected alarm: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Invalid sink configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Message template failed to render
    #[error("Template error: {0}")]
    Template(String),

    /// Maintenance lookup failed
    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordError),

    /// Some sinks of a fan-out failed
    #[error("Delivery failed for sinks: {}", .0.join(", "))]
    Partial(Vec<String>),
}

impl AlarmError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Partial(_) => true,
            Self::Rejected { status, .. } => *status >= 500,
            Self::Coordination(e) => e.is_recoverable(),
            Self::InvalidConfig(_) | Self::Serialization(_) | Self::Template(_) => false,
        }
    }
}

// ============================================================================
// Alarm types
// ============================================================================

/// Component that produced an alarm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmSource {
    /// Endpoint lifecycle (lost / back online / added / updated)
    Classifier,
    /// Probe failures evaluated by the policy center
    Policy,
}

impl AlarmSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Classifier => "classifier",
            Self::Policy => "policy",
        }
    }
}

/// Severity level of an alarm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmSeverity {
    Info,
    Warning,
    Critical,
}

impl AlarmSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlarmSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a sink needs to deliver one alarm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmOptions {
    pub id: Uuid,
    /// Alarm name, e.g. `module_lost` or `health_check_failed`
    pub name: String,
    /// Receiver category the alarm is routed under
    pub category: String,
    pub cluster: String,
    pub module: String,
    /// Endpoint or job the alarm refers to
    pub target: String,
    pub message: String,
    pub receivers: Vec<String>,
    pub severity: AlarmSeverity,
    /// Repeated firings with the same `dedup_key` inside this window are
    /// expected to be collapsed by the sink
    pub convergence_window_secs: Option<u64>,
    pub dedup_key: String,
    pub created_at: DateTime<Utc>,
}

impl AlarmOptions {
    pub fn new(
        name: impl Into<String>,
        cluster: impl Into<String>,
        module: impl Into<String>,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let target = target.into();
        Self {
            id: Uuid::new_v4(),
            dedup_key: format!("{name}:{target}"),
            name,
            category: "default".to_string(),
            cluster: cluster.into(),
            module: module.into(),
            target,
            message: message.into(),
            receivers: Vec::new(),
            severity: AlarmSeverity::Warning,
            convergence_window_secs: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_receivers(mut self, receivers: Vec<String>) -> Self {
        self.receivers = receivers;
        self
    }

    pub fn with_severity(mut self, severity: AlarmSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_convergence(mut self, window: Duration) -> Self {
        self.convergence_window_secs = Some(window.as_secs());
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = key.into();
        self
    }

    pub fn convergence_window(&self) -> Option<Duration> {
        self.convergence_window_secs.map(Duration::from_secs)
    }
}

/// Capability every alarm destination provides
#[async_trait]
pub trait AlarmSink: Send + Sync {
    /// Sink name used in logs and metrics
    fn name(&self) -> &str;

    /// Deliver one alarm
    async fn send_alarm(&self, options: &AlarmOptions, source: AlarmSource) -> AlarmResult<()>;
}

// ============================================================================
// Sinks
// ============================================================================

/// Writes alarms to the log
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl AlarmSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send_alarm(&self, options: &AlarmOptions, source: AlarmSource) -> AlarmResult<()> {
        warn!(
            source = source.as_str(),
            alarm = %options.name,
            severity = %options.severity,
            cluster = %options.cluster,
            module = %options.module,
            target = %options.target,
            receivers = ?options.receivers,
            "{}",
            options.message
        );
        Ok(())
    }
}

/// Keeps every alarm in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    alarms: Mutex<Vec<(AlarmOptions, AlarmSource)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Alarms received so far, in delivery order
    pub fn alarms(&self) -> Vec<(AlarmOptions, AlarmSource)> {
        self.alarms.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Alarms with the given name
    pub fn named(&self, name: &str) -> Vec<AlarmOptions> {
        self.alarms()
            .into_iter()
            .filter(|(a, _)| a.name == name)
            .map(|(a, _)| a)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.alarms.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.alarms.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[async_trait]
impl AlarmSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send_alarm(&self, options: &AlarmOptions, source: AlarmSource) -> AlarmResult<()> {
        self.alarms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((options.clone(), source));
        Ok(())
    }
}

/// Delivers every alarm to all inner sinks
pub struct MultiSink {
    sinks: Vec<Arc<dyn AlarmSink>>,
}

impl MultiSink {
    pub fn new(sinks: Vec<Arc<dyn AlarmSink>>) -> Self {
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl AlarmSink for MultiSink {
    fn name(&self) -> &str {
        "multi"
    }

    async fn send_alarm(&self, options: &AlarmOptions, source: AlarmSource) -> AlarmResult<()> {
        let results =
            futures::future::join_all(self.sinks.iter().map(|sink| sink.send_alarm(options, source))).await;

        let failed: Vec<String> = self
            .sinks
            .iter()
            .zip(results)
            .filter_map(|(sink, result)| {
                result.err().map(|e| {
                    warn!(sink = sink.name(), alarm = %options.name, error = %e, "Alarm delivery failed");
                    sink.name().to_string()
                })
            })
            .collect();

        if failed.is_empty() {
            Ok(())
        } else {
            Err(AlarmError::Partial(failed))
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// One configured alarm destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    Log,
    Webhook(WebhookConfig),
}

/// Build the sink described by `configs`
///
/// No entries yields a [`LogSink`]; several are wrapped in a [`MultiSink`].
pub fn build_sink(configs: &[SinkConfig]) -> AlarmResult<Arc<dyn AlarmSink>> {
    let mut sinks: Vec<Arc<dyn AlarmSink>> = Vec::with_capacity(configs.len());
    for config in configs {
        let sink: Arc<dyn AlarmSink> = match config {
            SinkConfig::Log => Arc::new(LogSink),
            SinkConfig::Webhook(webhook) => Arc::new(WebhookSink::new(webhook.clone())?),
        };
        sinks.push(sink);
    }

    let sink: Arc<dyn AlarmSink> = match sinks.len() {
        0 => Arc::new(LogSink),
        1 => sinks.remove(0),
        _ => Arc::new(MultiSink::new(sinks)),
    };
    info!(sink = sink.name(), "Alarm sink configured");
    Ok(sink)
}
