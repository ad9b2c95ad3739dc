//! Prometheus metrics for the master and slave tiers
//!
//! This module provides metrics tracking for:
//! - Master: watch events, flap pool, job pool fan-out, job-status cache, alarms
//! - Slave: probe outcomes and durations, running probe tasks
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

struct MasterMetrics {
    watch_events: CounterVec,
    classifications: CounterVec,
    flap_pool_size: Gauge,
    pool_jobs: Gauge,
    subscribers: Gauge,
    queue_drops: CounterVec,
    reports: CounterVec,
    cache_entries: Gauge,
    cache_changes: CounterVec,
    alarms: CounterVec,
    alarms_suppressed: CounterVec,
    api_requests: CounterVec,
    api_duration: HistogramVec,
}

struct SlaveMetrics {
    probes: CounterVec,
    probe_duration: HistogramVec,
    running_tasks: Gauge,
}

static MASTER_METRICS: OnceLock<MasterMetrics> = OnceLock::new();

static SLAVE_METRICS: OnceLock<SlaveMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Should be called once at startup. On failure subsequent metric
/// operations become no-ops.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let master = MasterMetrics {
        watch_events: register_counter_vec!(
            "healthmesh_watch_events_total",
            "Leaf events emitted by the tree watchers",
            &["kind"]
        )?,
        classifications: register_counter_vec!(
            "healthmesh_classifier_events_total",
            "Endpoint events by effective type and outcome",
            &["kind", "outcome"]
        )?,
        flap_pool_size: register_gauge!(
            "healthmesh_flap_pool_entries",
            "Outstanding lost observations awaiting the flap window"
        )?,
        pool_jobs: register_gauge!("healthmesh_pool_jobs", "Jobs known to the job pool")?,
        subscribers: register_gauge!(
            "healthmesh_pool_subscribers",
            "Slaves currently subscribed to job events"
        )?,
        queue_drops: register_counter_vec!(
            "healthmesh_pool_queue_drops_total",
            "Job events shed by the bounded event queue",
            &["policy"]
        )?,
        reports: register_counter_vec!(
            "healthmesh_job_reports_total",
            "Job status reports received from slaves",
            &["result"]
        )?,
        cache_entries: register_gauge!(
            "healthmesh_job_cache_entries",
            "Slave reports held in the job-status cache"
        )?,
        cache_changes: register_counter_vec!(
            "healthmesh_job_cache_changes_total",
            "Job-status cache mutations by origin",
            &["origin", "op"]
        )?,
        alarms: register_counter_vec!(
            "healthmesh_alarms_total",
            "Alarms handed to the alarm sink",
            &["source", "name", "result"]
        )?,
        alarms_suppressed: register_counter_vec!(
            "healthmesh_alarms_suppressed_total",
            "Alarms withheld before reaching a sink",
            &["reason"]
        )?,
        api_requests: register_counter_vec!(
            "healthmesh_api_requests_total",
            "Total API requests by endpoint and status",
            &["endpoint", "status"]
        )?,
        api_duration: register_histogram_vec!(
            "healthmesh_api_request_duration_seconds",
            "API request duration in seconds",
            &["endpoint"],
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
        )?,
    };

    let slave = SlaveMetrics {
        probes: register_counter_vec!(
            "healthmesh_probes_total",
            "Probe cycles by protocol and result",
            &["protocol", "result"]
        )?,
        probe_duration: register_histogram_vec!(
            "healthmesh_probe_duration_seconds",
            "Duration of a full probe cycle including retries",
            &["protocol"],
            vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 3.0, 5.0, 10.0, 15.0]
        )?,
        running_tasks: register_gauge!(
            "healthmesh_collector_running_tasks",
            "Probe tasks currently supervised by the collector"
        )?,
    };

    MASTER_METRICS.set(master).map_err(|_| "Master metrics already initialized")?;
    SLAVE_METRICS.set(slave).map_err(|_| "Slave metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    MASTER_METRICS.get().is_some() && SLAVE_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub fn record_watch_event(kind: &str) {
    if let Some(m) = MASTER_METRICS.get() {
        m.watch_events.with_label_values(&[kind]).inc();
    }
}

/// Record a classifier decision (`outcome` is `emitted` or `suppressed`)
pub fn record_classification(kind: &str, outcome: &str) {
    if let Some(m) = MASTER_METRICS.get() {
        m.classifications.with_label_values(&[kind, outcome]).inc();
    }
}

pub fn set_flap_pool_size(entries: usize) {
    if let Some(m) = MASTER_METRICS.get() {
        m.flap_pool_size.set(entries as f64);
    }
}

pub fn update_pool_metrics(jobs: usize, subscribers: usize) {
    if let Some(m) = MASTER_METRICS.get() {
        m.pool_jobs.set(jobs as f64);
        m.subscribers.set(subscribers as f64);
    }
}

pub fn record_queue_drop(policy: &str) {
    if let Some(m) = MASTER_METRICS.get() {
        m.queue_drops.with_label_values(&[policy]).inc();
    }
}

pub fn record_report(success: bool) {
    if let Some(m) = MASTER_METRICS.get() {
        let result = if success { "success" } else { "failure" };
        m.reports.with_label_values(&[result]).inc();
    }
}

pub fn set_cache_entries(entries: usize) {
    if let Some(m) = MASTER_METRICS.get() {
        m.cache_entries.set(entries as f64);
    }
}

/// Record cache mutations (`origin`: watch, sync, sweep; `op`: put, delete)
pub fn record_cache_change(origin: &str, op: &str, count: usize) {
    if count == 0 {
        return;
    }
    if let Some(m) = MASTER_METRICS.get() {
        m.cache_changes
            .with_label_values(&[origin, op])
            .inc_by(count as f64);
    }
}

pub fn record_alarm(source: &str, name: &str, delivered: bool) {
    if let Some(m) = MASTER_METRICS.get() {
        let result = if delivered { "delivered" } else { "failed" };
        m.alarms.with_label_values(&[source, name, result]).inc();
    }
}

pub fn record_alarm_suppressed(reason: &str) {
    if let Some(m) = MASTER_METRICS.get() {
        m.alarms_suppressed.with_label_values(&[reason]).inc();
    }
}

/// Record API request
pub fn record_api_request(endpoint: &str, status: u16, duration_secs: f64) {
    let Some(m) = MASTER_METRICS.get() else {
        return;
    };

    let status_str = status.to_string();
    m.api_requests
        .with_label_values(&[endpoint, &status_str])
        .inc();
    m.api_duration
        .with_label_values(&[endpoint])
        .observe(duration_secs);
}

pub fn record_probe(protocol: &str, success: bool, duration_secs: f64) {
    let Some(m) = SLAVE_METRICS.get() else {
        return;
    };

    let result = if success { "success" } else { "failure" };
    m.probes.with_label_values(&[protocol, result]).inc();
    m.probe_duration
        .with_label_values(&[protocol])
        .observe(duration_secs);
}

pub fn set_running_tasks(tasks: usize) {
    if let Some(m) = SLAVE_METRICS.get() {
        m.running_tasks.set(tasks as f64);
    }
}

// ============================================================================
// Tests
// ============================================================================
