//! Policy center: turns failing probe reports into alarms
//!
//! Each pass partitions every job's live reports into successes and
//! failures and emits exactly one alarm per job with at least one failure.
//! Alarms carry a convergence window; collapsing repeats inside it is the
//! sink's job. Passes only run while this process holds the master role.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alarm::{AlarmOptions, AlarmSeverity, AlarmSink, AlarmSource};
use crate::metrics;
use crate::models::{Job, JobKey};
use crate::store::JobStore;

/// Alarm name of policy alarms
pub const JOB_FAILED_ALARM: &str = "health_check_failed";

// ============================================================================
// Role
// ============================================================================

/// Answers whether this process is the active master
pub trait RoleProvider: Send + Sync {
    fn is_master(&self) -> bool;
}

/// Shared, settable role flag
#[derive(Debug, Clone, Default)]
pub struct RoleHandle(Arc<AtomicBool>);

impl RoleHandle {
    pub fn new(is_master: bool) -> Self {
        Self(Arc::new(AtomicBool::new(is_master)))
    }

    pub fn set_master(&self, is_master: bool) {
        let previous = self.0.swap(is_master, Ordering::Relaxed);
        if previous != is_master {
            info!(is_master, "Role changed");
        }
    }
}

impl RoleProvider for RoleHandle {
    fn is_master(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub interval_secs: u64,
    /// Independent of the classifier's flap window
    pub convergence_window_secs: u64,
    pub category: String,
    pub receivers: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            convergence_window_secs: 300,
            category: "healthcheck".to_string(),
            receivers: Vec::new(),
        }
    }
}

impl PolicyConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn convergence_window(&self) -> Duration {
        Duration::from_secs(self.convergence_window_secs)
    }
}

// ============================================================================
// Alarm Task
// ============================================================================

/// Reports of one job across all slaves, split by outcome
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmTask {
    pub key: JobKey,
    pub module: String,
    pub success: Vec<Job>,
    pub fail: Vec<Job>,
}

impl AlarmTask {
    /// Partition `reports`, which are expected sorted by slave
    pub fn build(key: JobKey, reports: Vec<Job>) -> Self {
        let module = reports.first().map(|job| job.module.clone()).unwrap_or_default();
        let (success, fail): (Vec<Job>, Vec<Job>) = reports
            .into_iter()
            .partition(|job| job.status.as_ref().is_some_and(|status| status.success));
        Self {
            key,
            module,
            success,
            fail,
        }
    }

    pub fn is_failing(&self) -> bool {
        !self.fail.is_empty()
    }

    /// Failure reported in the alarm
    pub fn representative(&self) -> Option<&Job> {
        self.fail.first()
    }

    /// Alarm for this task, if any slave reported a failure
    pub fn to_alarm(&self, config: &PolicyConfig) -> Option<AlarmOptions> {
        let failed = self.representative()?;
        let status = failed.status.as_ref()?;
        let total = self.success.len() + self.fail.len();
        let message = format!(
            "{} {} {} failed on {}/{} slaves; {} reported: {}",
            self.module,
            self.key.protocol,
            self.key.url,
            self.fail.len(),
            total,
            status.slave_info.cluster_name,
            status.message
        );
        let severity = if self.success.is_empty() {
            AlarmSeverity::Critical
        } else {
            AlarmSeverity::Warning
        };

        Some(
            AlarmOptions::new(JOB_FAILED_ALARM, self.key.zone.as_str(), &self.module, &self.key.url, message)
                .with_category(&config.category)
                .with_receivers(config.receivers.clone())
                .with_severity(severity)
                .with_convergence(config.convergence_window())
                .with_dedup_key(format!("{JOB_FAILED_ALARM}:{}", self.key)),
        )
    }
}

// ============================================================================
// Policy Center
// ============================================================================

pub struct PolicyCenter {
    store: Arc<JobStore>,
    sink: Arc<dyn AlarmSink>,
    role: Arc<dyn RoleProvider>,
    config: PolicyConfig,
}

impl PolicyCenter {
    pub fn new(store: Arc<JobStore>, sink: Arc<dyn AlarmSink>, role: Arc<dyn RoleProvider>, config: PolicyConfig) -> Self {
        Self {
            store,
            sink,
            role,
            config,
        }
    }

    /// Failing jobs in the cache as of `now`
    pub fn evaluate(&self, now: DateTime<Utc>) -> Vec<AlarmTask> {
        self.store
            .live_snapshot(now)
            .into_iter()
            .map(|(key, reports)| AlarmTask::build(key, reports))
            .filter(AlarmTask::is_failing)
            .collect()
    }

    /// One evaluation pass; returns the number of alarms delivered
    pub async fn run_once(&self, now: DateTime<Utc>) -> usize {
        if !self.role.is_master() {
            debug!("Not the active master, skipping policy evaluation");
            return 0;
        }

        let mut delivered = 0;
        for task in self.evaluate(now) {
            let Some(options) = task.to_alarm(&self.config) else {
                continue;
            };
            let result = self.sink.send_alarm(&options, AlarmSource::Policy).await;
            metrics::record_alarm(AlarmSource::Policy.as_str(), JOB_FAILED_ALARM, result.is_ok());
            match result {
                Ok(()) => {
                    delivered += 1;
                    info!(
                        job = %task.key,
                        failed = task.fail.len(),
                        succeeded = task.success.len(),
                        "Job failure alarm emitted"
                    );
                }
                Err(e) => warn!(job = %task.key, sink = self.sink.name(), error = %e, "Failed to send job alarm"),
            }
        }
        delivered
    }

    /// Evaluation loop; returns when `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.config.interval_secs,
            convergence_secs = self.config.convergence_window_secs,
            "Policy center started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_once(Utc::now()).await;
                }
            }
        }
        info!("Policy center stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::RecordingSink;
    use crate::models::{JobStatus, Protocol, SlaveInfo, Zone};
    use crate::store::{JobStoreConfig, MemoryDurableStore, StoreEvent};

    fn report(url: &str, slave: &str, success: bool) -> Job {
        Job::new("svc-a", Zone::new("zoneX"), Protocol::Tcp, url).with_status(JobStatus {
            slave_info: SlaveInfo::new(slave, vec![Zone::new("zoneX")]),
            success,
            message: if success { "ok".into() } else { format!("{slave}: connection refused") },
            finished_at: Utc::now(),
        })
    }

    fn seeded_store(reports: &[Job]) -> Arc<JobStore> {
        let store = Arc::new(JobStore::new(Arc::new(MemoryDurableStore::new()), JobStoreConfig::default()));
        for job in reports {
            let slave = &job.status.as_ref().unwrap().slave_info.cluster_name;
            store.apply_event(
                StoreEvent::Put {
                    key: store.key_for(&job.key(), slave),
                    value: serde_json::to_vec(job).unwrap(),
                },
                Utc::now(),
            );
        }
        store
    }

    fn center(store: Arc<JobStore>, sink: Arc<RecordingSink>, role: RoleHandle) -> PolicyCenter {
        PolicyCenter::new(store, sink, Arc::new(role), PolicyConfig::default())
    }

    #[test]
    fn test_alarm_task_partition() {
        let key = report("10.0.0.1:9100", "a", true).key();
        let task = AlarmTask::build(
            key,
            vec![
                report("10.0.0.1:9100", "a", true),
                report("10.0.0.1:9100", "b", false),
                report("10.0.0.1:9100", "c", false),
            ],
        );
        assert!(task.is_failing());
        assert_eq!(task.success.len(), 1);
        assert_eq!(task.fail.len(), 2);

        let slave = &task.representative().unwrap().status.as_ref().unwrap().slave_info.cluster_name;
        assert_eq!(slave, "b");
    }

    #[tokio::test]
    async fn test_one_alarm_per_failing_job() {
        let store = seeded_store(&[
            report("10.0.0.1:9100", "slave-1", false),
            report("10.0.0.1:9100", "slave-2", true),
            report("10.0.0.1:9100", "slave-3", false),
            report("10.0.0.2:9100", "slave-1", true),
        ]);
        let sink = Arc::new(RecordingSink::new());
        let policy = center(store, sink.clone(), RoleHandle::new(true));

        assert_eq!(policy.run_once(Utc::now()).await, 1);
        let alarms = sink.named(JOB_FAILED_ALARM);
        assert_eq!(alarms.len(), 1);

        let alarm = &alarms[0];
        assert_eq!(alarm.module, "svc-a");
        assert_eq!(alarm.cluster, "zoneX");
        assert_eq!(alarm.target, "10.0.0.1:9100");
        assert_eq!(alarm.severity, AlarmSeverity::Warning);
        assert_eq!(alarm.convergence_window(), Some(Duration::from_secs(300)));
        assert!(alarm.message.contains("failed on 2/3 slaves"));
        assert!(alarm.message.contains("slave-1: connection refused"));

        // A second pass fires again; collapsing it is up to the sink
        assert_eq!(policy.run_once(Utc::now()).await, 1);
        let again = sink.named(JOB_FAILED_ALARM);
        assert_eq!(again[0].dedup_key, again[1].dedup_key);
    }

    #[tokio::test]
    async fn test_all_failing_is_critical() {
        let store = seeded_store(&[report("10.0.0.1:9100", "slave-1", false)]);
        let sink = Arc::new(RecordingSink::new());
        center(store, sink.clone(), RoleHandle::new(true)).run_once(Utc::now()).await;
        assert_eq!(sink.named(JOB_FAILED_ALARM)[0].severity, AlarmSeverity::Critical);
    }

    #[tokio::test]
    async fn test_skipped_when_not_master() {
        let store = seeded_store(&[report("10.0.0.1:9100", "slave-1", false)]);
        let sink = Arc::new(RecordingSink::new());
        let role = RoleHandle::new(false);
        let policy = center(store, sink.clone(), role.clone());

        assert_eq!(policy.run_once(Utc::now()).await, 0);
        assert!(sink.is_empty());

        role.set_master(true);
        assert_eq!(policy.run_once(Utc::now()).await, 1);
    }

    #[tokio::test]
    async fn test_expired_reports_ignored() {
        let store = seeded_store(&[report("10.0.0.1:9100", "slave-1", false)]);
        let sink = Arc::new(RecordingSink::new());
        let policy = center(store, sink.clone(), RoleHandle::new(true));

        let later = Utc::now() + chrono::Duration::seconds(600);
        assert!(policy.evaluate(later).is_empty());
        assert_eq!(policy.run_once(later).await, 0);
    }

    #[test]
    fn test_policy_config_defaults() {
        let config = PolicyConfig::default();
        assert_eq!(config.interval(), Duration::from_secs(30));
        assert_eq!(config.convergence_window(), Duration::from_secs(300));
    }
}
