//! Slave-side job collector
//!
//! Keeps exactly one probe task per job key and reports every probe cycle
//! back to the master.
//!
//! ```text
//!   JobSource.watch_jobs ──▶ apply(job) ─┐
//!   JobSource.list_jobs  ──▶ sync(jobs) ─┼──▶ task pool (one lock)
//!   periodic resync ─────────────────────┘        │
//!                                           probe ─▶ report ─▶ sleep ─┐
//!                                             ▲                       │
//!                                             └───────────────────────┘
//! ```
//!
//! Per key: absent → running on Add/Update, running → running (fresh task)
//! on Update or a changed Add, running → absent on Delete. Cancelling a task
//! never waits for an in-flight probe; the loop checks its token before
//! reporting.

pub mod client;
pub mod probe;
pub mod source;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::models::{Job, JobAction, JobKey, JobStatus, SlaveInfo};

pub use client::{ClientConfig, ClientError, MasterClient};
pub use probe::{ProbeOutcome, Prober};
pub use source::{InProcessSource, JobSource, JobStream};

/// Collector timing settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub probe_timeout_secs: u64,
    /// Delays before the 2nd, 3rd, ... TCP dial attempt
    pub tcp_retry_delays_secs: Vec<u64>,
    /// Sleep between probe cycles of one job
    pub check_interval_secs: u64,
    /// Full resync period, independent of watch health
    pub resync_secs: u64,
    /// Delay before reopening a failed watch
    pub watch_retry_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: 3,
            tcp_retry_delays_secs: vec![1, 3],
            check_interval_secs: 10,
            resync_secs: 60,
            watch_retry_secs: 2,
        }
    }
}

impl CollectorConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn tcp_retry_delays(&self) -> Vec<Duration> {
        self.tcp_retry_delays_secs.iter().copied().map(Duration::from_secs).collect()
    }
}

/// Task pool changes made by one [`JobCollector::sync`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncStats {
    pub started: usize,
    pub restarted: usize,
    pub stopped: usize,
}

struct Task {
    job: Job,
    token: CancellationToken,
}

/// Supervises one probe task per job key
pub struct JobCollector {
    slave: SlaveInfo,
    source: Arc<dyn JobSource>,
    prober: Arc<Prober>,
    tasks: Mutex<HashMap<JobKey, Task>>,
    check_interval: Duration,
    resync_interval: Duration,
    retry_delay: Duration,
    healthy: AtomicBool,
}

impl JobCollector {
    pub fn new(slave: SlaveInfo, source: Arc<dyn JobSource>, prober: Prober, config: &CollectorConfig) -> Self {
        Self {
            slave,
            source,
            prober: Arc::new(prober),
            tasks: Mutex::new(HashMap::new()),
            check_interval: Duration::from_secs(config.check_interval_secs),
            resync_interval: Duration::from_secs(config.resync_secs.max(1)),
            retry_delay: Duration::from_secs(config.watch_retry_secs),
            healthy: AtomicBool::new(true),
        }
    }

    /// Override the check, resync and watch-retry periods
    pub fn with_intervals(mut self, check: Duration, resync: Duration, retry: Duration) -> Self {
        self.check_interval = check;
        self.resync_interval = resync;
        self.retry_delay = retry;
        self
    }

    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<JobKey, Task>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn slave(&self) -> &SlaveInfo {
        &self.slave
    }

    /// Number of running probe tasks
    pub fn running(&self) -> usize {
        self.lock_tasks().len()
    }

    /// Keys of running tasks, sorted
    pub fn running_keys(&self) -> Vec<JobKey> {
        let mut keys: Vec<JobKey> = self.lock_tasks().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Job a running task probes
    pub fn task_job(&self, key: &JobKey) -> Option<Job> {
        self.lock_tasks().get(key).map(|task| task.job.clone())
    }

    /// False while the master cannot be reached
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    fn set_healthy(&self, healthy: bool) {
        if self.healthy.swap(healthy, Ordering::Relaxed) != healthy && healthy {
            info!(source = self.source.name(), "Collector reconnected to master");
        }
    }

    // ========================================================================
    // Task pool
    // ========================================================================

    /// Start a task for `job`, cancelling any task it replaces
    ///
    /// Must be called with the task lock held so replace is atomic.
    fn start_locked(self: &Arc<Self>, tasks: &mut HashMap<JobKey, Task>, job: Job) {
        let key = job.key();
        if let Some(old) = tasks.remove(&key) {
            old.token.cancel();
        }

        let token = CancellationToken::new();
        let job = job.with_action(JobAction::Add);
        tokio::spawn(self.clone().run_task(job.clone(), token.clone()));
        debug!(job = %key, "Probe task started");
        tasks.insert(key, Task { job, token });
    }

    fn stop_locked(tasks: &mut HashMap<JobKey, Task>, key: &JobKey) -> bool {
        match tasks.remove(key) {
            Some(task) => {
                task.token.cancel();
                debug!(job = %key, "Probe task cancelled");
                true
            }
            None => false,
        }
    }

    /// Apply one job change from the watch stream
    pub fn apply(self: &Arc<Self>, job: Job) {
        let mut tasks = self.lock_tasks();
        let key = job.key();
        match job.action {
            JobAction::Add => {
                let unchanged = tasks
                    .get(&key)
                    .is_some_and(|task| task.job == job.with_action(JobAction::Add));
                if !unchanged {
                    self.start_locked(&mut tasks, job);
                }
            }
            JobAction::Update => self.start_locked(&mut tasks, job),
            JobAction::Delete => {
                Self::stop_locked(&mut tasks, &key);
            }
            JobAction::Handled => {
                debug!(job = %key, "Ignoring handled job in watch stream");
            }
        }
        metrics::set_running_tasks(tasks.len());
    }

    /// Reconcile the task pool against a full job list
    pub fn sync(self: &Arc<Self>, jobs: Vec<Job>) -> ResyncStats {
        let desired: HashMap<JobKey, Job> = jobs
            .into_iter()
            .map(|job| (job.key(), job.with_action(JobAction::Add)))
            .collect();

        let mut stats = ResyncStats::default();
        let mut tasks = self.lock_tasks();

        let redundant: Vec<JobKey> = tasks.keys().filter(|key| !desired.contains_key(*key)).cloned().collect();
        for key in &redundant {
            if Self::stop_locked(&mut tasks, key) {
                stats.stopped += 1;
            }
        }

        for (key, job) in desired {
            match tasks.get(&key) {
                Some(task) if task.job == job => {}
                Some(_) => {
                    self.start_locked(&mut tasks, job);
                    stats.restarted += 1;
                }
                None => {
                    self.start_locked(&mut tasks, job);
                    stats.started += 1;
                }
            }
        }
        metrics::set_running_tasks(tasks.len());
        stats
    }

    /// Cancel every task
    pub fn stop_all(&self) {
        let mut tasks = self.lock_tasks();
        for (_, task) in tasks.drain() {
            task.token.cancel();
        }
        metrics::set_running_tasks(0);
    }

    /// Fetch the full job list and reconcile against it
    pub async fn resync(self: &Arc<Self>) -> Result<ResyncStats, ClientError> {
        let jobs = self.source.list_jobs(&self.slave).await?;
        let stats = self.sync(jobs);
        if stats != ResyncStats::default() {
            info!(
                started = stats.started,
                restarted = stats.restarted,
                stopped = stats.stopped,
                "Resync reconciled probe tasks"
            );
        }
        Ok(stats)
    }

    // ========================================================================
    // Loops
    // ========================================================================

    async fn run_task(self: Arc<Self>, job: Job, token: CancellationToken) {
        loop {
            let outcome = tokio::select! {
                _ = token.cancelled() => break,
                outcome = self.prober.probe(&job) => outcome,
            };
            if token.is_cancelled() {
                break;
            }

            let report = job.with_status(JobStatus {
                slave_info: self.slave.clone(),
                success: outcome.success,
                message: outcome.message,
                finished_at: Utc::now(),
            });
            tokio::select! {
                _ = token.cancelled() => break,
                result = self.source.report_job(&report) => {
                    if let Err(e) = result {
                        warn!(job = %job.key(), error = %e, "Failed to report probe result");
                    }
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.check_interval) => {}
            }
        }
        debug!(job = %job.key(), "Probe task stopped");
    }

    async fn run_resync(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.resync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The watch loop already resyncs on start
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.resync().await {
                        warn!(error = %e, "Periodic resync failed");
                    }
                }
            }
        }
    }

    async fn run_watch(self: &Arc<Self>, cancel: &CancellationToken) {
        loop {
            match self.source.watch_jobs(&self.slave).await {
                Ok(mut stream) => {
                    // Resync with the watch already open so no change falls in between
                    match self.resync().await {
                        Ok(_) => self.set_healthy(true),
                        Err(e) => {
                            self.healthy.store(false, Ordering::Relaxed);
                            warn!(error = %e, "Resync before watch failed");
                        }
                    }

                    loop {
                        let item = tokio::select! {
                            _ = cancel.cancelled() => return,
                            item = stream.next() => item,
                        };
                        match item {
                            Some(Ok(job)) => self.apply(job),
                            Some(Err(e)) if !e.is_recoverable() => {
                                warn!(error = %e, "Dropping malformed job event");
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "Job watch failed, resyncing");
                                break;
                            }
                            None => {
                                info!("Job watch closed, resyncing");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    self.healthy.store(false, Ordering::Relaxed);
                    warn!(source = self.source.name(), error = %e, "Could not open job watch");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }

    /// Collector main loop; cancels every probe task when `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            slave = %self.slave.cluster_name,
            zones = ?self.slave.zones,
            source = self.source.name(),
            "Job collector started"
        );
        let resync = tokio::spawn(self.clone().run_resync(cancel.child_token()));

        self.run_watch(&cancel).await;

        let _ = resync.await;
        self.stop_all();
        info!("Job collector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Protocol, Zone};
    use crate::utils::retry::RetrySchedule;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct FakeSource {
        jobs: Mutex<Vec<Job>>,
        events: Mutex<Vec<Job>>,
        reports: Mutex<Vec<Job>>,
        list_calls: AtomicUsize,
        watch_calls: AtomicUsize,
    }

    impl FakeSource {
        fn reports(&self) -> Vec<Job> {
            self.reports.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobSource for FakeSource {
        fn name(&self) -> &str {
            "fake"
        }

        async fn watch_jobs(&self, _slave: &SlaveInfo) -> Result<JobStream, ClientError> {
            self.watch_calls.fetch_add(1, Ordering::SeqCst);
            let events: Vec<Job> = std::mem::take(&mut *self.events.lock().unwrap());
            Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
        }

        async fn list_jobs(&self, _slave: &SlaveInfo) -> Result<Vec<Job>, ClientError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.jobs.lock().unwrap().clone())
        }

        async fn report_job(&self, job: &Job) -> Result<(), ClientError> {
            self.reports.lock().unwrap().push(job.clone());
            Ok(())
        }
    }

    fn collector(source: Arc<FakeSource>) -> Arc<JobCollector> {
        let prober = Prober::new(
            Duration::from_millis(200),
            RetrySchedule::tiered(vec![Duration::from_millis(10), Duration::from_millis(20)]),
        )
        .unwrap();
        let slave = SlaveInfo::new("slave-1", vec![Zone::new("zoneX")]);
        Arc::new(
            JobCollector::new(slave, source, prober, &CollectorConfig::default()).with_intervals(
                Duration::from_millis(50),
                Duration::from_millis(100),
                Duration::from_millis(20),
            ),
        )
    }

    fn job(url: &str) -> Job {
        Job::new("svc-a", Zone::new("zoneX"), Protocol::Tcp, url)
    }

    async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        done()
    }

    #[tokio::test]
    async fn test_replayed_add_is_noop() {
        let collector = collector(Arc::new(FakeSource::default()));
        collector.apply(job("127.0.0.1:1"));
        collector.apply(job("127.0.0.1:1"));
        assert_eq!(collector.running(), 1);
        collector.stop_all();
    }

    #[tokio::test]
    async fn test_delete_then_add_leaves_one_task() {
        let collector = collector(Arc::new(FakeSource::default()));
        let add = job("127.0.0.1:1");

        collector.apply(add.clone());
        collector.apply(add.with_action(JobAction::Delete));
        collector.apply(add.clone());
        assert_eq!(collector.running(), 1);

        collector.apply(add.with_action(JobAction::Delete));
        assert_eq!(collector.running(), 0);
        collector.apply(add.with_action(JobAction::Delete));
        assert_eq!(collector.running(), 0);
    }

    #[tokio::test]
    async fn test_update_replaces_task() {
        let collector = collector(Arc::new(FakeSource::default()));
        collector.apply(job("127.0.0.1:1"));

        let mut updated = job("127.0.0.1:1").with_action(JobAction::Update);
        updated.module = "svc-b".into();
        collector.apply(updated.clone());

        assert_eq!(collector.running(), 1);
        assert_eq!(collector.task_job(&updated.key()).unwrap().module, "svc-b");
        collector.stop_all();
    }

    #[tokio::test]
    async fn test_sync_diffs_task_set() {
        let collector = collector(Arc::new(FakeSource::default()));
        collector.apply(job("127.0.0.1:1"));
        collector.apply(job("127.0.0.1:2"));

        let stats = collector.sync(vec![job("127.0.0.1:2"), job("127.0.0.1:3")]);
        assert_eq!(
            stats,
            ResyncStats {
                started: 1,
                restarted: 0,
                stopped: 1
            }
        );
        let urls: Vec<String> = collector.running_keys().into_iter().map(|k| k.url).collect();
        assert_eq!(urls, vec!["127.0.0.1:2", "127.0.0.1:3"]);
        collector.stop_all();
    }

    #[tokio::test]
    async fn test_reports_stop_after_delete() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let source = Arc::new(FakeSource::default());
        let collector = collector(source.clone());

        collector.apply(job(&addr));
        assert!(wait_until(|| source.reports().len() >= 2).await);

        let report = &source.reports()[0];
        let status = report.status.as_ref().unwrap();
        assert_eq!(report.action, JobAction::Handled);
        assert!(status.success);
        assert_eq!(status.slave_info.cluster_name, "slave-1");

        collector.apply(job(&addr).with_action(JobAction::Delete));
        tokio::time::sleep(Duration::from_millis(30)).await;
        let settled = source.reports().len();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(source.reports().len(), settled);
    }

    #[tokio::test]
    async fn test_run_resyncs_after_watch_closes() {
        let source = Arc::new(FakeSource::default());
        source.jobs.lock().unwrap().push(job("127.0.0.1:1"));
        source.events.lock().unwrap().push(job("127.0.0.1:2"));
        let collector = collector(source.clone());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(collector.clone().run(cancel.clone()));

        // The first watch delivers :2, ends, and the next resync drops it
        assert!(wait_until(|| source.watch_calls.load(Ordering::SeqCst) >= 2).await);
        assert!(wait_until(|| collector.running_keys().iter().map(|k| k.url.as_str()).eq(["127.0.0.1:1"])).await);
        assert!(source.list_calls.load(Ordering::SeqCst) >= 2);
        assert!(collector.is_healthy());

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(collector.running(), 0);
    }
}
