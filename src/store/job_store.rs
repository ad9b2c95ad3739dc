//! Reconciled job-status cache
//!
//! The cache is keyed `JobKey -> slave -> Job` and is only ever mutated by
//! the watch-apply loop, the periodic full sync and the expiry sweep. All
//! three go through the same lock; report handling writes to the durable
//! store and never touches the cache directly.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DurableStore, StoreError, StoreEvent, StoreResult};
use crate::metrics;
use crate::models::{Job, JobKey, Protocol, Zone};
use crate::utils::{decode_segment, encode_segment};

/// Job store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobStoreConfig {
    /// Durable key prefix; reports live under `{root}/jobs/`
    pub root: String,
    /// TTL attached to every durable report
    pub job_ttl_secs: u64,
    /// Reports older than this are swept from the cache
    pub cache_expiry_secs: u64,
    pub full_sync_secs: u64,
    pub sweep_secs: u64,
    /// Delay before re-establishing a failed watch
    pub watch_retry_secs: u64,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            root: "/healthmesh".to_string(),
            job_ttl_secs: 60,
            cache_expiry_secs: 90,
            full_sync_secs: 30,
            sweep_secs: 10,
            watch_retry_secs: 2,
        }
    }
}

impl JobStoreConfig {
    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_secs)
    }

    pub fn cache_expiry(&self) -> Duration {
        Duration::from_secs(self.cache_expiry_secs)
    }

    pub fn full_sync_interval(&self) -> Duration {
        Duration::from_secs(self.full_sync_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_secs.max(1))
    }

    /// Prefix covering every report
    pub fn jobs_prefix(&self) -> String {
        format!("{}/jobs/", self.root.trim_end_matches('/'))
    }
}

/// Outcome of a full sync pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

impl SyncStats {
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.updated == 0 && self.removed == 0
    }
}

type Cache = HashMap<JobKey, BTreeMap<String, Job>>;

/// Durable report writer plus reconciled in-memory view
pub struct JobStore {
    store: Arc<dyn DurableStore>,
    config: JobStoreConfig,
    prefix: String,
    cache: Mutex<Cache>,
    healthy: AtomicBool,
}

impl JobStore {
    pub fn new(store: Arc<dyn DurableStore>, config: JobStoreConfig) -> Self {
        Self {
            prefix: config.jobs_prefix(),
            store,
            config,
            cache: Mutex::new(HashMap::new()),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &JobStoreConfig {
        &self.config
    }

    fn lock_cache(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_healthy(&self, healthy: bool) {
        if self.healthy.swap(healthy, Ordering::Relaxed) != healthy {
            if healthy {
                info!(store = self.store.name(), "Job store recovered");
            } else {
                warn!(store = self.store.name(), "Job store degraded");
            }
        }
    }

    /// False while the durable store is failing
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Key layout
    // ========================================================================

    /// Durable key of `key` as reported by `slave`
    pub fn key_for(&self, key: &JobKey, slave: &str) -> String {
        format!(
            "{}{}/{}/{}",
            self.prefix,
            encode_segment(key.zone.as_str()),
            encode_segment(&key.name()),
            encode_segment(slave)
        )
    }

    /// Reverse of [`JobStore::key_for`]
    pub fn parse_key(&self, durable_key: &str) -> Option<(JobKey, String)> {
        let rest = durable_key.strip_prefix(&self.prefix)?;
        let mut segments = rest.split('/');
        let (zone, name, slave) = (segments.next()?, segments.next()?, segments.next()?);
        if segments.next().is_some() {
            return None;
        }

        let name = decode_segment(name);
        let (protocol, url) = name.split_once('-')?;
        let key = JobKey {
            zone: Zone::new(decode_segment(zone)),
            protocol: Protocol::parse(protocol)?,
            url: url.to_string(),
        };
        Some((key, decode_segment(slave)))
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Persist one probe report with the configured TTL
    pub async fn report(&self, job: &Job) -> StoreResult<()> {
        let status = job
            .status
            .as_ref()
            .ok_or_else(|| StoreError::Codec(format!("report for {} carries no status", job.key())))?;
        let value = serde_json::to_vec(job).map_err(|e| StoreError::Codec(e.to_string()))?;
        let durable_key = self.key_for(&job.key(), &status.slave_info.cluster_name);

        self.store.put(&durable_key, value, self.config.job_ttl()).await?;
        metrics::record_report(status.success);
        debug!(job = %job.key(), slave = %status.slave_info.cluster_name, success = status.success, "Report stored");
        Ok(())
    }

    // ========================================================================
    // Read path
    // ========================================================================

    fn is_stale(&self, job: &Job, now: DateTime<Utc>) -> bool {
        let Some(status) = &job.status else {
            return true;
        };
        let Ok(expiry) = chrono::Duration::from_std(self.config.cache_expiry()) else {
            return false;
        };
        now.signed_duration_since(status.finished_at) > expiry
    }

    fn decode(&self, durable_key: &str, value: &[u8]) -> Option<(JobKey, String, Job)> {
        let Some((key, slave)) = self.parse_key(durable_key) else {
            warn!(key = %durable_key, "Dropping report under unrecognized key");
            return None;
        };
        match serde_json::from_slice::<Job>(value) {
            Ok(job) if job.status.is_some() => Some((key, slave, job)),
            Ok(_) => {
                warn!(key = %durable_key, "Dropping report without status");
                None
            }
            Err(e) => {
                warn!(key = %durable_key, error = %e, "Dropping malformed report");
                None
            }
        }
    }

    fn remove_entry(cache: &mut Cache, key: &JobKey, slave: &str) -> bool {
        let Some(reports) = cache.get_mut(key) else {
            return false;
        };
        let removed = reports.remove(slave).is_some();
        if reports.is_empty() {
            cache.remove(key);
        }
        removed
    }

    /// Mirror one watch event into the cache; returns whether it changed
    pub fn apply_event(&self, event: StoreEvent, now: DateTime<Utc>) -> bool {
        match event {
            StoreEvent::Put { key, value } => {
                let Some((job_key, slave, job)) = self.decode(&key, &value) else {
                    return false;
                };
                let mut cache = self.lock_cache();
                if self.is_stale(&job, now) {
                    return Self::remove_entry(&mut cache, &job_key, &slave);
                }
                let previous = cache.entry(job_key).or_default().insert(slave, job.clone());
                let changed = previous.as_ref() != Some(&job);
                metrics::set_cache_entries(Self::count(&cache));
                drop(cache);

                if changed {
                    metrics::record_cache_change("watch", "put", 1);
                }
                changed
            }
            StoreEvent::Delete { key } => {
                let Some((job_key, slave)) = self.parse_key(&key) else {
                    return false;
                };
                let mut cache = self.lock_cache();
                let removed = Self::remove_entry(&mut cache, &job_key, &slave);
                metrics::set_cache_entries(Self::count(&cache));
                drop(cache);

                if removed {
                    metrics::record_cache_change("watch", "delete", 1);
                }
                removed
            }
        }
    }

    /// Replace the cache with the durable store's current contents
    pub async fn full_sync(&self, now: DateTime<Utc>) -> StoreResult<SyncStats> {
        let entries = self.store.list(&self.prefix).await?;

        let mut fresh: Cache = HashMap::new();
        for (durable_key, value) in entries {
            if let Some((key, slave, job)) = self.decode(&durable_key, &value) {
                if !self.is_stale(&job, now) {
                    fresh.entry(key).or_default().insert(slave, job);
                }
            }
        }

        let mut cache = self.lock_cache();
        let mut stats = SyncStats::default();
        for (key, reports) in &fresh {
            for (slave, job) in reports {
                match cache.get(key).and_then(|old| old.get(slave)) {
                    None => stats.added += 1,
                    Some(old) if old != job => stats.updated += 1,
                    Some(_) => {}
                }
            }
        }
        for (key, reports) in cache.iter() {
            stats.removed += reports
                .keys()
                .filter(|slave| !fresh.get(key).is_some_and(|r| r.contains_key(*slave)))
                .count();
        }
        *cache = fresh;
        metrics::set_cache_entries(Self::count(&cache));
        drop(cache);

        metrics::record_cache_change("sync", "put", stats.added + stats.updated);
        metrics::record_cache_change("sync", "delete", stats.removed);
        Ok(stats)
    }

    /// Drop cached reports whose `finishedAt` is past the expiry window
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut cache = self.lock_cache();
        let mut swept = 0;
        cache.retain(|_, reports| {
            let before = reports.len();
            reports.retain(|_, job| !self.is_stale(job, now));
            swept += before - reports.len();
            !reports.is_empty()
        });
        metrics::set_cache_entries(Self::count(&cache));
        drop(cache);

        if swept > 0 {
            metrics::record_cache_change("sweep", "delete", swept);
        }
        swept
    }

    fn count(cache: &Cache) -> usize {
        cache.values().map(BTreeMap::len).sum()
    }

    /// Number of cached `(job, slave)` reports
    pub fn len(&self) -> usize {
        Self::count(&self.lock_cache())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached reports per job key, sorted by key then slave
    pub fn snapshot(&self) -> Vec<(JobKey, Vec<Job>)> {
        let cache = self.lock_cache();
        let mut snapshot: Vec<(JobKey, Vec<Job>)> = cache
            .iter()
            .map(|(key, reports)| (key.clone(), reports.values().cloned().collect()))
            .collect();
        drop(cache);
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    /// Like [`JobStore::snapshot`], leaving out reports expired by `now`
    pub fn live_snapshot(&self, now: DateTime<Utc>) -> Vec<(JobKey, Vec<Job>)> {
        self.snapshot()
            .into_iter()
            .filter_map(|(key, reports)| {
                let live: Vec<Job> = reports.into_iter().filter(|job| !self.is_stale(job, now)).collect();
                (!live.is_empty()).then_some((key, live))
            })
            .collect()
    }

    /// Cached reports for one job, sorted by slave
    pub fn reports_for(&self, key: &JobKey) -> Vec<Job> {
        self.lock_cache()
            .get(key)
            .map(|reports| reports.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Reports for one job not yet expired by `now`
    pub fn live_reports_for(&self, key: &JobKey, now: DateTime<Utc>) -> Vec<Job> {
        self.reports_for(key)
            .into_iter()
            .filter(|job| !self.is_stale(job, now))
            .collect()
    }

    /// Cached `(job, slave)` pairs, sorted
    pub fn entries(&self) -> Vec<(JobKey, String)> {
        let cache = self.lock_cache();
        let mut entries: Vec<(JobKey, String)> = cache
            .iter()
            .flat_map(|(key, reports)| reports.keys().map(move |slave| (key.clone(), slave.clone())))
            .collect();
        drop(cache);
        entries.sort();
        entries
    }

    // ========================================================================
    // Background loops
    // ========================================================================

    /// Watch-apply loop; a failed or ended watch is re-established after a
    /// full sync
    pub async fn run_watch(self: Arc<Self>, cancel: CancellationToken) {
        let retry = Duration::from_secs(self.config.watch_retry_secs);

        loop {
            match self.store.watch(&self.prefix).await {
                Ok(mut stream) => {
                    // Sync after the watch is live so nothing falls in between
                    match self.full_sync(Utc::now()).await {
                        Ok(stats) => {
                            self.set_healthy(true);
                            info!(
                                added = stats.added,
                                updated = stats.updated,
                                removed = stats.removed,
                                "Job store watch established"
                            );
                        }
                        Err(e) => {
                            self.set_healthy(false);
                            warn!(error = %e, "Full sync after watch start failed");
                        }
                    }

                    loop {
                        let item = tokio::select! {
                            _ = cancel.cancelled() => return,
                            item = stream.next() => item,
                        };
                        match item {
                            Some(Ok(event)) => {
                                self.apply_event(event, Utc::now());
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "Job store watch failed, restarting");
                                break;
                            }
                            None => {
                                warn!("Job store watch closed, restarting");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    self.set_healthy(false);
                    warn!(store = self.store.name(), error = %e, "Could not establish job store watch");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(retry) => {}
            }
        }
    }

    /// Periodic full sync; returns when `cancel` fires
    pub async fn run_sync(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.full_sync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match self.full_sync(Utc::now()).await {
                    Ok(stats) => {
                        self.set_healthy(true);
                        if !stats.is_noop() {
                            info!(
                                added = stats.added,
                                updated = stats.updated,
                                removed = stats.removed,
                                "Full sync reconciled missed changes"
                            );
                        }
                    }
                    Err(e) => {
                        self.set_healthy(false);
                        warn!(error = %e, "Full sync failed");
                    }
                },
            }
        }
    }

    /// Periodic expiry sweep; returns when `cancel` fires
    pub async fn run_sweep(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let swept = self.sweep_expired(Utc::now());
                    if swept > 0 {
                        debug!(swept, "Expired reports swept from cache");
                    }
                }
            }
        }
    }

    /// Run watch, sync and sweep loops until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(store = self.store.name(), prefix = %self.prefix, "Job store started");
        tokio::join!(
            self.clone().run_watch(cancel.child_token()),
            self.clone().run_sync(cancel.child_token()),
            self.clone().run_sweep(cancel.child_token()),
        );
        info!("Job store stopped");
    }
}
