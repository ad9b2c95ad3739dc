//! Master-side job pool and distributor
//!
//! The pool is the single source of truth for which checks exist. It maps
//! registration leaves of one coordination sub-tree to [`Job`]s and fans
//! every change out to the slaves subscribed to the job's zone.
//!
//! ```text
//!  TreeWatcher ──▶ JobPool (LeafHandler) ──▶ EventQueue ──▶ fan-out task
//!                        │                                   │   │   │
//!                   list_jobs(zones)                         ▼   ▼   ▼
//!                                                     per-subscriber channels
//! ```
//!
//! Each subscriber owns a bounded channel. A subscriber that cannot keep up
//! is disconnected rather than allowed to stall the others; its stream ends
//! and the slave resyncs through `list_jobs`. When the fan-out task is
//! cancelled the pool closes and every subscriber stream ends.

pub mod queue;

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordination::{base_name, join_path, LeafHandler};
use crate::metrics;
use crate::models::{Job, JobAction, JobKey, Protocol, RegistrationEntry, SlaveInfo, Zone};

pub use queue::{EventQueue, OverflowPolicy, PushOutcome};

/// Job pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobPoolConfig {
    /// Zone for entries without a cluster tag
    pub default_zone: String,
    /// Path probed on HTTP endpoints
    pub check_path: String,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Per-subscriber buffer before the subscriber is disconnected
    pub subscriber_buffer: usize,
}

impl Default for JobPoolConfig {
    fn default() -> Self {
        Self {
            default_zone: "default".to_string(),
            check_path: "/healthz".to_string(),
            queue_capacity: 1024,
            overflow: OverflowPolicy::DropOldest,
            subscriber_buffer: 1024,
        }
    }
}

struct Subscriber {
    generation: u64,
    zones: Vec<Zone>,
    tx: mpsc::Sender<Job>,
}

/// Registry of jobs plus subscriber fan-out
pub struct JobPool {
    config: JobPoolConfig,
    /// Leaf path → job derived from it
    jobs: Mutex<HashMap<String, Job>>,
    subscribers: Mutex<HashMap<String, Subscriber>>,
    queue: EventQueue<Job>,
    generations: AtomicU64,
    /// Set on shutdown; later subscriptions end immediately
    closed: AtomicBool,
}

impl JobPool {
    pub fn new(config: JobPoolConfig) -> Self {
        let queue = EventQueue::new(config.queue_capacity, config.overflow);
        Self {
            config,
            jobs: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            queue,
            generations: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, HashMap<String, Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Derive the job for a registration entry under `branch`
    pub fn job_for(&self, branch: &str, entry: &RegistrationEntry) -> Job {
        let zone = if entry.cluster_tag.is_empty() {
            Zone::new(&self.config.default_zone)
        } else {
            Zone::new(&entry.cluster_tag)
        };

        let scheme = entry.scheme.to_ascii_lowercase();
        let (protocol, url) = if scheme == "http" || scheme == "https" {
            let path = if self.config.check_path.starts_with('/') {
                self.config.check_path.clone()
            } else {
                format!("/{}", self.config.check_path)
            };
            (Protocol::Http, format!("{scheme}://{}:{}{path}", entry.ip, entry.port))
        } else {
            (Protocol::Tcp, format!("{}:{}", entry.ip, entry.port))
        };

        Job::new(base_name(branch), zone, protocol, url)
    }

    // ------------------------------------------------------------------------
    // Subscribers
    // ------------------------------------------------------------------------

    /// Register a sink for jobs in `zones`, replacing any sink with the same id
    pub fn add_subscriber(&self, id: impl Into<String>, zones: Vec<Zone>, tx: mpsc::Sender<Job>) -> u64 {
        let id = id.into();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.lock_subscribers();
        if self.closed.load(Ordering::Acquire) {
            debug!(subscriber = %id, "Pool closed, subscription not registered");
            return generation;
        }
        if subscribers
            .insert(id.clone(), Subscriber { generation, zones, tx })
            .is_some()
        {
            debug!(subscriber = %id, "Replaced existing subscription");
        }
        info!(subscriber = %id, total = subscribers.len(), "Subscriber added");
        metrics::update_pool_metrics(self.job_count(), subscribers.len());
        generation
    }

    pub fn remove_subscriber(&self, id: &str) -> bool {
        self.remove_subscriber_if(id, None)
    }

    fn remove_subscriber_if(&self, id: &str, generation: Option<u64>) -> bool {
        let mut subscribers = self.lock_subscribers();
        let matches = subscribers
            .get(id)
            .is_some_and(|s| generation.map_or(true, |g| g == s.generation));
        if matches {
            subscribers.remove(id);
            info!(subscriber = %id, total = subscribers.len(), "Subscriber removed");
            metrics::update_pool_metrics(self.job_count(), subscribers.len());
        }
        matches
    }

    /// Subscribe a slave; the subscription unregisters itself when dropped
    pub fn subscribe(self: &Arc<Self>, slave: &SlaveInfo) -> Subscription {
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer.max(1));
        let id = slave.subscriber_id();
        let generation = self.add_subscriber(id.clone(), slave.zones.clone(), tx);
        Subscription {
            id,
            generation,
            rx,
            pool: Arc::clone(self),
        }
    }

    /// Drop every subscriber sender so each open stream ends
    pub fn close_all(&self) {
        let mut subscribers = self.lock_subscribers();
        self.closed.store(true, Ordering::Release);
        let closed = subscribers.len();
        subscribers.clear();
        info!(closed, "Job pool closed");
        metrics::update_pool_metrics(self.job_count(), 0);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    pub fn subscriber_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_subscribers().keys().cloned().collect();
        ids.sort();
        ids
    }

    // ------------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------------

    /// Snapshot of the jobs matching `zones`, one per job key
    pub fn list_jobs(&self, zones: &[Zone]) -> Vec<Job> {
        let jobs = self.lock_jobs();
        let unique: BTreeMap<JobKey, Job> = jobs
            .values()
            .filter(|job| job.zone.covered_by(zones))
            .map(|job| (job.key(), job.with_action(JobAction::Add)))
            .collect();
        unique.into_values().collect()
    }

    /// Number of distinct job keys
    pub fn job_count(&self) -> usize {
        let jobs = self.lock_jobs();
        let mut keys: Vec<JobKey> = jobs.values().map(Job::key).collect();
        keys.sort();
        keys.dedup();
        keys.len()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    async fn enqueue(&self, job: Job) {
        debug!(job = %job.key(), action = ?job.action, "Job event queued");
        if let PushOutcome::Dropped(shed) = self.queue.push(job).await {
            warn!(
                job = %shed.key(),
                policy = self.queue.policy().as_str(),
                "Job event queue full, event shed"
            );
            metrics::record_queue_drop(self.queue.policy().as_str());
        }
    }

    /// Whether another leaf still maps to `key`
    fn key_in_use(jobs: &HashMap<String, Job>, key: &JobKey) -> bool {
        jobs.values().any(|job| &job.key() == key)
    }

    async fn upsert(&self, path: String, job: Job) {
        let events = {
            let mut jobs = self.lock_jobs();
            let previous = jobs.insert(path, job.clone());
            match previous {
                None => vec![job.with_action(JobAction::Add)],
                Some(old) if old.key() != job.key() => {
                    let mut events = Vec::with_capacity(2);
                    if !Self::key_in_use(&jobs, &old.key()) {
                        events.push(old.with_action(JobAction::Delete));
                    }
                    events.push(job.with_action(JobAction::Add));
                    events
                }
                Some(old) if old != job => vec![job.with_action(JobAction::Update)],
                Some(_) => Vec::new(),
            }
        };
        for event in events {
            self.enqueue(event).await;
        }
        metrics::update_pool_metrics(self.job_count(), self.subscriber_count());
    }

    async fn remove(&self, path: &str) {
        let event = {
            let mut jobs = self.lock_jobs();
            jobs.remove(path)
                .filter(|old| !Self::key_in_use(&jobs, &old.key()))
                .map(|old| old.with_action(JobAction::Delete))
        };
        if let Some(event) = event {
            self.enqueue(event).await;
        }
        metrics::update_pool_metrics(self.job_count(), self.subscriber_count());
    }

    // ------------------------------------------------------------------------
    // Fan-out
    // ------------------------------------------------------------------------

    /// Push one job event to every matching subscriber
    fn deliver(&self, job: &Job) {
        let mut subscribers = self.lock_subscribers();
        let mut dropped = Vec::new();

        for (id, subscriber) in subscribers.iter() {
            if !job.zone.covered_by(&subscriber.zones) {
                continue;
            }
            match subscriber.tx.try_send(job.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = %id, "Subscriber too slow, disconnecting");
                    dropped.push(id.clone());
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscriber = %id, "Subscriber channel closed");
                    dropped.push(id.clone());
                }
            }
        }

        for id in &dropped {
            subscribers.remove(id);
        }
        if !dropped.is_empty() {
            metrics::update_pool_metrics(self.job_count(), subscribers.len());
        }
    }

    /// Fan-out loop draining the event queue; returns when `cancel` fires
    pub async fn run_fanout(self: Arc<Self>, cancel: CancellationToken) {
        info!("Job fan-out started");
        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => break,
                job = self.queue.pop() => job,
            };
            self.deliver(&job);
        }
        self.close_all();
        info!("Job fan-out stopped");
    }
}

#[async_trait]
impl LeafHandler for JobPool {
    async fn on_add_leaf(&self, branch: &str, leaf: &str, value: &[u8]) {
        match RegistrationEntry::from_bytes(value) {
            Ok(entry) => self.upsert(join_path(branch, leaf), self.job_for(branch, &entry)).await,
            Err(e) => warn!(branch = %branch, leaf = %leaf, error = %e, "Dropping malformed registration entry"),
        }
    }

    async fn on_update_leaf(&self, branch: &str, leaf: &str, _old: &[u8], new: &[u8]) {
        match RegistrationEntry::from_bytes(new) {
            Ok(entry) => self.upsert(join_path(branch, leaf), self.job_for(branch, &entry)).await,
            Err(e) => warn!(branch = %branch, leaf = %leaf, error = %e, "Ignoring malformed registration update"),
        }
    }

    async fn on_delete_leaf(&self, branch: &str, leaf: &str, _value: &[u8]) {
        self.remove(&join_path(branch, leaf)).await;
    }
}

/// Live job event stream of one subscriber
pub struct Subscription {
    id: String,
    generation: u64,
    rx: mpsc::Receiver<Job>,
    pool: Arc<JobPool>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn recv(&mut self) -> Option<Job> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = Job;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Job>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.pool.remove_subscriber_if(&self.id, Some(self.generation));
    }
}
