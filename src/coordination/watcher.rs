//! Recursive coordination-tree watcher
//!
//! One supervised task per branch lists children, arms a watch, diffs the
//! leaf set against the last observed state and blocks on the watch. Leaves
//! are children whose name matches [`WatcherConfig::leaf_pattern`]; every
//! other child is a branch and gets its own task.
//!
//! State mutations and the events they produce are ordered by a single
//! lock and delivered to the [`LeafHandler`] by one dispatcher task, so a
//! handler never observes a delete before the add it cancels.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{is_within, join_path, parent_path, CoordError, CoordResult, CoordinationStore, LeafHandler, WatchEvent};

/// Default leaf naming convention: `host:port`
pub const DEFAULT_LEAF_PATTERN: &str = r"^[^/:]+:\d+$";

static DEFAULT_LEAF_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(DEFAULT_LEAF_PATTERN).unwrap());

/// Tree watcher settings
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Fixed delay before retrying a failed list/watch
    pub retry_delay: Duration,

    /// Child names matching this pattern are leaves
    pub leaf_pattern: Regex,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(2),
            leaf_pattern: DEFAULT_LEAF_REGEX.clone(),
        }
    }
}

impl WatcherConfig {
    /// Create a config with a custom leaf pattern
    pub fn new(retry_delay: Duration, leaf_pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            retry_delay,
            leaf_pattern: Regex::new(leaf_pattern)?,
        })
    }

    pub fn is_leaf(&self, name: &str) -> bool {
        self.leaf_pattern.is_match(name)
    }
}

// ============================================================================
// Branch Registry
// ============================================================================

struct BranchTask {
    id: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Arena of `branch → task handle` for every watched branch
#[derive(Clone, Default)]
pub struct BranchRegistry {
    tasks: Arc<Mutex<HashMap<String, BranchTask>>>,
    next_id: Arc<AtomicU64>,
}

impl BranchRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, BranchTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Watched branch paths, sorted
    pub fn branches(&self) -> Vec<String> {
        let mut branches: Vec<String> = self.lock().keys().cloned().collect();
        branches.sort();
        branches
    }

    pub fn contains(&self, branch: &str) -> bool {
        self.lock().contains_key(branch)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of registered tasks that are still running
    pub fn running(&self) -> usize {
        self.lock().values().filter(|t| !t.handle.is_finished()).count()
    }

    /// Register and spawn a task for `branch` unless one is already tracked
    fn spawn_if_absent<F>(&self, branch: &str, token: CancellationToken, spawn: F) -> bool
    where
        F: FnOnce(u64, CancellationToken) -> JoinHandle<()>,
    {
        let mut tasks = self.lock();
        if tasks.contains_key(branch) {
            return false;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = spawn(id, token.clone());
        tasks.insert(branch.to_string(), BranchTask { id, token, handle });
        true
    }

    /// Remove the entry for `branch` if it still belongs to task `id`
    fn remove_if(&self, branch: &str, id: u64) {
        let mut tasks = self.lock();
        if tasks.get(branch).is_some_and(|t| t.id == id) {
            tasks.remove(branch);
        }
    }

    /// Cancel and forget every task at or below `root`
    fn cancel_within(&self, root: &str, include_root: bool) -> usize {
        let mut tasks = self.lock();
        let doomed: Vec<String> = tasks
            .keys()
            .filter(|b| is_within(b, root) && (include_root || b.as_str() != root))
            .cloned()
            .collect();
        for branch in &doomed {
            if let Some(task) = tasks.remove(branch) {
                task.token.cancel();
            }
        }
        doomed.len()
    }

    fn cancel_all(&self) {
        for (_, task) in self.lock().drain() {
            task.token.cancel();
        }
    }
}

// ============================================================================
// Tree Watcher
// ============================================================================

/// Normalized leaf change
#[derive(Debug, Clone, PartialEq, Eq)]
enum LeafEvent {
    Add { branch: String, leaf: String, value: Vec<u8> },
    Update { branch: String, leaf: String, old: Vec<u8>, new: Vec<u8> },
    Delete { branch: String, leaf: String, value: Vec<u8> },
}

/// `branch → {leaf → last value}`
type LeafState = HashMap<String, HashMap<String, Vec<u8>>>;

struct WatcherInner {
    store: Arc<dyn CoordinationStore>,
    config: WatcherConfig,
    root: String,
    state: Mutex<LeafState>,
    registry: BranchRegistry,
    events: mpsc::UnboundedSender<LeafEvent>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<LeafEvent>>>,
    handler: Arc<dyn LeafHandler>,
    cancel: CancellationToken,
    healthy: AtomicBool,
}

/// Live recursive watch over one coordination sub-tree
#[derive(Clone)]
pub struct TreeWatcher {
    inner: Arc<WatcherInner>,
}

impl TreeWatcher {
    /// Create a watcher for the sub-tree at `root`
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        root: impl Into<String>,
        handler: Arc<dyn LeafHandler>,
        config: WatcherConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(WatcherInner {
                store,
                config,
                root: root.into(),
                state: Mutex::new(HashMap::new()),
                registry: BranchRegistry::default(),
                events,
                pending: Mutex::new(Some(rx)),
                handler,
                cancel,
                healthy: AtomicBool::new(true),
            }),
        }
    }

    /// Start the dispatcher and the root branch task
    pub fn start(&self) {
        let rx = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(rx) = rx else {
            warn!(root = %self.inner.root, "Tree watcher already started");
            return;
        };

        tokio::spawn(dispatch(self.inner.handler.clone(), rx, self.inner.cancel.clone()));
        self.ensure_branch(&self.inner.root);
        info!(root = %self.inner.root, "Tree watcher started");
    }

    /// Cancel every branch task and the dispatcher
    pub fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner.registry.cancel_all();
        info!(root = %self.inner.root, "Tree watcher stopped");
    }

    pub fn root(&self) -> &str {
        &self.inner.root
    }

    /// Branch task arena
    pub fn registry(&self) -> &BranchRegistry {
        &self.inner.registry
    }

    /// False while list/watch calls are failing
    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::Relaxed)
    }

    /// Current leaf state as `full leaf path → value`
    pub fn leaves(&self) -> BTreeMap<String, Vec<u8>> {
        self.lock_state()
            .iter()
            .flat_map(|(branch, leaves)| {
                leaves
                    .iter()
                    .map(move |(leaf, value)| (join_path(branch, leaf), value.clone()))
            })
            .collect()
    }

    fn lock_state(&self) -> MutexGuard<'_, LeafState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_branch(&self, branch: &str) {
        let this = self.clone();
        let path = branch.to_string();
        let spawned = self.inner.registry.spawn_if_absent(
            branch,
            self.inner.cancel.child_token(),
            move |id, token| tokio::spawn(this.watch_branch(path, id, token)),
        );
        if spawned {
            debug!(branch = %branch, "Branch watch spawned");
        }
    }

    async fn watch_branch(self, branch: String, id: u64, token: CancellationToken) {
        let is_root = branch == self.inner.root;

        loop {
            if token.is_cancelled() {
                break;
            }

            let listed = self.inner.store.children_watch(&branch).await;
            let (children, watch) = match listed {
                Ok(pair) => {
                    self.inner.healthy.store(true, Ordering::Relaxed);
                    pair
                }
                Err(CoordError::NoNode(_)) if is_root => {
                    self.purge(&branch, &token);
                    if !self.pause(&token).await {
                        break;
                    }
                    continue;
                }
                Err(CoordError::NoNode(_)) => {
                    debug!(branch = %branch, "Branch removed");
                    self.purge(&branch, &token);
                    break;
                }
                Err(e) => {
                    warn!(branch = %branch, error = %e, "Failed to list children, retrying");
                    self.inner.healthy.store(false, Ordering::Relaxed);
                    if !self.pause(&token).await {
                        break;
                    }
                    continue;
                }
            };

            if let Err(e) = self.reconcile(&branch, children, &token).await {
                warn!(branch = %branch, error = %e, "Failed to read leaves, retrying");
                if !self.pause(&token).await {
                    break;
                }
                continue;
            }

            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = watch => event,
            };

            match event {
                WatchEvent::ChildrenChanged => {}
                WatchEvent::NodeDeleted => {
                    // Re-listing decides whether the branch is gone or recreated
                    self.purge(&branch, &token);
                }
                WatchEvent::Disconnected => {
                    debug!(branch = %branch, "Watch disconnected, re-listing");
                }
            }
        }

        self.inner.registry.remove_if(&branch, id);

        // The node may have been recreated after our last listing
        if !token.is_cancelled() && self.inner.store.get(&branch).await.is_ok() {
            self.ensure_branch(&branch);
        }
    }

    /// Sleep the retry delay; false if cancelled meanwhile
    async fn pause(&self, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(self.inner.config.retry_delay) => true,
        }
    }

    /// Diff the listed children of `branch` against the tracked state
    async fn reconcile(&self, branch: &str, children: Vec<String>, token: &CancellationToken) -> CoordResult<()> {
        let mut current = HashMap::new();
        let mut sub_branches = HashSet::new();

        for child in children {
            let path = join_path(branch, &child);
            if self.inner.config.is_leaf(&child) {
                match self.inner.store.get(&path).await {
                    Ok(value) => {
                        current.insert(child, value);
                    }
                    // Vanished between listing and reading
                    Err(CoordError::NoNode(_)) => {}
                    Err(e) => return Err(e),
                }
            } else {
                sub_branches.insert(path);
            }
        }

        {
            let mut state = self.lock_state();
            if token.is_cancelled() {
                return Ok(());
            }
            let previous = state.remove(branch).unwrap_or_default();

            for (leaf, value) in &current {
                match previous.get(leaf) {
                    None => self.emit(LeafEvent::Add {
                        branch: branch.to_string(),
                        leaf: leaf.clone(),
                        value: value.clone(),
                    }),
                    Some(old) if old != value => self.emit(LeafEvent::Update {
                        branch: branch.to_string(),
                        leaf: leaf.clone(),
                        old: old.clone(),
                        new: value.clone(),
                    }),
                    Some(_) => {}
                }
            }
            for (leaf, value) in previous {
                if !current.contains_key(&leaf) {
                    self.emit(LeafEvent::Delete {
                        branch: branch.to_string(),
                        leaf,
                        value,
                    });
                }
            }

            if !current.is_empty() {
                state.insert(branch.to_string(), current);
            }
        }

        // Sub-branches that disappeared without a NodeDeleted reaching them
        let stale: Vec<String> = self
            .inner
            .registry
            .branches()
            .into_iter()
            .filter(|b| parent_path(b) == Some(branch) && !sub_branches.contains(b))
            .collect();
        for gone in stale {
            self.inner.registry.cancel_within(&gone, true);
            self.purge(&gone, token);
        }

        for sub in &sub_branches {
            self.ensure_branch(sub);
        }
        Ok(())
    }

    /// Forget `branch` and everything below it, synthesizing deletes for
    /// every leaf that was tracked there
    fn purge(&self, branch: &str, token: &CancellationToken) {
        let cancelled = self.inner.registry.cancel_within(branch, false);

        let mut state = self.lock_state();
        let doomed: Vec<String> = state.keys().filter(|b| is_within(b, branch)).cloned().collect();
        for b in doomed {
            if let Some(leaves) = state.remove(&b) {
                for (leaf, value) in leaves {
                    self.emit(LeafEvent::Delete {
                        branch: b.clone(),
                        leaf,
                        value,
                    });
                }
            }
        }
        drop(state);

        if cancelled > 0 && !token.is_cancelled() {
            debug!(branch = %branch, cancelled, "Cancelled sub-branch watches");
        }
    }

    fn emit(&self, event: LeafEvent) {
        // The receiver only goes away after cancellation
        let _ = self.inner.events.send(event);
    }
}

/// Deliver leaf events to the handler in the order they were produced
async fn dispatch(
    handler: Arc<dyn LeafHandler>,
    mut rx: mpsc::UnboundedReceiver<LeafEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => event,
        };
        let Some(event) = event else { break };

        match event {
            LeafEvent::Add { branch, leaf, value } => handler.on_add_leaf(&branch, &leaf, &value).await,
            LeafEvent::Update { branch, leaf, old, new } => {
                handler.on_update_leaf(&branch, &leaf, &old, &new).await
            }
            LeafEvent::Delete { branch, leaf, value } => {
                handler.on_delete_leaf(&branch, &leaf, &value).await
            }
        }
    }
}
