//! In-memory coordination store
//!
//! Backs the master when no external coordination service is configured and
//! drives the watcher tests. Semantics follow the one-shot watch model:
//! every armed watch fires at most once, on the first change after arming.
//! Data changes of a child are reported to the parent's children watch.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::oneshot;

use super::{is_within, parent_path, validate_path, CoordError, CoordResult, CoordinationStore, Watch, WatchEvent};

#[derive(Default)]
struct Inner {
    /// Every existing node path → data
    nodes: BTreeMap<String, Vec<u8>>,
    /// Armed watches per watched path
    watches: HashMap<String, Vec<oneshot::Sender<WatchEvent>>>,
    /// Simulated session state
    disconnected: bool,
}

impl Inner {
    fn fire(&mut self, path: &str, event: WatchEvent) {
        if let Some(senders) = self.watches.remove(path) {
            for tx in senders {
                let _ = tx.send(event);
            }
        }
    }

    fn fire_all(&mut self, event: WatchEvent) {
        for (_, senders) in self.watches.drain() {
            for tx in senders {
                let _ = tx.send(event);
            }
        }
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" { "/".to_string() } else { format!("{path}/") };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }
}

/// Coordination store held entirely in process memory
pub struct MemoryCoordinationStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinationStore {
    /// Create a store containing only the root node
    pub fn new() -> Self {
        let mut inner = Inner::default();
        inner.nodes.insert("/".to_string(), Vec::new());
        Self {
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the simulated session: all watches fire `Disconnected` and every
    /// call fails until [`reconnect`](Self::reconnect)
    pub fn disconnect(&self) {
        let mut inner = self.lock();
        inner.disconnected = true;
        inner.fire_all(WatchEvent::Disconnected);
    }

    /// Restore the simulated session
    pub fn reconnect(&self) {
        self.lock().disconnected = false;
    }

    /// Mutate the tree without firing any watch, simulating changes that
    /// happen while a watcher is between cycles
    pub fn set_silently(&self, path: &str, data: Vec<u8>) -> CoordResult<()> {
        validate_path(path)?;
        let mut inner = self.lock();
        create_parents(&mut inner, path, false);
        inner.nodes.insert(path.to_string(), data);
        Ok(())
    }

    /// Paths and data of every node below `root`, excluding `root` itself
    pub fn snapshot(&self, root: &str) -> BTreeMap<String, Vec<u8>> {
        self.lock()
            .nodes
            .iter()
            .filter(|(k, _)| k.as_str() != root && is_within(k, root))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn ensure_connected(inner: &Inner) -> CoordResult<()> {
        if inner.disconnected {
            return Err(CoordError::Connection("session disconnected".to_string()));
        }
        Ok(())
    }
}

/// Create every missing ancestor of `path`, optionally firing parent watches
fn create_parents(inner: &mut Inner, path: &str, notify: bool) {
    let mut missing = Vec::new();
    let mut cursor = parent_path(path);
    while let Some(p) = cursor {
        if inner.nodes.contains_key(p) {
            break;
        }
        missing.push(p.to_string());
        cursor = parent_path(p);
    }
    for p in missing.into_iter().rev() {
        inner.nodes.insert(p.clone(), Vec::new());
        if notify {
            if let Some(parent) = parent_path(&p) {
                inner.fire(parent, WatchEvent::ChildrenChanged);
            }
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn children_watch(&self, path: &str) -> CoordResult<(Vec<String>, Watch)> {
        validate_path(path)?;
        let mut inner = self.lock();
        Self::ensure_connected(&inner)?;
        if !inner.nodes.contains_key(path) {
            return Err(CoordError::NoNode(path.to_string()));
        }

        let children = inner.children(path);
        let (tx, rx) = oneshot::channel();
        inner.watches.entry(path.to_string()).or_default().push(tx);

        let watch = rx.map(|res| res.unwrap_or(WatchEvent::Disconnected)).boxed();
        Ok((children, watch))
    }

    async fn get(&self, path: &str) -> CoordResult<Vec<u8>> {
        validate_path(path)?;
        let inner = self.lock();
        Self::ensure_connected(&inner)?;
        inner
            .nodes
            .get(path)
            .cloned()
            .ok_or_else(|| CoordError::NoNode(path.to_string()))
    }

    async fn set(&self, path: &str, data: Vec<u8>) -> CoordResult<()> {
        validate_path(path)?;
        if path == "/" {
            return Err(CoordError::InvalidPath(path.to_string()));
        }
        let mut inner = self.lock();
        Self::ensure_connected(&inner)?;
        create_parents(&mut inner, path, true);

        let changed = inner.nodes.get(path) != Some(&data);
        inner.nodes.insert(path.to_string(), data);
        if changed {
            if let Some(parent) = parent_path(path) {
                inner.fire(parent, WatchEvent::ChildrenChanged);
            }
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> CoordResult<()> {
        validate_path(path)?;
        let mut inner = self.lock();
        Self::ensure_connected(&inner)?;
        if path == "/" || !inner.nodes.contains_key(path) {
            return Err(CoordError::NoNode(path.to_string()));
        }

        let doomed: Vec<String> = inner
            .nodes
            .keys()
            .filter(|k| is_within(k, path))
            .cloned()
            .collect();
        for node in &doomed {
            inner.nodes.remove(node);
            inner.fire(node, WatchEvent::NodeDeleted);
        }
        if let Some(parent) = parent_path(path) {
            inner.fire(parent, WatchEvent::ChildrenChanged);
        }
        Ok(())
    }
}
