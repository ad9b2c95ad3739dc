//! In-memory durable store with per-key expiry
//!
//! Expired keys are invisible to `list` and are removed (with a Delete
//! event) by [`MemoryDurableStore::purge_expired`], mirroring lease expiry
//! in an external store.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{DurableStore, StoreError, StoreEvent, StoreResult, WatchStream};

const WATCH_BUFFER: usize = 1024;

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Durable store held in process memory
pub struct MemoryDurableStore {
    entries: Mutex<BTreeMap<String, Entry>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::with_watch_buffer(WATCH_BUFFER)
    }

    /// Watchers falling more than `buffer` events behind are invalidated
    pub fn with_watch_buffer(buffer: usize) -> Self {
        let (events, _) = broadcast::channel(buffer.max(1));
        Self {
            entries: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: StoreEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Write without notifying watchers
    pub fn put_silently(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        self.lock().insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Remove without notifying watchers
    pub fn delete_silently(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Live keys under `prefix`
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        self.lock()
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.expires_at > now)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Drop expired keys, publishing a Delete for each
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = {
            let mut entries = self.lock();
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.expires_at <= now)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &expired {
                entries.remove(key);
            }
            expired
        };
        for key in &expired {
            self.publish(StoreEvent::Delete { key: key.clone() });
        }
        expired.len()
    }

    /// Periodically purge expired keys until cancelled
    pub async fn run_reaper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let purged = self.purge_expired();
                    if purged > 0 {
                        debug!(purged, "Expired durable keys purged");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<()> {
        self.put_silently(key, value.clone(), ttl);
        self.publish(StoreEvent::Put {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let now = Instant::now();
        Ok(self
            .lock()
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.expires_at > now)
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        if self.lock().remove(key).is_some() {
            self.publish(StoreEvent::Delete { key: key.to_string() });
        }
        Ok(())
    }

    async fn watch(&self, prefix: &str) -> StoreResult<WatchStream> {
        let rx = self.events.subscribe();
        let prefix = prefix.to_string();

        let stream = futures::stream::unfold(Some(rx), move |state| {
            let prefix = prefix.clone();
            async move {
                let mut rx = state?;
                loop {
                    match rx.recv().await {
                        Ok(event) if event.key().starts_with(prefix.as_str()) => {
                            return Some((Ok(event), Some(rx)))
                        }
                        Ok(_) => continue,
                        // Events were lost: surface once, then end the stream
                        Err(RecvError::Lagged(_)) => return Some((Err(StoreError::WatchInvalidated), None)),
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
