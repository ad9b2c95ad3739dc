//! Durable job-status storage
//!
//! Slaves' probe reports are written to an external watch-capable key/value
//! store with per-key TTL, then mirrored into an in-memory cache that the
//! policy center evaluates.
//!
//! # Architecture
//!
//! ```text
//!  report ──▶ DurableStore.put(key, job, ttl)
//!                   │
//!                   ├── watch stream ──▶ JobStore.apply_event ─┐
//!                   └── periodic list ──▶ JobStore.full_sync ──┼──▶ cache (one lock)
//!                                         JobStore.sweep ──────┘
//! ```
//!
//! Key layout: `{root}/jobs/{zone}/{PROTOCOL-url}/{slave}` with every
//! segment percent-encoded.

pub mod job_store;
pub mod memory;
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

pub use job_store::{JobStore, JobStoreConfig, SyncStats};
pub use memory::MemoryDurableStore;
pub use redis_store::{RedisDurableStore, RedisStoreConfig};

/// Result type for durable store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a durable store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transport failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Redis command failed
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Connection pool could not hand out a connection
    #[error("pool error: {0}")]
    Pool(String),

    /// The watch lost events and must be restarted from scratch
    #[error("watch invalidated, restart required")]
    WatchInvalidated,

    /// A stored value could not be decoded
    #[error("codec error: {0}")]
    Codec(String),
}

impl StoreError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Codec(_))
    }
}

/// Change observed by a store watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl StoreEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Stream of watch events; an `Err` item ends the watch
pub type WatchStream = BoxStream<'static, StoreResult<StoreEvent>>;

/// Watch-capable key/value store with per-key expiry
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Store name used in logs
    fn name(&self) -> &str;

    /// Write `value` under `key`, expiring after `ttl`
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<()>;

    /// Every live key/value under `prefix`
    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Watch changes under `prefix` from now on
    async fn watch(&self, prefix: &str) -> StoreResult<WatchStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_recoverable() {
        assert!(StoreError::WatchInvalidated.is_recoverable());
        assert!(StoreError::Connection("reset".into()).is_recoverable());
        assert!(!StoreError::Codec("bad".into()).is_recoverable());
    }

    #[test]
    fn test_event_key() {
        let put = StoreEvent::Put {
            key: "a".into(),
            value: vec![],
        };
        assert_eq!(put.key(), "a");
        assert_eq!(StoreEvent::Delete { key: "b".into() }.key(), "b");
    }
}
