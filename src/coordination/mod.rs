//! Coordination store access and recursive sub-tree watching
//!
//! The coordination store is an external hierarchical namespace with
//! children-listing and one-shot change notifications (ZooKeeper-like).
//! This module defines the contract the rest of the crate relies on, an
//! in-memory implementation, a Redis-backed tree shared between processes,
//! and the [`TreeWatcher`] that turns raw child lists into leaf
//! add/update/delete callbacks.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐   children + watch   ┌──────────────────────┐
//! │  CoordinationStore   │ ───────────────────▶ │     TreeWatcher      │
//! │  (memory / redis)    │                      │  branch → task arena │
//! └──────────────────────┘                      │  branch → leaf state │
//!                                               └──────────┬───────────┘
//!                                                          │ LeafHandler
//!                                      ┌───────────────────┴──────────┐
//!                                      ▼                              ▼
//!                             EndpointClassifier                   JobPool
//! ```

pub mod memory;
pub mod redis_tree;
pub mod watcher;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;

pub use memory::MemoryCoordinationStore;
pub use redis_tree::{RedisCoordinationConfig, RedisCoordinationStore};
pub use watcher::{BranchRegistry, TreeWatcher, WatcherConfig};

/// Result type for coordination operations
pub type CoordResult<T> = Result<T, CoordError>;

/// Errors returned by a coordination store
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordError {
    /// The node does not exist (terminal for a watched branch)
    #[error("node does not exist: {0}")]
    NoNode(String),

    /// Transport or session failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Path is not a valid absolute node path
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

impl CoordError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Notification delivered by a one-shot watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    /// The children (or a child's data) of the watched node changed
    ChildrenChanged,
    /// The watched node itself was deleted
    NodeDeleted,
    /// The session dropped; callers must re-list
    Disconnected,
}

/// A pending one-shot watch
pub type Watch = BoxFuture<'static, WatchEvent>;

/// Hierarchical coordination store contract
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// List the children of `path` and arm a watch on it
    async fn children_watch(&self, path: &str) -> CoordResult<(Vec<String>, Watch)>;

    /// Read the data of a node
    async fn get(&self, path: &str) -> CoordResult<Vec<u8>>;

    /// Create or overwrite a node, creating missing parents
    async fn set(&self, path: &str, data: Vec<u8>) -> CoordResult<()>;

    /// Delete a node and everything below it
    async fn delete(&self, path: &str) -> CoordResult<()>;
}

/// Callbacks emitted by a [`TreeWatcher`]
#[async_trait]
pub trait LeafHandler: Send + Sync {
    async fn on_add_leaf(&self, branch: &str, leaf: &str, value: &[u8]);

    async fn on_update_leaf(&self, branch: &str, leaf: &str, old: &[u8], new: &[u8]);

    async fn on_delete_leaf(&self, branch: &str, leaf: &str, value: &[u8]);
}

/// Join a parent path and a child name
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Parent of an absolute path (`/` for top-level nodes)
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Reject anything but `/` or an absolute path without empty segments
pub fn validate_path(path: &str) -> CoordResult<()> {
    let valid = path == "/"
        || (path.starts_with('/') && !path.ends_with('/') && !path[1..].split('/').any(str::is_empty));
    if valid {
        Ok(())
    } else {
        Err(CoordError::InvalidPath(path.to_string()))
    }
}

/// Last segment of a path
pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Whether `path` equals `root` or lies below it
pub fn is_within(path: &str, root: &str) -> bool {
    if root == "/" {
        return path.starts_with('/');
    }
    path == root || path.strip_prefix(root).is_some_and(|rest| rest.starts_with('/'))
}
