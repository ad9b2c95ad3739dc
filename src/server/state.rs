//! Shared state handed to every API handler

use std::sync::Arc;
use std::time::Instant;

use crate::alarm::MaintenanceWindows;
use crate::classifier::EndpointClassifier;
use crate::coordination::{CoordinationStore, TreeWatcher};
use crate::platform::PlatformHealthChecker;
use crate::policy::{RoleHandle, RoleProvider};
use crate::pool::JobPool;
use crate::store::JobStore;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Jobs and slave subscriptions
    pub pool: Arc<JobPool>,

    /// Durable report writer and reconciled cache
    pub jobs: Arc<JobStore>,

    /// Registration tree
    pub coordination: Arc<dyn CoordinationStore>,

    pub maintenance: Arc<MaintenanceWindows>,

    pub platform: Arc<PlatformHealthChecker>,

    pub classifier: Arc<EndpointClassifier>,

    /// Watchers feeding the pool and the classifier
    pub watchers: Vec<TreeWatcher>,

    pub role: RoleHandle,

    /// Server start time
    pub start_time: Instant,
}

impl AppState {
    /// Whether every watcher's list/watch calls are succeeding
    pub fn watchers_healthy(&self) -> bool {
        self.watchers.iter().all(TreeWatcher::is_healthy)
    }

    pub fn is_master(&self) -> bool {
        self.role.is_master()
    }
}
