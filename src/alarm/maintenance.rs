//! Planned maintenance windows
//!
//! Windows live in the coordination store at `{root}/{cluster}` (whole
//! cluster) or `{root}/{cluster}/{alarm}` (one alarm name), each segment
//! percent-encoded. The
//! [`MaintenanceGate`] sink decorator consults them before delivery.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{AlarmOptions, AlarmResult, AlarmSink, AlarmSource};
use crate::coordination::{join_path, CoordError, CoordResult, CoordinationStore};
use crate::metrics;
use crate::utils::encode_segment;

/// Default coordination path of the maintenance records
pub const DEFAULT_MAINTENANCE_ROOT: &str = "/maintenance";

/// One maintenance record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceWindow {
    pub cluster: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm_name: Option<String>,
    #[serde(default)]
    pub reason: String,
    pub until: DateTime<Utc>,
}

impl MaintenanceWindow {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.until
    }
}

/// Read/write access to the maintenance records
pub struct MaintenanceWindows {
    store: Arc<dyn CoordinationStore>,
    root: String,
}

impl MaintenanceWindows {
    pub fn new(store: Arc<dyn CoordinationStore>, root: impl Into<String>) -> Self {
        Self {
            store,
            root: root.into(),
        }
    }

    fn path(&self, cluster: &str, alarm_name: Option<&str>) -> String {
        let cluster_path = join_path(&self.root, &encode_segment(cluster));
        match alarm_name {
            Some(alarm) => join_path(&cluster_path, &encode_segment(alarm)),
            None => cluster_path,
        }
    }

    /// Create or replace a window
    pub async fn set(&self, window: &MaintenanceWindow) -> CoordResult<()> {
        let path = self.path(&window.cluster, window.alarm_name.as_deref());
        // A struct of strings and a timestamp always serializes
        let data = serde_json::to_vec(window).unwrap_or_default();
        self.store.set(&path, data).await?;
        info!(path = %path, until = %window.until, reason = %window.reason, "Maintenance window set");
        Ok(())
    }

    /// Remove a window; removing a missing one succeeds
    pub async fn cancel(&self, cluster: &str, alarm_name: Option<&str>) -> CoordResult<()> {
        let path = self.path(cluster, alarm_name);

        // A cluster record may be the parent of per-alarm records: clear its
        // data instead of deleting the sub-tree
        if alarm_name.is_none() {
            match self.store.children_watch(&path).await {
                Ok((children, _)) if !children.is_empty() => {
                    self.store.set(&path, Vec::new()).await?;
                    info!(path = %path, "Maintenance window cancelled");
                    return Ok(());
                }
                Ok(_) | Err(CoordError::NoNode(_)) => {}
                Err(e) => return Err(e),
            }
        }

        match self.store.delete(&path).await {
            Ok(()) | Err(CoordError::NoNode(_)) => {
                info!(path = %path, "Maintenance window cancelled");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn read(&self, path: &str) -> CoordResult<Option<MaintenanceWindow>> {
        match self.store.get(path).await {
            Ok(data) if data.is_empty() => Ok(None),
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(window) => Ok(Some(window)),
                Err(e) => {
                    warn!(path = %path, error = %e, "Ignoring malformed maintenance record");
                    Ok(None)
                }
            },
            Err(CoordError::NoNode(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The active window covering `(cluster, alarm_name)`, alarm-specific first
    pub async fn active(
        &self,
        cluster: &str,
        alarm_name: &str,
        now: DateTime<Utc>,
    ) -> CoordResult<Option<MaintenanceWindow>> {
        if cluster.is_empty() {
            return Ok(None);
        }
        for path in [self.path(cluster, Some(alarm_name)), self.path(cluster, None)] {
            if let Some(window) = self.read(&path).await? {
                if window.is_active(now) {
                    return Ok(Some(window));
                }
            }
        }
        Ok(None)
    }
}

/// Sink decorator dropping alarms covered by an active window
pub struct MaintenanceGate {
    inner: Arc<dyn AlarmSink>,
    windows: Arc<MaintenanceWindows>,
}

impl MaintenanceGate {
    pub fn new(inner: Arc<dyn AlarmSink>, windows: Arc<MaintenanceWindows>) -> Self {
        Self { inner, windows }
    }
}

#[async_trait]
impl AlarmSink for MaintenanceGate {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn send_alarm(&self, options: &AlarmOptions, source: AlarmSource) -> AlarmResult<()> {
        match self.windows.active(&options.cluster, &options.name, Utc::now()).await {
            Ok(Some(window)) => {
                debug!(
                    alarm = %options.name,
                    cluster = %options.cluster,
                    until = %window.until,
                    "Alarm suppressed by maintenance window"
                );
                metrics::record_alarm_suppressed("maintenance");
                return Ok(());
            }
            Ok(None) => {}
            // Fail open: a coordination outage must not swallow alarms
            Err(e) => warn!(error = %e, "Maintenance lookup failed, delivering alarm"),
        }
        self.inner.send_alarm(options, source).await
    }
}
