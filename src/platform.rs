//! Platform and component health aggregation
//!
//! A component is a set of replicas registered as leaves under one branch.
//! Replica health comes from the job-status cache: all live reports
//! successful means healthy, any failure means unhealthy, no report means
//! unknown. Component health then follows the replication mode:
//!
//! - `master_master`: every replica must be healthy
//! - `master_slave`: exactly one healthy master, every other replica a
//!   healthy slave
//!
//! Unknown wins over healthy everywhere; unhealthy wins over both at the
//! platform level.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::coordination::{join_path, CoordError, CoordinationStore};
use crate::models::RegistrationEntry;
use crate::pool::JobPool;
use crate::store::JobStore;

/// Placeholder replaced by the cluster name in per-cluster branches
pub const CLUSTER_PLACEHOLDER: &str = "{cluster}";

/// Tri-state health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Unknown,
}

/// How a component's replicas cooperate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaMode {
    MasterSlave,
    MasterMaster,
}

/// One monitored component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,
    /// Branch whose leaves are the replicas; may contain `{cluster}`
    pub branch: String,
    pub mode: ReplicaMode,
}

impl ComponentSpec {
    pub fn new(name: impl Into<String>, branch: impl Into<String>, mode: ReplicaMode) -> Self {
        Self {
            name: name.into(),
            branch: branch.into(),
            mode,
        }
    }
}

/// Components to aggregate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Platform-wide components
    pub components: Vec<ComponentSpec>,
    pub clusters: Vec<String>,
    /// Components deployed once per entry of `clusters`
    pub cluster_components: Vec<ComponentSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaHealth {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub state: HealthState,
}

impl ReplicaHealth {
    fn has_role(&self, role: &str) -> bool {
        self.role.as_deref().is_some_and(|r| r.eq_ignore_ascii_case(role))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    pub mode: ReplicaMode,
    pub state: HealthState,
    pub replicas: Vec<ReplicaHealth>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformHealth {
    pub state: HealthState,
    pub components: Vec<ComponentHealth>,
    pub checked_at: DateTime<Utc>,
}

// ============================================================================
// Aggregation rules
// ============================================================================

/// Component state from its replicas
pub fn aggregate(mode: ReplicaMode, replicas: &[ReplicaHealth]) -> HealthState {
    if replicas.is_empty() || replicas.iter().any(|r| r.state == HealthState::Unknown) {
        return HealthState::Unknown;
    }

    match mode {
        ReplicaMode::MasterMaster => {
            if replicas.iter().all(|r| r.state == HealthState::Healthy) {
                HealthState::Healthy
            } else {
                HealthState::Unhealthy
            }
        }
        ReplicaMode::MasterSlave => {
            let masters = replicas.iter().filter(|r| r.has_role("master")).count();
            let all_healthy = replicas.iter().all(|r| r.state == HealthState::Healthy);
            let rest_slaves = replicas.iter().all(|r| r.has_role("master") || r.has_role("slave"));
            if masters == 1 && all_healthy && rest_slaves {
                HealthState::Healthy
            } else {
                HealthState::Unhealthy
            }
        }
    }
}

/// Platform state from its components
pub fn overall(components: &[ComponentHealth]) -> HealthState {
    if components.iter().any(|c| c.state == HealthState::Unhealthy) {
        HealthState::Unhealthy
    } else if components.iter().any(|c| c.state == HealthState::Unknown) {
        HealthState::Unknown
    } else {
        HealthState::Healthy
    }
}

// ============================================================================
// Checker
// ============================================================================

/// Resolves components against the coordination store and job cache
pub struct PlatformHealthChecker {
    coordination: Arc<dyn CoordinationStore>,
    pool: Arc<JobPool>,
    store: Arc<JobStore>,
    config: PlatformConfig,
}

impl PlatformHealthChecker {
    pub fn new(
        coordination: Arc<dyn CoordinationStore>,
        pool: Arc<JobPool>,
        store: Arc<JobStore>,
        config: PlatformConfig,
    ) -> Self {
        Self {
            coordination,
            pool,
            store,
            config,
        }
    }

    /// Health of every configured component
    pub async fn check(&self, now: DateTime<Utc>) -> PlatformHealth {
        let mut components = Vec::new();
        for spec in &self.config.components {
            components.push(self.component(spec, None, now).await);
        }
        for cluster in &self.config.clusters {
            for spec in &self.config.cluster_components {
                components.push(self.component(spec, Some(cluster.as_str()), now).await);
            }
        }

        PlatformHealth {
            state: overall(&components),
            components,
            checked_at: now,
        }
    }

    async fn component(&self, spec: &ComponentSpec, cluster: Option<&str>, now: DateTime<Utc>) -> ComponentHealth {
        let branch = match cluster {
            Some(cluster) => spec.branch.replace(CLUSTER_PLACEHOLDER, cluster),
            None => spec.branch.clone(),
        };

        let replicas = match self.replicas(&branch, now).await {
            Ok(replicas) => replicas,
            Err(CoordError::NoNode(_)) => Vec::new(),
            Err(e) => {
                warn!(component = %spec.name, branch = %branch, error = %e, "Could not list component replicas");
                Vec::new()
            }
        };
        let state = aggregate(spec.mode, &replicas);
        debug!(component = %spec.name, branch = %branch, state = ?state, "Component health evaluated");

        ComponentHealth {
            name: spec.name.clone(),
            cluster: cluster.map(str::to_string),
            mode: spec.mode,
            state,
            replicas,
        }
    }

    async fn replicas(&self, branch: &str, now: DateTime<Utc>) -> Result<Vec<ReplicaHealth>, CoordError> {
        let (mut children, _watch) = self.coordination.children_watch(branch).await?;
        children.sort();

        let mut replicas = Vec::new();
        for child in children {
            let value = match self.coordination.get(&join_path(branch, &child)).await {
                Ok(value) => value,
                // Removed while listing
                Err(CoordError::NoNode(_)) => continue,
                Err(e) => return Err(e),
            };
            // Sub-branches and foreign nodes are not replicas
            let Ok(entry) = RegistrationEntry::from_bytes(&value) else {
                continue;
            };

            let key = self.pool.job_for(branch, &entry).key();
            let reports: Vec<bool> = self
                .store
                .live_reports_for(&key, now)
                .iter()
                .filter_map(|job| job.status.as_ref().map(|s| s.success))
                .collect();
            let state = if reports.is_empty() {
                HealthState::Unknown
            } else if reports.iter().all(|success| *success) {
                HealthState::Healthy
            } else {
                HealthState::Unhealthy
            };

            replicas.push(ReplicaHealth {
                address: entry.leaf_name(),
                role: entry.role.clone(),
                state,
            });
        }
        Ok(replicas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinationStore;
    use crate::models::{Job, JobStatus, SlaveInfo, Zone};
    use crate::pool::JobPoolConfig;
    use crate::store::{JobStoreConfig, MemoryDurableStore, StoreEvent};

    fn replica(role: Option<&str>, state: HealthState) -> ReplicaHealth {
        ReplicaHealth {
            address: "10.0.0.1:1".into(),
            role: role.map(str::to_string),
            state,
        }
    }

    #[test]
    fn test_master_master_rules() {
        use HealthState::*;
        assert_eq!(aggregate(ReplicaMode::MasterMaster, &[]), Unknown);
        assert_eq!(
            aggregate(ReplicaMode::MasterMaster, &[replica(None, Healthy), replica(None, Healthy)]),
            Healthy
        );
        assert_eq!(
            aggregate(ReplicaMode::MasterMaster, &[replica(None, Healthy), replica(None, Unhealthy)]),
            Unhealthy
        );
        assert_eq!(
            aggregate(ReplicaMode::MasterMaster, &[replica(None, Unhealthy), replica(None, Unknown)]),
            Unknown
        );
    }

    #[test]
    fn test_master_slave_rules() {
        use HealthState::*;
        let mode = ReplicaMode::MasterSlave;
        assert_eq!(
            aggregate(mode, &[replica(Some("master"), Healthy), replica(Some("slave"), Healthy)]),
            Healthy
        );
        assert_eq!(
            aggregate(mode, &[replica(Some("MASTER"), Healthy), replica(Some("Slave"), Healthy)]),
            Healthy
        );
        // Two masters
        assert_eq!(
            aggregate(mode, &[replica(Some("master"), Healthy), replica(Some("master"), Healthy)]),
            Unhealthy
        );
        // No master
        assert_eq!(
            aggregate(mode, &[replica(Some("slave"), Healthy), replica(Some("slave"), Healthy)]),
            Unhealthy
        );
        assert_eq!(
            aggregate(mode, &[replica(Some("master"), Healthy), replica(Some("slave"), Unhealthy)]),
            Unhealthy
        );
        assert_eq!(
            aggregate(mode, &[replica(Some("master"), Healthy), replica(None, Healthy)]),
            Unhealthy
        );
        assert_eq!(
            aggregate(mode, &[replica(Some("master"), Healthy), replica(Some("slave"), Unknown)]),
            Unknown
        );
    }

    #[test]
    fn test_overall() {
        let component = |state| ComponentHealth {
            name: "c".into(),
            cluster: None,
            mode: ReplicaMode::MasterMaster,
            state,
            replicas: vec![],
        };
        assert_eq!(overall(&[]), HealthState::Healthy);
        assert_eq!(
            overall(&[component(HealthState::Healthy), component(HealthState::Unknown)]),
            HealthState::Unknown
        );
        assert_eq!(
            overall(&[component(HealthState::Unknown), component(HealthState::Unhealthy)]),
            HealthState::Unhealthy
        );
    }

    async fn register(store: &MemoryCoordinationStore, branch: &str, ip: &str, role: &str) -> RegistrationEntry {
        let entry = RegistrationEntry {
            role: Some(role.to_string()),
            cluster_tag: "zoneX".into(),
            ..RegistrationEntry::new(ip, 7000)
        };
        store.set(&join_path(branch, &entry.leaf_name()), entry.to_bytes()).await.unwrap();
        entry
    }

    fn report(store: &JobStore, job: &Job, success: bool) {
        let reported = job.with_status(JobStatus {
            slave_info: SlaveInfo::new("slave-1", vec![Zone::all()]),
            success,
            message: String::new(),
            finished_at: Utc::now(),
        });
        store.apply_event(
            StoreEvent::Put {
                key: store.key_for(&job.key(), "slave-1"),
                value: serde_json::to_vec(&reported).unwrap(),
            },
            Utc::now(),
        );
    }

    #[tokio::test]
    async fn test_checker_resolves_per_cluster_components() {
        let coordination = Arc::new(MemoryCoordinationStore::new());
        let pool = Arc::new(JobPool::new(JobPoolConfig::default()));
        let jobs = Arc::new(JobStore::new(Arc::new(MemoryDurableStore::new()), JobStoreConfig::default()));

        let branch = "/clusters/c1/scheduler";
        let master = register(&coordination, branch, "10.0.0.1", "master").await;
        let slave = register(&coordination, branch, "10.0.0.2", "slave").await;
        report(&jobs, &pool.job_for(branch, &master), true);
        report(&jobs, &pool.job_for(branch, &slave), true);

        let config = PlatformConfig {
            components: vec![ComponentSpec::new("gateway", "/platform/gateway", ReplicaMode::MasterMaster)],
            clusters: vec!["c1".into()],
            cluster_components: vec![ComponentSpec::new(
                "scheduler",
                "/clusters/{cluster}/scheduler",
                ReplicaMode::MasterSlave,
            )],
        };
        let checker = PlatformHealthChecker::new(coordination.clone(), pool.clone(), jobs.clone(), config);

        let health = checker.check(Utc::now()).await;
        assert_eq!(health.components.len(), 2);
        // Gateway has no replicas registered at all
        assert_eq!(health.components[0].state, HealthState::Unknown);
        assert_eq!(health.components[1].cluster.as_deref(), Some("c1"));
        assert_eq!(health.components[1].state, HealthState::Healthy);
        assert_eq!(health.state, HealthState::Unknown);

        report(&jobs, &pool.job_for(branch, &slave), false);
        let health = checker.check(Utc::now()).await;
        assert_eq!(health.components[1].state, HealthState::Unhealthy);
        assert_eq!(health.state, HealthState::Unhealthy);
    }
}
