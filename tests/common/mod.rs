//! Common test utilities

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use healthmesh::alarm::RecordingSink;
use healthmesh::collector::Prober;
use healthmesh::config::MasterConfig;
use healthmesh::coordination::{CoordinationStore, MemoryCoordinationStore};
use healthmesh::models::{RegistrationEntry, SlaveInfo, Zone};
use healthmesh::policy::RoleHandle;
use healthmesh::server::MasterServer;
use healthmesh::store::MemoryDurableStore;
use healthmesh::utils::retry::RetrySchedule;

/// A master wired to in-memory backends
pub struct TestMaster {
    pub server: MasterServer,
    pub coordination: Arc<MemoryCoordinationStore>,
    pub sink: Arc<RecordingSink>,
}

/// Master config with quiet background loops
pub fn master_config() -> MasterConfig {
    let mut config = MasterConfig::default();
    config.policy.interval_secs = 3600;
    config.job_store.full_sync_secs = 1;
    config.watcher.retry_delay_secs = 1;
    config
}

pub fn start_master(config: MasterConfig) -> TestMaster {
    let coordination = Arc::new(MemoryCoordinationStore::new());
    let sink = Arc::new(RecordingSink::new());
    let server = MasterServer::new(
        config,
        coordination.clone(),
        Arc::new(MemoryDurableStore::new()),
        sink.clone(),
        RoleHandle::new(true),
    )
    .expect("master should build");
    server.start_background_tasks();
    TestMaster {
        server,
        coordination,
        sink,
    }
}

/// Register `ip:port` under `branch` with a cluster tag
pub async fn register(store: &MemoryCoordinationStore, branch: &str, ip: &str, port: u16, zone: &str) -> RegistrationEntry {
    let mut entry = RegistrationEntry::new(ip, port);
    entry.cluster_tag = zone.to_string();
    store
        .set(&format!("{branch}/{}", entry.leaf_name()), entry.to_bytes())
        .await
        .expect("registration should be stored");
    entry
}

/// A localhost port nothing listens on
pub async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

pub fn slave(name: &str, zones: &[&str]) -> SlaveInfo {
    SlaveInfo::new(name, zones.iter().map(|z| Zone::new(*z)).collect())
}

/// Prober dialing three times with short pauses
pub fn fast_prober() -> Prober {
    Prober::new(
        Duration::from_millis(500),
        RetrySchedule::tiered(vec![Duration::from_millis(10), Duration::from_millis(30)]),
    )
    .unwrap()
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
