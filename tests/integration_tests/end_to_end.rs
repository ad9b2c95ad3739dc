//! Registration to alarm, in process
//!
//! 1. A service registers under `/lb/svc-a`
//! 2. The job pool derives a TCP job and streams it to a slave
//! 3. The slave probes a closed port and reports failures
//! 4. The job store mirrors the reports and the policy center alarms

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use healthmesh::collector::{InProcessSource, JobCollector};
use healthmesh::collector::CollectorConfig;
use healthmesh::coordination::CoordinationStore;
use healthmesh::models::Protocol;
use healthmesh::policy::{PolicyCenter, PolicyConfig, RoleHandle, JOB_FAILED_ALARM};
use tokio_util::sync::CancellationToken;

use crate::common::{closed_port, fast_prober, master_config, register, slave, start_master, wait_until};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_failing_endpoint_raises_one_alarm() {
    let master = start_master(master_config());
    let state = master.server.state();

    let port = closed_port().await;
    let entry = register(&master.coordination, "/lb/svc-a", "127.0.0.1", port, "zoneX").await;
    let job = state.pool.job_for("/lb/svc-a", &entry);
    assert_eq!(job.protocol, Protocol::Tcp);
    assert_eq!(job.zone.as_str(), "zoneX");

    let pool = state.pool.clone();
    assert!(
        wait_until(WAIT, || {
            let pool = pool.clone();
            async move { pool.job_count() == 1 }
        })
        .await,
        "job should reach the pool"
    );

    let cancel = CancellationToken::new();
    let source = Arc::new(InProcessSource::new(state.pool.clone(), state.jobs.clone()));
    let collector = Arc::new(
        JobCollector::new(slave("slave-1", &["zoneX"]), source, fast_prober(), &CollectorConfig::default())
            .with_intervals(Duration::from_millis(100), Duration::from_secs(1), Duration::from_millis(50)),
    );
    tokio::spawn(collector.clone().run(cancel.child_token()));

    let jobs = state.jobs.clone();
    let key = job.key();
    assert!(
        wait_until(WAIT, || {
            let jobs = jobs.clone();
            let key = key.clone();
            async move { !jobs.live_reports_for(&key, Utc::now()).is_empty() }
        })
        .await,
        "report should reach the cache"
    );

    let reports = state.jobs.live_reports_for(&key, Utc::now());
    let status = reports[0].status.as_ref().unwrap();
    assert!(!status.success);
    assert_eq!(status.slave_info.cluster_name, "slave-1");

    let policy = PolicyCenter::new(
        state.jobs.clone(),
        master.sink.clone(),
        Arc::new(RoleHandle::new(true)),
        PolicyConfig::default(),
    );
    assert_eq!(policy.run_once(Utc::now()).await, 1);

    let alarms = master.sink.named(JOB_FAILED_ALARM);
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0].module, "svc-a");
    assert_eq!(alarms[0].cluster, "zoneX");
    assert_eq!(alarms[0].target, format!("127.0.0.1:{port}"));

    cancel.cancel();
    master.server.shutdown_token().cancel();
}

#[tokio::test]
async fn test_deregistration_stops_probing() {
    let master = start_master(master_config());
    let state = master.server.state();

    let port = closed_port().await;
    register(&master.coordination, "/lb/svc-b", "127.0.0.1", port, "zoneX").await;

    let cancel = CancellationToken::new();
    let source = Arc::new(InProcessSource::new(state.pool.clone(), state.jobs.clone()));
    let collector = Arc::new(
        JobCollector::new(slave("slave-1", &["zoneX"]), source, fast_prober(), &CollectorConfig::default())
            .with_intervals(Duration::from_millis(100), Duration::from_secs(1), Duration::from_millis(50)),
    );
    tokio::spawn(collector.clone().run(cancel.child_token()));

    let running = collector.clone();
    assert!(
        wait_until(WAIT, || {
            let running = running.clone();
            async move { running.running() == 1 }
        })
        .await,
        "collector should start a probe task"
    );

    master
        .coordination
        .delete(&format!("/lb/svc-b/127.0.0.1:{port}"))
        .await
        .unwrap();

    let running = collector.clone();
    assert!(
        wait_until(WAIT, || {
            let running = running.clone();
            async move { running.running() == 0 }
        })
        .await,
        "delete should stop the probe task"
    );
    assert_eq!(state.pool.job_count(), 0);

    cancel.cancel();
    master.server.shutdown_token().cancel();
}

#[tokio::test]
async fn test_other_zone_not_assigned() {
    let master = start_master(master_config());
    let state = master.server.state();

    register(&master.coordination, "/lb/svc-c", "127.0.0.1", closed_port().await, "zoneY").await;

    let pool = state.pool.clone();
    assert!(
        wait_until(WAIT, || {
            let pool = pool.clone();
            async move { pool.job_count() == 1 }
        })
        .await
    );

    assert!(state.pool.list_jobs(&slave("slave-1", &["zoneX"]).zones).is_empty());
    assert_eq!(state.pool.list_jobs(&slave("slave-2", &["*"]).zones).len(), 1);

    master.server.shutdown_token().cancel();
}
