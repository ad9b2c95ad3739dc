//! Slave collector talking to a served master
//!
//! Exercises the ND-JSON watch stream, the job list and report endpoints
//! through the real HTTP client.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use healthmesh::collector::{ClientConfig, CollectorConfig, JobCollector, JobSource, MasterClient};
use healthmesh::coordination::CoordinationStore;
use healthmesh::models::{JobAction, Protocol, RegistrationEntry};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{fast_prober, master_config, slave, start_master, wait_until, TestMaster};

const WAIT: Duration = Duration::from_secs(10);

/// Serve the master's router on an ephemeral port
async fn serve(master: &TestMaster) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let router = master.server.build_router();
    let shutdown = master.server.shutdown_token();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .unwrap();
    });
    format!("http://{address}")
}

async fn register_http(master: &TestMaster, branch: &str, endpoint: &MockServer) -> RegistrationEntry {
    let address = endpoint.address();
    let mut entry = RegistrationEntry::new(address.ip().to_string(), address.port());
    entry.scheme = "http".to_string();
    entry.cluster_tag = "zoneX".to_string();
    master
        .coordination
        .set(&format!("{branch}/{}", entry.leaf_name()), entry.to_bytes())
        .await
        .unwrap();
    entry
}

#[tokio::test]
async fn test_watch_stream_delivers_jobs() {
    let master = start_master(master_config());
    let url = serve(&master).await;
    let client = MasterClient::new(ClientConfig::new(&url)).unwrap();

    let mut stream = client.watch_jobs(&slave("slave-1", &["zoneX"])).await.unwrap();
    let endpoint = MockServer::start().await;
    register_http(&master, "/lb/web", &endpoint).await;

    let job = tokio::time::timeout(WAIT, futures::StreamExt::next(&mut stream))
        .await
        .expect("job event within the timeout")
        .expect("stream still open")
        .expect("well-formed job line");
    assert_eq!(job.action, JobAction::Add);
    assert_eq!(job.protocol, Protocol::Http);
    assert_eq!(job.module, "web");
    assert_eq!(job.url, format!("{}/healthz", endpoint.uri()));

    let listed = client.list_jobs(&slave("slave-1", &["zoneX"])).await.unwrap();
    assert_eq!(listed.len(), 1);

    master.server.shutdown_token().cancel();
}

#[tokio::test]
async fn test_http_collector_reports_success() {
    let master = start_master(master_config());
    let state = master.server.state();
    let url = serve(&master).await;

    let endpoint = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/healthz"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&endpoint)
        .await;
    let entry = register_http(&master, "/lb/web", &endpoint).await;
    let key = state.pool.job_for("/lb/web", &entry).key();

    let client = MasterClient::new(ClientConfig::new(&url).with_retry(2, Duration::from_millis(50))).unwrap();
    let cancel = CancellationToken::new();
    let collector = Arc::new(
        JobCollector::new(slave("slave-1", &["zoneX"]), Arc::new(client), fast_prober(), &CollectorConfig::default())
            .with_intervals(Duration::from_millis(100), Duration::from_secs(1), Duration::from_millis(50)),
    );
    tokio::spawn(collector.clone().run(cancel.child_token()));

    let jobs = state.jobs.clone();
    let probe_key = key.clone();
    assert!(
        wait_until(WAIT, || {
            let jobs = jobs.clone();
            let key = probe_key.clone();
            async move { !jobs.live_reports_for(&key, Utc::now()).is_empty() }
        })
        .await,
        "report should travel through the HTTP API into the cache"
    );

    let report = &state.jobs.live_reports_for(&key, Utc::now())[0];
    let status = report.status.as_ref().unwrap();
    assert!(status.success, "unexpected failure: {}", status.message);
    assert!(master.sink.named(healthmesh::policy::JOB_FAILED_ALARM).is_empty());

    cancel.cancel();
    master.server.shutdown_token().cancel();
}

#[tokio::test]
async fn test_watch_rejects_missing_zones() {
    let master = start_master(master_config());
    let url = serve(&master).await;
    let client = MasterClient::new(ClientConfig::new(&url)).unwrap();

    let result = client.watch_jobs(&slave("slave-1", &[])).await;
    match result {
        Err(healthmesh::collector::ClientError::Http { status, .. }) => assert_eq!(status, 400),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("watch without zones should be rejected"),
    }

    master.server.shutdown_token().cancel();
}
