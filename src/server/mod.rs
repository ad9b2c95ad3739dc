//! Master HTTP server
//!
//! Wires the master tier together and serves it over HTTP:
//!
//! ```text
//!                    ┌──────────────┐  leaf events  ┌──────────────────────┐
//!  coordination ────▶│ TreeWatcher  │──────────────▶│ EndpointClassifier   │──▶ alarms
//!      store         │  (root "/")  │               └──────────────────────┘
//!        │           └──────────────┘
//!        │           ┌──────────────┐  leaf events  ┌──────────┐   ND-JSON
//!        └──────────▶│ TreeWatcher  │──────────────▶│ JobPool  │──────────▶ slaves
//!                    │ (root "/lb") │               └──────────┘
//!                    └──────────────┘
//!  slaves ── report ──▶ JobStore ──▶ durable store ──watch──▶ cache ──▶ PolicyCenter ──▶ alarms
//! ```

pub mod api;
pub mod state;

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::alarm::{build_sink, AlarmSink, MaintenanceGate, MaintenanceWindows};
use crate::classifier::EndpointClassifier;
use crate::config::{CoordinationBackend, DurableBackend, MasterConfig};
use crate::coordination::{
    CoordinationStore, MemoryCoordinationStore, RedisCoordinationStore, TreeWatcher, WatcherConfig,
};
use crate::platform::PlatformHealthChecker;
use crate::policy::{PolicyCenter, RoleHandle};
use crate::pool::JobPool;
use crate::store::{DurableStore, JobStore, MemoryDurableStore, RedisDurableStore};

pub use api::{create_router, ApiResponse, JobList};
pub use state::AppState;

// ============================================================================
// Server Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Initialization error: {0}")]
    Init(String),

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

// ============================================================================
// Master Server
// ============================================================================

pub struct MasterServer {
    config: MasterConfig,
    state: AppState,
    policy: Arc<PolicyCenter>,
    /// Set when the durable store is the in-process one and needs expiry
    reaper: Option<Arc<MemoryDurableStore>>,
    shutdown: CancellationToken,
}

impl MasterServer {
    /// Assemble the master from its collaborators
    pub fn new(
        config: MasterConfig,
        coordination: Arc<dyn CoordinationStore>,
        durable: Arc<dyn DurableStore>,
        sink: Arc<dyn AlarmSink>,
        role: RoleHandle,
    ) -> Result<Self, ServerError> {
        config.validate().map_err(|e| ServerError::Config(e.to_string()))?;

        let shutdown = CancellationToken::new();
        let maintenance = Arc::new(MaintenanceWindows::new(coordination.clone(), &config.maintenance_root));
        let sink: Arc<dyn AlarmSink> = Arc::new(MaintenanceGate::new(sink, maintenance.clone()));

        let classifier = Arc::new(
            EndpointClassifier::new(config.classifier.clone(), sink.clone())
                .map_err(|e| ServerError::Init(e.to_string()))?,
        );
        let pool = Arc::new(JobPool::new(config.pool.clone()));
        let jobs = Arc::new(JobStore::new(durable, config.job_store.clone()));

        let watcher_config = WatcherConfig::new(config.watcher.retry_delay(), &config.watcher.leaf_pattern)
            .map_err(|e| ServerError::Config(format!("watcher.leaf_pattern: {e}")))?;
        let watchers = vec![
            TreeWatcher::new(
                coordination.clone(),
                &config.classifier_root,
                classifier.clone(),
                watcher_config.clone(),
                shutdown.child_token(),
            ),
            TreeWatcher::new(
                coordination.clone(),
                &config.pool_root,
                pool.clone(),
                watcher_config,
                shutdown.child_token(),
            ),
        ];

        let platform = Arc::new(PlatformHealthChecker::new(
            coordination.clone(),
            pool.clone(),
            jobs.clone(),
            config.platform.clone(),
        ));
        let policy = Arc::new(PolicyCenter::new(
            jobs.clone(),
            sink,
            Arc::new(role.clone()),
            config.policy.clone(),
        ));

        let state = AppState {
            pool,
            jobs,
            coordination,
            maintenance,
            platform,
            classifier,
            watchers,
            role,
            start_time: Instant::now(),
        };

        Ok(Self {
            config,
            state,
            policy,
            reaper: None,
            shutdown,
        })
    }

    /// Build the master described by `config` with its configured backends
    pub async fn from_config(config: MasterConfig) -> Result<Self, ServerError> {
        let sink = build_sink(&config.sinks).map_err(|e| ServerError::Init(e.to_string()))?;
        let coordination: Arc<dyn CoordinationStore> = match &config.coordination {
            CoordinationBackend::Memory => Arc::new(MemoryCoordinationStore::new()),
            CoordinationBackend::Redis(redis) => Arc::new(
                RedisCoordinationStore::connect(redis.clone())
                    .await
                    .map_err(|e| ServerError::Init(format!("redis coordination store: {e}")))?,
            ),
        };
        let role = RoleHandle::new(config.is_master);

        match &config.durable {
            DurableBackend::Memory => {
                let memory = Arc::new(MemoryDurableStore::new());
                let mut server = Self::new(config, coordination, memory.clone(), sink, role)?;
                server.reaper = Some(memory);
                Ok(server)
            }
            DurableBackend::Redis(redis) => {
                let durable = RedisDurableStore::connect(redis.clone())
                    .await
                    .map_err(|e| ServerError::Init(format!("redis durable store: {e}")))?;
                Self::new(config, coordination, Arc::new(durable), sink, role)
            }
        }
    }

    /// Get the application state
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Cancelling this token stops the server and every background task
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let mut router = create_router(self.state.clone());

        if self.config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }

        if self.config.enable_request_logging {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Start watchers, fan-out, sweepers, the job store and the policy loop
    pub fn start_background_tasks(&self) {
        for watcher in &self.state.watchers {
            watcher.start();
        }

        let state = &self.state;
        tokio::spawn(state.pool.clone().run_fanout(self.shutdown.child_token()));
        tokio::spawn(state.classifier.clone().run(self.shutdown.child_token()));
        tokio::spawn(state.jobs.clone().run(self.shutdown.child_token()));
        tokio::spawn(self.policy.clone().run(self.shutdown.child_token()));

        if let Some(memory) = &self.reaper {
            let interval = self.config.job_store.sweep_interval();
            tokio::spawn(memory.clone().run_reaper(interval, self.shutdown.child_token()));
        }

        info!(
            classifier_root = %self.config.classifier_root,
            pool_root = %self.config.pool_root,
            is_master = self.state.is_master(),
            "Background tasks started"
        );
    }

    /// Serve until the shutdown token is cancelled
    pub async fn serve(&self) -> Result<(), ServerError> {
        let router = self.build_router();
        let address = self.config.bind_address.clone();

        info!(address = %address, "Starting master server");
        self.start_background_tasks();

        let listener = tokio::net::TcpListener::bind(&address)
            .await
            .map_err(|source| ServerError::Bind {
                address: address.clone(),
                source,
            })?;

        let shutdown = self.shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        for watcher in &self.state.watchers {
            watcher.stop();
        }
        info!("Master server shutdown complete");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;

    use crate::alarm::RecordingSink;
    use crate::models::{RegistrationEntry, SlaveInfo, Zone};

    fn server(config: MasterConfig) -> (MasterServer, Arc<MemoryCoordinationStore>) {
        let coordination = Arc::new(MemoryCoordinationStore::new());
        let server = MasterServer::new(
            config,
            coordination.clone(),
            Arc::new(MemoryDurableStore::new()),
            Arc::new(RecordingSink::new()),
            RoleHandle::new(true),
        )
        .unwrap();
        (server, coordination)
    }

    #[test]
    fn test_server_rejects_invalid_config() {
        let config = MasterConfig {
            pool_root: "lb".to_string(),
            ..MasterConfig::default()
        };
        let result = MasterServer::new(
            config,
            Arc::new(MemoryCoordinationStore::new()),
            Arc::new(MemoryDurableStore::new()),
            Arc::new(RecordingSink::new()),
            RoleHandle::new(true),
        );
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn test_app_state_components() {
        let (server, _) = server(MasterConfig::default());
        let state = server.state();
        assert_eq!(state.watchers.len(), 2);
        assert_eq!(state.watchers[0].root(), "/");
        assert_eq!(state.watchers[1].root(), "/lb");
        assert!(state.is_master());
        assert_eq!(state.pool.job_count(), 0);
    }

    #[tokio::test]
    async fn test_registered_endpoint_reaches_pool() {
        let (server, coordination) = server(MasterConfig::default());
        server.start_background_tasks();

        let mut entry = RegistrationEntry::new("10.0.0.1", 9100);
        entry.cluster_tag = "zoneX".to_string();
        coordination.set("/lb/svc-a/10.0.0.1:9100", entry.to_bytes()).await.unwrap();

        let state = server.state();
        let slave = SlaveInfo::new("slave-1", vec![Zone::new("zoneX")]);
        let deadline = Instant::now() + Duration::from_secs(5);
        while state.pool.list_jobs(&slave.zones).is_empty() {
            assert!(Instant::now() < deadline, "job never reached the pool");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.pool.list_jobs(&slave.zones)[0].module, "svc-a");

        server.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn test_maintenance_gate_wraps_sink() {
        let sink = Arc::new(RecordingSink::new());
        let server = MasterServer::new(
            MasterConfig::default(),
            Arc::new(MemoryCoordinationStore::new()),
            Arc::new(MemoryDurableStore::new()),
            sink.clone(),
            RoleHandle::new(true),
        )
        .unwrap();
        let state = server.state();

        state
            .maintenance
            .set(&crate::alarm::MaintenanceWindow {
                cluster: "zoneX".to_string(),
                alarm_name: None,
                reason: "upgrade".to_string(),
                until: Utc::now() + chrono::Duration::seconds(600),
            })
            .await
            .unwrap();

        let report = crate::models::Job::new("svc-a", Zone::new("zoneX"), crate::models::Protocol::Tcp, "10.0.0.1:9100")
            .with_status(crate::models::JobStatus {
                slave_info: SlaveInfo::new("slave-1", vec![Zone::new("zoneX")]),
                success: false,
                message: "connection refused".to_string(),
                finished_at: Utc::now(),
            });
        state.jobs.report(&report).await.unwrap();
        state.jobs.full_sync(Utc::now()).await.unwrap();

        // The gate accepts the alarm and drops it
        assert_eq!(server.policy.run_once(Utc::now()).await, 1);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let config = MasterConfig {
            bind_address: "127.0.0.1:0".to_string(),
            ..MasterConfig::default()
        };
        let (server, _) = server(config);
        let token = server.shutdown_token();
        let handle = tokio::spawn(async move { server.serve().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_ends_open_job_watch() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = MasterConfig {
            bind_address: format!("127.0.0.1:{port}"),
            ..MasterConfig::default()
        };
        let (server, _) = server(config);
        let token = server.shutdown_token();
        let pool = server.state().pool;
        let handle = tokio::spawn(async move { server.serve().await });

        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{port}/api/v1/jobs/watch");
        let slave = SlaveInfo::new("slave-1", vec![Zone::new("zoneX")]);
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut response = loop {
            match client.post(&url).json(&slave).send().await {
                Ok(response) => break response,
                Err(_) => {
                    assert!(Instant::now() < deadline, "server never started listening");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        };
        assert!(response.status().is_success());
        assert_eq!(pool.subscriber_count(), 1);

        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("serve should return while a watch is open")
            .unwrap();
        assert!(result.is_ok());
        assert!(pool.is_closed());
        assert!(!matches!(response.chunk().await, Ok(Some(_))));
    }
}
