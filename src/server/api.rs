//! REST API handlers for the master
//!
//! Every non-stream response is wrapped in [`ApiResponse`]. The job watch
//! endpoint answers with newline-delimited JSON instead, one [`Job`] per line,
//! for as long as the slave keeps the connection open.

use std::convert::Infallible;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{MatchedPath, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::alarm::MaintenanceWindow;
use crate::coordination::{join_path, CoordError};
use crate::metrics;
use crate::models::{Job, RegistrationEntry, SlaveInfo};
use crate::store::StoreError;

use super::state::AppState;

// ============================================================================
// API Response Types
// ============================================================================

/// Envelope of every non-stream response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub result: bool,
    /// 0 on success, the HTTP status otherwise
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            result: true,
            code: 0,
            message: "ok".to_string(),
            data: Some(data),
        }
    }

    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            result: false,
            code: status.as_u16(),
            message: message.into(),
            data: None,
        }
    }
}

impl ApiResponse<()> {
    /// Success without a payload
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            result: true,
            code: 0,
            message: message.into(),
            data: None,
        }
    }
}

fn reply<T: Serialize>(status: StatusCode, body: ApiResponse<T>) -> Response {
    (status, Json(body)).into_response()
}

fn fail(status: StatusCode, message: impl Into<String>) -> Response {
    reply(status, ApiResponse::<()>::error(status, message))
}

/// Jobs currently assigned to a slave
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobList {
    pub jobs: Vec<Job>,
}

/// Liveness response of `/healthz`
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Component flags and counts
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub version: String,
    pub uptime_secs: u64,
    pub is_master: bool,
    pub watchers_healthy: bool,
    pub job_store_healthy: bool,
    pub jobs: usize,
    pub subscribers: usize,
    pub queued_events: usize,
    pub cached_jobs: usize,
    pub pending_flaps: usize,
}

/// Create or cancel a maintenance window
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceRequest {
    pub cluster: String,
    #[serde(default)]
    pub alarm_name: Option<String>,
    #[serde(default)]
    pub reason: String,
    /// Absolute end of the window
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    /// Relative end of the window, used when `until` is absent
    #[serde(default)]
    pub duration_secs: Option<u64>,
}

impl MaintenanceRequest {
    fn window(&self, now: DateTime<Utc>) -> Option<MaintenanceWindow> {
        let until = match (self.until, self.duration_secs) {
            (Some(until), _) => until,
            (None, Some(secs)) => now + chrono::Duration::seconds(i64::try_from(secs).ok()?),
            (None, None) => return None,
        };
        Some(MaintenanceWindow {
            cluster: self.cluster.clone(),
            alarm_name: self.alarm_name.clone().filter(|name| !name.is_empty()),
            reason: self.reason.clone(),
            until,
        })
    }
}

/// Register an endpoint under a branch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryRequest {
    pub branch: String,
    pub entry: RegistrationEntry,
}

/// Remove the `ip:port` leaf of a branch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryDeleteRequest {
    pub branch: String,
    pub ip: String,
    pub port: u16,
}

// ============================================================================
// API Routes
// ============================================================================

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/healthz", get(health_check))
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/platform/healthz", get(platform_health))
        // Job endpoints
        .route("/api/v1/jobs/watch", post(watch_jobs))
        .route("/api/v1/jobs/list", post(list_jobs))
        .route("/api/v1/jobs/report", post(report_job))
        // Operator endpoints
        .route("/api/v1/maintenance", post(set_maintenance).delete(cancel_maintenance))
        .route("/api/v1/registry", post(register_entry).delete(remove_entry))
        .route("/metrics", get(export_metrics))
        .route_layer(middleware::from_fn(track_metrics))
        .with_state(state)
}

async fn track_metrics(request: Request, next: Next) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();
    let response = next.run(request).await;
    metrics::record_api_request(&endpoint, response.status().as_u16(), start.elapsed().as_secs_f64());
    response
}

fn validate_slave(slave: &SlaveInfo) -> Result<(), Response> {
    if slave.cluster_name.trim().is_empty() {
        return Err(fail(StatusCode::BAD_REQUEST, "clusterName must not be empty"));
    }
    if slave.zones.is_empty() {
        return Err(fail(StatusCode::BAD_REQUEST, "zones must not be empty"));
    }
    Ok(())
}

fn coordination_failure(e: &CoordError) -> Response {
    let status = match e {
        CoordError::NoNode(_) => StatusCode::NOT_FOUND,
        CoordError::InvalidPath(_) => StatusCode::BAD_REQUEST,
        CoordError::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    fail(status, e.to_string())
}

// ============================================================================
// Health Handlers
// ============================================================================

async fn health_check() -> Response {
    reply(
        StatusCode::OK,
        ApiResponse::success(HealthResponse {
            status: "ok".to_string(),
        }),
    )
}

async fn get_status(State(state): State<AppState>) -> Response {
    let status = StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        is_master: state.is_master(),
        watchers_healthy: state.watchers_healthy(),
        job_store_healthy: state.jobs.is_healthy(),
        jobs: state.pool.job_count(),
        subscribers: state.pool.subscriber_count(),
        queued_events: state.pool.queued(),
        cached_jobs: state.jobs.len(),
        pending_flaps: state.classifier.pending(),
    };
    reply(StatusCode::OK, ApiResponse::success(status))
}

async fn platform_health(State(state): State<AppState>) -> Response {
    let health = state.platform.check(Utc::now()).await;
    reply(StatusCode::OK, ApiResponse::success(health))
}

// ============================================================================
// Job Handlers
// ============================================================================

/// Stream job events for the slave's zones until it disconnects
async fn watch_jobs(State(state): State<AppState>, Json(slave): Json<SlaveInfo>) -> Response {
    if let Err(response) = validate_slave(&slave) {
        return response;
    }

    let subscription = state.pool.subscribe(&slave);
    info!(subscriber = %subscription.id(), zones = slave.zones.len(), "Slave watching jobs");

    // Dropping the body drops the subscription, which unregisters it
    let lines = subscription.filter_map(|job| async move {
        match serde_json::to_vec(&job) {
            Ok(mut line) => {
                line.push(b'\n');
                Some(Ok::<Bytes, Infallible>(Bytes::from(line)))
            }
            Err(e) => {
                warn!(job = %job.key(), error = %e, "Failed to encode job event");
                None
            }
        }
    });

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response()
}

async fn list_jobs(State(state): State<AppState>, Json(slave): Json<SlaveInfo>) -> Response {
    if let Err(response) = validate_slave(&slave) {
        return response;
    }
    let jobs = state.pool.list_jobs(&slave.zones);
    debug!(slave = %slave.cluster_name, jobs = jobs.len(), "Jobs listed");
    reply(StatusCode::OK, ApiResponse::success(JobList { jobs }))
}

async fn report_job(State(state): State<AppState>, Json(job): Json<Job>) -> Response {
    if job.status.is_none() {
        return fail(StatusCode::BAD_REQUEST, "job report carries no status");
    }
    match state.jobs.report(&job).await {
        Ok(()) => reply(StatusCode::OK, ApiResponse::ok("reported")),
        Err(StoreError::Codec(message)) => fail(StatusCode::BAD_REQUEST, message),
        Err(e) => {
            warn!(job = %job.key(), error = %e, "Failed to persist job report");
            fail(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

// ============================================================================
// Maintenance Handlers
// ============================================================================

async fn set_maintenance(State(state): State<AppState>, Json(request): Json<MaintenanceRequest>) -> Response {
    if request.cluster.trim().is_empty() {
        return fail(StatusCode::BAD_REQUEST, "cluster must not be empty");
    }
    let now = Utc::now();
    let Some(window) = request.window(now) else {
        return fail(StatusCode::BAD_REQUEST, "either until or durationSecs is required");
    };
    if !window.is_active(now) {
        return fail(StatusCode::BAD_REQUEST, "maintenance window already ended");
    }

    match state.maintenance.set(&window).await {
        Ok(()) => reply(StatusCode::OK, ApiResponse::ok(format!("maintenance set until {}", window.until))),
        Err(e) => coordination_failure(&e),
    }
}

async fn cancel_maintenance(State(state): State<AppState>, Json(request): Json<MaintenanceRequest>) -> Response {
    if request.cluster.trim().is_empty() {
        return fail(StatusCode::BAD_REQUEST, "cluster must not be empty");
    }
    let alarm_name = request.alarm_name.as_deref().filter(|name| !name.is_empty());
    match state.maintenance.cancel(&request.cluster, alarm_name).await {
        Ok(()) => reply(StatusCode::OK, ApiResponse::ok("maintenance cancelled")),
        Err(e) => coordination_failure(&e),
    }
}

// ============================================================================
// Registry Handlers
// ============================================================================

async fn register_entry(State(state): State<AppState>, Json(request): Json<RegistryRequest>) -> Response {
    if !request.branch.starts_with('/') {
        return fail(StatusCode::BAD_REQUEST, format!("branch must be absolute: {}", request.branch));
    }
    if request.entry.ip.is_empty() {
        return fail(StatusCode::BAD_REQUEST, "entry ip must not be empty");
    }

    let path = join_path(&request.branch, &request.entry.leaf_name());
    match state.coordination.set(&path, request.entry.to_bytes()).await {
        Ok(()) => {
            info!(path = %path, "Endpoint registered");
            reply(StatusCode::OK, ApiResponse::ok(format!("registered {path}")))
        }
        Err(e) => coordination_failure(&e),
    }
}

async fn remove_entry(State(state): State<AppState>, Json(request): Json<RegistryDeleteRequest>) -> Response {
    if !request.branch.starts_with('/') {
        return fail(StatusCode::BAD_REQUEST, format!("branch must be absolute: {}", request.branch));
    }

    let path = join_path(&request.branch, &format!("{}:{}", request.ip, request.port));
    match state.coordination.delete(&path).await {
        Ok(()) => {
            info!(path = %path, "Endpoint removed");
            reply(StatusCode::OK, ApiResponse::ok(format!("removed {path}")))
        }
        Err(e) => coordination_failure(&e),
    }
}

// ============================================================================
// Metrics Handler
// ============================================================================

async fn export_metrics() -> Response {
    match metrics::encode_metrics() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::http::{Method, Request as HttpRequest};
    use serde::de::DeserializeOwned;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use crate::alarm::RecordingSink;
    use crate::config::MasterConfig;
    use crate::coordination::{CoordinationStore, LeafHandler, MemoryCoordinationStore};
    use crate::models::{JobAction, JobStatus, Protocol, Zone};
    use crate::policy::RoleHandle;
    use crate::server::MasterServer;
    use crate::store::MemoryDurableStore;

    struct Harness {
        server: MasterServer,
        coordination: Arc<MemoryCoordinationStore>,
    }

    fn harness() -> Harness {
        let coordination = Arc::new(MemoryCoordinationStore::new());
        let server = MasterServer::new(
            MasterConfig::default(),
            coordination.clone(),
            Arc::new(MemoryDurableStore::new()),
            Arc::new(RecordingSink::new()),
            RoleHandle::new(true),
        )
        .unwrap();
        Harness { server, coordination }
    }

    fn json_request<B: Serialize>(method: Method, uri: &str, body: &B) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    fn get_request(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn envelope<T: DeserializeOwned>(response: Response) -> ApiResponse<T> {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn slave() -> SlaveInfo {
        SlaveInfo::new("slave-1", vec![Zone::new("zoneX")])
    }

    fn entry_bytes(ip: &str, port: u16) -> Vec<u8> {
        let mut entry = RegistrationEntry::new(ip, port);
        entry.cluster_tag = "zoneX".to_string();
        entry.to_bytes()
    }

    #[test]
    fn test_api_response_envelope() {
        let ok = ApiResponse::success(JobList::default());
        assert!(ok.result);
        assert_eq!(ok.code, 0);

        let err = ApiResponse::<()>::error(StatusCode::SERVICE_UNAVAILABLE, "store down");
        assert!(!err.result);
        assert_eq!(err.code, 503);
        let json = serde_json::to_value(&err).unwrap();
        assert!(json.get("data").is_none());
    }

    #[test]
    fn test_maintenance_request_window() {
        let now = Utc::now();
        let request = MaintenanceRequest {
            cluster: "zoneX".to_string(),
            alarm_name: Some(String::new()),
            reason: "upgrade".to_string(),
            until: None,
            duration_secs: Some(600),
        };
        let window = request.window(now).unwrap();
        assert_eq!(window.until, now + chrono::Duration::seconds(600));
        assert!(window.alarm_name.is_none());

        let open = MaintenanceRequest {
            duration_secs: None,
            ..request
        };
        assert!(open.window(now).is_none());
    }

    #[tokio::test]
    async fn test_healthz() {
        let h = harness();
        let response = h.server.build_router().oneshot(get_request("/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: ApiResponse<HealthResponse> = envelope(response).await;
        assert_eq!(body.data.unwrap().status, "ok");
    }

    #[tokio::test]
    async fn test_status_reports_flags() {
        let h = harness();
        let response = h.server.build_router().oneshot(get_request("/api/v1/status")).await.unwrap();
        let body: ApiResponse<StatusResponse> = envelope(response).await;
        let status = body.data.unwrap();
        assert!(status.is_master);
        assert!(status.job_store_healthy);
        assert_eq!(status.jobs, 0);
    }

    #[tokio::test]
    async fn test_list_jobs_filters_by_zone() {
        let h = harness();
        let state = h.server.state();
        state.pool.on_add_leaf("/lb/svc-a", "10.0.0.1:9100", &entry_bytes("10.0.0.1", 9100)).await;
        state.pool.on_add_leaf("/lb/svc-b", "10.0.0.2:9100", &entry_bytes("10.0.0.2", 9100)).await;

        let response = h
            .server
            .build_router()
            .oneshot(json_request(Method::POST, "/api/v1/jobs/list", &slave()))
            .await
            .unwrap();
        let body: ApiResponse<JobList> = envelope(response).await;
        assert_eq!(body.data.unwrap().jobs.len(), 2);

        let other = SlaveInfo::new("slave-2", vec![Zone::new("zoneY")]);
        let response = h
            .server
            .build_router()
            .oneshot(json_request(Method::POST, "/api/v1/jobs/list", &other))
            .await
            .unwrap();
        let body: ApiResponse<JobList> = envelope(response).await;
        assert!(body.data.unwrap().jobs.is_empty());
    }

    #[tokio::test]
    async fn test_list_jobs_rejects_empty_zones() {
        let h = harness();
        let response = h
            .server
            .build_router()
            .oneshot(json_request(Method::POST, "/api/v1/jobs/list", &SlaveInfo::new("slave-1", vec![])))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ApiResponse<JobList> = envelope(response).await;
        assert_eq!(body.code, 400);
    }

    #[tokio::test]
    async fn test_watch_streams_ndjson() {
        let h = harness();
        let state = h.server.state();
        let cancel = CancellationToken::new();
        tokio::spawn(state.pool.clone().run_fanout(cancel.clone()));

        let response = h
            .server
            .build_router()
            .oneshot(json_request(Method::POST, "/api/v1/jobs/watch", &slave()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/x-ndjson");
        assert_eq!(state.pool.subscriber_count(), 1);

        state.pool.on_add_leaf("/lb/svc-a", "10.0.0.1:9100", &entry_bytes("10.0.0.1", 9100)).await;

        let mut frames = response.into_body().into_data_stream();
        let frame = tokio::time::timeout(Duration::from_secs(5), frames.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(frame.ends_with(b"\n"));
        let job: Job = serde_json::from_slice(&frame).unwrap();
        assert_eq!(job.action, JobAction::Add);
        assert_eq!(job.module, "svc-a");
        assert_eq!(job.url, "10.0.0.1:9100");

        drop(frames);
        assert_eq!(state.pool.subscriber_count(), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_report_requires_status() {
        let h = harness();
        let job = Job::new("svc-a", Zone::new("zoneX"), Protocol::Tcp, "10.0.0.1:9100");
        let response = h
            .server
            .build_router()
            .oneshot(json_request(Method::POST, "/api/v1/jobs/report", &job))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let reported = job.with_status(JobStatus {
            slave_info: slave(),
            success: false,
            message: "connection refused".to_string(),
            finished_at: Utc::now(),
        });
        let response = h
            .server
            .build_router()
            .oneshot(json_request(Method::POST, "/api/v1/jobs/report", &reported))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: ApiResponse<serde_json::Value> = envelope(response).await;
        assert!(body.result);
    }

    #[tokio::test]
    async fn test_registry_roundtrip() {
        let h = harness();
        let request = RegistryRequest {
            branch: "/lb/svc-a".to_string(),
            entry: RegistrationEntry::new("10.0.0.1", 9100),
        };
        let response = h
            .server
            .build_router()
            .oneshot(json_request(Method::POST, "/api/v1/registry", &request))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stored = h.coordination.get("/lb/svc-a/10.0.0.1:9100").await.unwrap();
        assert_eq!(RegistrationEntry::from_bytes(&stored).unwrap().port, 9100);

        let delete = RegistryDeleteRequest {
            branch: "/lb/svc-a".to_string(),
            ip: "10.0.0.1".to_string(),
            port: 9100,
        };
        let response = h
            .server
            .build_router()
            .oneshot(json_request(Method::DELETE, "/api/v1/registry", &delete))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = h
            .server
            .build_router()
            .oneshot(json_request(Method::DELETE, "/api/v1/registry", &delete))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_registry_rejects_relative_branch() {
        let h = harness();
        let request = RegistryRequest {
            branch: "lb/svc-a".to_string(),
            entry: RegistrationEntry::new("10.0.0.1", 9100),
        };
        let response = h
            .server
            .build_router()
            .oneshot(json_request(Method::POST, "/api/v1/registry", &request))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_maintenance_set_and_cancel() {
        let h = harness();
        let state = h.server.state();
        let request = MaintenanceRequest {
            cluster: "zoneX".to_string(),
            alarm_name: None,
            reason: "upgrade".to_string(),
            until: None,
            duration_secs: Some(600),
        };

        let response = h
            .server
            .build_router()
            .oneshot(json_request(Method::POST, "/api/v1/maintenance", &request))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let active = state.maintenance.active("zoneX", "any", Utc::now()).await.unwrap();
        assert_eq!(active.unwrap().reason, "upgrade");

        let response = h
            .server
            .build_router()
            .oneshot(json_request(Method::DELETE, "/api/v1/maintenance", &request))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.maintenance.active("zoneX", "any", Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_maintenance_requires_end() {
        let h = harness();
        let request = MaintenanceRequest {
            cluster: "zoneX".to_string(),
            alarm_name: None,
            reason: String::new(),
            until: None,
            duration_secs: None,
        };
        let response = h
            .server
            .build_router()
            .oneshot(json_request(Method::POST, "/api/v1/maintenance", &request))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_platform_health_without_components() {
        let h = harness();
        let response = h
            .server
            .build_router()
            .oneshot(get_request("/api/v1/platform/healthz"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: ApiResponse<crate::platform::PlatformHealth> = envelope(response).await;
        let health = body.data.unwrap();
        assert!(health.components.is_empty());
        assert_eq!(health.state, crate::platform::HealthState::Healthy);
    }
}
