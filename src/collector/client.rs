//! HTTP client slaves use to talk to the master
//!
//! List and report calls are plain JSON requests wrapped in the master's
//! response envelope; the watch call returns a newline-delimited JSON
//! stream of jobs that stays open until either side disconnects.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::source::{JobSource, JobStream};
use crate::models::{Job, SlaveInfo};
use crate::server::api::{ApiResponse, JobList};
use crate::store::StoreError;
use crate::utils::retry::{with_retry_if, RetrySchedule};

// ============================================================================
// Client Errors
// ============================================================================

/// Errors talking to the master
#[derive(Debug, Error)]
pub enum ClientError {
    /// The HTTP client could not be built
    #[error("initialization error: {0}")]
    Init(String),

    /// Transport failure
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The master answered with an error envelope or status
    #[error("HTTP error ({status}): {message}")]
    Http { status: u16, message: String },

    /// The master answered with something that is not a valid payload
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// In-process source failed to persist a report
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ClientError {
    /// Transport failures and server-side errors are worth retrying
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            Self::Store(e) => e.is_recoverable(),
            Self::Init(_) | Self::InvalidResponse(_) => false,
        }
    }
}

// ============================================================================
// Client Configuration
// ============================================================================

/// Configuration for the master client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Master server URL
    pub master_url: String,

    /// Timeout for list and report requests
    pub timeout: Duration,

    /// Connect timeout for the long-lived watch request
    pub connect_timeout: Duration,

    /// Retry count for failed requests
    pub retry_count: u32,

    /// Retry delay
    pub retry_delay: Duration,
}

impl ClientConfig {
    /// Create a new client config
    pub fn new(master_url: impl Into<String>) -> Self {
        Self {
            master_url: master_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            retry_count: 3,
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Set timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set retry count and delay
    pub fn with_retry(mut self, count: u32, delay: Duration) -> Self {
        self.retry_count = count;
        self.retry_delay = delay;
        self
    }
}

// ============================================================================
// Master Client
// ============================================================================

/// Client for the master's job API
pub struct MasterClient {
    config: ClientConfig,
    http_client: Client,
    stream_client: Client,
    schedule: RetrySchedule,
}

impl MasterClient {
    /// Create a new master client
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClientError::Init(e.to_string()))?;
        // No overall timeout: the watch response never completes on its own
        let stream_client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ClientError::Init(e.to_string()))?;

        Ok(Self {
            schedule: RetrySchedule::fixed(config.retry_delay, config.retry_count),
            config,
            http_client,
            stream_client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.config.master_url)
    }

    async fn post_once<B: Serialize, R: DeserializeOwned>(&self, url: &str, body: &B) -> Result<Option<R>, ClientError> {
        let response = self.http_client.post(url).json(body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        let envelope: ApiResponse<R> = serde_json::from_str(&text).map_err(|e| {
            if status.is_success() {
                ClientError::InvalidResponse(e.to_string())
            } else {
                ClientError::Http {
                    status: status.as_u16(),
                    message: text.clone(),
                }
            }
        })?;

        if !envelope.result || !status.is_success() {
            return Err(ClientError::Http {
                status: status.as_u16(),
                message: envelope.message,
            });
        }
        Ok(envelope.data)
    }

    // Internal: POST request with retry
    async fn post_with_retry<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Option<R>, ClientError> {
        let url = self.endpoint(path);
        with_retry_if(&self.schedule, |_| self.post_once(&url, body), ClientError::is_recoverable).await
    }
}

/// Split a chunked body into newline-delimited jobs
fn job_lines(response: reqwest::Response) -> JobStream {
    struct Lines {
        response: Option<reqwest::Response>,
        buffer: Vec<u8>,
    }

    let state = Lines {
        response: Some(response),
        buffer: Vec::new(),
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                let line = line.trim_ascii();
                if line.is_empty() {
                    continue;
                }
                let job = serde_json::from_slice::<Job>(line).map_err(|e| ClientError::InvalidResponse(e.to_string()));
                return Some((job, state));
            }

            let response = state.response.as_mut()?;
            match response.chunk().await {
                Ok(Some(bytes)) => state.buffer.extend_from_slice(&bytes),
                Ok(None) => {
                    state.response = None;
                    if !state.buffer.is_empty() {
                        state.buffer.push(b'\n');
                    }
                }
                Err(e) => {
                    state.response = None;
                    state.buffer.clear();
                    return Some((Err(ClientError::Network(e)), state));
                }
            }
        }
    })
    .boxed()
}

#[async_trait]
impl JobSource for MasterClient {
    fn name(&self) -> &str {
        &self.config.master_url
    }

    async fn watch_jobs(&self, slave: &SlaveInfo) -> Result<JobStream, ClientError> {
        let response = self
            .stream_client
            .post(self.endpoint("/api/v1/jobs/watch"))
            .json(slave)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Http {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        debug!(master = %self.config.master_url, "Job watch stream opened");
        Ok(job_lines(response))
    }

    async fn list_jobs(&self, slave: &SlaveInfo) -> Result<Vec<Job>, ClientError> {
        let list: Option<JobList> = self.post_with_retry("/api/v1/jobs/list", slave).await?;
        list.map(|l| l.jobs)
            .ok_or_else(|| ClientError::InvalidResponse("missing job list".to_string()))
    }

    async fn report_job(&self, job: &Job) -> Result<(), ClientError> {
        let _: Option<serde_json::Value> = self.post_with_retry("/api/v1/jobs/report", job).await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobAction, Protocol, Zone};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> MasterClient {
        let config = ClientConfig::new(server.uri()).with_retry(2, Duration::from_millis(10));
        MasterClient::new(config).unwrap()
    }

    fn slave() -> SlaveInfo {
        SlaveInfo::new("slave-1", vec![Zone::new("zoneX")])
    }

    #[test]
    fn test_client_config_creation() {
        let config = ClientConfig::new("http://localhost:8080/").with_timeout(Duration::from_secs(30));
        assert_eq!(config.master_url, "http://localhost:8080");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.retry_count, 3);
    }

    #[test]
    fn test_error_recoverability() {
        let server_error = ClientError::Http {
            status: 503,
            message: String::new(),
        };
        assert!(server_error.is_recoverable());
        let bad_request = ClientError::Http {
            status: 400,
            message: String::new(),
        };
        assert!(!bad_request.is_recoverable());
        assert!(!ClientError::InvalidResponse("x".into()).is_recoverable());
    }

    #[tokio::test]
    async fn test_list_jobs() {
        let server = MockServer::start().await;
        let job = Job::new("svc-a", Zone::new("zoneX"), Protocol::Tcp, "10.0.0.1:9100");
        Mock::given(method("POST"))
            .and(path("/api/v1/jobs/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": true, "code": 0, "message": "ok", "data": {"jobs": [job]}
            })))
            .mount(&server)
            .await;

        let jobs = client(&server).list_jobs(&slave()).await.unwrap();
        assert_eq!(jobs, vec![job]);
    }

    #[tokio::test]
    async fn test_report_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/jobs/report"))
            .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({
                "result": false, "code": 503, "message": "store down"
            })))
            .expect(3)
            .mount(&server)
            .await;

        let job = Job::new("svc-a", Zone::new("zoneX"), Protocol::Tcp, "10.0.0.1:9100");
        let err = client(&server).report_job(&job).await.unwrap_err();
        assert!(matches!(err, ClientError::Http { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_report_does_not_retry_rejections() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/jobs/report"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "result": false, "code": 400, "message": "no status"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let job = Job::new("svc-a", Zone::new("zoneX"), Protocol::Tcp, "10.0.0.1:9100");
        let err = client(&server).report_job(&job).await.unwrap_err();
        assert!(matches!(err, ClientError::Http { status: 400, ref message } if message == "no status"));
    }

    #[tokio::test]
    async fn test_watch_parses_job_lines() {
        let server = MockServer::start().await;
        let add = Job::new("svc-a", Zone::new("zoneX"), Protocol::Tcp, "10.0.0.1:9100");
        let delete = add.with_action(JobAction::Delete);
        let body = format!(
            "{}\n\n{}\nnot-json\n{}",
            serde_json::to_string(&add).unwrap(),
            serde_json::to_string(&delete).unwrap(),
            serde_json::to_string(&add).unwrap()
        );
        Mock::given(method("POST"))
            .and(path("/api/v1/jobs/watch"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let items: Vec<_> = client(&server).watch_jobs(&slave()).await.unwrap().collect().await;
        assert_eq!(items.len(), 4);
        assert_eq!(items[0].as_ref().unwrap(), &add);
        assert_eq!(items[1].as_ref().unwrap().action, JobAction::Delete);
        assert!(matches!(items[2], Err(ClientError::InvalidResponse(_))));
        // Trailing line without a newline is still delivered
        assert_eq!(items[3].as_ref().unwrap(), &add);
    }

    #[tokio::test]
    async fn test_watch_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/jobs/watch"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let result = client(&server).watch_jobs(&slave()).await;
        assert!(matches!(result, Err(ClientError::Http { status: 503, .. })));
    }
}
