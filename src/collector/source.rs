//! Where a collector gets its jobs from and sends its reports to

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

use super::client::ClientError;
use crate::models::{Job, SlaveInfo};
use crate::pool::JobPool;
use crate::store::JobStore;

/// Live job change stream; an `Err` item that is recoverable ends the watch
pub type JobStream = BoxStream<'static, Result<Job, ClientError>>;

/// Master-side job protocol as seen by a slave
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Source name used in logs
    fn name(&self) -> &str;

    /// Open a stream of job changes for `slave`'s zones
    async fn watch_jobs(&self, slave: &SlaveInfo) -> Result<JobStream, ClientError>;

    /// Snapshot of every job in `slave`'s zones
    async fn list_jobs(&self, slave: &SlaveInfo) -> Result<Vec<Job>, ClientError>;

    /// Upload one probe outcome
    async fn report_job(&self, job: &Job) -> Result<(), ClientError>;
}

/// Source wired directly to a master's pool and job store
///
/// Used when master and slave share a process, and in tests.
pub struct InProcessSource {
    pool: Arc<JobPool>,
    store: Arc<JobStore>,
}

impl InProcessSource {
    pub fn new(pool: Arc<JobPool>, store: Arc<JobStore>) -> Self {
        Self { pool, store }
    }
}

#[async_trait]
impl JobSource for InProcessSource {
    fn name(&self) -> &str {
        "in-process"
    }

    async fn watch_jobs(&self, slave: &SlaveInfo) -> Result<JobStream, ClientError> {
        Ok(self.pool.subscribe(slave).map(Ok).boxed())
    }

    async fn list_jobs(&self, slave: &SlaveInfo) -> Result<Vec<Job>, ClientError> {
        Ok(self.pool.list_jobs(&slave.zones))
    }

    async fn report_job(&self, job: &Job) -> Result<(), ClientError> {
        self.store.report(job).await?;
        Ok(())
    }
}
