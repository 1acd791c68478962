//! Job-status records and the store they are polled from.
//!
//! Conversions run as background tasks; clients poll a [`JobStatus`] (one
//! document) or a [`BatchJob`] (many files) by id. The store is injected, so a
//! host can back it with a shared cache. [`InMemoryJobStore`] serves a
//! single process.

use crate::batch::BatchJob;
use crate::collab::{SignedUrl, StoredObject};
use crate::error::Zpl2PdfError;
use crate::output::ConversionStats;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;

/// Lifecycle of one conversion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Processing => write!(f, "processing"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// Where a finished job's artifact can be fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub object: StoredObject,
    pub download: SignedUrl,
    pub stats: ConversionStats,
}

/// Pollable status of one conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub user_id: String,
    pub status: JobState,
    /// 0–100.
    pub progress: u8,
    pub result: Option<JobResult>,
    pub error: Option<String>,
    /// Filled in at read time from the dispatcher.
    pub queue_position: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobStatus {
    pub fn pending(job_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            user_id: user_id.into(),
            status: JobState::Pending,
            progress: 0,
            result: None,
            error: None,
            queue_position: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn processing(mut self, progress: u8) -> Self {
        self.status = JobState::Processing;
        self.progress = progress.min(99);
        self.updated_at = Utc::now();
        self
    }

    pub fn completed(mut self, result: JobResult) -> Self {
        self.status = JobState::Completed;
        self.progress = 100;
        self.result = Some(result);
        self.error = None;
        self.updated_at = Utc::now();
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.status = JobState::Failed;
        self.error = Some(error.into());
        self.updated_at = Utc::now();
        self
    }
}

/// Job and batch records, keyed by id.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn put_job(&self, status: JobStatus) -> Result<(), Zpl2PdfError>;

    async fn get_job(&self, job_id: &str) -> Result<Option<JobStatus>, Zpl2PdfError>;

    async fn put_batch(&self, batch: BatchJob) -> Result<(), Zpl2PdfError>;

    async fn get_batch(&self, batch_id: &str) -> Result<Option<BatchJob>, Zpl2PdfError>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<String, JobStatus>>,
    batches: RwLock<HashMap<String, BatchJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn put_job(&self, status: JobStatus) -> Result<(), Zpl2PdfError> {
        self.jobs.write().await.insert(status.job_id.clone(), status);
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobStatus>, Zpl2PdfError> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn put_batch(&self, batch: BatchJob) -> Result<(), Zpl2PdfError> {
        self.batches.write().await.insert(batch.id.clone(), batch);
        Ok(())
    }

    async fn get_batch(&self, batch_id: &str) -> Result<Option<BatchJob>, Zpl2PdfError> {
        Ok(self.batches.read().await.get(batch_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn job_status_lifecycle_is_stored() {
        let store = InMemoryJobStore::new();
        let status = JobStatus::pending("job-1", "user-1");
        store.put_job(status.clone()).await.unwrap();
        assert_eq!(
            store.get_job("job-1").await.unwrap().unwrap().status,
            JobState::Pending
        );

        store.put_job(status.failed("renderer down")).await.unwrap();
        let read = store.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(read.status, JobState::Failed);
        assert!(read.status.is_terminal());
        assert_eq!(read.error.as_deref(), Some("renderer down"));
        assert!(store.get_job("job-2").await.unwrap().is_none());
    }

    #[test]
    fn processing_never_reports_done() {
        let status = JobStatus::pending("j", "u").processing(100);
        assert_eq!(status.progress, 99);
        assert_eq!(status.status, JobState::Processing);
    }

    #[test]
    fn status_serialises_lowercase() {
        let json = serde_json::to_value(JobStatus::pending("j", "u")).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["progress"], 0);
    }
}
