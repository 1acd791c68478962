//! Batch orchestration: many ZPL files → per-file jobs → one archive.
//!
//! ## Flow
//!
//! ```text
//! files ──▶ FileJob (pending) ──▶ convert ──▶ temp artifact ──┐
//!             … up to `batch_concurrency` at a time …         ├─▶ .tar.gz ─▶ store
//! files ──▶ FileJob (pending) ──▶ convert ──▶ (failed) ───────┘
//! ```
//!
//! The whole batch is checked against the [`UsageGate`] before any file is
//! queued, and each completed file is recorded against it.
//!
//! A file's renderer or assembly error is recorded on its [`FileJob`] and
//! never stops the batch. Once every file is terminal, the successful
//! artifacts are packed in submission order, the archive is stored, and the
//! per-file temp directory is removed whether or not that worked.
//!
//! The batch record is written to the [`JobStore`] on every transition so a
//! client can poll it.

use crate::archive::{ArchiveBuilder, ARCHIVE_CONTENT_TYPE};
use crate::collab::{
    record_in_background, ObjectStore, SignedUrl, StoredObject, UsageDecision, UsageGate,
    UsageRecord,
};
use crate::config::{LabelSize, OutputFormat};
use crate::convert::{inspect, ConvertOptions, Converter};
use crate::dispatch::PlanTier;
use crate::error::Zpl2PdfError;
use crate::jobs::JobStore;
use crate::pdf::PdfEngine;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Aggregate state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Processing,
    Completed,
    Partial,
    Failed,
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchStatus::Processing => write!(f, "processing"),
            BatchStatus::Completed => write!(f, "completed"),
            BatchStatus::Partial => write!(f, "partial"),
            BatchStatus::Failed => write!(f, "failed"),
        }
    }
}

/// State of one file inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Per-file record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileJob {
    pub job_id: String,
    pub file_name: String,
    pub status: FileStatus,
    /// 0–100.
    pub progress: u8,
    pub error: Option<String>,
    /// Where the file's artifact waits for aggregation; cleared on cleanup.
    pub temp_path: Option<PathBuf>,
    /// Output labels produced (0 until completed).
    pub label_count: usize,
}

/// Durable record of a multi-file run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: String,
    pub user_id: String,
    pub status: BatchStatus,
    pub files: Vec<FileJob>,
    pub archive: Option<StoredObject>,
    pub download: Option<SignedUrl>,
    /// Set when aggregation or storage failed.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchJob {
    pub fn completed_files(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.status == FileStatus::Completed)
            .count()
    }

    /// `completed` iff every file completed, `failed` iff none did.
    pub fn aggregate_status(files: &[FileJob]) -> BatchStatus {
        let done = files
            .iter()
            .filter(|f| f.status == FileStatus::Completed)
            .count();
        match done {
            0 => BatchStatus::Failed,
            n if n == files.len() => BatchStatus::Completed,
            _ => BatchStatus::Partial,
        }
    }
}

/// One input file.
#[derive(Debug, Clone)]
pub struct BatchFile {
    pub name: String,
    pub zpl: String,
}

/// A multi-file conversion request.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub user_id: String,
    pub tier: PlanTier,
    pub files: Vec<BatchFile>,
    pub format: Option<OutputFormat>,
    pub label_size: Option<LabelSize>,
}

/// Drives the single-document pipeline over a batch.
pub struct BatchOrchestrator<E: PdfEngine> {
    converter: Arc<Converter<E>>,
    storage: Arc<dyn ObjectStore>,
    usage: Arc<dyn UsageGate>,
    jobs: Arc<dyn JobStore>,
}

impl<E: PdfEngine> BatchOrchestrator<E> {
    pub fn new(
        converter: Arc<Converter<E>>,
        storage: Arc<dyn ObjectStore>,
        usage: Arc<dyn UsageGate>,
        jobs: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            converter,
            storage,
            usage,
            jobs,
        }
    }

    /// Process every file and produce the aggregate archive.
    ///
    /// # Returns
    /// The final [`BatchJob`]; its status is `failed` (with no archive) when
    /// no file succeeded.
    ///
    /// # Errors
    /// * [`Zpl2PdfError::UsageDenied`] if the batch's total label count is
    ///   refused; nothing is queued or recorded.
    /// * [`Zpl2PdfError::ArchiveFailed`] or [`Zpl2PdfError::StorageFailed`]
    ///   when aggregation fails; the stored record is marked `failed` first.
    /// * [`Zpl2PdfError::OutputWriteFailed`] if the temp directory cannot be
    ///   created.
    pub async fn run(&self, request: BatchRequest) -> Result<BatchJob, Zpl2PdfError> {
        self.check_usage(&request).await?;

        let now = Utc::now();
        let batch = BatchJob {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: request.user_id.clone(),
            status: BatchStatus::Processing,
            files: request
                .files
                .iter()
                .map(|f| FileJob {
                    job_id: uuid::Uuid::new_v4().to_string(),
                    file_name: f.name.clone(),
                    status: FileStatus::Pending,
                    progress: 0,
                    error: None,
                    temp_path: None,
                    label_count: 0,
                })
                .collect(),
            archive: None,
            download: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        let batch_id = batch.id.clone();
        info!(batch_id = %batch_id, files = batch.files.len(), "Starting batch");

        let temp_root = self
            .converter
            .config()
            .temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&temp_root).map_err(|e| Zpl2PdfError::OutputWriteFailed {
            path: temp_root.clone(),
            source: e,
        })?;
        let temp_dir = tempfile::Builder::new()
            .prefix(&format!("zpl2pdf-{batch_id}-"))
            .tempdir_in(&temp_root)
            .map_err(|e| Zpl2PdfError::OutputWriteFailed {
                path: temp_root.clone(),
                source: e,
            })?;

        let state = Mutex::new(batch);
        self.snapshot(&*state.lock().await).await;

        // ── Per-file conversions ─────────────────────────────────────────
        let concurrency = self.converter.config().batch_concurrency.max(1);
        let conversions: Vec<_> = request
            .files
            .iter()
            .enumerate()
            .map(|(i, file)| self.process_file(&state, i, file, &request, temp_dir.path()))
            .collect();
        stream::iter(conversions)
            .buffer_unordered(concurrency)
            .collect::<Vec<()>>()
            .await;

        // ── Aggregate, then clean up regardless ──────────────────────────
        let mut batch = state.into_inner();
        let aggregated = self.aggregate(&batch).await;

        let temp_path = temp_dir.path().to_path_buf();
        if let Err(e) = temp_dir.close() {
            warn!(batch_id = %batch_id, "Failed to remove {}: {}", temp_path.display(), e);
        }
        for file in &mut batch.files {
            file.temp_path = None;
        }

        batch.updated_at = Utc::now();
        match aggregated {
            Ok(Some((object, download))) => {
                batch.status = BatchJob::aggregate_status(&batch.files);
                batch.archive = Some(object);
                batch.download = Some(download);
            }
            Ok(None) => batch.status = BatchStatus::Failed,
            Err(e) => {
                warn!(batch_id = %batch_id, "Batch aggregation failed: {}", e);
                batch.status = BatchStatus::Failed;
                batch.error = Some(e.to_string());
                self.snapshot(&batch).await;
                return Err(e);
            }
        }
        self.snapshot(&batch).await;

        info!(
            batch_id = %batch_id,
            status = %batch.status,
            "Batch finished: {}/{} files completed",
            batch.completed_files(),
            batch.files.len()
        );
        Ok(batch)
    }

    /// Ask the usage gate about the whole batch at once.
    ///
    /// Files that fail inspection count zero; they fail on their own later
    /// without reaching the renderer.
    async fn check_usage(&self, request: &BatchRequest) -> Result<(), Zpl2PdfError> {
        let config = self.converter.config();
        let label_count: usize = request
            .files
            .iter()
            .filter_map(|f| inspect(&f.zpl, config).ok())
            .map(|plan| plan.dedup.total_labels())
            .sum();

        match self.usage.can_convert(&request.user_id, label_count).await? {
            UsageDecision::Allowed => Ok(()),
            UsageDecision::Denied {
                reason,
                used,
                limit,
            } => {
                warn!(
                    user_id = %request.user_id,
                    reason = %reason,
                    files = request.files.len(),
                    labels = label_count,
                    used,
                    limit,
                    "Batch denied"
                );
                Err(Zpl2PdfError::UsageDenied {
                    user_id: request.user_id.clone(),
                    reason,
                    used,
                    limit,
                })
            }
        }
    }

    /// Latest stored record of a batch.
    pub async fn status(&self, batch_id: &str) -> Result<Option<BatchJob>, Zpl2PdfError> {
        self.jobs.get_batch(batch_id).await
    }

    async fn process_file(
        &self,
        state: &Mutex<BatchJob>,
        index: usize,
        file: &BatchFile,
        request: &BatchRequest,
        temp_dir: &Path,
    ) {
        let job_id = {
            let mut batch = state.lock().await;
            let job = &mut batch.files[index];
            job.status = FileStatus::Processing;
            job.progress = 10;
            let id = job.job_id.clone();
            self.snapshot(&batch).await;
            id
        };

        let mut opts = ConvertOptions::new(&job_id, &request.user_id, request.tier);
        opts.format = request.format;
        opts.label_size = request.label_size;

        let result = match self.converter.convert_document(&file.zpl, &opts).await {
            Ok(output) => {
                let path = temp_dir.join(format!("{}.{}", job_id, output.format.artifact_extension()));
                match tokio::fs::write(&path, &output.bytes).await {
                    Ok(()) => {
                        record_in_background(
                            Arc::clone(&self.usage),
                            UsageRecord {
                                user_id: request.user_id.clone(),
                                tier: request.tier,
                                job_id: job_id.clone(),
                                label_count: output.stats.total_labels,
                                output_format: output.format,
                                completed_at: Utc::now(),
                            },
                        );
                        Ok((path, output.stats.output_units))
                    }
                    Err(e) => Err(format!("failed to write temp artifact: {e}")),
                }
            }
            Err(e) => Err(e.to_string()),
        };

        let mut batch = state.lock().await;
        let job = &mut batch.files[index];
        match result {
            Ok((path, labels)) => {
                job.status = FileStatus::Completed;
                job.progress = 100;
                job.temp_path = Some(path);
                job.label_count = labels;
            }
            Err(msg) => {
                warn!(job_id = %job_id, file = %file.name, "Batch file failed: {}", msg);
                job.status = FileStatus::Failed;
                job.error = Some(msg);
            }
        }
        batch.updated_at = Utc::now();
        self.snapshot(&batch).await;
    }

    /// Pack completed artifacts in submission order and store the archive.
    ///
    /// `Ok(None)` when nothing succeeded.
    async fn aggregate(
        &self,
        batch: &BatchJob,
    ) -> Result<Option<(StoredObject, SignedUrl)>, Zpl2PdfError> {
        let completed: Vec<(usize, &FileJob, &Path)> = batch
            .files
            .iter()
            .enumerate()
            .filter(|(_, f)| f.status == FileStatus::Completed)
            .filter_map(|(i, f)| f.temp_path.as_deref().map(|p| (i, f, p)))
            .collect();
        if completed.is_empty() {
            return Ok(None);
        }

        let mut entries = Vec::with_capacity(completed.len());
        for (i, file, path) in completed {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| Zpl2PdfError::ArchiveFailed(format!("{}: {e}", path.display())))?;
            entries.push((entry_name(i, &file.file_name, path), bytes));
        }

        let archive = tokio::task::spawn_blocking(move || {
            let mut builder = ArchiveBuilder::new();
            for (name, bytes) in &entries {
                builder.append(name, bytes)?;
            }
            builder.finish()
        })
        .await
        .map_err(|e| Zpl2PdfError::Internal(format!("Archive task panicked: {}", e)))??;

        let object = self.storage.put(archive, ARCHIVE_CONTENT_TYPE).await?;
        let ttl = Duration::from_secs(self.converter.config().signed_url_ttl_secs);
        let download = self.storage.sign(&object, ttl).await?;
        Ok(Some((object, download)))
    }

    async fn snapshot(&self, batch: &BatchJob) {
        if let Err(e) = self.jobs.put_batch(batch.clone()).await {
            warn!(batch_id = %batch.id, "Failed to write batch status: {}", e);
        }
    }
}

/// `NN_<stem>.<ext>`, numbered from 1 in submission order.
fn entry_name(index: usize, file_name: &str, artifact: &Path) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().replace(['/', '\\'], "_"))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "file".to_string());
    let ext = artifact
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.split_once('.'))
        .map(|(_, ext)| ext)
        .unwrap_or("bin");
    format!("{:02}_{}.{}", index + 1, stem, ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(status: FileStatus) -> FileJob {
        FileJob {
            job_id: "j".into(),
            file_name: "f.zpl".into(),
            status,
            progress: 0,
            error: None,
            temp_path: None,
            label_count: 0,
        }
    }

    #[test]
    fn aggregate_status_rules() {
        use FileStatus::*;
        assert_eq!(
            BatchJob::aggregate_status(&[file(Completed), file(Completed)]),
            BatchStatus::Completed
        );
        assert_eq!(
            BatchJob::aggregate_status(&[file(Completed), file(Failed)]),
            BatchStatus::Partial
        );
        assert_eq!(
            BatchJob::aggregate_status(&[file(Failed), file(Failed)]),
            BatchStatus::Failed
        );
        assert_eq!(BatchJob::aggregate_status(&[]), BatchStatus::Failed);
    }

    #[test]
    fn entry_names_are_numbered_and_keep_stem() {
        let pdf = Path::new("/tmp/x/abc-123.pdf");
        let tgz = Path::new("/tmp/x/abc-123.tar.gz");
        assert_eq!(entry_name(0, "orders.zpl", pdf), "01_orders.pdf");
        assert_eq!(entry_name(11, "returns.txt", tgz), "12_returns.tar.gz");
        assert_eq!(entry_name(2, "", pdf), "03_file.pdf");
    }

    #[test]
    fn batch_status_serialises_lowercase() {
        assert_eq!(serde_json::to_string(&BatchStatus::Partial).unwrap(), "\"partial\"");
    }
}
