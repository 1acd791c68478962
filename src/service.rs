//! Interactive conversion service: submit, poll, download.
//!
//! Wraps a [`Converter`] with the pieces a hosted deployment needs:
//!
//! 1. a usage check before any render work (denials carry reason + usage);
//! 2. a background task per job, with progress written to the [`JobStore`];
//! 3. upload of the artifact and a signed download URL;
//! 4. a fire-and-forget usage record once the job completes.
//!
//! Queue position is not stored; [`ConversionService::status`] reads it live
//! from the dispatcher while the job is still waiting.

use crate::collab::{record_in_background, ObjectStore, UsageDecision, UsageGate, UsageRecord};
use crate::config::{LabelSize, OutputFormat};
use crate::convert::{inspect, ConvertOptions, Converter};
use crate::dispatch::PlanTier;
use crate::error::Zpl2PdfError;
use crate::jobs::{JobResult, JobStatus, JobStore};
use crate::pdf::PdfEngine;
use crate::progress::ConversionProgressCallback;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// One document submitted for conversion.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub user_id: String,
    pub tier: PlanTier,
    pub zpl: String,
    pub format: Option<OutputFormat>,
    pub label_size: Option<LabelSize>,
}

/// Maps chunk completions onto job progress (5 → 90 %).
struct JobProgress {
    done: AtomicUsize,
    total: AtomicUsize,
    tx: mpsc::UnboundedSender<u8>,
}

impl ConversionProgressCallback for JobProgress {
    fn on_conversion_start(&self, total_chunks: usize) {
        self.total.store(total_chunks, Ordering::SeqCst);
        let _ = self.tx.send(5);
    }

    fn on_chunk_complete(&self, _chunk_num: usize, _total_chunks: usize, _pdf_len: usize) {
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        let total = self.total.load(Ordering::SeqCst).max(1);
        let _ = self.tx.send((5 + done * 85 / total) as u8);
    }
}

/// Submit/poll façade over the conversion pipeline.
pub struct ConversionService<E: PdfEngine> {
    converter: Arc<Converter<E>>,
    storage: Arc<dyn ObjectStore>,
    usage: Arc<dyn UsageGate>,
    jobs: Arc<dyn JobStore>,
}

impl<E: PdfEngine> Clone for ConversionService<E> {
    fn clone(&self) -> Self {
        Self {
            converter: Arc::clone(&self.converter),
            storage: Arc::clone(&self.storage),
            usage: Arc::clone(&self.usage),
            jobs: Arc::clone(&self.jobs),
        }
    }
}

impl<E: PdfEngine> ConversionService<E> {
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

    /// Validate, check usage, record a pending job and start it.
    ///
    /// Returns the job id to poll with [`status`](Self::status).
    ///
    /// # Errors
    /// Input errors (nothing is queued) and [`Zpl2PdfError::UsageDenied`].
    pub async fn submit(&self, request: ConversionRequest) -> Result<String, Zpl2PdfError> {
        let plan = inspect(&request.zpl, self.converter.config())?;
        let label_count = plan.dedup.total_labels();

        if let UsageDecision::Denied {
            reason,
            used,
            limit,
        } = self.usage.can_convert(&request.user_id, label_count).await?
        {
            warn!(
                user_id = %request.user_id,
                reason = %reason,
                used,
                limit,
                "Conversion denied"
            );
            return Err(Zpl2PdfError::UsageDenied {
                user_id: request.user_id,
                reason,
                used,
                limit,
            });
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        self.jobs
            .put_job(JobStatus::pending(&job_id, &request.user_id))
            .await?;

        let service = self.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            service.run_job(id, request).await;
        });

        info!(job_id = %job_id, labels = label_count, "Conversion submitted");
        Ok(job_id)
    }

    /// Run a job to completion and return its terminal status.
    ///
    /// Never fails: errors are recorded on the job.
    pub async fn run_job(&self, job_id: String, request: ConversionRequest) -> JobStatus {
        let base = match self.jobs.get_job(&job_id).await {
            Ok(Some(status)) => status,
            _ => JobStatus::pending(&job_id, &request.user_id),
        };
        self.save(base.clone().processing(0)).await;

        // Progress updates go through a channel so store writes stay ordered.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let writer = {
            let service = self.clone();
            let base = base.clone();
            tokio::spawn(async move {
                while let Some(p) = rx.recv().await {
                    service.save(base.clone().processing(p)).await;
                }
            })
        };

        let mut opts = ConvertOptions::new(&job_id, &request.user_id, request.tier)
            .with_progress(Arc::new(JobProgress {
                done: AtomicUsize::new(0),
                total: AtomicUsize::new(0),
                tx,
            }));
        opts.format = request.format;
        opts.label_size = request.label_size;

        let outcome = self.convert_and_store(&request.zpl, &opts).await;
        drop(opts);
        let _ = writer.await;

        let status = match outcome {
            Ok((result, label_count, format)) => {
                record_in_background(
                    Arc::clone(&self.usage),
                    UsageRecord {
                        user_id: request.user_id.clone(),
                        tier: request.tier,
                        job_id: job_id.clone(),
                        label_count,
                        output_format: format,
                        completed_at: Utc::now(),
                    },
                );
                base.completed(result)
            }
            Err(e) => {
                error!(job_id = %job_id, "Conversion failed: {}", e);
                base.failed(e.to_string())
            }
        };
        self.save(status.clone()).await;
        status
    }

    async fn convert_and_store(
        &self,
        zpl: &str,
        opts: &ConvertOptions,
    ) -> Result<(JobResult, usize, OutputFormat), Zpl2PdfError> {
        let output = self.converter.convert_document(zpl, opts).await?;
        let object = self
            .storage
            .put(output.bytes, output.format.content_type())
            .await?;
        let ttl = Duration::from_secs(self.converter.config().signed_url_ttl_secs);
        let download = self.storage.sign(&object, ttl).await?;
        Ok((
            JobResult {
                object,
                download,
                stats: output.stats.clone(),
            },
            output.stats.total_labels,
            output.format,
        ))
    }

    /// Current job status, with a live queue position while pending.
    pub async fn status(&self, job_id: &str) -> Result<Option<JobStatus>, Zpl2PdfError> {
        let Some(mut status) = self.jobs.get_job(job_id).await? else {
            return Ok(None);
        };
        if !status.status.is_terminal() {
            status.queue_position = self.converter.dispatcher().queue_position(job_id);
        }
        Ok(Some(status))
    }

    /// Status writes are best-effort; a polling client tolerates a stale read.
    async fn save(&self, status: JobStatus) {
        if let Err(e) = self.jobs.put_job(status).await {
            warn!("Failed to write job status: {}", e);
        }
    }
}
