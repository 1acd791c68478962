//! Single-document conversion: raw ZPL → PDF or image archive.
//!
//! ```text
//! raw ZPL ─▶ parse ─▶ dedup ─▶ chunk ─▶ dispatcher ─▶ reconstruct ─▶ PDF
//!                                          │
//!                                          └────────▶ rasterise ─▶ .tar.gz
//! ```
//!
//! Every chunk of a document is queued with the dispatcher at once, so the
//! whole document holds its place in line and the reported queue position
//! covers the best-placed chunk. Any renderer failure fails the conversion;
//! the dispatcher does not retry and neither does this layer.

use crate::config::{LabelSize, OutputFormat, ServiceConfig};
use crate::dispatch::{PlanTier, RenderDispatcher, RenderJob};
use crate::error::Zpl2PdfError;
use crate::output::{ConversionOutput, ConversionStats};
use crate::pdf::PdfEngine;
use crate::pipeline::chunk::{plan_chunks, ChunkRange};
use crate::pipeline::parse::{deduplicate, parse_blocks, total_copies, DedupResult};
use crate::pipeline::raster::{package_images, render_images};
use crate::pipeline::reconstruct::{assemble, ReconstructionPlan};
use crate::progress::ProgressCallback;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Per-conversion options. Anything left `None` falls back to the
/// [`ServiceConfig`] the converter was built with.
#[derive(Clone)]
pub struct ConvertOptions {
    pub job_id: String,
    pub user_id: String,
    pub tier: PlanTier,
    pub format: Option<OutputFormat>,
    pub label_size: Option<LabelSize>,
    pub progress: Option<ProgressCallback>,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            user_id: "local".to_string(),
            tier: PlanTier::default(),
            format: None,
            label_size: None,
            progress: None,
        }
    }
}

impl std::fmt::Debug for ConvertOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvertOptions")
            .field("job_id", &self.job_id)
            .field("user_id", &self.user_id)
            .field("tier", &self.tier)
            .field("format", &self.format)
            .field("label_size", &self.label_size)
            .field("progress", &self.progress.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

impl ConvertOptions {
    pub fn new(job_id: impl Into<String>, user_id: impl Into<String>, tier: PlanTier) -> Self {
        Self {
            job_id: job_id.into(),
            user_id: user_id.into(),
            tier,
            ..Self::default()
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_label_size(mut self, size: LabelSize) -> Self {
        self.label_size = Some(size);
        self
    }

    pub fn with_progress(mut self, cb: ProgressCallback) -> Self {
        self.progress = Some(cb);
        self
    }
}

/// Parse, deduplicate and chunk a document without rendering anything.
#[derive(Debug, Clone)]
pub struct DocumentPlan {
    /// `^XA … ^XZ` blocks found in the input.
    pub blocks: usize,
    pub dedup: DedupResult,
    pub ranges: Vec<ChunkRange>,
}

/// Serializable view of a [`DocumentPlan`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub blocks: usize,
    pub total_labels: usize,
    pub unique_labels: usize,
    pub chunks: usize,
    pub largest_chunk: usize,
}

impl DocumentPlan {
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            blocks: self.blocks,
            total_labels: self.dedup.total_labels(),
            unique_labels: self.dedup.unique.len(),
            chunks: self.ranges.len(),
            largest_chunk: self.ranges.iter().map(ChunkRange::len).max().unwrap_or(0),
        }
    }
}

/// Run the local stages (parse → dedup → chunk) on `raw`.
///
/// # Errors
/// * [`Zpl2PdfError::EmptyInput`] — blank input.
/// * [`Zpl2PdfError::NoValidBlocks`] — no label block found.
/// * [`Zpl2PdfError::TooManyLabels`] — `Σ copies` exceeds `max_labels`.
///   Checked before the expansion sequence is built.
pub fn inspect(raw: &str, config: &ServiceConfig) -> Result<DocumentPlan, Zpl2PdfError> {
    if raw.trim().is_empty() {
        return Err(Zpl2PdfError::EmptyInput);
    }

    let blocks = parse_blocks(raw)?;
    let total = total_copies(&blocks);
    if total > config.max_labels {
        return Err(Zpl2PdfError::TooManyLabels {
            total,
            limit: config.max_labels,
        });
    }

    let dedup = deduplicate(&blocks);
    let ranges = plan_chunks(dedup.unique.len(), config.label_cap);
    debug!(
        "Planned {} chunks for {} unique / {} total labels",
        ranges.len(),
        dedup.unique.len(),
        dedup.total_labels()
    );

    Ok(DocumentPlan {
        blocks: blocks.len(),
        dedup,
        ranges,
    })
}

/// Converts documents through a shared dispatcher.
pub struct Converter<E: PdfEngine> {
    dispatcher: RenderDispatcher,
    engine: Arc<E>,
    config: Arc<ServiceConfig>,
}

impl<E: PdfEngine> Converter<E> {
    pub fn new(dispatcher: RenderDispatcher, engine: Arc<E>, config: Arc<ServiceConfig>) -> Self {
        Self {
            dispatcher,
            engine,
            config,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &RenderDispatcher {
        &self.dispatcher
    }

    /// Convert one document to the requested (or configured) format.
    ///
    /// # Returns
    /// `Ok` even when some chunks could not be assembled; check
    /// `stats.skipped_units`.
    ///
    /// # Errors
    /// Input errors from [`inspect`], any renderer failure from the
    /// dispatcher, and [`Zpl2PdfError::EmptyDocument`] when nothing could be
    /// assembled.
    pub async fn convert_document(
        &self,
        raw: &str,
        opts: &ConvertOptions,
    ) -> Result<ConversionOutput, Zpl2PdfError> {
        let total_start = Instant::now();
        let format = opts.format.unwrap_or(self.config.output_format);
        let label_size = opts.label_size.unwrap_or(self.config.label_size);
        info!(
            job_id = %opts.job_id,
            format = %format,
            label_size = %label_size,
            "Starting conversion"
        );

        // ── Step 1: Parse, dedup, chunk ──────────────────────────────────
        let plan = inspect(raw, &self.config)?;

        // ── Step 2: Render every chunk through the dispatcher ────────────
        let render_start = Instant::now();
        let chunk_pdfs = self.render_chunks(&plan, opts, label_size).await?;
        let render_duration_ms = render_start.elapsed().as_millis() as u64;

        // ── Step 3: Assemble the output ──────────────────────────────────
        let assemble_start = Instant::now();
        let (bytes, output_units, skipped_units) = match format {
            OutputFormat::Pdf => {
                let rplan = ReconstructionPlan::build(&plan.dedup.sequence, &plan.ranges)?;
                let doc = assemble(Arc::clone(&self.engine), chunk_pdfs, rplan).await?;
                (doc.bytes, doc.page_count, doc.skipped_pages)
            }
            OutputFormat::Png | OutputFormat::Jpeg => {
                let images = render_images(
                    Arc::clone(&self.engine),
                    chunk_pdfs,
                    plan.ranges.clone(),
                    plan.dedup.unique.len(),
                    self.config.raster_width_px,
                )
                .await?;
                let sequence = plan.dedup.sequence.clone();
                let quality = self.config.jpeg_quality;
                let archive = tokio::task::spawn_blocking(move || {
                    package_images(&sequence, &images, format, quality)
                })
                .await
                .map_err(|e| Zpl2PdfError::Internal(format!("Packaging task panicked: {}", e)))??;
                (archive.bytes, archive.entries, archive.skipped)
            }
        };
        let assemble_duration_ms = assemble_start.elapsed().as_millis() as u64;

        let stats = ConversionStats {
            total_labels: plan.dedup.total_labels(),
            unique_labels: plan.dedup.unique.len(),
            chunks: plan.ranges.len(),
            renderer_calls: plan.ranges.len(),
            output_units,
            skipped_units,
            render_duration_ms,
            assemble_duration_ms,
            total_duration_ms: total_start.elapsed().as_millis() as u64,
        };

        info!(
            job_id = %opts.job_id,
            "Conversion complete: {}/{} labels, {} renderer calls, {}ms total",
            stats.output_units,
            stats.total_labels,
            stats.renderer_calls,
            stats.total_duration_ms
        );

        Ok(ConversionOutput {
            bytes,
            format,
            stats,
        })
    }

    /// Convert to PNG or JPEG images packed in a `.tar.gz`.
    pub async fn export_images(
        &self,
        raw: &str,
        format: OutputFormat,
        opts: &ConvertOptions,
    ) -> Result<ConversionOutput, Zpl2PdfError> {
        if format == OutputFormat::Pdf {
            return Err(Zpl2PdfError::InvalidConfig(
                "export_images requires png or jpeg".into(),
            ));
        }
        let opts = ConvertOptions {
            format: Some(format),
            ..opts.clone()
        };
        self.convert_document(raw, &opts).await
    }

    /// Convert and write the artifact directly to a file.
    ///
    /// Uses atomic write (temp file + rename) to prevent partial files.
    pub async fn convert_to_file(
        &self,
        raw: &str,
        output_path: impl AsRef<Path>,
        opts: &ConvertOptions,
    ) -> Result<ConversionStats, Zpl2PdfError> {
        let output = self.convert_document(raw, opts).await?;
        write_atomic(output_path.as_ref(), &output.bytes).await?;
        Ok(output.stats)
    }

    /// Queue every chunk, then wait for all of them in chunk order.
    async fn render_chunks(
        &self,
        plan: &DocumentPlan,
        opts: &ConvertOptions,
        label_size: LabelSize,
    ) -> Result<Vec<Vec<u8>>, Zpl2PdfError> {
        let total = plan.ranges.len();
        if let Some(ref cb) = opts.progress {
            cb.on_conversion_start(total);
        }

        // Collected up front so the stream owns its futures outright.
        let calls: Vec<_> = plan
            .ranges
            .iter()
            .enumerate()
            .map(|(i, range)| {
                let job = RenderJob {
                    job_id: opts.job_id.clone(),
                    user_id: opts.user_id.clone(),
                    tier: opts.tier,
                    zpl: plan.dedup.payload(range.start, range.end),
                    label_size,
                    label_count: range.len(),
                };
                let dispatcher = self.dispatcher.clone();
                let cb = opts.progress.clone();
                async move {
                    let chunk_num = i + 1;
                    if let Some(ref cb) = cb {
                        cb.on_chunk_start(chunk_num, total, job.label_count);
                    }
                    let result = dispatcher.enqueue(job).await;
                    if let Some(ref cb) = cb {
                        match &result {
                            Ok(pdf) => cb.on_chunk_complete(chunk_num, total, pdf.len()),
                            Err(e) => cb.on_chunk_error(chunk_num, total, &e.to_string()),
                        }
                    }
                    result
                }
            })
            .collect();

        let results: Vec<Result<Vec<u8>, Zpl2PdfError>> =
            stream::iter(calls).buffered(total.max(1)).collect().await;

        let rendered = results.iter().filter(|r| r.is_ok()).count();
        if let Some(ref cb) = opts.progress {
            cb.on_conversion_complete(total, rendered);
        }
        results.into_iter().collect()
    }
}

/// Write `bytes` to `path` via a sibling temp file and a rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), Zpl2PdfError> {
    let write_err = |e| Zpl2PdfError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let tmp_path = tmp_sibling(path);
    tokio::fs::write(&tmp_path, bytes).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}
