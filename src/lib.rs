//! # zpl2pdf
//!
//! Convert ZPL (Zebra Programming Language) label documents to PDF, PNG or
//! JPEG through an external, rate-limited label renderer.
//!
//! ## Why this crate?
//!
//! Label renderers such as Labelary accept a few dozen labels per request and
//! a handful of requests per second, while real shipping documents hold
//! thousands of labels, most of them repeats. This crate renders every
//! distinct label once, funnels every renderer call from every user through
//! one priority queue, and rebuilds the full, correctly ordered document
//! locally.
//!
//! ## Pipeline Overview
//!
//! ```text
//! ZPL text
//!  │
//!  ├─ 1. Parse       extract ^XA…^XZ blocks, normalise, expand ^PQ copies
//!  ├─ 2. Dedup       unique labels + expansion sequence
//!  ├─ 3. Chunk       windows of ≤ label_cap unique labels
//!  ├─ 4. Dispatch    priority queue (tier, arrival) → renderer
//!  ├─ 5. Rebuild     batched page copies → ordered PDF (spawn_blocking)
//!  └─ 6. Export      optional PNG/JPEG images in a .tar.gz
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use zpl2pdf::{
//!     ConvertOptions, Converter, LabelaryRenderer, PdfiumEngine, RenderDispatcher, ServiceConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(ServiceConfig::default());
//!     let renderer = Arc::new(LabelaryRenderer::new(&config)?);
//!     let dispatcher = RenderDispatcher::new(renderer, &config);
//!     let converter = Converter::new(dispatcher, Arc::new(PdfiumEngine::new()?), config);
//!
//!     let zpl = std::fs::read_to_string("labels.zpl")?;
//!     let output = converter.convert_document(&zpl, &ConvertOptions::default()).await?;
//!     std::fs::write("labels.pdf", &output.bytes)?;
//!     eprintln!(
//!         "{} labels, {} unique, {} renderer calls",
//!         output.stats.total_labels, output.stats.unique_labels, output.stats.renderer_calls
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `zpl2pdf` binary (clap + indicatif + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! zpl2pdf = { version = "0.1", default-features = false }
//! ```
//!
//! ## Native dependency
//!
//! PDF assembly and rasterisation use pdfium. Set `PDFIUM_LIB_PATH` to the
//! library (or its directory), or install it on the system library path.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod archive;
pub mod batch;
pub mod collab;
pub mod config;
pub mod convert;
pub mod dispatch;
pub mod error;
pub mod jobs;
pub mod output;
pub mod pdf;
pub mod pipeline;
pub mod progress;
pub mod renderer;
pub mod service;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use batch::{BatchFile, BatchJob, BatchOrchestrator, BatchRequest, BatchStatus, FileJob, FileStatus};
pub use collab::{
    DenialReason, LocalDirStore, ObjectStore, SignedUrl, StoredObject, UnlimitedUsage,
    UsageDecision, UsageGate, UsageRecord,
};
pub use config::{LabelSize, OutputFormat, ServiceConfig, ServiceConfigBuilder};
pub use convert::{inspect, ConvertOptions, Converter, DocumentPlan, PlanSummary};
pub use dispatch::{PlanTier, RenderDispatcher, RenderJob};
pub use error::{RenderError, Zpl2PdfError};
pub use jobs::{InMemoryJobStore, JobState, JobStatus, JobStore};
pub use output::{ConversionOutput, ConversionStats};
pub use pdf::{EngineError, PdfEngine, PdfSession, PdfiumEngine, PdfiumSession};
pub use progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use renderer::{LabelaryRenderer, RenderRequest, Renderer};
pub use service::{ConversionRequest, ConversionService};
