//! Error types for the zpl2pdf library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`Zpl2PdfError`] — **Fatal** for the conversion it belongs to: no valid
//!   labels, a renderer failure, nothing left to assemble, a failed archive.
//!   Returned as `Err(Zpl2PdfError)` from the `convert*` and batch entry
//!   points.
//!
//! * [`RenderError`] — what a [`crate::renderer::Renderer`] reports for one
//!   call. The dispatcher classifies it into the matching fatal variant
//!   (`PayloadTooLarge` or `RendererUnavailable`) before handing it back.
//!
//! Degradation inside reconstruction (one chunk failing to load) is not an
//! error at all: it is logged and counted in
//! [`crate::output::ConversionStats::skipped_units`].

use crate::collab::DenialReason;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the zpl2pdf library.
#[derive(Debug, Error)]
pub enum Zpl2PdfError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The submitted text was empty or whitespace only.
    #[error("ZPL input is empty")]
    EmptyInput,

    /// No `^XA … ^XZ` block was found in the submitted text.
    #[error("No valid ZPL label blocks found (expected at least one ^XA … ^XZ)")]
    NoValidBlocks,

    /// The expanded label count exceeds the configured ceiling.
    #[error("Document expands to {total} labels, limit is {limit}")]
    TooManyLabels { total: usize, limit: usize },

    /// A label size string could not be parsed.
    #[error("Invalid label size '{input}': expected <width>x<height> in inches, e.g. 4x6")]
    InvalidLabelSize { input: String },

    // ── Capacity errors ───────────────────────────────────────────────────
    /// A payload reached the dispatcher with more labels than the renderer
    /// accepts per call. Indicates a chunking bug, never retried.
    #[error("Chunk for job {job_id} carries {found} labels, renderer cap is {cap}")]
    LabelCapExceeded {
        job_id: String,
        found: usize,
        cap: usize,
    },

    /// The renderer rejected the payload as too large.
    #[error("Renderer rejected payload for job {job_id} as too large ({label_count} labels)")]
    PayloadTooLarge { job_id: String, label_count: usize },

    // ── Transient external errors ─────────────────────────────────────────
    /// Renderer timeout, rate limit, 5xx or network failure.
    #[error("Renderer unavailable{}: {detail}", http_status(.status))]
    RendererUnavailable { status: Option<u16>, detail: String },

    // ── Reconstruction errors ─────────────────────────────────────────────
    /// Every chunk was unavailable or the assembled output had no pages.
    #[error("Assembled document is empty: {skipped} of {expected} output units were unavailable")]
    EmptyDocument { expected: usize, skipped: usize },

    /// A PDF engine operation failed outside the tolerated per-chunk paths.
    #[error("PDF engine error: {0}")]
    Engine(String),

    // ── Aggregation errors ────────────────────────────────────────────────
    /// Building an output archive failed.
    #[error("Failed to build archive: {0}")]
    ArchiveFailed(String),

    /// The storage collaborator rejected an upload or signing request.
    #[error("Storage error: {0}")]
    StorageFailed(String),

    // ── Usage errors ──────────────────────────────────────────────────────
    /// The usage collaborator denied the conversion before any render work.
    #[error("Conversion denied for user {user_id}: {reason} ({used}/{limit} labels used)")]
    UsageDenied {
        user_id: String,
        reason: DenialReason,
        used: u64,
        limit: u64,
    },

    // ── Dispatcher errors ─────────────────────────────────────────────────
    /// The dispatcher shut down before the request was admitted.
    #[error("Render dispatcher closed before job {job_id} was served")]
    DispatcherClosed { job_id: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Zpl2PdfError {
    /// Whether a caller-side retry has a reasonable chance of succeeding.
    ///
    /// Only transient renderer failures qualify; everything else is either a
    /// bad input, a contract violation, or a local fault.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Zpl2PdfError::RendererUnavailable { .. })
    }
}

fn http_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

/// The outcome of a single failed renderer call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    /// HTTP 413 or equivalent: the payload carried too many labels.
    #[error("payload too large")]
    PayloadTooLarge,

    /// Timeout, rate limit, server error or network failure.
    #[error("{detail}")]
    Transient { status: Option<u16>, detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renderer_unavailable_display_with_status() {
        let e = Zpl2PdfError::RendererUnavailable {
            status: Some(503),
            detail: "service unavailable".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("HTTP 503"), "got: {msg}");
        assert!(msg.contains("service unavailable"));
    }

    #[test]
    fn renderer_unavailable_display_without_status() {
        let e = Zpl2PdfError::RendererUnavailable {
            status: None,
            detail: "timed out".into(),
        };
        assert_eq!(e.to_string(), "Renderer unavailable: timed out");
    }

    #[test]
    fn only_transient_errors_are_retriable() {
        assert!(Zpl2PdfError::RendererUnavailable {
            status: Some(429),
            detail: "rate limited".into()
        }
        .is_retriable());
        assert!(!Zpl2PdfError::PayloadTooLarge {
            job_id: "j".into(),
            label_count: 51
        }
        .is_retriable());
        assert!(!Zpl2PdfError::NoValidBlocks.is_retriable());
    }

    #[test]
    fn label_cap_display() {
        let e = Zpl2PdfError::LabelCapExceeded {
            job_id: "job-1".into(),
            found: 51,
            cap: 50,
        };
        let msg = e.to_string();
        assert!(msg.contains("51"));
        assert!(msg.contains("50"));
        assert!(msg.contains("job-1"));
    }

    #[test]
    fn usage_denied_display() {
        let e = Zpl2PdfError::UsageDenied {
            user_id: "u1".into(),
            reason: DenialReason::MonthlyLimitReached,
            used: 100,
            limit: 100,
        };
        let msg = e.to_string();
        assert!(msg.contains("u1"));
        assert!(msg.contains("100/100"));
    }
}
