//! Progress-callback trait for per-chunk conversion events.
//!
//! Inject an [`Arc<dyn ConversionProgressCallback>`] via
//! [`crate::convert::ConvertOptions::progress`] to receive events as each
//! chunk goes through the render dispatcher.
//!
//! # Why callbacks instead of channels?
//!
//! Callers can forward events to a job-status record, a WebSocket or a
//! terminal progress bar without the library knowing how the host
//! application communicates. The trait is `Send + Sync` because chunks of one
//! document are dispatched concurrently.
//!
//! # Example
//!
//! ```rust
//! use zpl2pdf::ConversionProgressCallback;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct CountingCallback {
//!     rendered: AtomicUsize,
//! }
//!
//! impl ConversionProgressCallback for CountingCallback {
//!     fn on_chunk_complete(&self, chunk_num: usize, total_chunks: usize, pdf_len: usize) {
//!         self.rendered.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("Chunk {}/{} rendered ({} bytes)", chunk_num, total_chunks, pdf_len);
//!     }
//! }
//! ```

use std::sync::Arc;

/// Called by the conversion pipeline as it dispatches each chunk.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
///
/// # Thread safety
///
/// `on_chunk_start`, `on_chunk_complete` and `on_chunk_error` may be called
/// concurrently from different tasks. Protect shared mutable state with
/// `Mutex` or atomics.
pub trait ConversionProgressCallback: Send + Sync {
    /// Called once before any chunk is dispatched.
    fn on_conversion_start(&self, total_chunks: usize) {
        let _ = total_chunks;
    }

    /// Called just before a chunk is queued with the dispatcher.
    ///
    /// # Arguments
    /// * `chunk_num`    — 1-indexed chunk number
    /// * `total_chunks` — chunks in the document
    /// * `label_count`  — unique labels in this chunk
    fn on_chunk_start(&self, chunk_num: usize, total_chunks: usize, label_count: usize) {
        let _ = (chunk_num, total_chunks, label_count);
    }

    /// Called when the renderer returned a PDF for the chunk.
    fn on_chunk_complete(&self, chunk_num: usize, total_chunks: usize, pdf_len: usize) {
        let _ = (chunk_num, total_chunks, pdf_len);
    }

    /// Called when a chunk's render call failed.
    fn on_chunk_error(&self, chunk_num: usize, total_chunks: usize, error: &str) {
        let _ = (chunk_num, total_chunks, error);
    }

    /// Called once after every chunk has been attempted.
    ///
    /// # Arguments
    /// * `total_chunks` — chunks in the document
    /// * `rendered`     — chunks the renderer returned successfully
    fn on_conversion_complete(&self, total_chunks: usize, rendered: usize) {
        let _ = (total_chunks, rendered);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in
/// [`crate::convert::ConvertOptions`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        errors: AtomicUsize,
        started_total: AtomicUsize,
        rendered_total: AtomicUsize,
    }

    impl ConversionProgressCallback for TrackingCallback {
        fn on_conversion_start(&self, total_chunks: usize) {
            self.started_total.store(total_chunks, Ordering::SeqCst);
        }

        fn on_chunk_start(&self, _chunk_num: usize, _total_chunks: usize, _label_count: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_chunk_complete(&self, _chunk_num: usize, _total_chunks: usize, _pdf_len: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_chunk_error(&self, _chunk_num: usize, _total_chunks: usize, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_conversion_complete(&self, _total_chunks: usize, rendered: usize) {
            self.rendered_total.store(rendered, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_conversion_start(2);
        cb.on_chunk_start(1, 2, 50);
        cb.on_chunk_complete(1, 2, 4096);
        cb.on_chunk_error(2, 2, "renderer timed out");
        cb.on_conversion_complete(2, 1);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();

        tracker.on_conversion_start(3);
        tracker.on_chunk_start(1, 3, 50);
        tracker.on_chunk_complete(1, 3, 1000);
        tracker.on_chunk_start(2, 3, 50);
        tracker.on_chunk_complete(2, 3, 1000);
        tracker.on_chunk_start(3, 3, 7);
        tracker.on_chunk_error(3, 3, "HTTP 503");
        tracker.on_conversion_complete(3, 2);

        assert_eq!(tracker.started_total.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.starts.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.rendered_total.load(Ordering::SeqCst), 2);
    }
}
