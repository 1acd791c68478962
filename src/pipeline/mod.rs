//! Pipeline stages for ZPL-to-PDF conversion.
//!
//! Each submodule implements exactly one transformation step. Everything
//! here is local and deterministic; the only network stage (the renderer)
//! sits behind [`crate::dispatch`].
//!
//! ## Data Flow
//!
//! ```text
//! parse ──▶ chunk ──▶ (dispatcher) ──▶ reconstruct ──▶ PDF
//! (dedup)   (cap)                  └─▶ raster ──────▶ images
//! ```
//!
//! 1. [`parse`]       — extract `^XA … ^XZ` blocks, normalise, deduplicate
//!    into a unique set plus the expansion sequence
//! 2. [`chunk`]       — split the unique set into renderer-sized windows
//! 3. [`reconstruct`] — rebuild the ordered, duplicate-expanded PDF from
//!    per-chunk renderer output; runs in `spawn_blocking`
//! 4. [`raster`]      — rasterise unique pages once and pack one image per
//!    output label

pub mod chunk;
pub mod parse;
pub mod raster;
pub mod reconstruct;
