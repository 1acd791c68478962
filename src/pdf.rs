//! PDF engine: load, copy, save and rasterise pages.
//!
//! Reconstruction and image export only need a handful of document
//! operations, so they are written against [`PdfEngine`] rather than pdfium
//! directly. [`PdfiumEngine`] is the production implementation; tests use a
//! small in-memory engine so the ordering logic can be exercised without the
//! native library.
//!
//! ## Engines and sessions
//!
//! A [`PdfEngine`] is a cheap, shareable handle. The document operations
//! live on a [`PdfSession`] which the engine opens on the thread that does
//! the work, inside `tokio::task::spawn_blocking`. A pdfium session owns the
//! bound library and every document it loads borrows from it, so neither
//! crosses threads.
//!
//! pdfium is located through `PDFIUM_LIB_PATH` (a directory or a full
//! library path), then the system library search path.

use crate::error::Zpl2PdfError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

/// A failed engine operation. Reconstruction treats these per chunk.
#[derive(Debug, Error)]
#[error("{op} failed: {detail}")]
pub struct EngineError {
    pub op: &'static str,
    pub detail: String,
}

impl EngineError {
    pub fn new(op: &'static str, detail: impl Into<String>) -> Self {
        Self {
            op,
            detail: detail.into(),
        }
    }
}

impl From<EngineError> for Zpl2PdfError {
    fn from(e: EngineError) -> Self {
        Zpl2PdfError::Engine(e.to_string())
    }
}

/// A shareable handle that opens document sessions.
pub trait PdfEngine: Send + Sync + 'static {
    type Session: PdfSession;

    /// Open a session on the current thread.
    ///
    /// # Errors
    /// [`Zpl2PdfError::PdfiumBindingFailed`] if the native library cannot be
    /// bound.
    fn open(&self) -> Result<Self::Session, Zpl2PdfError>;
}

/// The document operations the pipeline needs.
///
/// Documents borrow from the session that produced them.
pub trait PdfSession {
    type Document<'s>
    where
        Self: 's;

    /// Parse a PDF from bytes.
    fn load<'s>(&'s self, bytes: Vec<u8>) -> Result<Self::Document<'s>, EngineError>;

    /// A new, empty document.
    fn create<'s>(&'s self) -> Result<Self::Document<'s>, EngineError>;

    fn page_count<'s>(&'s self, doc: &Self::Document<'s>) -> usize;

    /// Append `pages` of `src` (0-based, duplicates allowed, in the given
    /// order) to the end of `dest` in a single operation.
    fn copy_pages<'s>(
        &'s self,
        dest: &mut Self::Document<'s>,
        src: &Self::Document<'s>,
        pages: &[usize],
    ) -> Result<(), EngineError>;

    /// Append the contiguous page range `range` of `src` to the end of `dest`.
    fn copy_range<'s>(
        &'s self,
        dest: &mut Self::Document<'s>,
        src: &Self::Document<'s>,
        range: Range<usize>,
    ) -> Result<(), EngineError>;

    /// Serialise a document to PDF bytes.
    fn save<'s>(&'s self, doc: &Self::Document<'s>) -> Result<Vec<u8>, EngineError>;

    /// Rasterise page `index` (0-based), scaled to `target_width` pixels.
    fn rasterize_page<'s>(
        &'s self,
        doc: &Self::Document<'s>,
        index: usize,
        target_width: u32,
    ) -> Result<DynamicImage, EngineError>;
}

/// pdfium initialises and tears down process-global state; one session at a
/// time.
static SESSION_LOCK: Mutex<()> = Mutex::new(());

/// Accept either a directory holding the platform library or the file itself.
fn library_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        Pdfium::pdfium_platform_library_name_at_path(path)
    } else {
        path.to_path_buf()
    }
}

/// pdfium-backed engine. Holds only the library location.
#[derive(Debug, Clone, Default)]
pub struct PdfiumEngine {
    lib_path: Option<PathBuf>,
}

impl PdfiumEngine {
    /// Resolve the library from `PDFIUM_LIB_PATH` (or the system search
    /// path) and check that it binds.
    pub fn new() -> Result<Self, Zpl2PdfError> {
        let engine = Self {
            lib_path: std::env::var_os("PDFIUM_LIB_PATH").map(|p| library_path(Path::new(&p))),
        };
        engine.open()?;
        Ok(engine)
    }

    /// Use the library at `path` (a directory or the library file).
    pub fn with_library(path: impl AsRef<Path>) -> Self {
        Self {
            lib_path: Some(library_path(path.as_ref())),
        }
    }

    fn bind(&self) -> Result<Pdfium, Zpl2PdfError> {
        let bindings = match &self.lib_path {
            Some(path) => {
                info!("Binding pdfium from {}", path.display());
                Pdfium::bind_to_library(path)
            }
            None => {
                debug!("PDFIUM_LIB_PATH not set, binding system pdfium");
                Pdfium::bind_to_system_library()
            }
        }
        .map_err(|e| Zpl2PdfError::PdfiumBindingFailed(format!("{:?}", e)))?;
        Ok(Pdfium::new(bindings))
    }
}

impl PdfEngine for PdfiumEngine {
    type Session = PdfiumSession;

    fn open(&self) -> Result<PdfiumSession, Zpl2PdfError> {
        let guard = SESSION_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(PdfiumSession {
            pdfium: self.bind()?,
            _guard: guard,
        })
    }
}

/// A bound pdfium library, usable on the thread that opened it.
pub struct PdfiumSession {
    // Dropped before the guard is released.
    pdfium: Pdfium,
    _guard: MutexGuard<'static, ()>,
}

impl std::fmt::Debug for PdfiumSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PdfiumSession")
    }
}

fn page_index(i: usize, op: &'static str) -> Result<PdfPageIndex, EngineError> {
    PdfPageIndex::try_from(i).map_err(|_| EngineError::new(op, format!("page {i} out of range")))
}

impl PdfSession for PdfiumSession {
    type Document<'s>
        = PdfDocument<'s>
    where
        Self: 's;

    fn load<'s>(&'s self, bytes: Vec<u8>) -> Result<PdfDocument<'s>, EngineError> {
        self.pdfium
            .load_pdf_from_byte_vec(bytes, None)
            .map_err(|e| EngineError::new("load", format!("{:?}", e)))
    }

    fn create<'s>(&'s self) -> Result<PdfDocument<'s>, EngineError> {
        self.pdfium
            .create_new_pdf()
            .map_err(|e| EngineError::new("create", format!("{:?}", e)))
    }

    fn page_count<'s>(&'s self, doc: &PdfDocument<'s>) -> usize {
        doc.pages().len() as usize
    }

    fn copy_pages<'s>(
        &'s self,
        dest: &mut PdfDocument<'s>,
        src: &PdfDocument<'s>,
        pages: &[usize],
    ) -> Result<(), EngineError> {
        if pages.is_empty() {
            return Ok(());
        }
        // pdfium takes a 1-based page list; repeats are copied repeatedly.
        let list = pages
            .iter()
            .map(|p| (p + 1).to_string())
            .collect::<Vec<_>>()
            .join(",");
        let at = page_index(self.page_count(dest), "copy_pages")?;
        dest.pages_mut()
            .copy_pages_from_document(src, &list, at)
            .map_err(|e| EngineError::new("copy_pages", format!("{:?}", e)))
    }

    fn copy_range<'s>(
        &'s self,
        dest: &mut PdfDocument<'s>,
        src: &PdfDocument<'s>,
        range: Range<usize>,
    ) -> Result<(), EngineError> {
        if range.is_empty() {
            return Ok(());
        }
        let first = page_index(range.start, "copy_range")?;
        let last = page_index(range.end - 1, "copy_range")?;
        let at = page_index(self.page_count(dest), "copy_range")?;
        dest.pages_mut()
            .copy_page_range_from_document(src, first..=last, at)
            .map_err(|e| EngineError::new("copy_range", format!("{:?}", e)))
    }

    fn save<'s>(&'s self, doc: &PdfDocument<'s>) -> Result<Vec<u8>, EngineError> {
        doc.save_to_bytes()
            .map_err(|e| EngineError::new("save", format!("{:?}", e)))
    }

    fn rasterize_page<'s>(
        &'s self,
        doc: &PdfDocument<'s>,
        index: usize,
        target_width: u32,
    ) -> Result<DynamicImage, EngineError> {
        let render_config = PdfRenderConfig::new().set_target_width(target_width as i32);
        let page = doc
            .pages()
            .get(page_index(index, "rasterize")?)
            .map_err(|e| EngineError::new("rasterize", format!("page {}: {:?}", index + 1, e)))?;
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| EngineError::new("rasterize", format!("page {}: {:?}", index + 1, e)))?;
        let image = bitmap.as_image();
        debug!(
            "Rasterised page {} → {}x{} px",
            index + 1,
            image.width(),
            image.height()
        );
        Ok(image)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Line-based stand-in for a PDF engine.
    //!
    //! A "PDF" is UTF-8 text, one page label per line, prefixed with
    //! `%FAKEPDF`. Anything else fails to load. The engine is its own
    //! session.

    use super::*;
    use image::{Rgba, RgbaImage};

    const MAGIC: &str = "%FAKEPDF";

    #[derive(Debug, Default, Clone, Copy)]
    pub struct FakeEngine;

    pub fn pdf_of(pages: &[&str]) -> Vec<u8> {
        let mut text = String::from(MAGIC);
        for p in pages {
            text.push('\n');
            text.push_str(p);
        }
        text.into_bytes()
    }

    pub fn pages_of(bytes: &[u8]) -> Vec<String> {
        let text = String::from_utf8_lossy(bytes);
        text.lines().skip(1).map(str::to_string).collect()
    }

    impl PdfEngine for FakeEngine {
        type Session = FakeEngine;

        fn open(&self) -> Result<FakeEngine, Zpl2PdfError> {
            Ok(FakeEngine)
        }
    }

    impl PdfSession for FakeEngine {
        type Document<'s>
            = Vec<String>
        where
            Self: 's;

        fn load<'s>(&'s self, bytes: Vec<u8>) -> Result<Vec<String>, EngineError> {
            let text =
                String::from_utf8(bytes).map_err(|e| EngineError::new("load", e.to_string()))?;
            if !text.starts_with(MAGIC) {
                return Err(EngineError::new("load", "not a PDF"));
            }
            Ok(text.lines().skip(1).map(str::to_string).collect())
        }

        fn create<'s>(&'s self) -> Result<Vec<String>, EngineError> {
            Ok(Vec::new())
        }

        fn page_count<'s>(&'s self, doc: &Vec<String>) -> usize {
            doc.len()
        }

        fn copy_pages<'s>(
            &'s self,
            dest: &mut Vec<String>,
            src: &Vec<String>,
            pages: &[usize],
        ) -> Result<(), EngineError> {
            for &p in pages {
                let page = src
                    .get(p)
                    .ok_or_else(|| EngineError::new("copy_pages", format!("no page {p}")))?;
                dest.push(page.clone());
            }
            Ok(())
        }

        fn copy_range<'s>(
            &'s self,
            dest: &mut Vec<String>,
            src: &Vec<String>,
            range: Range<usize>,
        ) -> Result<(), EngineError> {
            let pages = src
                .get(range.clone())
                .ok_or_else(|| EngineError::new("copy_range", format!("bad range {range:?}")))?;
            dest.extend_from_slice(pages);
            Ok(())
        }

        fn save<'s>(&'s self, doc: &Vec<String>) -> Result<Vec<u8>, EngineError> {
            let pages: Vec<&str> = doc.iter().map(String::as_str).collect();
            Ok(pdf_of(&pages))
        }

        /// A 2×2 image; the red channel encodes the label's trailing digits
        /// so tests can tell images apart. Labels containing `BROKEN` fail.
        fn rasterize_page<'s>(
            &'s self,
            doc: &Vec<String>,
            index: usize,
            _target_width: u32,
        ) -> Result<DynamicImage, EngineError> {
            let label = doc
                .get(index)
                .ok_or_else(|| EngineError::new("rasterize", format!("no page {index}")))?;
            if label.contains("BROKEN") {
                return Err(EngineError::new("rasterize", "unrenderable page"));
            }
            let shade = label
                .chars()
                .filter(char::is_ascii_digit)
                .collect::<String>()
                .parse::<u8>()
                .unwrap_or(0);
            Ok(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
                2,
                2,
                Rgba([shade, 0, 0, 255]),
            )))
        }
    }
}
