//! Gzipped tar archives for image exports and batch results.
//!
//! Entries are written with fixed metadata (mode 0644, mtime 0) so the same
//! inputs always produce the same archive bytes.

use crate::error::Zpl2PdfError;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Read;

/// Content type of every archive this module produces.
pub const ARCHIVE_CONTENT_TYPE: &str = "application/gzip";

/// In-memory `.tar.gz` writer.
pub struct ArchiveBuilder {
    builder: tar::Builder<GzEncoder<Vec<u8>>>,
    entries: usize,
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        let gz = GzEncoder::new(Vec::new(), Compression::default());
        Self {
            builder: tar::Builder::new(gz),
            entries: 0,
        }
    }

    /// Append one regular file.
    pub fn append(&mut self, name: &str, bytes: &[u8]) -> Result<(), Zpl2PdfError> {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();

        self.builder
            .append_data(&mut header, name, bytes)
            .map_err(|e| Zpl2PdfError::ArchiveFailed(format!("entry '{name}': {e}")))?;
        self.entries += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Finish the tar stream and the gzip trailer.
    pub fn finish(self) -> Result<Vec<u8>, Zpl2PdfError> {
        let gz = self
            .builder
            .into_inner()
            .map_err(|e| Zpl2PdfError::ArchiveFailed(e.to_string()))?;
        gz.finish()
            .map_err(|e| Zpl2PdfError::ArchiveFailed(e.to_string()))
    }
}

/// Read every entry of a `.tar.gz` archive as `(name, bytes)`, in order.
pub fn read_entries(archive_bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>, Zpl2PdfError> {
    use flate2::read::GzDecoder;
    use tar::Archive;

    let mut archive = Archive::new(GzDecoder::new(archive_bytes));
    let mut out = Vec::new();

    for entry in archive
        .entries()
        .map_err(|e| Zpl2PdfError::ArchiveFailed(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| Zpl2PdfError::ArchiveFailed(e.to_string()))?;
        let name = entry
            .path()
            .map_err(|e| Zpl2PdfError::ArchiveFailed(e.to_string()))?
            .to_string_lossy()
            .into_owned();
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| Zpl2PdfError::ArchiveFailed(format!("entry '{name}': {e}")))?;
        out.push((name, bytes));
    }

    Ok(out)
}
