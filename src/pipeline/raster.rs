//! Image export: per-chunk renderer PDFs → one image per output label.
//!
//! ## Why rasterise unique pages only?
//!
//! A 500-copy `^PQ` run is still one renderer page. Rasterising that page
//! once and replaying the encoded bytes for every output position keeps the
//! CPU cost at O(unique labels), the same trade the PDF path makes.
//!
//! ## Why PNG as the intermediate?
//!
//! Lossless. JPEG output is transcoded from the PNG once per unique image, so
//! repeated labels do not accumulate compression artefacts or repeat work.

use crate::archive::ArchiveBuilder;
use crate::config::OutputFormat;
use crate::error::Zpl2PdfError;
use crate::pdf::{PdfEngine, PdfSession};
use crate::pipeline::chunk::ChunkRange;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, warn};

/// A finished image archive.
#[derive(Debug, Clone)]
pub struct ImageArchive {
    pub bytes: Vec<u8>,
    pub entries: usize,
    /// Output positions with no usable image.
    pub skipped: usize,
}

/// Encode a rasterised page as PNG.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// Transcode PNG bytes to JPEG at `quality` (1–100).
///
/// JPEG has no alpha channel, so the image is flattened to RGB first.
pub fn transcode_jpeg(png: &[u8], quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let img = image::load_from_memory_with_format(png, image::ImageFormat::Png)?;
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut buf = Vec::new();
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)))?;
    Ok(buf)
}

/// Rasterise every page of every chunk exactly once.
///
/// Returns one PNG per unique index; `None` where the chunk's PDF could not
/// be loaded or that page could not be rasterised. A bad page costs only its
/// own image. Blocking.
///
/// # Errors
/// Only a failure to open an engine session.
pub fn rasterize_chunks<E: PdfEngine>(
    engine: &E,
    chunk_pdfs: Vec<Vec<u8>>,
    ranges: &[ChunkRange],
    unique_count: usize,
    target_width: u32,
) -> Result<Vec<Option<Vec<u8>>>, Zpl2PdfError> {
    let session = engine.open()?;
    let mut images: Vec<Option<Vec<u8>>> = vec![None; unique_count];

    for (c, (bytes, range)) in chunk_pdfs.into_iter().zip(ranges).enumerate() {
        let doc = match session.load(bytes) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(chunk = c, "Chunk PDF unreadable, {} images unavailable: {}", range.len(), e);
                continue;
            }
        };

        let pages = session.page_count(&doc);
        if pages < range.len() {
            warn!(chunk = c, "Chunk PDF has {} pages, expected {}", pages, range.len());
        }

        for local in 0..pages.min(range.len()) {
            let unique = range.start + local;
            let page = match session.rasterize_page(&doc, local, target_width) {
                Ok(page) => page,
                Err(e) => {
                    warn!(chunk = c, unique, "Rasterisation failed, image unavailable: {}", e);
                    continue;
                }
            };
            match encode_png(&page) {
                Ok(png) => images[unique] = Some(png),
                Err(e) => warn!(unique, "PNG encoding failed: {}", e),
            }
        }
        debug!("Rasterised chunk {} ({} pages)", c, pages);
    }

    Ok(images)
}

/// Run [`rasterize_chunks`] on the blocking thread pool.
pub async fn render_images<E: PdfEngine>(
    engine: Arc<E>,
    chunk_pdfs: Vec<Vec<u8>>,
    ranges: Vec<ChunkRange>,
    unique_count: usize,
    target_width: u32,
) -> Result<Vec<Option<Vec<u8>>>, Zpl2PdfError> {
    tokio::task::spawn_blocking(move || {
        rasterize_chunks(engine.as_ref(), chunk_pdfs, &ranges, unique_count, target_width)
    })
    .await
    .map_err(|e| Zpl2PdfError::Internal(format!("Rasterisation task panicked: {}", e)))?
}

/// Archive entry name for 0-based output `position`.
pub fn entry_name(position: usize, format: OutputFormat) -> String {
    format!("label_{:04}.{}", position + 1, format.image_extension())
}

/// Replay `sequence` over the unique images and pack them into a `.tar.gz`.
///
/// Unavailable or untranscodable images are skipped (logged once per unique
/// image) and their positions counted in [`ImageArchive::skipped`].
///
/// # Errors
/// * [`Zpl2PdfError::InvalidConfig`] for [`OutputFormat::Pdf`].
/// * [`Zpl2PdfError::EmptyDocument`] when no entry could be written.
/// * [`Zpl2PdfError::ArchiveFailed`] if the archive itself fails.
pub fn package_images(
    sequence: &[usize],
    uniques: &[Option<Vec<u8>>],
    format: OutputFormat,
    jpeg_quality: u8,
) -> Result<ImageArchive, Zpl2PdfError> {
    if format == OutputFormat::Pdf {
        return Err(Zpl2PdfError::InvalidConfig(
            "Image packaging requires png or jpeg output".into(),
        ));
    }

    // Index-aligned with `uniques`: outer None = not encoded yet.
    let mut encoded: Vec<Option<Option<Vec<u8>>>> = vec![None; uniques.len()];
    let mut archive = ArchiveBuilder::new();
    let mut skipped = 0usize;

    for (position, &unique) in sequence.iter().enumerate() {
        let slot = encoded.get_mut(unique).ok_or_else(|| {
            Zpl2PdfError::Internal(format!("unique index {unique} has no image slot"))
        })?;
        let bytes = slot
            .get_or_insert_with(|| encode_unique(unique, &uniques[unique], format, jpeg_quality));

        match bytes.as_deref() {
            Some(bytes) => archive.append(&entry_name(position, format), bytes)?,
            None => skipped += 1,
        }
    }

    if archive.is_empty() {
        return Err(Zpl2PdfError::EmptyDocument {
            expected: sequence.len(),
            skipped,
        });
    }

    let entries = archive.len();
    let bytes = archive.finish()?;
    debug!(
        format = %format,
        entries,
        skipped,
        "Packaged image archive ({} bytes)",
        bytes.len()
    );

    Ok(ImageArchive {
        bytes,
        entries,
        skipped,
    })
}

fn encode_unique(
    unique: usize,
    png: &Option<Vec<u8>>,
    format: OutputFormat,
    jpeg_quality: u8,
) -> Option<Vec<u8>> {
    let Some(png) = png else {
        warn!(unique, "No rendered image for label; skipping its copies");
        return None;
    };
    match format {
        OutputFormat::Jpeg => match transcode_jpeg(png, jpeg_quality) {
            Ok(jpeg) => Some(jpeg),
            Err(e) => {
                warn!(unique, "JPEG transcoding failed, skipping its copies: {}", e);
                None
            }
        },
        _ => Some(png.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::read_entries;
    use crate::pdf::fake::{pdf_of, FakeEngine};
    use crate::pipeline::chunk::plan_chunks;
    use image::{Rgba, RgbaImage};

    fn png(shade: u8) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([shade, 0, 0, 255])));
        encode_png(&img).unwrap()
    }

    #[test]
    fn entry_names_are_one_based_and_padded() {
        assert_eq!(entry_name(0, OutputFormat::Png), "label_0001.png");
        assert_eq!(entry_name(41, OutputFormat::Jpeg), "label_0042.jpg");
        assert_eq!(entry_name(12_344, OutputFormat::Png), "label_12345.png");
    }

    #[test]
    fn png_archive_replays_sequence() {
        let uniques = vec![Some(png(10)), Some(png(20))];
        let archive = package_images(&[1, 0, 1], &uniques, OutputFormat::Png, 85).unwrap();
        assert_eq!(archive.entries, 3);
        assert_eq!(archive.skipped, 0);

        let entries = read_entries(&archive.bytes).unwrap();
        let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["label_0001.png", "label_0002.png", "label_0003.png"]);
        assert_eq!(entries[0].1, uniques[1].clone().unwrap());
        assert_eq!(entries[1].1, uniques[0].clone().unwrap());
    }

    #[test]
    fn jpeg_archive_holds_jpeg_data() {
        let uniques = vec![Some(png(200))];
        let archive = package_images(&[0, 0], &uniques, OutputFormat::Jpeg, 90).unwrap();
        let entries = read_entries(&archive.bytes).unwrap();
        assert_eq!(entries[0].0, "label_0001.jpg");
        assert_eq!(&entries[0].1[..2], &[0xFF, 0xD8], "JPEG SOI marker");
        assert_eq!(entries[0].1, entries[1].1, "transcoded once, replayed");
    }

    #[test]
    fn bad_image_is_skipped_and_counted() {
        let uniques = vec![Some(png(1)), Some(b"not a png".to_vec()), None];
        let archive = package_images(&[0, 1, 2, 1, 0], &uniques, OutputFormat::Jpeg, 85).unwrap();
        assert_eq!(archive.entries, 2);
        assert_eq!(archive.skipped, 3);

        let names: Vec<String> = read_entries(&archive.bytes)
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["label_0001.jpg", "label_0005.jpg"]);
    }

    #[test]
    fn nothing_usable_is_empty_document() {
        let err = package_images(&[0, 0], &[None], OutputFormat::Png, 85).unwrap_err();
        assert!(matches!(err, Zpl2PdfError::EmptyDocument { expected: 2, skipped: 2 }));
    }

    #[test]
    fn pdf_format_is_rejected() {
        assert!(package_images(&[0], &[Some(png(1))], OutputFormat::Pdf, 85).is_err());
    }

    #[test]
    fn chunks_rasterised_into_unique_slots() {
        let ranges = plan_chunks(5, 2);
        let pdfs = vec![
            pdf_of(&["U0", "U1"]),
            b"<html>502 Bad Gateway</html>".to_vec(),
            pdf_of(&["U4"]),
        ];
        let images = rasterize_chunks(&FakeEngine, pdfs, &ranges, 5, 100).unwrap();
        let present: Vec<bool> = images.iter().map(Option::is_some).collect();
        assert_eq!(present, vec![true, true, false, false, true]);
    }

    #[test]
    fn unrenderable_page_does_not_cost_its_neighbours() {
        let ranges = plan_chunks(5, 3);
        let pdfs = vec![pdf_of(&["U0", "BROKEN", "U2"]), pdf_of(&["U3", "U4"])];
        let images = rasterize_chunks(&FakeEngine, pdfs, &ranges, 5, 100).unwrap();
        let present: Vec<bool> = images.iter().map(Option::is_some).collect();
        assert_eq!(present, vec![true, false, true, true, true]);

        let archive = package_images(&[2, 1, 0, 1], &images, OutputFormat::Png, 85).unwrap();
        assert_eq!(archive.entries, 2);
        assert_eq!(archive.skipped, 2);
    }
}
