//! Document reconstruction: per-chunk renderer PDFs + expansion sequence →
//! one ordered, duplicate-expanded PDF.
//!
//! ## How it works
//!
//! The renderer only ever saw unique labels, chunk by chunk. Output position
//! `k` needs page `sequence[k] - ranges[c].start` of chunk `c`. Copying pages
//! one at a time would cost one engine call per output page (thousands for a
//! large `^PQ` run), so reconstruction batches instead:
//!
//! 1. **Plan** — group output positions by source chunk. Each chunk gets the
//!    list of local pages it must supply, in output order, duplicates kept.
//! 2. **Stage** — one batched copy per chunk builds a staging document whose
//!    page `i` is exactly the chunk's `i`-th contribution to the output.
//! 3. **Assemble** — walk output positions in order; consecutive positions
//!    served by consecutive staged pages of the same chunk form a run, and
//!    each run is one range copy into the final document.
//!
//! A chunk whose PDF fails to load, is short of pages, or fails to stage is
//! dropped with a warning; its positions are counted as skipped and the rest
//! of the document is still produced. Only a completely empty result is an
//! error.

use crate::error::Zpl2PdfError;
use crate::pdf::{PdfEngine, PdfSession};
use crate::pipeline::chunk::{chunk_for, ChunkRange};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything one chunk contributes to the output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkDemand {
    /// Local page indices in output order (duplicates included).
    pub local_pages: Vec<usize>,
    /// Output positions those pages land at, parallel to `local_pages`.
    pub positions: Vec<usize>,
}

/// A contiguous slice of one chunk's staging document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRun {
    pub chunk: usize,
    pub staged: Range<usize>,
}

/// Output-position → staged-page mapping for one conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconstructionPlan {
    /// One entry per chunk range.
    pub chunks: Vec<ChunkDemand>,
    /// `(chunk, staged page)` for every output position.
    slots: Vec<(usize, usize)>,
}

impl ReconstructionPlan {
    /// Group `sequence` by source chunk.
    ///
    /// # Errors
    /// [`Zpl2PdfError::Internal`] if a sequence entry lies outside every
    /// chunk range, which means the ranges were not planned from the same
    /// unique set.
    pub fn build(sequence: &[usize], ranges: &[ChunkRange]) -> Result<Self, Zpl2PdfError> {
        let mut chunks = vec![ChunkDemand::default(); ranges.len()];
        let mut slots = Vec::with_capacity(sequence.len());

        for (position, &unique) in sequence.iter().enumerate() {
            let (chunk, local) = chunk_for(ranges, unique).ok_or_else(|| {
                Zpl2PdfError::Internal(format!(
                    "unique index {unique} at position {position} is outside the planned chunks"
                ))
            })?;
            let demand = &mut chunks[chunk];
            slots.push((chunk, demand.local_pages.len()));
            demand.local_pages.push(local);
            demand.positions.push(position);
        }

        Ok(Self { chunks, slots })
    }

    /// Output units the plan describes.
    pub fn total(&self) -> usize {
        self.slots.len()
    }

    /// Coalesce output positions into staged-page runs, skipping chunks
    /// flagged unavailable.
    pub fn runs(&self, available: &[bool]) -> Vec<PageRun> {
        let mut runs: Vec<PageRun> = Vec::new();
        for &(chunk, staged) in &self.slots {
            if !available.get(chunk).copied().unwrap_or(false) {
                continue;
            }
            match runs.last_mut() {
                Some(run) if run.chunk == chunk && run.staged.end == staged => {
                    run.staged.end += 1;
                }
                _ => runs.push(PageRun {
                    chunk,
                    staged: staged..staged + 1,
                }),
            }
        }
        runs
    }
}

/// The assembled output document.
#[derive(Debug, Clone)]
pub struct ReconstructedDocument {
    pub bytes: Vec<u8>,
    pub page_count: usize,
    /// Output units lost to unavailable chunks.
    pub skipped_pages: usize,
}

/// Assemble the final PDF from per-chunk renderer output.
///
/// `chunk_pdfs[c]` is the renderer's PDF for chunk `c` of the plan. Opens
/// one engine session for the whole document. This is blocking; use
/// [`assemble`] from async code.
pub fn reconstruct<E: PdfEngine>(
    engine: &E,
    chunk_pdfs: Vec<Vec<u8>>,
    plan: &ReconstructionPlan,
) -> Result<ReconstructedDocument, Zpl2PdfError> {
    let session = engine.open()?;
    reconstruct_in(&session, chunk_pdfs, plan)
}

fn reconstruct_in<S: PdfSession>(
    session: &S,
    chunk_pdfs: Vec<Vec<u8>>,
    plan: &ReconstructionPlan,
) -> Result<ReconstructedDocument, Zpl2PdfError> {
    let total = plan.total();
    let mut available = vec![false; plan.chunks.len()];
    let mut staged: Vec<Option<S::Document<'_>>> = Vec::with_capacity(plan.chunks.len());
    let mut skipped_pages = 0usize;

    let mut pdfs = chunk_pdfs.into_iter();
    for (c, demand) in plan.chunks.iter().enumerate() {
        let bytes = pdfs.next();
        let staging = stage_chunk(session, c, bytes, demand)?;
        if staging.is_some() {
            available[c] = true;
        } else {
            skipped_pages += demand.positions.len();
        }
        staged.push(staging);
    }

    if !available.iter().any(|&a| a) {
        return Err(Zpl2PdfError::EmptyDocument {
            expected: total,
            skipped: skipped_pages,
        });
    }

    let mut output = session.create()?;
    let runs = plan.runs(&available);
    for run in &runs {
        let Some(src) = staged[run.chunk].as_ref() else {
            continue;
        };
        session.copy_range(&mut output, src, run.staged.clone())?;
    }

    let page_count = session.page_count(&output);
    if page_count == 0 {
        return Err(Zpl2PdfError::EmptyDocument {
            expected: total,
            skipped: skipped_pages,
        });
    }

    let bytes = session.save(&output)?;
    debug!(
        "Reconstructed {} pages from {} chunks in {} runs ({} skipped)",
        page_count,
        plan.chunks.len(),
        runs.len(),
        skipped_pages
    );

    Ok(ReconstructedDocument {
        bytes,
        page_count,
        skipped_pages,
    })
}

/// Load one chunk and copy its demanded pages into a staging document.
///
/// `Ok(None)` marks the chunk unavailable. Only a failure to create an empty
/// document, which says nothing about the chunk, is returned as an error.
fn stage_chunk<'s, S: PdfSession>(
    session: &'s S,
    chunk: usize,
    bytes: Option<Vec<u8>>,
    demand: &ChunkDemand,
) -> Result<Option<S::Document<'s>>, Zpl2PdfError> {
    if demand.local_pages.is_empty() {
        return Ok(None);
    }
    let Some(bytes) = bytes else {
        warn!(chunk, "No renderer output for chunk; skipping {} pages", demand.positions.len());
        return Ok(None);
    };

    let source = match session.load(bytes) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(chunk, "Chunk PDF unreadable, skipping {} pages: {}", demand.positions.len(), e);
            return Ok(None);
        }
    };

    let have = session.page_count(&source);
    let need = demand.local_pages.iter().max().map_or(0, |m| m + 1);
    if have < need {
        warn!(
            chunk,
            "Chunk PDF has {} pages, needs at least {}; skipping {} pages",
            have,
            need,
            demand.positions.len()
        );
        return Ok(None);
    }

    let mut staging = session.create()?;
    if let Err(e) = session.copy_pages(&mut staging, &source, &demand.local_pages) {
        warn!(chunk, "Failed to stage chunk, skipping {} pages: {}", demand.positions.len(), e);
        return Ok(None);
    }
    Ok(Some(staging))
}

/// Run [`reconstruct`] on the blocking thread pool.
pub async fn assemble<E: PdfEngine>(
    engine: Arc<E>,
    chunk_pdfs: Vec<Vec<u8>>,
    plan: ReconstructionPlan,
) -> Result<ReconstructedDocument, Zpl2PdfError> {
    tokio::task::spawn_blocking(move || reconstruct(engine.as_ref(), chunk_pdfs, &plan))
        .await
        .map_err(|e| Zpl2PdfError::Internal(format!("Reconstruction task panicked: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::fake::{pages_of, pdf_of, FakeEngine};
    use crate::pipeline::chunk::plan_chunks;

    /// Renderer output for each chunk: page `k` is labelled `U{start + k}`.
    fn chunk_pdfs(ranges: &[ChunkRange]) -> Vec<Vec<u8>> {
        ranges
            .iter()
            .map(|r| {
                let labels: Vec<String> = (r.start..r.end).map(|u| format!("U{u}")).collect();
                let refs: Vec<&str> = labels.iter().map(String::as_str).collect();
                pdf_of(&refs)
            })
            .collect()
    }

    fn expected(sequence: &[usize]) -> Vec<String> {
        sequence.iter().map(|u| format!("U{u}")).collect()
    }

    #[test]
    fn plan_groups_positions_by_chunk() {
        let ranges = plan_chunks(5, 2);
        let plan = ReconstructionPlan::build(&[3, 0, 0, 4, 1, 3], &ranges).unwrap();
        assert_eq!(plan.chunks[0].local_pages, vec![0, 0, 1]);
        assert_eq!(plan.chunks[0].positions, vec![1, 2, 4]);
        assert_eq!(plan.chunks[1].local_pages, vec![1, 1]);
        assert_eq!(plan.chunks[1].positions, vec![0, 5]);
        assert_eq!(plan.chunks[2].local_pages, vec![0]);
        assert_eq!(plan.total(), 6);
    }

    #[test]
    fn plan_rejects_index_outside_ranges() {
        let ranges = plan_chunks(2, 2);
        assert!(matches!(
            ReconstructionPlan::build(&[0, 2], &ranges),
            Err(Zpl2PdfError::Internal(_))
        ));
    }

    #[test]
    fn in_order_sequence_is_one_run_per_chunk() {
        let ranges = plan_chunks(6, 3);
        let plan = ReconstructionPlan::build(&[0, 1, 2, 3, 4, 5], &ranges).unwrap();
        assert_eq!(
            plan.runs(&[true, true]),
            vec![
                PageRun { chunk: 0, staged: 0..3 },
                PageRun { chunk: 1, staged: 0..3 }
            ]
        );
    }

    #[test]
    fn runs_skip_unavailable_chunks() {
        let ranges = plan_chunks(4, 2);
        let plan = ReconstructionPlan::build(&[0, 2, 1, 3], &ranges).unwrap();
        assert_eq!(plan.runs(&[true, false]), vec![PageRun { chunk: 0, staged: 0..2 }]);
    }

    #[test]
    fn output_follows_sequence_across_chunk_boundaries() {
        let sequence = [3, 0, 0, 4, 1, 3];
        let ranges = plan_chunks(5, 2);
        let plan = ReconstructionPlan::build(&sequence, &ranges).unwrap();
        let doc = reconstruct(&FakeEngine, chunk_pdfs(&ranges), &plan).unwrap();

        assert_eq!(doc.page_count, sequence.len());
        assert_eq!(doc.skipped_pages, 0);
        assert_eq!(pages_of(&doc.bytes), expected(&sequence));
    }

    #[test]
    fn many_duplicates_of_one_label() {
        let sequence = vec![0; 120];
        let ranges = plan_chunks(1, 50);
        let plan = ReconstructionPlan::build(&sequence, &ranges).unwrap();
        assert_eq!(plan.runs(&[true]).len(), 1);

        let doc = reconstruct(&FakeEngine, chunk_pdfs(&ranges), &plan).unwrap();
        assert_eq!(doc.page_count, 120);
        assert!(pages_of(&doc.bytes).iter().all(|p| p == "U0"));
    }

    #[test]
    fn unreadable_chunk_is_skipped_not_fatal() {
        let sequence = [3, 0, 0, 4, 1, 3];
        let ranges = plan_chunks(5, 2);
        let plan = ReconstructionPlan::build(&sequence, &ranges).unwrap();
        let mut pdfs = chunk_pdfs(&ranges);
        pdfs[1] = b"<html>502 Bad Gateway</html>".to_vec();

        let doc = reconstruct(&FakeEngine, pdfs, &plan).unwrap();
        assert_eq!(doc.skipped_pages, 2);
        assert_eq!(doc.page_count, sequence.len() - doc.skipped_pages);
        assert_eq!(pages_of(&doc.bytes), vec!["U0", "U0", "U4", "U1"]);
    }

    #[test]
    fn short_chunk_is_skipped() {
        let sequence = [0, 1, 2];
        let ranges = plan_chunks(3, 2);
        let plan = ReconstructionPlan::build(&sequence, &ranges).unwrap();
        let mut pdfs = chunk_pdfs(&ranges);
        pdfs[0] = pdf_of(&["U0"]);

        let doc = reconstruct(&FakeEngine, pdfs, &plan).unwrap();
        assert_eq!(pages_of(&doc.bytes), vec!["U2"]);
        assert_eq!(doc.skipped_pages, 2);
    }

    #[test]
    fn missing_chunk_output_is_skipped() {
        let ranges = plan_chunks(4, 2);
        let plan = ReconstructionPlan::build(&[0, 1, 2, 3], &ranges).unwrap();
        let mut pdfs = chunk_pdfs(&ranges);
        pdfs.pop();

        let doc = reconstruct(&FakeEngine, pdfs, &plan).unwrap();
        assert_eq!(pages_of(&doc.bytes), vec!["U0", "U1"]);
    }

    #[test]
    fn all_chunks_unavailable_is_empty_document() {
        let ranges = plan_chunks(3, 2);
        let plan = ReconstructionPlan::build(&[0, 1, 2], &ranges).unwrap();
        let err = reconstruct(&FakeEngine, vec![b"x".to_vec(), b"y".to_vec()], &plan).unwrap_err();
        assert!(matches!(
            err,
            Zpl2PdfError::EmptyDocument {
                expected: 3,
                skipped: 3
            }
        ));
    }

    #[test]
    fn reconstruction_is_deterministic() {
        let sequence = [2, 2, 0, 1, 2, 0];
        let ranges = plan_chunks(3, 1);
        let plan = ReconstructionPlan::build(&sequence, &ranges).unwrap();
        let a = reconstruct(&FakeEngine, chunk_pdfs(&ranges), &plan).unwrap();
        let b = reconstruct(&FakeEngine, chunk_pdfs(&ranges), &plan).unwrap();
        assert_eq!(a.bytes, b.bytes);
    }

    #[tokio::test]
    async fn assemble_runs_off_the_async_runtime() {
        let ranges = plan_chunks(2, 50);
        let plan = ReconstructionPlan::build(&[1, 0], &ranges).unwrap();
        let doc = assemble(Arc::new(FakeEngine), chunk_pdfs(&ranges), plan)
            .await
            .unwrap();
        assert_eq!(pages_of(&doc.bytes), vec!["U1", "U0"]);
    }
}
