//! Chunk planning: split the unique-block set into renderer-sized windows.
//!
//! The renderer accepts at most `cap` labels per request and returns one PDF
//! page per label in submission order. Windows are contiguous and ascending,
//! so page `k` of chunk `c` is always unique block `ranges[c].start + k`.

use serde::{Deserialize, Serialize};

/// A half-open `[start, end)` window over the unique-block array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub start: usize,
    pub end: usize,
}

impl ChunkRange {
    /// Labels in this window.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, unique_index: usize) -> bool {
        (self.start..self.end).contains(&unique_index)
    }
}

/// Partition `[0, count)` into ordered windows of at most `cap` entries.
///
/// A `cap` of zero is treated as one so the function stays total.
pub fn plan_chunks(count: usize, cap: usize) -> Vec<ChunkRange> {
    let cap = cap.max(1);
    (0..count)
        .step_by(cap)
        .map(|start| ChunkRange {
            start,
            end: (start + cap).min(count),
        })
        .collect()
}

/// Locate a unique index: `(chunk index, local page index)`.
///
/// Returns `None` when the index lies outside every range.
pub fn chunk_for(ranges: &[ChunkRange], unique_index: usize) -> Option<(usize, usize)> {
    let chunk = ranges.partition_point(|r| r.end <= unique_index);
    ranges
        .get(chunk)
        .filter(|r| r.contains(unique_index))
        .map(|r| (chunk, unique_index - r.start))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(plan_chunks(0, 50).is_empty());
    }

    #[test]
    fn exact_multiple_of_cap() {
        let ranges = plan_chunks(100, 50);
        assert_eq!(
            ranges,
            vec![
                ChunkRange { start: 0, end: 50 },
                ChunkRange { start: 50, end: 100 }
            ]
        );
    }

    #[test]
    fn remainder_lands_in_last_chunk() {
        let ranges = plan_chunks(7, 3);
        let lens: Vec<usize> = ranges.iter().map(|r| r.len()).collect();
        assert_eq!(lens, vec![3, 3, 1]);
    }

    #[test]
    fn ranges_are_contiguous_and_cover_everything() {
        for (count, cap) in [(1, 1), (49, 50), (51, 50), (1000, 50), (13, 4)] {
            let ranges = plan_chunks(count, cap);
            assert_eq!(ranges.len(), count.div_ceil(cap));
            assert_eq!(ranges.first().map(|r| r.start), Some(0));
            assert_eq!(ranges.last().map(|r| r.end), Some(count));
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
            }
            assert!(ranges.iter().all(|r| !r.is_empty() && r.len() <= cap));
        }
    }

    #[test]
    fn zero_cap_is_treated_as_one() {
        assert_eq!(plan_chunks(3, 0).len(), 3);
    }

    #[test]
    fn chunk_for_maps_back_to_local_pages() {
        let ranges = plan_chunks(7, 3);
        assert_eq!(chunk_for(&ranges, 0), Some((0, 0)));
        assert_eq!(chunk_for(&ranges, 2), Some((0, 2)));
        assert_eq!(chunk_for(&ranges, 3), Some((1, 0)));
        assert_eq!(chunk_for(&ranges, 6), Some((2, 0)));
        assert_eq!(chunk_for(&ranges, 7), None);
    }
}
