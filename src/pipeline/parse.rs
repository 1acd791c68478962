//! Block parsing and deduplication: raw ZPL text → unique blocks + replay list.
//!
//! ## Why deduplicate before rendering?
//!
//! Shipping-label documents are extremely repetitive: the same label printed
//! 200 times, or a handful of distinct labels each with a `^PQ` repeat count.
//! The renderer is slow and rate-limited, so we render every distinct label
//! exactly once and replay duplicates locally when the output is assembled.
//! Rendering work is O(unique blocks); output fidelity is O(total labels).
//!
//! ## Normalisation
//!
//! Two blocks are duplicates when their normalised text is byte-identical.
//! Normalisation removes line breaks, collapses any other whitespace run to
//! one space, upper-cases the `^XA`/`^XZ` markers and strips every `^PQ`
//! command, so the same visual label with different copy counts still maps to
//! one key.

use crate::error::Zpl2PdfError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use tracing::debug;

/// One label as submitted, normalised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBlock {
    /// Normalised `^XA…^XZ` source, without any `^PQ` command.
    pub content: String,
    /// Requested copies (≥ 1).
    pub copies: u32,
    /// 0-based position in the original submission.
    pub position: usize,
}

/// One distinct label; the renderer sees only these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueBlock {
    /// Index into the unique set.
    pub index: usize,
    pub content: String,
}

/// The unique set plus the expansion sequence that replays it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupResult {
    pub unique: Vec<UniqueBlock>,
    /// One unique index per output unit; `len == Σ copies`.
    pub sequence: Vec<usize>,
}

impl DedupResult {
    /// Total output units (labels including duplicates).
    pub fn total_labels(&self) -> usize {
        self.sequence.len()
    }

    /// Rebuild the expanded, normalised document: one block per output unit.
    pub fn expanded_zpl(&self) -> String {
        self.sequence
            .iter()
            .map(|&i| self.unique[i].content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Concatenated ZPL for a window of unique blocks, in order.
    pub fn payload(&self, start: usize, end: usize) -> String {
        self.unique[start..end]
            .iter()
            .map(|b| b.content.as_str())
            .collect()
    }
}

static RE_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)\^XA.*?\^XZ").unwrap());
static RE_LINE_BREAKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]*[\r\n]+[ \t]*").unwrap());
static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static RE_PQ: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\^PQ([^\^]*)").unwrap());
static RE_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^(\^XA)+").unwrap());
static RE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(\^XZ)+$").unwrap());

/// Extract and normalise every label block in `raw`.
///
/// # Errors
/// [`Zpl2PdfError::NoValidBlocks`] when the text holds no `^XA … ^XZ` block.
/// Nothing else about the ZPL is validated here.
pub fn parse_blocks(raw: &str) -> Result<Vec<ParsedBlock>, Zpl2PdfError> {
    let blocks: Vec<ParsedBlock> = RE_BLOCK
        .find_iter(raw)
        .enumerate()
        .map(|(position, m)| {
            let (content, copies) = normalise_block(m.as_str());
            ParsedBlock {
                content,
                copies,
                position,
            }
        })
        .collect();

    if blocks.is_empty() {
        return Err(Zpl2PdfError::NoValidBlocks);
    }

    debug!("Parsed {} label blocks", blocks.len());
    Ok(blocks)
}

/// Collapse parsed blocks into a unique set plus the expansion sequence.
///
/// Single pass: each block's content is looked up in a `content → index` map;
/// a miss appends a new unique entry, then the index is pushed once per copy.
pub fn deduplicate(blocks: &[ParsedBlock]) -> DedupResult {
    let mut index_of: HashMap<&str, usize> = HashMap::with_capacity(blocks.len());
    let mut result = DedupResult {
        unique: Vec::new(),
        sequence: Vec::with_capacity(total_copies(blocks)),
    };

    for block in blocks {
        let index = match index_of.get(block.content.as_str()) {
            Some(&i) => i,
            None => {
                let i = result.unique.len();
                result.unique.push(UniqueBlock {
                    index: i,
                    content: block.content.clone(),
                });
                index_of.insert(block.content.as_str(), i);
                i
            }
        };
        result
            .sequence
            .extend(std::iter::repeat(index).take(block.copies as usize));
    }

    debug!(
        "Deduplicated {} blocks → {} unique, {} output labels",
        blocks.len(),
        result.unique.len(),
        result.sequence.len()
    );
    result
}

/// Σ copies over the parsed blocks.
pub fn total_copies(blocks: &[ParsedBlock]) -> usize {
    blocks.iter().map(|b| b.copies as usize).sum()
}

/// Number of label start markers present in a payload.
pub fn count_label_markers(zpl: &str) -> usize {
    RE_BLOCK.find_iter(zpl).count()
}

/// Normalise one matched block and extract its copy count.
fn normalise_block(block: &str) -> (String, u32) {
    let copies = RE_PQ
        .captures(block)
        .map(|caps| parse_copies(&caps[1]))
        .unwrap_or(1);

    let without_pq = RE_PQ.replace_all(block, "");
    let single_line = RE_LINE_BREAKS.replace_all(&without_pq, "");
    let collapsed = RE_WHITESPACE.replace_all(&single_line, " ");

    let body = RE_START.replace(collapsed.trim(), "");
    let body = RE_END.replace(body.trim(), "");
    (format!("^XA{}^XZ", body.trim()), copies)
}

/// First `^PQ` parameter as a copy count; anything unusable means 1.
fn parse_copies(params: &str) -> u32 {
    params
        .split(',')
        .next()
        .and_then(|q| q.trim().parse::<u32>().ok())
        .filter(|&q| q > 0)
        .unwrap_or(1)
}
