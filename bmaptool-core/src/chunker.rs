//! Turns raw byte extents into block-aligned, merged [`Range`]s.

use crate::document::Range;
use crate::extent::Extent;

/// Rounds every extent out to `block_size` boundaries and merges ranges that
/// overlap or touch. Ranges are clipped to `total_blocks`, since filesystems
/// may report preallocated extents past the end of the file.
///
/// The output is sorted and disjoint, with checksums unset. Input extents may
/// arrive in any order.
pub fn chunk_extents(extents: &[Extent], block_size: u32, total_blocks: u64) -> Vec<Range> {
    let block_size = u64::from(block_size);

    let mut spans = extents
        .iter()
        .filter(|e| e.len > 0)
        .map(|e| {
            let first = e.offset / block_size;
            let end = e.end().div_ceil(block_size).min(total_blocks);
            (first, end)
        })
        .filter(|(first, end)| first < end)
        .collect::<Vec<_>>();
    spans.sort_unstable();

    let mut ranges: Vec<Range> = Vec::with_capacity(spans.len());

    for (first, end) in spans {
        match ranges.last_mut() {
            Some(last) if first <= last.end_block() => {
                if end > last.end_block() {
                    last.block_count = end - last.start_block;
                }
            }
            _ => ranges.push(Range::new(first, end - first)),
        }
    }

    ranges
}
