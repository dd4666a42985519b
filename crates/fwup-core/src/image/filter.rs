//! Address safety filtering and segment merging.
//!
//! Only segments that fit entirely inside a configured [`SafeRange`] survive
//! filtering. Survivors are then sorted and merged so that no flash sector is
//! erased twice: two segments merge when they overlap or when the gap between
//! them is smaller than the merge threshold. Gap bytes take the erased-flash
//! value `0xFF`.

use thiserror::Error;
use tracing::{debug, warn};

use super::segment::{MemorySegment, SafeRange, SegmentSpan};

/// Erased state of a flash byte.
pub const ERASED_BYTE: u8 = 0xFF;

/// Segments closer than this many bytes are merged.
pub const MERGE_GAP_THRESHOLD: u32 = 4096;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "no firmware segment lies inside a safe address range ({count} rejected)",
    count = .rejected.len()
)]
pub struct NoSafeSegmentsError {
    /// Every segment the filter dropped.
    pub rejected: Vec<SegmentSpan>,
}

/// Result of a successful filter pass.
#[derive(Debug, Clone)]
pub struct FilteredSegments {
    /// Segments fully contained in a safe range, in input order.
    pub kept: Vec<MemorySegment>,
    /// Segments dropped because some byte fell outside every safe range.
    pub rejected: Vec<SegmentSpan>,
}

/// Keep only segments whose whole address range lies inside one safe range.
///
/// Partially covered segments are dropped, never truncated.
pub fn filter(
    segments: Vec<MemorySegment>,
    ranges: &[SafeRange],
) -> Result<FilteredSegments, NoSafeSegmentsError> {
    let mut kept = Vec::with_capacity(segments.len());
    let mut rejected = Vec::new();

    for segment in segments {
        if ranges.iter().any(|range| range.contains(&segment)) {
            kept.push(segment);
        } else {
            warn!(
                address = %format!("0x{:08X}", segment.start),
                len = segment.len(),
                "Skipping segment outside safe ranges"
            );
            rejected.push(segment.span());
        }
    }

    if kept.is_empty() {
        return Err(NoSafeSegmentsError { rejected });
    }

    Ok(FilteredSegments { kept, rejected })
}

/// Sort and merge with the default [`MERGE_GAP_THRESHOLD`].
pub fn merge(segments: Vec<MemorySegment>) -> Vec<MemorySegment> {
    merge_with_gap(segments, MERGE_GAP_THRESHOLD)
}

/// Sort segments by address and merge overlapping or nearby neighbours.
///
/// On overlap the segment that sorts later overwrites the earlier bytes.
pub fn merge_with_gap(
    mut segments: Vec<MemorySegment>,
    gap_threshold: u32,
) -> Vec<MemorySegment> {
    segments.sort_by_key(|s| s.start);

    let mut merged: Vec<MemorySegment> = Vec::with_capacity(segments.len());
    for next in segments {
        let Some(current) = merged.last_mut() else {
            merged.push(next);
            continue;
        };

        let current_end = current.end();
        let next_start = next.start as u64;
        let overlaps = next_start < current_end;
        let close = next_start >= current_end && next_start - current_end < gap_threshold as u64;

        if !(overlaps || next_start == current_end || close) {
            merged.push(next);
            continue;
        }

        if overlaps {
            warn!(
                first = %format!("0x{:08X}", current.start),
                second = %format!("0x{:08X}", next.start),
                "Overlapping segments, later data wins"
            );
        }
        debug!(
            gap = next_start as i64 - current_end as i64,
            "Merging 0x{:08X} and 0x{:08X}",
            current.start,
            next.start
        );

        let new_end = current_end.max(next.end());
        let new_len = (new_end - current.start as u64) as usize;
        current.data.resize(new_len, ERASED_BYTE);
        let offset = (next.start - current.start) as usize;
        current.data[offset..offset + next.data.len()].copy_from_slice(&next.data);
    }

    merged
}
