//! Firmware image handling.
//!
//! Turns Intel HEX text into the filtered, merged segment list the flash
//! engine writes. Everything here is pure and runs before the device is
//! touched.

pub mod filter;
pub mod hex;
pub mod segment;

pub use filter::{
    ERASED_BYTE, FilteredSegments, MERGE_GAP_THRESHOLD, NoSafeSegmentsError, filter, merge,
    merge_with_gap,
};
pub use hex::{ParseError, parse as parse_hex};
pub use segment::{MemorySegment, SafeRange, SegmentSpan};

use thiserror::Error;
use tracing::{debug, info};

use crate::protocol::DeviceMemoryMap;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Invalid Intel HEX: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    NoSafeSegments(#[from] NoSafeSegmentsError),

    #[error("Only Intel HEX files are supported for safe updates, got '{0}'")]
    NotHexFile(String),

    #[error("Erasing sector 0x{sector_start:08X}..0x{sector_end:08X} would touch memory outside the safe ranges")]
    UnsafeEraseFootprint { sector_start: u32, sector_end: u64 },

    #[error("Memory map error: {0}")]
    MemoryMap(#[from] crate::protocol::MemoryMapError),
}

/// Segments ready to be flashed.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    /// Filtered and merged segments, ascending by address.
    pub segments: Vec<MemorySegment>,
    /// Number of segments the HEX file decoded into.
    pub parsed_count: usize,
    /// Segments dropped by the safety filter.
    pub rejected: Vec<SegmentSpan>,
}

impl PreparedImage {
    /// Parse, filter, and merge HEX text in one step.
    pub fn from_hex(
        text: &str,
        safe_ranges: &[SafeRange],
        gap_threshold: u32,
    ) -> Result<Self, ImageError> {
        let parsed = parse_hex(text)?;
        let parsed_count = parsed.len();
        let filtered = filter(parsed, safe_ranges)?;
        let kept = filtered.kept.len();
        let segments = merge_with_gap(filtered.kept, gap_threshold);

        info!(
            parsed = parsed_count,
            filtered = kept,
            merged = segments.len(),
            "Prepared firmware image"
        );

        Ok(Self {
            segments,
            parsed_count,
            rejected: filtered.rejected,
        })
    }

    pub fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.len() as u64).sum()
    }

    /// Lowest address written, where manifestation points the device.
    pub fn start_address(&self) -> Option<u32> {
        self.segments.first().map(|s| s.start)
    }

    /// Check that every sector erased for these segments lies inside a safe
    /// range. Returns the number of sectors that will be erased.
    pub fn verify_erase_footprint(
        &self,
        map: &DeviceMemoryMap,
        safe_ranges: &[SafeRange],
    ) -> Result<usize, ImageError> {
        let mut sectors = 0;
        for segment in &self.segments {
            for sector in map.erase_footprint(segment.start, segment.len())? {
                let last = (sector.end - 1) as u32;
                if !safe_ranges
                    .iter()
                    .any(|r| r.contains_span(sector.start, last))
                {
                    return Err(ImageError::UnsafeEraseFootprint {
                        sector_start: sector.start,
                        sector_end: sector.end,
                    });
                }
                sectors += 1;
            }
        }
        debug!(sectors, map = %map.name, "Erase footprint verified");
        Ok(sectors)
    }
}
