//! Memory segments and address ranges.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A contiguous run of bytes destined for a fixed device address.
#[derive(Clone, PartialEq, Eq)]
pub struct MemorySegment {
    /// Absolute address of the first byte.
    pub start: u32,
    /// Segment payload. Never empty.
    pub data: Vec<u8>,
}

impl MemorySegment {
    pub fn new(start: u32, data: Vec<u8>) -> Self {
        Self { start, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Address of the last byte (inclusive).
    ///
    /// Returns `None` for an empty segment or one that runs past the 32-bit
    /// address space.
    pub fn last_address(&self) -> Option<u32> {
        let len = u32::try_from(self.data.len()).ok()?;
        self.start.checked_add(len.checked_sub(1)?)
    }

    /// Exclusive end address, widened so a segment ending at `0xFFFF_FFFF`
    /// is still representable.
    pub fn end(&self) -> u64 {
        self.start as u64 + self.data.len() as u64
    }

    pub fn span(&self) -> SegmentSpan {
        SegmentSpan {
            start: self.start,
            len: self.data.len(),
        }
    }
}

impl fmt::Debug for MemorySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemorySegment(0x{:08X}, {} bytes)",
            self.start,
            self.data.len()
        )
    }
}

/// Address and length of a segment, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSpan {
    pub start: u32,
    pub len: usize,
}

impl fmt::Display for SegmentSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X} (+{} bytes)", self.start, self.len)
    }
}

/// Inclusive address range a firmware image may be written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeRange {
    pub start: u32,
    pub end: u32,
}

impl SafeRange {
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// True if `[start, last]` lies entirely inside this range.
    pub fn contains_span(&self, start: u32, last: u32) -> bool {
        start >= self.start && last <= self.end
    }

    /// True if every byte of the segment lies inside this range.
    pub fn contains(&self, segment: &MemorySegment) -> bool {
        match segment.last_address() {
            Some(last) => self.contains_span(segment.start, last),
            None => false,
        }
    }
}

impl fmt::Display for SafeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}..=0x{:08X}", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_address() {
        let seg = MemorySegment::new(0x0800_0000, vec![0u8; 16]);
        assert_eq!(seg.last_address(), Some(0x0800_000F));
        assert_eq!(seg.end(), 0x0800_0010);

        let empty = MemorySegment::new(0x0800_0000, Vec::new());
        assert_eq!(empty.last_address(), None);

        let top = MemorySegment::new(0xFFFF_FFFE, vec![1, 2]);
        assert_eq!(top.last_address(), Some(0xFFFF_FFFF));
        assert_eq!(top.end(), 0x1_0000_0000);

        let overflow = MemorySegment::new(0xFFFF_FFFF, vec![1, 2]);
        assert_eq!(overflow.last_address(), None);
    }

    #[test]
    fn test_range_containment() {
        let range = SafeRange::new(0x0800_0000, 0x0800_3FFF);
        assert!(range.contains(&MemorySegment::new(0x0800_0000, vec![0; 0x4000])));
        assert!(!range.contains(&MemorySegment::new(0x0800_0000, vec![0; 0x4001])));
        assert!(!range.contains(&MemorySegment::new(0x07FF_FFFF, vec![0; 2])));
    }
}
