//! Intel HEX decoding into memory segments.
//!
//! Records are decoded with the `ihex` crate, which also verifies the
//! per-record checksum. Lines that do not start with the `:` start code are
//! skipped, parsing stops at the first end-of-file record, and consecutive
//! data records that continue exactly where the open segment ends are
//! coalesced into a single [`MemorySegment`].

use ihex::{ReaderError, Record};
use thiserror::Error;
use tracing::{debug, warn};

use super::segment::MemorySegment;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("line {line}: {reason}")]
    Record { line: usize, reason: ReaderError },

    #[error("line {line}: {len} bytes at 0x{base:08X} + 0x{offset:04X} overflow the 32-bit address space")]
    AddressOverflow {
        line: usize,
        base: u32,
        offset: u16,
        len: usize,
    },
}

/// Parse Intel HEX text into segments, in file order.
///
/// Segments may be unsorted and non-contiguous; nothing is filtered here.
pub fn parse(text: &str) -> Result<Vec<MemorySegment>, ParseError> {
    let mut segments = Vec::new();
    let mut open: Option<MemorySegment> = None;
    let mut base: u32 = 0;

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if !line.starts_with(':') {
            continue;
        }

        let record = match Record::from_record_string(line) {
            Ok(record) => record,
            Err(ReaderError::UnsupportedRecordType(kind)) => {
                warn!(line = line_no, kind, "Ignoring unsupported HEX record type");
                continue;
            }
            Err(reason) => {
                return Err(ParseError::Record {
                    line: line_no,
                    reason,
                });
            }
        };

        match record {
            Record::Data { offset, value } => {
                if value.is_empty() {
                    continue;
                }
                let address = base
                    .checked_add(offset as u32)
                    .filter(|addr| {
                        (*addr as u64) + (value.len() as u64) <= (u32::MAX as u64) + 1
                    })
                    .ok_or(ParseError::AddressOverflow {
                        line: line_no,
                        base,
                        offset,
                        len: value.len(),
                    })?;

                match open.as_mut() {
                    Some(seg) if seg.end() == address as u64 => seg.data.extend_from_slice(&value),
                    _ => {
                        if let Some(done) = open.replace(MemorySegment::new(address, value)) {
                            segments.push(done);
                        }
                    }
                }
            }
            Record::EndOfFile => {
                debug!(line = line_no, "End-of-file record");
                break;
            }
            Record::ExtendedLinearAddress(upper) => {
                base = (upper as u32) << 16;
            }
            Record::ExtendedSegmentAddress(segment) => {
                base = (segment as u32) << 4;
            }
            Record::StartSegmentAddress { .. } | Record::StartLinearAddress(_) => {}
        }
    }

    if let Some(done) = open {
        segments.push(done);
    }

    debug!(segments = segments.len(), "Parsed Intel HEX");
    Ok(segments)
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_contiguous_records_coalesce() {
        let text = [
            ela_line(0x0800),
            data_line(0x0000, &[1, 2, 3, 4]),
            data_line(0x0004, &[5, 6, 7, 8]),
            EOF_LINE.to_string(),
        ]
        .join("\n");

        let segments = parse(&text).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start, 0x0800_0000);
        assert_eq!(segments[0].data, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_gap_starts_new_segment_in_file_order() {
        let text = [
            ela_line(0x0801),
            data_line(0x0000, &[0xAA; 4]),
            ela_line(0x0800),
            data_line(0x0000, &[0xBB; 4]),
            data_line(0x0010, &[0xCC; 2]),
            EOF_LINE.to_string(),
        ]
        .join("\r\n");

        let segments = parse(&text).unwrap();
        let starts: Vec<u32> = segments.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![0x0801_0000, 0x0800_0000, 0x0800_0010]);
    }

    #[test]
    fn test_stops_at_end_of_file() {
        let text = [
            data_line(0x0000, &[1]),
            EOF_LINE.to_string(),
            data_line(0x0100, &[2]),
        ]
        .join("\n");

        let segments = parse(&text).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].data, vec![1]);
    }

    #[test]
    fn test_skips_non_record_lines_and_whitespace() {
        let text = format!(
            "# build 42\n\n   {}   \n{}\n",
            data_line(0x0020, &[9, 9]),
            EOF_LINE
        );
        let segments = parse(&text).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start, 0x20);
    }

    #[test]
    fn test_start_address_records_are_ignored() {
        let text = [
            ela_line(0x0800),
            data_line(0x0000, &[1, 2]),
            record_line(0x05, 0, &0x0800_01C1u32.to_be_bytes()),
            data_line(0x0002, &[3, 4]),
        ]
        .join("\n");

        let segments = parse(&text).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_extended_segment_address() {
        let text = [
            record_line(0x02, 0, &0x1000u16.to_be_bytes()),
            data_line(0x0004, &[7]),
        ]
        .join("\n");

        let segments = parse(&text).unwrap();
        assert_eq!(segments[0].start, 0x0001_0004);
    }

    #[test]
    fn test_checksum_mismatch_is_rejected() {
        let mut line = data_line(0x0000, &[1, 2, 3]);
        line.replace_range(line.len() - 2.., "00");
        let err = parse(&line).unwrap_err();
        assert!(matches!(err, ParseError::Record { line: 1, .. }));
    }

    #[test]
    fn test_malformed_line_reports_line_number() {
        let text = format!("{}\n:10GARBAGE\n", data_line(0, &[1]));
        let err = parse(&text).unwrap_err();
        assert!(matches!(err, ParseError::Record { line: 2, .. }));
    }

    #[test]
    fn test_address_overflow() {
        let text = [ela_line(0xFFFF), data_line(0xFFFE, &[1, 2, 3])].join("\n");
        let err = parse(&text).unwrap_err();
        assert!(matches!(err, ParseError::AddressOverflow { line: 2, .. }));

        let fits = [ela_line(0xFFFF), data_line(0xFFFE, &[1, 2])].join("\n");
        assert_eq!(parse(&fits).unwrap()[0].last_address(), Some(0xFFFF_FFFF));
    }
}
