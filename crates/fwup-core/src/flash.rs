//! DfuSe flash engine.
//!
//! Writes merged segments to an opened bootloader: one erase per segment,
//! then address-set, block write, and idle poll for every block. The address
//! pointer is set before every block since the bootloader does not promise
//! to auto-increment across separate downloads. Flashing is not
//! transactional; a failure leaves whatever was already committed.

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::events::{UpdateEvent, UpdateObserver};
use crate::image::MemorySegment;
use crate::protocol::{DfuState, DfuStatus, TRANSFER_SIZE};
use crate::transport::{DfuTransport, TransportError};

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("Nothing to flash")]
    NoSegments,

    #[error("Erase of {length} bytes at 0x{address:08X} failed: {source}")]
    Erase {
        address: u32,
        length: usize,
        source: TransportError,
    },

    #[error("Setting address pointer to 0x{address:08X} failed: {source}")]
    SetAddress {
        address: u32,
        source: TransportError,
    },

    #[error("Writing block at 0x{address:08X} failed: {source}")]
    Write {
        address: u32,
        source: TransportError,
    },

    #[error("Device not ready after block at 0x{address:08X}: {source}")]
    Poll {
        address: u32,
        source: TransportError,
    },

    #[error("Manifestation request at 0x{address:08X} failed: {source}")]
    Manifest {
        address: u32,
        source: TransportError,
    },
}

impl FlashError {
    /// Device address the failing operation targeted.
    pub fn address(&self) -> Option<u32> {
        match self {
            FlashError::NoSegments => None,
            FlashError::Erase { address, .. }
            | FlashError::SetAddress { address, .. }
            | FlashError::Write { address, .. }
            | FlashError::Poll { address, .. }
            | FlashError::Manifest { address, .. } => Some(*address),
        }
    }
}

/// How the device answered the manifestation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestOutcome {
    /// The device reported a manifest state before rebooting.
    Acknowledged(DfuState),
    /// The device stopped answering, usually because it already reset.
    DeviceGone(String),
}

/// Summary of a completed flash run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashReport {
    pub segments: usize,
    pub blocks: usize,
    pub bytes_written: u64,
    pub manifest: ManifestOutcome,
}

/// Drives erase/write/poll sequencing over a [`DfuTransport`].
pub struct FlashEngine<'a, T: DfuTransport + ?Sized> {
    transport: &'a T,
    observer: &'a dyn UpdateObserver,
    block_size: usize,
}

impl<'a, T: DfuTransport + ?Sized> FlashEngine<'a, T> {
    pub fn new(transport: &'a T, observer: &'a dyn UpdateObserver) -> Self {
        Self {
            transport,
            observer,
            block_size: TRANSFER_SIZE,
        }
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Write every segment and request manifestation.
    #[instrument(skip_all, fields(segments = segments.len(), block_size = self.block_size))]
    pub fn flash(&self, segments: &[MemorySegment]) -> Result<FlashReport, FlashError> {
        let mut ordered: Vec<&MemorySegment> = segments.iter().filter(|s| !s.is_empty()).collect();
        ordered.sort_by_key(|s| s.start);
        let first = ordered.first().map(|s| s.start).ok_or(FlashError::NoSegments)?;

        let total: u64 = ordered.iter().map(|s| s.len() as u64).sum();
        let mut written = 0u64;
        let mut blocks = 0usize;

        info!(total_bytes = total, "Flashing {} segment(s)", ordered.len());
        self.observer
            .on_event(&UpdateEvent::Progress { written, total });

        for segment in &ordered {
            self.erase(segment)?;

            for (index, chunk) in segment.data.chunks(self.block_size).enumerate() {
                let address = segment.start + (index * self.block_size) as u32;
                self.write_chunk(address, chunk)?;

                blocks += 1;
                written += chunk.len() as u64;
                self.observer
                    .on_event(&UpdateEvent::Progress { written, total });
            }
        }

        let manifest = self.manifest(first)?;
        info!(blocks, bytes = written, "Flash complete");

        Ok(FlashReport {
            segments: ordered.len(),
            blocks,
            bytes_written: written,
            manifest,
        })
    }

    fn erase(&self, segment: &MemorySegment) -> Result<(), FlashError> {
        debug!(
            address = %format!("0x{:08X}", segment.start),
            length = segment.len(),
            "Erasing"
        );
        let to_error = |source| FlashError::Erase {
            address: segment.start,
            length: segment.len(),
            source,
        };
        self.transport
            .erase(segment.start, segment.len())
            .map_err(to_error)
    }

    fn write_chunk(&self, address: u32, chunk: &[u8]) -> Result<(), FlashError> {
        self.transport
            .set_address_pointer(address)
            .map_err(|source| FlashError::SetAddress { address, source })?;
        self.transport
            .write_block(chunk)
            .map_err(|source| FlashError::Write { address, source })?;

        let status = self
            .transport
            .poll_until_idle()
            .map_err(|source| FlashError::Poll { address, source })?;
        ensure_ok(status).map_err(|source| FlashError::Poll { address, source })
    }

    /// Point the device at the image start and send the zero-length
    /// download. Losing the device while waiting for the manifest state is
    /// expected.
    fn manifest(&self, address: u32) -> Result<ManifestOutcome, FlashError> {
        info!(address = %format!("0x{:08X}", address), "Requesting manifestation");
        self.transport
            .set_address_pointer(address)
            .map_err(|source| FlashError::Manifest { address, source })?;
        self.transport
            .write_block(&[])
            .map_err(|source| FlashError::Manifest { address, source })?;

        match self
            .transport
            .poll_until(&|state| state == DfuState::Manifest)
        {
            Ok(status) => Ok(ManifestOutcome::Acknowledged(status.state)),
            Err(e) => {
                warn!(error = %e, "No manifest state reported, device is likely rebooting");
                Ok(ManifestOutcome::DeviceGone(e.to_string()))
            }
        }
    }
}

fn ensure_ok(status: DfuStatus) -> Result<(), TransportError> {
    if status.is_ok() && status.state != DfuState::Error {
        Ok(())
    } else {
        Err(TransportError::DeviceStatus {
            status: status.status,
            state: status.state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::events::recording::RecordingObserver;
    use crate::config::TargetProfile;
    use crate::image::hex::fixtures::{EOF_LINE, data_line, ela_line};
    use crate::image::{MERGE_GAP_THRESHOLD, PreparedImage};
    use crate::protocol::DeviceMemoryMap;
    use crate::transport::{MockCall, MockTransport};

    fn segment(start: u32, len: usize, fill: u8) -> MemorySegment {
        MemorySegment::new(start, vec![fill; len])
    }

    #[test]
    fn test_flash_sets_address_before_every_block() {
        let mock = MockTransport::new();
        let engine = FlashEngine::new(&mock, &NullObserver).with_block_size(4);

        let report = engine.flash(&[segment(0x0800_0000, 10, 0xA5)]).unwrap();
        assert_eq!(report.blocks, 3);
        assert_eq!(report.bytes_written, 10);

        let calls = mock.calls();
        assert_eq!(calls[0], MockCall::Erase { address: 0x0800_0000, length: 10 });
        assert_eq!(
            &calls[1..10],
            &[
                MockCall::SetAddress(0x0800_0000),
                MockCall::WriteBlock { len: 4 },
                MockCall::PollUntil,
                MockCall::SetAddress(0x0800_0004),
                MockCall::WriteBlock { len: 4 },
                MockCall::PollUntil,
                MockCall::SetAddress(0x0800_0008),
                MockCall::WriteBlock { len: 2 },
                MockCall::PollUntil,
            ]
        );
        assert_eq!(mock.byte_at(0x0800_0009), Some(0xA5));
        assert_eq!(mock.byte_at(0x0800_000A), None);
    }

    #[test]
    fn test_flash_orders_segments_and_manifests_at_lowest() {
        let mock = MockTransport::new();
        let engine = FlashEngine::new(&mock, &NullObserver);

        let report = engine
            .flash(&[segment(0x0801_0000, 4, 2), segment(0x0800_0000, 4, 1)])
            .unwrap();
        assert_eq!(report.manifest, ManifestOutcome::Acknowledged(DfuState::Manifest));

        let erases: Vec<_> = mock
            .calls()
            .into_iter()
            .filter(|c| matches!(c, MockCall::Erase { .. }))
            .collect();
        assert_eq!(
            erases,
            vec![
                MockCall::Erase { address: 0x0800_0000, length: 4 },
                MockCall::Erase { address: 0x0801_0000, length: 4 },
            ]
        );

        let calls = mock.calls();
        let tail = &calls[calls.len() - 3..];
        assert_eq!(
            tail,
            &[
                MockCall::SetAddress(0x0800_0000),
                MockCall::WriteBlock { len: 0 },
                MockCall::PollUntil,
            ]
        );
    }

    #[test]
    fn test_segments_sharing_a_sector_keep_their_data() {
        // 4096-byte gap: not merged, but both land in the 64 KB sector
        let hex = [
            ela_line(0x0801),
            data_line(0x0000, &[0xAA; 4]),
            data_line(0x1004, &[0xBB; 4]),
            EOF_LINE.to_string(),
        ]
        .join("\n");
        let profile = TargetProfile::default();
        let image =
            PreparedImage::from_hex(&hex, &profile.safe_ranges, MERGE_GAP_THRESHOLD).unwrap();
        assert_eq!(image.segments.len(), 2);

        let mut mock = MockTransport::new();
        mock.bind_memory_map(DeviceMemoryMap::stm32f446());
        FlashEngine::new(&mock, &NullObserver)
            .flash(&image.segments)
            .unwrap();

        assert_eq!(mock.erased_sectors(), vec![0x0801_0000]);
        assert_eq!(mock.byte_at(0x0801_0000), Some(0xAA));
        assert_eq!(mock.byte_at(0x0801_1004), Some(0xBB));
    }

    #[test]
    fn test_progress_accumulates_across_segments() {
        let mock = MockTransport::new();
        let observer = RecordingObserver::default();
        FlashEngine::new(&mock, &observer)
            .with_block_size(4)
            .flash(&[segment(0x0800_0000, 6, 0), segment(0x0801_0000, 4, 0)])
            .unwrap();

        assert_eq!(observer.progress(), vec![(0, 10), (4, 10), (6, 10), (10, 10)]);
    }

    #[test]
    fn test_manifest_poll_failure_is_swallowed() {
        let mock = MockTransport::new().fail_manifest_poll();
        let report = FlashEngine::new(&mock, &NullObserver)
            .flash(&[segment(0x0800_0000, 4, 0)])
            .unwrap();
        assert!(matches!(report.manifest, ManifestOutcome::DeviceGone(_)));
    }

    #[test]
    fn test_write_failure_aborts_without_further_blocks() {
        let mock = MockTransport::new().fail_write_at(3);
        let err = FlashEngine::new(&mock, &NullObserver)
            .with_block_size(4)
            .flash(&[segment(0x0800_0000, 32, 0)])
            .unwrap_err();

        assert!(matches!(err, FlashError::Write { address: 0x0800_0008, .. }));
        assert_eq!(mock.count(|c| matches!(c, MockCall::WriteBlock { .. })), 3);
        // no manifestation after a failed write
        assert_eq!(mock.count(|c| matches!(c, MockCall::WriteBlock { len: 0 })), 0);
    }

    #[test]
    fn test_erase_failure_aborts_before_writes() {
        let mock = MockTransport::new().fail_erase();
        let err = FlashEngine::new(&mock, &NullObserver)
            .flash(&[segment(0x0800_0000, 4, 0)])
            .unwrap_err();
        assert!(matches!(err, FlashError::Erase { .. }));
        assert_eq!(err.address(), Some(0x0800_0000));
        assert_eq!(mock.count(|c| matches!(c, MockCall::WriteBlock { .. })), 0);
    }

    #[test]
    fn test_empty_input_touches_nothing() {
        let mock = MockTransport::new();
        let err = FlashEngine::new(&mock, &NullObserver).flash(&[]).unwrap_err();
        assert!(matches!(err, FlashError::NoSegments));
        assert!(mock.calls().is_empty());
    }
}
