//! fwup-core: DfuSe firmware updater for the STM32F446-based instrument.
//!
//! This crate turns an Intel HEX image into a safe set of flash writes and
//! drives them through the STM32 system bootloader, leaving the
//! EEPROM-emulation sectors untouched.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Image**: Intel HEX parsing, safe-range filtering, segment merging
//! - **Protocol**: DFU/DfuSe constants, status decoding, memory maps
//! - **Transport**: Bootloader access abstraction (nusb, mock)
//! - **Flash**: Erase/write/poll sequencing and manifestation
//! - **State**: Orchestration states and transition rules
//! - **Events**: Observer pattern for UI decoupling
//! - **Release**: Release manifests and version comparison
//! - **Config**: Target profile
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use fwup_core::session::{BootloaderEntry, FirmwareSource, Updater};
//! use fwup_core::{NusbBroker, TargetProfile};
//!
//! let profile = TargetProfile::default();
//! let broker = NusbBroker::new(Duration::from_secs(30));
//! let mut updater = Updater::new(broker, profile);
//!
//! let text = std::fs::read_to_string("firmware.hex").unwrap();
//! let source = FirmwareSource::Local {
//!     file_name: "firmware.hex".to_string(),
//!     text,
//! };
//! updater
//!     .perform_update(source, BootloaderEntry::Manual)
//!     .expect("Update failed");
//! ```

pub mod config;
pub mod events;
pub mod flash;
pub mod image;
pub mod protocol;
pub mod release;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use config::{ProfileError, SectorGroup, TargetProfile};
pub use events::{ChannelObserver, NullObserver, TracingObserver, UpdateEvent, UpdateObserver};
pub use flash::{FlashEngine, FlashError, FlashReport, ManifestOutcome};
pub use image::{ImageError, MemorySegment, ParseError, PreparedImage, SafeRange, SegmentSpan};
pub use protocol::{DeviceMemoryMap, DfuState, DfuStatus, DfuStatusCode, MemoryMapError, Sector};
pub use release::{FirmwareManifest, ReleaseError, is_newer, parse_reported_version};
pub use session::{
    ArtifactFetcher, BootloaderEntry, ChannelError, CommandChannel, DirectoryFetcher, FetchError,
    FirmwareSource, UpdateError, UpdateFailure, UpdateInfo, UpdateReport, Updater,
};
pub use state::UpdateState;
pub use transport::{
    DeviceBroker, DfuTransport, DiscoveryError, MockTransport, NusbBroker, NusbTransport,
    TransportError,
};
