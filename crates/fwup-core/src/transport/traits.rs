//! Device transport abstraction.
//!
//! Defines the `DfuTransport` trait for talking to an opened DfuSe
//! bootloader and the `DeviceBroker` trait for finding and opening one,
//! allowing different implementations (nusb, mock, etc.).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{DeviceMemoryMap, DfuState, DfuStatus, DfuStatusCode, MemoryMapError};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("{request} failed: {message}")]
    ControlFailed {
        request: &'static str,
        message: String,
    },

    #[error("Device reported {status} in state {state}")]
    DeviceStatus {
        status: DfuStatusCode,
        state: DfuState,
    },

    #[error("Device entered {state} while waiting for {expected}")]
    UnexpectedState { state: DfuState, expected: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Device is not open")]
    NotOpen,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Device still busy after {attempts} status polls")]
    PollTimeout { attempts: u32 },

    #[error("No memory map bound to the device")]
    NoMemoryMap,

    #[error("Memory map error: {0}")]
    MemoryMap(#[from] MemoryMapError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operations on an opened DfuSe bootloader interface.
///
/// This trait enables:
/// - Production implementation using nusb
/// - Scripted mock implementation for unit testing
pub trait DfuTransport: Send {
    /// Issue DFU_GETSTATUS.
    fn get_status(&self) -> Result<DfuStatus, TransportError>;

    /// Issue DFU_GETSTATE.
    fn get_state(&self) -> Result<DfuState, TransportError>;

    /// Issue DFU_CLRSTATUS, leaving `dfuERROR`.
    fn clear_status(&self) -> Result<(), TransportError>;

    /// Issue DFU_ABORT, returning the device to `dfuIDLE`.
    fn abort(&self) -> Result<(), TransportError>;

    /// Erase every sector overlapping `[address, address + length)`.
    ///
    /// A sector already erased since the memory map was bound is skipped, so
    /// segments sharing a sector keep each other's data.
    fn erase(&self, address: u32, length: usize) -> Result<(), TransportError>;

    /// Point the device's write pointer at `address`.
    fn set_address_pointer(&self, address: u32) -> Result<(), TransportError>;

    /// Send one data block, written at the current address pointer.
    /// An empty block requests manifestation.
    fn write_block(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Poll DFU_GETSTATUS until `predicate` accepts the state or the device
    /// enters `dfuERROR`. The final status is returned either way.
    fn poll_until(&self, predicate: &dyn Fn(DfuState) -> bool)
    -> Result<DfuStatus, TransportError>;

    /// Poll until the device is ready for the next download block.
    fn poll_until_idle(&self) -> Result<DfuStatus, TransportError> {
        self.poll_until(&|state| state == DfuState::DnloadIdle)
    }

    /// Attach the memory layout used to resolve erase requests.
    fn bind_memory_map(&mut self, map: DeviceMemoryMap);

    /// Release the device. Further operations fail with `NotOpen`.
    fn close(&mut self) -> Result<(), TransportError>;
}

/// USB vendor/product pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl fmt::Display for UsbIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vendor_id, self.product_id)
    }
}

/// A device matching the bootloader identity, not yet opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCandidate {
    pub identity: UsbIdentity,
    pub bus_id: String,
    pub address: u8,
    pub serial: Option<String>,
}

impl fmt::Display for DeviceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (bus {} addr {})", self.identity, self.bus_id, self.address)?;
        if let Some(serial) = &self.serial {
            write!(f, " serial {}", serial)?;
        }
        Ok(())
    }
}

/// A DFU-class interface alternate setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuInterface {
    pub number: u8,
    pub alt_setting: u8,
    /// Interface string; DfuSe puts the memory layout descriptor here.
    pub name: Option<String>,
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("No device selected")]
    NoDeviceSelected,

    #[error("No DFU interface found on {0}")]
    NoDfuInterface(String),

    #[error("USB enumeration failed: {0}")]
    Enumeration(String),

    #[error("Device {0} is no longer present")]
    DeviceGone(String),

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },
}

/// Finds and opens bootloader devices.
///
/// Mirrors a permission model where some devices are already authorized and
/// others must be granted interactively by the operator.
pub trait DeviceBroker {
    type Transport: DfuTransport;

    /// Devices matching `identity` that can be opened without asking.
    fn authorized_devices(
        &mut self,
        identity: UsbIdentity,
    ) -> Result<Vec<DeviceCandidate>, DiscoveryError>;

    /// Ask the operator for a matching device. Blocks until one is granted;
    /// `Ok(None)` means the request was cancelled.
    fn request_device(
        &mut self,
        identity: UsbIdentity,
    ) -> Result<Option<DeviceCandidate>, DiscoveryError>;

    /// DFU-class interfaces the device exposes.
    fn dfu_interfaces(
        &mut self,
        device: &DeviceCandidate,
    ) -> Result<Vec<DfuInterface>, DiscoveryError>;

    /// Open the device and claim `interface`.
    fn open(
        &mut self,
        device: &DeviceCandidate,
        interface: &DfuInterface,
    ) -> Result<Self::Transport, DiscoveryError>;
}
