//! USB DFU / DfuSe protocol definitions.

pub mod constants;
pub mod memory;
pub mod state;

pub use constants::*;
pub use memory::{DeviceMemoryMap, MemoryMapError, Sector};
pub use state::{DfuState, DfuStatus, DfuStatusCode};
