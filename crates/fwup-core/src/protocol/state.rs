//! DFU device states and GETSTATUS decoding.

use std::fmt;

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use super::constants::DFU_STATUS_LEN;

/// Device state as reported by DFU_GETSTATE / DFU_GETSTATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuState {
    AppIdle,
    AppDetach,
    DfuIdle,
    DnloadSync,
    DnBusy,
    DnloadIdle,
    ManifestSync,
    Manifest,
    ManifestWaitReset,
    UploadIdle,
    Error,
    Unknown(u8),
}

impl From<u8> for DfuState {
    fn from(value: u8) -> Self {
        match value {
            0 => DfuState::AppIdle,
            1 => DfuState::AppDetach,
            2 => DfuState::DfuIdle,
            3 => DfuState::DnloadSync,
            4 => DfuState::DnBusy,
            5 => DfuState::DnloadIdle,
            6 => DfuState::ManifestSync,
            7 => DfuState::Manifest,
            8 => DfuState::ManifestWaitReset,
            9 => DfuState::UploadIdle,
            10 => DfuState::Error,
            other => DfuState::Unknown(other),
        }
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuState::AppIdle => write!(f, "appIDLE"),
            DfuState::AppDetach => write!(f, "appDETACH"),
            DfuState::DfuIdle => write!(f, "dfuIDLE"),
            DfuState::DnloadSync => write!(f, "dfuDNLOAD-SYNC"),
            DfuState::DnBusy => write!(f, "dfuDNBUSY"),
            DfuState::DnloadIdle => write!(f, "dfuDNLOAD-IDLE"),
            DfuState::ManifestSync => write!(f, "dfuMANIFEST-SYNC"),
            DfuState::Manifest => write!(f, "dfuMANIFEST"),
            DfuState::ManifestWaitReset => write!(f, "dfuMANIFEST-WAIT-RESET"),
            DfuState::UploadIdle => write!(f, "dfuUPLOAD-IDLE"),
            DfuState::Error => write!(f, "dfuERROR"),
            DfuState::Unknown(v) => write!(f, "unknown({})", v),
        }
    }
}

/// bStatus field of a GETSTATUS response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuStatusCode {
    Ok,
    ErrTarget,
    ErrFile,
    ErrWrite,
    ErrErase,
    ErrCheckErased,
    ErrProg,
    ErrVerify,
    ErrAddress,
    ErrNotDone,
    ErrFirmware,
    ErrVendor,
    ErrUsbReset,
    ErrPowerOnReset,
    ErrUnknown,
    ErrStalledPkt,
    Other(u8),
}

impl From<u8> for DfuStatusCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => DfuStatusCode::Ok,
            0x01 => DfuStatusCode::ErrTarget,
            0x02 => DfuStatusCode::ErrFile,
            0x03 => DfuStatusCode::ErrWrite,
            0x04 => DfuStatusCode::ErrErase,
            0x05 => DfuStatusCode::ErrCheckErased,
            0x06 => DfuStatusCode::ErrProg,
            0x07 => DfuStatusCode::ErrVerify,
            0x08 => DfuStatusCode::ErrAddress,
            0x09 => DfuStatusCode::ErrNotDone,
            0x0A => DfuStatusCode::ErrFirmware,
            0x0B => DfuStatusCode::ErrVendor,
            0x0C => DfuStatusCode::ErrUsbReset,
            0x0D => DfuStatusCode::ErrPowerOnReset,
            0x0E => DfuStatusCode::ErrUnknown,
            0x0F => DfuStatusCode::ErrStalledPkt,
            other => DfuStatusCode::Other(other),
        }
    }
}

impl fmt::Display for DfuStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuStatusCode::Ok => write!(f, "OK"),
            DfuStatusCode::ErrTarget => write!(f, "errTARGET"),
            DfuStatusCode::ErrFile => write!(f, "errFILE"),
            DfuStatusCode::ErrWrite => write!(f, "errWRITE"),
            DfuStatusCode::ErrErase => write!(f, "errERASE"),
            DfuStatusCode::ErrCheckErased => write!(f, "errCHECK_ERASED"),
            DfuStatusCode::ErrProg => write!(f, "errPROG"),
            DfuStatusCode::ErrVerify => write!(f, "errVERIFY"),
            DfuStatusCode::ErrAddress => write!(f, "errADDRESS"),
            DfuStatusCode::ErrNotDone => write!(f, "errNOTDONE"),
            DfuStatusCode::ErrFirmware => write!(f, "errFIRMWARE"),
            DfuStatusCode::ErrVendor => write!(f, "errVENDOR"),
            DfuStatusCode::ErrUsbReset => write!(f, "errUSBR"),
            DfuStatusCode::ErrPowerOnReset => write!(f, "errPOR"),
            DfuStatusCode::ErrUnknown => write!(f, "errUNKNOWN"),
            DfuStatusCode::ErrStalledPkt => write!(f, "errSTALLEDPKT"),
            DfuStatusCode::Other(v) => write!(f, "status(0x{:02X})", v),
        }
    }
}

/// Decoded DFU_GETSTATUS response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuStatus {
    pub status: DfuStatusCode,
    /// Minimum time the host waits before the next GETSTATUS.
    pub poll_timeout_ms: u32,
    pub state: DfuState,
    pub string_index: u8,
}

impl DfuStatus {
    pub fn new(status: DfuStatusCode, state: DfuState) -> Self {
        Self {
            status,
            poll_timeout_ms: 0,
            state,
            string_index: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == DfuStatusCode::Ok
    }

    /// Decode the 6-byte response: bStatus, bwPollTimeout (24-bit LE),
    /// bState, iString.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < DFU_STATUS_LEN {
            return None;
        }
        let mut cursor = Cursor::new(data);
        let status = cursor.read_u8().ok()?;
        let poll_timeout_ms = cursor.read_u24::<LittleEndian>().ok()?;
        let state = cursor.read_u8().ok()?;
        let string_index = cursor.read_u8().ok()?;
        Some(Self {
            status: status.into(),
            poll_timeout_ms,
            state: state.into(),
            string_index,
        })
    }
}
