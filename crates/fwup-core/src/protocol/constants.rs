//! Protocol constants for USB DFU 1.1 with the STMicroelectronics DfuSe
//! extensions (AN3156).

use std::time::Duration;

// ============================================================================
// Device Identification
// ============================================================================

/// STMicroelectronics Vendor ID
pub const STM_VENDOR_ID: u16 = 0x0483;
/// STM32 system bootloader in DFU mode
pub const STM_DFU_PRODUCT_ID: u16 = 0xDF11;

/// Application-specific class code assigned to DFU
pub const DFU_INTERFACE_CLASS: u8 = 0xFE;
/// DFU subclass
pub const DFU_INTERFACE_SUBCLASS: u8 = 0x01;

// ============================================================================
// Memory Layout (STM32F446, 512 KB)
// ============================================================================

pub const FLASH_BASE: u32 = 0x0800_0000;
pub const FLASH_SIZE: u32 = 0x0008_0000;

/// Block size used for DFU_DNLOAD data transfers
pub const TRANSFER_SIZE: usize = 1024 * 2;

pub const SIXTEEN_K: u32 = 16 * 1024;
pub const SIXTY_FOUR_K: u32 = 64 * 1024;
pub const ONE28_K: u32 = 128 * 1024;

// ============================================================================
// DFU Class Requests
// ============================================================================

pub const DFU_DNLOAD: u8 = 0x01;
pub const DFU_GETSTATUS: u8 = 0x03;
pub const DFU_CLRSTATUS: u8 = 0x04;
pub const DFU_GETSTATE: u8 = 0x05;
pub const DFU_ABORT: u8 = 0x06;

/// Length of a DFU_GETSTATUS response
pub const DFU_STATUS_LEN: usize = 6;

// ============================================================================
// DfuSe Commands (DNLOAD with wBlockNum = 0)
// ============================================================================

pub const DFUSE_SET_ADDRESS: u8 = 0x21;
pub const DFUSE_ERASE_SECTOR: u8 = 0x41;

/// wBlockNum carrying a DfuSe command
pub const DFUSE_COMMAND_BLOCK: u16 = 0;
/// First wBlockNum carrying data; the device writes it at the address pointer
pub const DFUSE_DATA_BLOCK: u16 = 2;

// ============================================================================
// Timing
// ============================================================================

/// Timeout applied to each control transfer
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);
