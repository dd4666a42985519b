//! Target profile: every device-family constant the updater depends on.
//!
//! The default profile describes the STM32F446-based instrument. Another
//! family can be targeted by loading a TOML profile.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::image::{MERGE_GAP_THRESHOLD, SafeRange};
use crate::protocol::{
    DeviceMemoryMap, FLASH_BASE, FLASH_SIZE, MemoryMapError, ONE28_K, SIXTEEN_K, SIXTY_FOUR_K,
    STM_DFU_PRODUCT_ID, STM_VENDOR_ID, TRANSFER_SIZE,
};
use crate::transport::UsbIdentity;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("Block size must be non-zero")]
    ZeroBlockSize,

    #[error("At least one safe range is required")]
    NoSafeRanges,

    #[error("Safe range {0} is inverted")]
    InvertedRange(SafeRange),

    #[error("Safe range {0} lies outside flash")]
    RangeOutsideFlash(SafeRange),

    #[error("Default sector map is empty")]
    EmptySectorMap,

    #[error("Default sector map: {0}")]
    SectorMap(#[from] MemoryMapError),
}

/// `count` sectors of `size` bytes each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorGroup {
    pub count: u32,
    pub size: u32,
}

/// Device-family configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetProfile {
    /// Display name.
    pub name: String,
    pub flash_base: u32,
    pub flash_size: u32,
    /// Bytes per DFU download block.
    pub block_size: usize,
    /// Segments closer than this are merged into one erase/write run.
    pub merge_gap: u32,
    /// Sent over the application channel to reboot into the bootloader.
    pub bootloader_command: String,
    pub bootloader_command_timeout_ms: u64,
    /// Asks the running firmware for its version.
    pub version_command: String,
    pub version_command_timeout_ms: u64,
    /// Wait after the bootloader-entry command.
    pub bootloader_settle_ms: u64,
    /// Wait after manifestation before reporting completion.
    pub reboot_settle_ms: u64,
    /// How long an interactive device request waits for a device.
    pub device_wait_secs: u64,
    /// Ceiling on status polls while waiting for the device to go idle.
    pub max_status_polls: u32,
    pub bootloader: UsbIdentity,
    pub safe_ranges: Vec<SafeRange>,
    /// Used when the device does not describe its own memory.
    pub sectors: Vec<SectorGroup>,
}

impl Default for TargetProfile {
    fn default() -> Self {
        Self {
            name: "STM32F446".to_string(),
            flash_base: FLASH_BASE,
            flash_size: FLASH_SIZE,
            block_size: TRANSFER_SIZE,
            merge_gap: MERGE_GAP_THRESHOLD,
            bootloader_command: ":SYST:DFU 42".to_string(),
            bootloader_command_timeout_ms: 1000,
            version_command: ":PeopleDetection:VERSION?".to_string(),
            version_command_timeout_ms: 2000,
            bootloader_settle_ms: 2000,
            reboot_settle_ms: 3000,
            device_wait_secs: 30,
            max_status_polls: 5000,
            bootloader: UsbIdentity {
                vendor_id: STM_VENDOR_ID,
                product_id: STM_DFU_PRODUCT_ID,
            },
            safe_ranges: vec![
                // interrupt vectors
                SafeRange::new(0x0800_0000, 0x0800_3FFF),
                // application, past the EEPROM-emulation sectors
                SafeRange::new(0x0801_0000, 0x0807_FFFF),
            ],
            sectors: vec![
                SectorGroup {
                    count: 4,
                    size: SIXTEEN_K,
                },
                SectorGroup {
                    count: 1,
                    size: SIXTY_FOUR_K,
                },
                SectorGroup {
                    count: 3,
                    size: ONE28_K,
                },
            ],
        }
    }
}

impl TargetProfile {
    /// Load and validate a profile from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read profile {}", path.display()))?;
        let profile: TargetProfile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse profile {}", path.display()))?;
        profile.validate()?;
        Ok(profile)
    }

    /// Save the profile to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.block_size == 0 {
            return Err(ProfileError::ZeroBlockSize);
        }
        if self.safe_ranges.is_empty() {
            return Err(ProfileError::NoSafeRanges);
        }

        let flash_end = self.flash_base as u64 + self.flash_size as u64;
        for range in &self.safe_ranges {
            if range.start > range.end {
                return Err(ProfileError::InvertedRange(*range));
            }
            if range.start < self.flash_base || range.end as u64 >= flash_end {
                return Err(ProfileError::RangeOutsideFlash(*range));
            }
        }

        if self.sectors.iter().all(|g| g.count == 0 || g.size == 0) {
            return Err(ProfileError::EmptySectorMap);
        }
        self.default_memory_map()?;
        Ok(())
    }

    /// Sector map built from `sectors`, starting at the flash base.
    pub fn default_memory_map(&self) -> Result<DeviceMemoryMap, MemoryMapError> {
        let groups: Vec<(u32, u32)> = self.sectors.iter().map(|g| (g.count, g.size)).collect();
        DeviceMemoryMap::from_groups(format!("{} (default)", self.name), self.flash_base, &groups)
    }

    pub fn bootloader_command_timeout(&self) -> Duration {
        Duration::from_millis(self.bootloader_command_timeout_ms)
    }

    pub fn version_command_timeout(&self) -> Duration {
        Duration::from_millis(self.version_command_timeout_ms)
    }

    pub fn bootloader_settle(&self) -> Duration {
        Duration::from_millis(self.bootloader_settle_ms)
    }

    pub fn reboot_settle(&self) -> Duration {
        Duration::from_millis(self.reboot_settle_ms)
    }

    pub fn device_wait(&self) -> Duration {
        Duration::from_secs(self.device_wait_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profile_is_valid() {
        let profile = TargetProfile::default();
        profile.validate().unwrap();

        let map = profile.default_memory_map().unwrap();
        assert_eq!(map.sectors, DeviceMemoryMap::stm32f446().sectors);
        assert_eq!(map.sectors.last().unwrap().end, 0x0808_0000);
    }

    #[test]
    fn test_toml_round_trip_and_partial_profile() {
        let profile = TargetProfile::default();
        let text = profile.to_toml().unwrap();
        let back: TargetProfile = toml::from_str(&text).unwrap();
        assert_eq!(back, profile);

        let partial: TargetProfile =
            toml::from_str("block_size = 1024\nreboot_settle_ms = 0\n").unwrap();
        assert_eq!(partial.block_size, 1024);
        assert_eq!(partial.reboot_settle(), Duration::ZERO);
        assert_eq!(partial.safe_ranges, profile.safe_ranges);
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        let mut profile = TargetProfile::default();
        profile.safe_ranges = vec![SafeRange::new(0x0801_0000, 0x0800_0000)];
        assert!(matches!(profile.validate(), Err(ProfileError::InvertedRange(_))));

        profile.safe_ranges = vec![SafeRange::new(0x2000_0000, 0x2000_FFFF)];
        assert!(matches!(profile.validate(), Err(ProfileError::RangeOutsideFlash(_))));

        profile.safe_ranges.clear();
        assert_eq!(profile.validate(), Err(ProfileError::NoSafeRanges));
    }

    #[test]
    fn test_validate_rejects_zero_block_and_empty_map() {
        let mut profile = TargetProfile::default();
        profile.block_size = 0;
        assert_eq!(profile.validate(), Err(ProfileError::ZeroBlockSize));

        let mut profile = TargetProfile::default();
        profile.sectors.clear();
        assert_eq!(profile.validate(), Err(ProfileError::EmptySectorMap));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("fwup-profile-{}.toml", std::process::id()));
        let mut profile = TargetProfile::default();
        profile.name = "bench".into();
        profile.save_to_file(&path).unwrap();

        let loaded = TargetProfile::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded.name, "bench");
    }
}
