//! Device memory map.
//!
//! DfuSe devices describe their memory in the DFU interface string
//! descriptor, e.g. `@Internal Flash  /0x08000000/04*016Kg,01*064Kg,03*128Kg`:
//! a name, then one or more `/<start>/<count>*<size><unit><props>` groups.
//! The property letter encodes a bitmask (`a` = 1): readable = 1,
//! erasable = 2, writable = 4.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::constants::{FLASH_BASE, ONE28_K, SIXTEEN_K, SIXTY_FOUR_K};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryMapError {
    #[error("Invalid memory descriptor '{descriptor}': {reason}")]
    InvalidDescriptor { descriptor: String, reason: String },

    #[error("Address 0x{0:08X} is outside the device memory map")]
    AddressNotMapped(u32),

    #[error("Memory region starting at 0x{0:08X} overflows the 32-bit address space")]
    Overflow(u32),
}

/// One erasable unit of device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sector {
    pub start: u32,
    pub sector_size: u32,
    /// Exclusive end address.
    pub end: u64,
    pub readable: bool,
    pub erasable: bool,
    pub writable: bool,
}

impl Sector {
    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && (address as u64) < self.end
    }
}

/// Ordered list of device sectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMemoryMap {
    pub name: String,
    pub sectors: Vec<Sector>,
}

impl DeviceMemoryMap {
    /// Build a map of read/erase/write sectors laid out back to back from
    /// `base`, one `(count, size)` group at a time.
    pub fn from_groups(
        name: impl Into<String>,
        base: u32,
        groups: &[(u32, u32)],
    ) -> Result<Self, MemoryMapError> {
        let total: u64 = groups
            .iter()
            .map(|&(count, size)| count as u64 * size as u64)
            .sum();
        if base as u64 + total > u32::MAX as u64 + 1 {
            return Err(MemoryMapError::Overflow(base));
        }
        Ok(Self {
            name: name.into(),
            sectors: build_sectors(base, groups),
        })
    }

    /// Internal flash of the STM32F446: 4x16 KB, 1x64 KB, 3x128 KB.
    pub fn stm32f446() -> Self {
        let groups = [(4, SIXTEEN_K), (1, SIXTY_FOUR_K), (3, ONE28_K)];
        let sectors = build_sectors(FLASH_BASE, &groups);
        Self {
            name: "Internal Flash".to_string(),
            sectors,
        }
    }

    /// Parse a DfuSe memory layout descriptor.
    pub fn parse_descriptor(descriptor: &str) -> Result<Self, MemoryMapError> {
        let invalid = |reason: &str| MemoryMapError::InvalidDescriptor {
            descriptor: descriptor.to_string(),
            reason: reason.to_string(),
        };

        let body = descriptor
            .strip_prefix('@')
            .ok_or_else(|| invalid("missing '@' prefix"))?;
        let mut parts = body.split('/');
        let name = parts.next().unwrap_or_default().trim().to_string();

        let mut sectors = Vec::new();
        loop {
            let Some(address) = parts.next() else { break };
            let address = address.trim();
            let hex = address
                .strip_prefix("0x")
                .or_else(|| address.strip_prefix("0X"))
                .ok_or_else(|| invalid("start address must be hexadecimal"))?;
            let mut start = u32::from_str_radix(hex, 16)
                .map_err(|_| invalid("start address must be hexadecimal"))?
                as u64;

            let layout = parts
                .next()
                .ok_or_else(|| invalid("start address without sector layout"))?;
            for group in layout.split(',').map(str::trim).filter(|g| !g.is_empty()) {
                let (count, size, props) = parse_group(group).ok_or_else(|| invalid(group))?;
                for _ in 0..count {
                    let end = start + size as u64;
                    if end > u32::MAX as u64 + 1 {
                        return Err(MemoryMapError::Overflow(start as u32));
                    }
                    sectors.push(Sector {
                        start: start as u32,
                        sector_size: size,
                        end,
                        readable: props & 0x1 != 0,
                        erasable: props & 0x2 != 0,
                        writable: props & 0x4 != 0,
                    });
                    start = end;
                }
            }
        }

        if sectors.is_empty() {
            return Err(invalid("no memory segments"));
        }
        Ok(Self { name, sectors })
    }

    pub fn sector_at(&self, address: u32) -> Option<&Sector> {
        self.sectors.iter().find(|s| s.contains(address))
    }

    /// Erasable sectors touched by `[start, start + length)`, ascending.
    ///
    /// Every byte of the range must be mapped. Sectors that are not erasable
    /// are skipped.
    pub fn erase_footprint(
        &self,
        start: u32,
        length: usize,
    ) -> Result<Vec<Sector>, MemoryMapError> {
        let end = start as u64 + length as u64;
        let mut footprint = Vec::new();
        let mut address = start as u64;
        while address < end {
            let sector = *self
                .sector_at(address as u32)
                .ok_or(MemoryMapError::AddressNotMapped(address as u32))?;
            if sector.erasable {
                footprint.push(sector);
            }
            address = sector.end;
        }
        Ok(footprint)
    }
}

fn build_sectors(base: u32, groups: &[(u32, u32)]) -> Vec<Sector> {
    let mut sectors = Vec::new();
    let mut start = base;
    for &(count, size) in groups {
        for _ in 0..count {
            sectors.push(Sector {
                start,
                sector_size: size,
                end: start as u64 + size as u64,
                readable: true,
                erasable: true,
                writable: true,
            });
            start = start.wrapping_add(size);
        }
    }
    sectors
}

/// Parse `04*016Kg` into `(count, size_in_bytes, property_bits)`.
fn parse_group(group: &str) -> Option<(u32, u32, u8)> {
    let (count, rest) = group.split_once('*')?;
    let count: u32 = count.trim().parse().ok()?;

    let rest = rest.trim_start();
    let digits_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let size: u32 = rest[..digits_end].parse().ok()?;

    let tail: Vec<char> = rest[digits_end..]
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let (multiplier, prop) = match tail.as_slice() {
        ['B', p] => (1, *p),
        ['K', p] => (1024, *p),
        ['M', p] => (1024 * 1024, *p),
        [p] => (1, *p),
        _ => return None,
    };
    if !('a'..='g').contains(&prop) {
        return None;
    }
    let props = prop as u8 - b'a' + 1;
    Some((count, size.checked_mul(multiplier)?, props))
}

#[cfg(test)]
mod tests {
    use super::*;

    const F446_DESCRIPTOR: &str = "@Internal Flash  /0x08000000/04*016Kg,01*064Kg,03*128Kg";

    #[test]
    fn test_parse_internal_flash() {
        let map = DeviceMemoryMap::parse_descriptor(F446_DESCRIPTOR).unwrap();
        assert_eq!(map.name, "Internal Flash");
        assert_eq!(map, DeviceMemoryMap::stm32f446());
        assert_eq!(map.sectors.len(), 8);
        assert_eq!(map.sectors[4].start, 0x0801_0000);
        assert_eq!(map.sectors[4].sector_size, 64 * 1024);
        assert_eq!(map.sectors[7].end, 0x0808_0000);
    }

    #[test]
    fn test_parse_properties_and_units() {
        let map = DeviceMemoryMap::parse_descriptor("@Option Bytes  /0x1FFFC000/01*016 e").unwrap();
        let sector = map.sectors[0];
        assert_eq!(sector.sector_size, 16);
        assert!(sector.readable);
        assert!(!sector.erasable);
        assert!(sector.writable);

        let descriptor = "@Mixed /0x00000000/2*1Ka/0x20000000/1*001Ma";
        let map = DeviceMemoryMap::parse_descriptor(descriptor).unwrap();
        assert_eq!(map.sectors.len(), 3);
        assert_eq!(map.sectors[2].start, 0x2000_0000);
        assert_eq!(map.sectors[2].sector_size, 1024 * 1024);
        assert!(!map.sectors[2].erasable);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(DeviceMemoryMap::parse_descriptor("Internal Flash").is_err());
        assert!(DeviceMemoryMap::parse_descriptor("@Internal Flash").is_err());
        assert!(DeviceMemoryMap::parse_descriptor("@Flash /08000000/04*016Kg").is_err());
        assert!(DeviceMemoryMap::parse_descriptor("@Flash /0x08000000/04*016Kz").is_err());
    }

    #[test]
    fn test_from_groups_matches_builtin() {
        let map = DeviceMemoryMap::from_groups(
            "Internal Flash",
            FLASH_BASE,
            &[(4, SIXTEEN_K), (1, SIXTY_FOUR_K), (3, ONE28_K)],
        )
        .unwrap();
        assert_eq!(map, DeviceMemoryMap::stm32f446());
        assert!(DeviceMemoryMap::from_groups("x", 0xFFFF_0000, &[(2, 0x10000)]).is_err());
    }

    #[test]
    fn test_erase_footprint() {
        let map = DeviceMemoryMap::stm32f446();

        let one = map.erase_footprint(0x0800_0000, 16).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].start, 0x0800_0000);

        let spanning = map.erase_footprint(0x0800_FFF0, 0x20).unwrap();
        let starts: Vec<u32> = spanning.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![0x0800_C000, 0x0801_0000]);

        assert_eq!(
            map.erase_footprint(0x0807_FFFF, 2),
            Err(MemoryMapError::AddressNotMapped(0x0808_0000))
        );
    }
}
