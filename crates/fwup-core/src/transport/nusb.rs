//! nusb-based DfuSe transport and device broker.
//!
//! All transfers go over the default control pipe as DFU class requests
//! addressed to the claimed interface. nusb operations are driven to
//! completion with `.wait()`.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use nusb::descriptors::language_id::US_ENGLISH;
use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient};
use nusb::{Device, DeviceInfo, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, warn};

use super::traits::{
    DeviceBroker, DeviceCandidate, DfuInterface, DfuTransport, DiscoveryError, TransportError,
    UsbIdentity,
};
use crate::protocol::constants::*;
use crate::protocol::{DeviceMemoryMap, DfuState, DfuStatus, Sector};

/// Default ceiling on GETSTATUS polls while waiting for a state.
pub const DEFAULT_MAX_POLLS: u32 = 5000;

/// DfuSe transport over a claimed nusb interface.
pub struct NusbTransport {
    interface: Option<Interface>,
    interface_number: u8,
    memory_map: Option<DeviceMemoryMap>,
    /// Start addresses of sectors erased since the map was bound.
    erased: Mutex<BTreeSet<u32>>,
    max_polls: u32,
    vid: u16,
    pid: u16,
}

impl NusbTransport {
    pub fn vendor_id(&self) -> u16 {
        self.vid
    }

    pub fn product_id(&self) -> u16 {
        self.pid
    }

    fn interface(&self) -> Result<&Interface, TransportError> {
        self.interface.as_ref().ok_or(TransportError::NotOpen)
    }

    fn control_in(
        &self,
        request: u8,
        name: &'static str,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        self.interface()?
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value: 0,
                    index: self.interface_number as u16,
                    length,
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(|e| TransportError::ControlFailed {
                request: name,
                message: e.to_string(),
            })
    }

    fn control_out(
        &self,
        request: u8,
        name: &'static str,
        value: u16,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.interface()?
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index: self.interface_number as u16,
                    data,
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(|e| TransportError::ControlFailed {
                request: name,
                message: e.to_string(),
            })
    }

    fn download(&self, block: u16, data: &[u8]) -> Result<(), TransportError> {
        self.control_out(DFU_DNLOAD, "DFU_DNLOAD", block, data)
    }

    /// Send a DfuSe command carrying a 32-bit address and wait for it to
    /// complete.
    fn dfuse_command(&self, command: u8, address: u32) -> Result<(), TransportError> {
        self.download(DFUSE_COMMAND_BLOCK, &command_payload(command, address))?;
        let status = poll_status(
            || self.get_status(),
            &|state| state != DfuState::DnBusy,
            self.max_polls,
        )?;
        command_result(status)
    }

    fn erased_sectors(&self) -> std::sync::MutexGuard<'_, BTreeSet<u32>> {
        self.erased.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `[command, address as u32 LE]`
fn command_payload(command: u8, address: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(5);
    payload.push(command);
    payload.extend_from_slice(&address.to_le_bytes());
    payload
}

/// Poll `get_status` until `predicate` accepts the state or the device
/// enters `dfuERROR`, sleeping for the device-requested interval between
/// attempts. Gives up with `PollTimeout` after `max_polls` attempts.
fn poll_status(
    mut get_status: impl FnMut() -> Result<DfuStatus, TransportError>,
    predicate: &dyn Fn(DfuState) -> bool,
    max_polls: u32,
) -> Result<DfuStatus, TransportError> {
    let mut status = get_status()?;
    let mut attempts = 1;
    while !predicate(status.state) && status.state != DfuState::Error {
        if attempts >= max_polls {
            return Err(TransportError::PollTimeout { attempts });
        }
        thread::sleep(Duration::from_millis(status.poll_timeout_ms as u64));
        status = get_status()?;
        attempts += 1;
    }
    Ok(status)
}

/// A DfuSe command succeeded only if it finished with an OK status outside
/// `dfuERROR`.
fn command_result(status: DfuStatus) -> Result<(), TransportError> {
    if status.is_ok() && status.state != DfuState::Error {
        Ok(())
    } else {
        Err(TransportError::DeviceStatus {
            status: status.status,
            state: status.state,
        })
    }
}

/// wBlockNum for a download. Data always goes in block 2 so the device
/// writes it at the address pointer; the empty manifestation request is
/// block 0.
fn block_number(data: &[u8]) -> u16 {
    if data.is_empty() {
        DFUSE_COMMAND_BLOCK
    } else {
        DFUSE_DATA_BLOCK
    }
}

/// Sectors of `footprint` not yet in `erased`.
fn pending_sectors(footprint: Vec<Sector>, erased: &BTreeSet<u32>) -> Vec<Sector> {
    footprint
        .into_iter()
        .filter(|sector| !erased.contains(&sector.start))
        .collect()
}

impl DfuTransport for NusbTransport {
    fn get_status(&self) -> Result<DfuStatus, TransportError> {
        let data = self.control_in(DFU_GETSTATUS, "DFU_GETSTATUS", DFU_STATUS_LEN as u16)?;
        DfuStatus::from_bytes(&data).ok_or_else(|| {
            TransportError::InvalidResponse(format!("GETSTATUS returned {} bytes", data.len()))
        })
    }

    fn get_state(&self) -> Result<DfuState, TransportError> {
        let data = self.control_in(DFU_GETSTATE, "DFU_GETSTATE", 1)?;
        data.first()
            .map(|&b| DfuState::from(b))
            .ok_or_else(|| TransportError::InvalidResponse("GETSTATE returned no data".into()))
    }

    fn clear_status(&self) -> Result<(), TransportError> {
        self.control_out(DFU_CLRSTATUS, "DFU_CLRSTATUS", 0, &[])
    }

    fn abort(&self) -> Result<(), TransportError> {
        self.control_out(DFU_ABORT, "DFU_ABORT", 0, &[])
    }

    #[instrument(skip(self), fields(address = %format!("0x{:08X}", address)))]
    fn erase(&self, address: u32, length: usize) -> Result<(), TransportError> {
        let map = self.memory_map.as_ref().ok_or(TransportError::NoMemoryMap)?;
        let footprint = map.erase_footprint(address, length)?;
        let pending = pending_sectors(footprint, &self.erased_sectors());
        for sector in pending {
            debug!(
                sector = %format!("0x{:08X}", sector.start),
                size = sector.sector_size,
                "Erasing sector"
            );
            self.dfuse_command(DFUSE_ERASE_SECTOR, sector.start)?;
            self.erased_sectors().insert(sector.start);
        }
        Ok(())
    }

    fn set_address_pointer(&self, address: u32) -> Result<(), TransportError> {
        self.dfuse_command(DFUSE_SET_ADDRESS, address)
    }

    fn write_block(&self, data: &[u8]) -> Result<(), TransportError> {
        self.download(block_number(data), data)
    }

    fn poll_until(
        &self,
        predicate: &dyn Fn(DfuState) -> bool,
    ) -> Result<DfuStatus, TransportError> {
        poll_status(|| self.get_status(), predicate, self.max_polls)
    }

    fn bind_memory_map(&mut self, map: DeviceMemoryMap) {
        self.erased_sectors().clear();
        self.memory_map = Some(map);
    }

    fn close(&mut self) -> Result<(), TransportError> {
        match self.interface.take() {
            Some(interface) => {
                drop(interface);
                debug!("Released DFU interface {}", self.interface_number);
                Ok(())
            }
            None => Err(TransportError::NotOpen),
        }
    }
}

/// Device broker backed by the host USB stack.
///
/// Every enumerable device counts as authorized. An interactive request
/// waits for a matching device to appear, up to `wait_timeout`.
pub struct NusbBroker {
    wait_timeout: Duration,
    poll_interval: Duration,
    max_polls: u32,
}

impl NusbBroker {
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            wait_timeout,
            poll_interval: Duration::from_millis(100),
            max_polls: DEFAULT_MAX_POLLS,
        }
    }

    pub fn with_max_polls(mut self, max_polls: u32) -> Self {
        self.max_polls = max_polls.max(1);
        self
    }

    fn matching(identity: UsbIdentity) -> Result<Vec<DeviceInfo>, DiscoveryError> {
        Ok(list_devices()
            .wait()
            .map_err(|e| DiscoveryError::Enumeration(e.to_string()))?
            .filter(|d| {
                d.vendor_id() == identity.vendor_id && d.product_id() == identity.product_id
            })
            .collect())
    }

    fn candidate(info: &DeviceInfo) -> DeviceCandidate {
        DeviceCandidate {
            identity: UsbIdentity {
                vendor_id: info.vendor_id(),
                product_id: info.product_id(),
            },
            bus_id: info.bus_id().to_string(),
            address: info.device_address(),
            serial: info.serial_number().map(str::to_string),
        }
    }

    fn open_device(device: &DeviceCandidate) -> Result<Device, DiscoveryError> {
        let info = Self::matching(device.identity)?
            .into_iter()
            .find(|d| d.bus_id() == device.bus_id && d.device_address() == device.address)
            .ok_or_else(|| DiscoveryError::DeviceGone(device.to_string()))?;

        info.open()
            .wait()
            .map_err(|e| DiscoveryError::OpenFailed(e.to_string()))
    }
}

impl DeviceBroker for NusbBroker {
    type Transport = NusbTransport;

    fn authorized_devices(
        &mut self,
        identity: UsbIdentity,
    ) -> Result<Vec<DeviceCandidate>, DiscoveryError> {
        Ok(Self::matching(identity)?.iter().map(Self::candidate).collect())
    }

    #[instrument(skip(self), fields(identity = %identity))]
    fn request_device(
        &mut self,
        identity: UsbIdentity,
    ) -> Result<Option<DeviceCandidate>, DiscoveryError> {
        info!("Waiting for bootloader device...");
        let start = Instant::now();
        let mut poll_count = 0u64;

        loop {
            poll_count += 1;
            if let Some(info) = Self::matching(identity)?.first() {
                info!("Device found after {} polls", poll_count);
                return Ok(Some(Self::candidate(info)));
            }
            if start.elapsed() > self.wait_timeout {
                warn!(
                    "No bootloader device after {}s",
                    self.wait_timeout.as_secs()
                );
                return Ok(None);
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn dfu_interfaces(
        &mut self,
        device: &DeviceCandidate,
    ) -> Result<Vec<DfuInterface>, DiscoveryError> {
        let handle = Self::open_device(device)?;
        let config = handle
            .active_configuration()
            .map_err(|e| DiscoveryError::OpenFailed(format!("Failed to get config: {}", e)))?;

        let mut interfaces = Vec::new();
        for alt in config.interface_alt_settings() {
            if alt.class() != DFU_INTERFACE_CLASS || alt.subclass() != DFU_INTERFACE_SUBCLASS {
                continue;
            }
            let name = alt.string_index().and_then(|index| {
                handle
                    .get_string_descriptor(index, US_ENGLISH, CONTROL_TIMEOUT)
                    .wait()
                    .inspect_err(|e| warn!(error = %e, "Could not read interface string"))
                    .ok()
            });
            interfaces.push(DfuInterface {
                number: alt.interface_number(),
                alt_setting: alt.alternate_setting(),
                name,
            });
        }
        Ok(interfaces)
    }

    #[instrument(skip(self), fields(device = %device, interface = interface.number))]
    fn open(
        &mut self,
        device: &DeviceCandidate,
        interface: &DfuInterface,
    ) -> Result<NusbTransport, DiscoveryError> {
        let handle = Self::open_device(device)?;
        let claimed = handle
            .claim_interface(interface.number)
            .wait()
            .map_err(|e| DiscoveryError::ClaimInterfaceFailed {
                interface: interface.number,
                message: e.to_string(),
            })?;

        if interface.alt_setting != 0 {
            claimed
                .set_alt_setting(interface.alt_setting)
                .wait()
                .map_err(|e| DiscoveryError::ClaimInterfaceFailed {
                    interface: interface.number,
                    message: format!("alt setting {}: {}", interface.alt_setting, e),
                })?;
        }

        info!("DFU interface claimed");
        Ok(NusbTransport {
            interface: Some(claimed),
            interface_number: interface.number,
            memory_map: None,
            erased: Mutex::new(BTreeSet::new()),
            max_polls: self.max_polls,
            vid: device.identity.vendor_id,
            pid: device.identity.product_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DfuStatusCode;

    fn statuses(
        states: &[(DfuStatusCode, DfuState)],
    ) -> impl FnMut() -> Result<DfuStatus, TransportError> + '_ {
        let mut iter = states.iter();
        move || {
            iter.next()
                .map(|&(code, state)| DfuStatus::new(code, state))
                .ok_or(TransportError::Disconnected)
        }
    }

    fn not_busy(state: DfuState) -> bool {
        state != DfuState::DnBusy
    }

    #[test]
    fn test_command_payload_is_little_endian() {
        assert_eq!(
            command_payload(DFUSE_SET_ADDRESS, 0x0801_0000),
            vec![0x21, 0x00, 0x00, 0x01, 0x08]
        );
    }

    #[test]
    fn test_poll_waits_out_busy() {
        let script = [
            (DfuStatusCode::Ok, DfuState::DnBusy),
            (DfuStatusCode::Ok, DfuState::DnBusy),
            (DfuStatusCode::Ok, DfuState::DnloadIdle),
        ];
        let status = poll_status(statuses(&script), &not_busy, 10).unwrap();
        assert_eq!(status.state, DfuState::DnloadIdle);
        assert!(command_result(status).is_ok());
    }

    #[test]
    fn test_poll_stops_on_error_state() {
        let script = [
            (DfuStatusCode::Ok, DfuState::DnBusy),
            (DfuStatusCode::ErrErase, DfuState::Error),
            (DfuStatusCode::Ok, DfuState::DnloadIdle),
        ];
        let status = poll_status(statuses(&script), &|s| s == DfuState::DnloadIdle, 10).unwrap();
        assert_eq!(status.state, DfuState::Error);

        let err = command_result(status).unwrap_err();
        assert!(matches!(
            err,
            TransportError::DeviceStatus {
                status: DfuStatusCode::ErrErase,
                state: DfuState::Error
            }
        ));
    }

    #[test]
    fn test_poll_ceiling_times_out() {
        let script = [(DfuStatusCode::Ok, DfuState::DnBusy); 5];
        let err = poll_status(statuses(&script), &not_busy, 3).unwrap_err();
        assert!(matches!(err, TransportError::PollTimeout { attempts: 3 }));
    }

    #[test]
    fn test_poll_propagates_transfer_failure() {
        let script = [(DfuStatusCode::Ok, DfuState::DnBusy)];
        let err = poll_status(statuses(&script), &not_busy, 10).unwrap_err();
        assert!(matches!(err, TransportError::Disconnected));
    }

    #[test]
    fn test_bad_status_fails_command() {
        let status = DfuStatus::new(DfuStatusCode::ErrUnknown, DfuState::DnloadIdle);
        assert!(command_result(status).is_err());
    }

    #[test]
    fn test_data_goes_in_block_two() {
        assert_eq!(block_number(&[0xFF; 16]), DFUSE_DATA_BLOCK);
        assert_eq!(block_number(&[]), DFUSE_COMMAND_BLOCK);
    }

    #[test]
    fn test_shared_sector_is_erased_once() {
        let map = DeviceMemoryMap::stm32f446();
        let mut erased = BTreeSet::new();

        let first = pending_sectors(map.erase_footprint(0x0801_0000, 4).unwrap(), &erased);
        assert_eq!(first.len(), 1);
        erased.insert(first[0].start);

        let second = pending_sectors(map.erase_footprint(0x0801_1004, 4).unwrap(), &erased);
        assert!(second.is_empty());

        let third = pending_sectors(map.erase_footprint(0x0801_FFFC, 8).unwrap(), &erased);
        assert_eq!(third.iter().map(|s| s.start).collect::<Vec<_>>(), vec![0x0802_0000]);
    }
}
