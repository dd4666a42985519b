//! Scripted transport and broker for testing without hardware.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use super::traits::{
    DeviceBroker, DeviceCandidate, DfuInterface, DfuTransport, DiscoveryError, TransportError,
    UsbIdentity,
};
use crate::protocol::{
    DeviceMemoryMap, DfuState, DfuStatus, DfuStatusCode, STM_DFU_PRODUCT_ID, STM_VENDOR_ID,
};

/// A call recorded by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    GetStatus,
    GetState,
    ClearStatus,
    Abort,
    Erase { address: u32, length: usize },
    SetAddress(u32),
    WriteBlock { len: usize },
    PollUntil,
    BindMemoryMap,
    Close,
}

#[derive(Debug)]
struct MockState {
    state: DfuState,
    address_pointer: u32,
    writes: usize,
    calls: Vec<MockCall>,
    memory: BTreeMap<u32, u8>,
    memory_map: Option<DeviceMemoryMap>,
    erased_sectors: BTreeSet<u32>,
    closed: bool,
    fail_write_at: Option<usize>,
    fail_erase: bool,
    fail_manifest_poll: bool,
    fail_recovery: bool,
    fail_close: bool,
}

/// Mock transport for unit testing flash and orchestration logic.
///
/// Clones share state, so a test can keep one handle for inspection after
/// moving another into the code under test.
#[derive(Debug, Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockState {
                state: DfuState::DfuIdle,
                address_pointer: 0,
                writes: 0,
                calls: Vec::new(),
                memory: BTreeMap::new(),
                memory_map: None,
                erased_sectors: BTreeSet::new(),
                closed: false,
                fail_write_at: None,
                fail_erase: false,
                fail_manifest_poll: false,
                fail_recovery: false,
                fail_close: false,
            })),
        }
    }

    /// Start in the given device state.
    pub fn with_state(self, state: DfuState) -> Self {
        self.inner.lock().unwrap().state = state;
        self
    }

    /// Fail the `n`th data block (1-based) and enter `dfuERROR`.
    pub fn fail_write_at(self, n: usize) -> Self {
        self.inner.lock().unwrap().fail_write_at = Some(n);
        self
    }

    pub fn fail_erase(self) -> Self {
        self.inner.lock().unwrap().fail_erase = true;
        self
    }

    /// Simulate the device dropping off the bus while manifesting.
    pub fn fail_manifest_poll(self) -> Self {
        self.inner.lock().unwrap().fail_manifest_poll = true;
        self
    }

    /// Make CLRSTATUS and ABORT fail.
    pub fn fail_recovery(self) -> Self {
        self.inner.lock().unwrap().fail_recovery = true;
        self
    }

    pub fn fail_close(self) -> Self {
        self.inner.lock().unwrap().fail_close = true;
        self
    }

    /// All recorded calls, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Number of recorded calls matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&MockCall) -> bool) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| predicate(c))
            .count()
    }

    /// Byte written at `address`, if any.
    pub fn byte_at(&self, address: u32) -> Option<u8> {
        self.inner.lock().unwrap().memory.get(&address).copied()
    }

    pub fn written_bytes(&self) -> usize {
        self.inner.lock().unwrap().memory.len()
    }

    pub fn state(&self) -> DfuState {
        self.inner.lock().unwrap().state
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn memory_map(&self) -> Option<DeviceMemoryMap> {
        self.inner.lock().unwrap().memory_map.clone()
    }

    /// Start addresses of sectors erased since the map was bound.
    pub fn erased_sectors(&self) -> Vec<u32> {
        self.inner
            .lock()
            .unwrap()
            .erased_sectors
            .iter()
            .copied()
            .collect()
    }

    fn record(
        &self,
        call: MockCall,
    ) -> Result<std::sync::MutexGuard<'_, MockState>, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(call);
        if inner.closed {
            return Err(TransportError::NotOpen);
        }
        Ok(inner)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl DfuTransport for MockTransport {
    fn get_status(&self) -> Result<DfuStatus, TransportError> {
        let inner = self.record(MockCall::GetStatus)?;
        let status = if inner.state == DfuState::Error {
            DfuStatusCode::ErrUnknown
        } else {
            DfuStatusCode::Ok
        };
        Ok(DfuStatus::new(status, inner.state))
    }

    fn get_state(&self) -> Result<DfuState, TransportError> {
        Ok(self.record(MockCall::GetState)?.state)
    }

    fn clear_status(&self) -> Result<(), TransportError> {
        let mut inner = self.record(MockCall::ClearStatus)?;
        if inner.fail_recovery {
            return Err(TransportError::ControlFailed {
                request: "DFU_CLRSTATUS",
                message: "stalled".into(),
            });
        }
        inner.state = DfuState::DfuIdle;
        Ok(())
    }

    fn abort(&self) -> Result<(), TransportError> {
        let mut inner = self.record(MockCall::Abort)?;
        if inner.fail_recovery {
            return Err(TransportError::ControlFailed {
                request: "DFU_ABORT",
                message: "stalled".into(),
            });
        }
        inner.state = DfuState::DfuIdle;
        Ok(())
    }

    fn erase(&self, address: u32, length: usize) -> Result<(), TransportError> {
        let mut inner = self.record(MockCall::Erase { address, length })?;
        if inner.fail_erase {
            inner.state = DfuState::Error;
            return Err(TransportError::DeviceStatus {
                status: DfuStatusCode::ErrErase,
                state: DfuState::Error,
            });
        }
        // Without a map the erase is byte-exact; with one it is sector-sized
        // and each sector is erased once per bound map.
        let ranges: Vec<(u64, u64)> = match inner.memory_map.clone() {
            None => vec![(address as u64, address as u64 + length as u64)],
            Some(map) => {
                let footprint = map.erase_footprint(address, length)?;
                let mut ranges = Vec::new();
                for sector in footprint {
                    if inner.erased_sectors.insert(sector.start) {
                        ranges.push((sector.start as u64, sector.end));
                    }
                }
                ranges
            }
        };
        for (start, end) in ranges {
            inner
                .memory
                .retain(|&a, _| (a as u64) < start || (a as u64) >= end);
        }
        inner.state = DfuState::DnloadIdle;
        Ok(())
    }

    fn set_address_pointer(&self, address: u32) -> Result<(), TransportError> {
        let mut inner = self.record(MockCall::SetAddress(address))?;
        inner.address_pointer = address;
        inner.state = DfuState::DnloadIdle;
        Ok(())
    }

    fn write_block(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.record(MockCall::WriteBlock { len: data.len() })?;
        if data.is_empty() {
            inner.state = DfuState::Manifest;
            return Ok(());
        }

        inner.writes += 1;
        if inner.fail_write_at == Some(inner.writes) {
            inner.state = DfuState::Error;
            return Err(TransportError::ControlFailed {
                request: "DFU_DNLOAD",
                message: format!("pipe error on block {}", inner.writes),
            });
        }

        let base = inner.address_pointer;
        for (i, byte) in data.iter().enumerate() {
            inner.memory.insert(base.wrapping_add(i as u32), *byte);
        }
        inner.state = DfuState::DnloadIdle;
        Ok(())
    }

    fn poll_until(
        &self,
        predicate: &dyn Fn(DfuState) -> bool,
    ) -> Result<DfuStatus, TransportError> {
        let inner = self.record(MockCall::PollUntil)?;
        let manifesting = matches!(inner.state, DfuState::Manifest | DfuState::ManifestSync);
        if manifesting && inner.fail_manifest_poll {
            return Err(TransportError::Disconnected);
        }
        if inner.state == DfuState::Error {
            return Ok(DfuStatus::new(DfuStatusCode::ErrUnknown, DfuState::Error));
        }
        if predicate(inner.state) {
            Ok(DfuStatus::new(DfuStatusCode::Ok, inner.state))
        } else {
            Err(TransportError::PollTimeout { attempts: 1 })
        }
    }

    fn bind_memory_map(&mut self, map: DeviceMemoryMap) {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(MockCall::BindMemoryMap);
        inner.erased_sectors.clear();
        inner.memory_map = Some(map);
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let mut inner = self.record(MockCall::Close)?;
        inner.closed = true;
        if inner.fail_close {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BrokerLog {
    authorized_queries: usize,
    requests: usize,
    opens: usize,
}

/// Mock device broker handing out a [`MockTransport`].
#[derive(Debug, Clone)]
pub struct MockBroker {
    authorized: Vec<DeviceCandidate>,
    grant: Option<DeviceCandidate>,
    interfaces: Vec<DfuInterface>,
    transport: MockTransport,
    log: Arc<Mutex<BrokerLog>>,
}

impl MockBroker {
    /// A broker with one already-authorized STM32 bootloader exposing the
    /// F446 internal flash interface.
    pub fn new(transport: MockTransport) -> Self {
        let device = Self::bootloader_candidate();
        Self {
            authorized: vec![device.clone()],
            grant: Some(device),
            interfaces: vec![DfuInterface {
                number: 0,
                alt_setting: 0,
                name: Some("@Internal Flash  /0x08000000/04*016Kg,01*064Kg,03*128Kg".into()),
            }],
            transport,
            log: Arc::new(Mutex::new(BrokerLog::default())),
        }
    }

    pub fn bootloader_candidate() -> DeviceCandidate {
        DeviceCandidate {
            identity: UsbIdentity {
                vendor_id: STM_VENDOR_ID,
                product_id: STM_DFU_PRODUCT_ID,
            },
            bus_id: "1".into(),
            address: 7,
            serial: Some("2060336B5841".into()),
        }
    }

    /// No device is authorized up front; the interactive request grants one.
    pub fn unauthorized(mut self) -> Self {
        self.authorized.clear();
        self
    }

    /// The operator cancels the interactive request.
    pub fn cancel_request(mut self) -> Self {
        self.grant = None;
        self
    }

    pub fn with_interfaces(mut self, interfaces: Vec<DfuInterface>) -> Self {
        self.interfaces = interfaces;
        self
    }

    pub fn opens(&self) -> usize {
        self.log.lock().unwrap().opens
    }

    pub fn requests(&self) -> usize {
        self.log.lock().unwrap().requests
    }

    pub fn authorized_queries(&self) -> usize {
        self.log.lock().unwrap().authorized_queries
    }
}

impl DeviceBroker for MockBroker {
    type Transport = MockTransport;

    fn authorized_devices(
        &mut self,
        identity: UsbIdentity,
    ) -> Result<Vec<DeviceCandidate>, DiscoveryError> {
        self.log.lock().unwrap().authorized_queries += 1;
        Ok(self
            .authorized
            .iter()
            .filter(|d| d.identity == identity)
            .cloned()
            .collect())
    }

    fn request_device(
        &mut self,
        identity: UsbIdentity,
    ) -> Result<Option<DeviceCandidate>, DiscoveryError> {
        self.log.lock().unwrap().requests += 1;
        Ok(self.grant.clone().filter(|d| d.identity == identity))
    }

    fn dfu_interfaces(
        &mut self,
        _device: &DeviceCandidate,
    ) -> Result<Vec<DfuInterface>, DiscoveryError> {
        Ok(self.interfaces.clone())
    }

    fn open(
        &mut self,
        _device: &DeviceCandidate,
        _interface: &DfuInterface,
    ) -> Result<MockTransport, DiscoveryError> {
        self.log.lock().unwrap().opens += 1;
        Ok(self.transport.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_write_lands_at_address_pointer() {
        let mock = MockTransport::new();
        mock.set_address_pointer(0x0800_0000).unwrap();
        mock.write_block(&[1, 2, 3]).unwrap();

        assert_eq!(mock.byte_at(0x0800_0002), Some(3));
        assert_eq!(mock.written_bytes(), 3);
        assert_eq!(
            mock.calls(),
            vec![MockCall::SetAddress(0x0800_0000), MockCall::WriteBlock { len: 3 }]
        );
    }

    #[test]
    fn test_mock_write_failure_enters_error() {
        let mock = MockTransport::new().fail_write_at(2);
        mock.write_block(&[1]).unwrap();
        assert!(mock.write_block(&[2]).is_err());
        assert_eq!(mock.state(), DfuState::Error);

        let status = mock.poll_until_idle().unwrap();
        assert_eq!(status.state, DfuState::Error);
        assert!(!status.is_ok());
    }

    #[test]
    fn test_mock_erase_is_sector_sized_with_map() {
        let mut mock = MockTransport::new();
        mock.bind_memory_map(DeviceMemoryMap::stm32f446());
        mock.set_address_pointer(0x0800_4010).unwrap();
        mock.write_block(&[1]).unwrap();

        mock.erase(0x0800_4000, 4).unwrap();
        assert_eq!(mock.byte_at(0x0800_4010), None);
        assert_eq!(mock.erased_sectors(), vec![0x0800_4000]);

        // the same sector is not erased again
        mock.set_address_pointer(0x0800_4010).unwrap();
        mock.write_block(&[2]).unwrap();
        mock.erase(0x0800_5000, 4).unwrap();
        assert_eq!(mock.byte_at(0x0800_4010), Some(2));
        assert_eq!(mock.erased_sectors(), vec![0x0800_4000]);
    }

    #[test]
    fn test_mock_close() {
        let mut mock = MockTransport::new();
        let handle = mock.clone();
        mock.close().unwrap();
        assert!(handle.is_closed());
        assert!(matches!(mock.get_state(), Err(TransportError::NotOpen)));
    }

    #[test]
    fn test_mock_broker_counts_opens() {
        let mut broker = MockBroker::new(MockTransport::new());
        let device = MockBroker::bootloader_candidate();
        let iface = broker.dfu_interfaces(&device).unwrap().remove(0);
        broker.open(&device, &iface).unwrap();
        assert_eq!(broker.clone().opens(), 1);
    }
}
