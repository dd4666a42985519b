//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockBroker, MockCall, MockTransport};
pub use self::nusb::{NusbBroker, NusbTransport};
pub use traits::{
    DeviceBroker, DeviceCandidate, DfuInterface, DfuTransport, DiscoveryError, TransportError,
    UsbIdentity,
};
