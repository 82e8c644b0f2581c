//! libusb-backed implementation of the transport
//!
//! Everything here blocks; callers run it on dedicated threads or
//! `spawn_blocking`.

pub mod hotplug;
pub mod probe;
pub mod transport;

pub use hotplug::{HotplugEvent, HotplugMonitor, drive_session};
pub use probe::{
    Capability, DeviceSummary, EndpointInfo, ProbedTransport, RusbConnector, classify_interfaces,
    find_device, list_devices, list_endpoints, probe,
};
pub use transport::{VendorTransport, map_rusb_error};
