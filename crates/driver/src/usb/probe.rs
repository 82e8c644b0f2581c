//! Device discovery and capability probing
//!
//! The glasses' video can be reached through a vendor interface or, on some
//! firmware, only through a standard UVC interface. Which one is available
//! is decided once here, from the interface descriptors, and expressed as a
//! [`ProbedTransport`] variant.

use super::transport::{VendorTransport, map_rusb_error};
use crate::config::DeviceSettings;
use crate::error::{DriverError, Result};
use crate::session::Connector;
use common::Transport;
use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// USB interface class codes we care about
pub mod class {
    pub const VIDEO: u8 = 0x0E;
    pub const VENDOR_SPECIFIC: u8 = 0xFF;
}

/// Identity of one attached device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub bus_number: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub num_configurations: u8,
}

impl fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bus {:03} Device {:03}: ID {:04x}:{:04x}",
            self.bus_number, self.address, self.vendor_id, self.product_id
        )?;
        if let Some(manufacturer) = &self.manufacturer {
            write!(f, " {}", manufacturer)?;
        }
        if let Some(product) = &self.product {
            write!(f, " {}", product)?;
        }
        if let Some(serial) = &self.serial_number {
            write!(f, " (serial {})", serial)?;
        }
        Ok(())
    }
}

/// One endpoint of one alternate setting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub configuration: u8,
    pub interface: u8,
    pub alt_setting: u8,
    pub interface_class: u8,
    pub address: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
}

impl fmt::Display for EndpointInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self.direction {
            Direction::In => "IN",
            Direction::Out => "OUT",
        };
        let transfer = match self.transfer_type {
            TransferType::Control => "control",
            TransferType::Isochronous => "isochronous",
            TransferType::Bulk => "bulk",
            TransferType::Interrupt => "interrupt",
        };
        write!(
            f,
            "config {} iface {} alt {} class {:#04x}: EP {:#04x} {:<3} {:<11} max packet {}",
            self.configuration,
            self.interface,
            self.alt_setting,
            self.interface_class,
            self.address,
            direction,
            transfer,
            self.max_packet_size
        )
    }
}

/// How the device's video path can be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Vendor-specific interface with the proprietary protocol
    Vendor { interface: u8 },
    /// Only the standard video class is exposed
    Uvc { interface: u8 },
}

/// Decide the capability from `(interface number, class code)` pairs
///
/// The vendor interface wins when both exist.
pub fn classify_interfaces(interfaces: &[(u8, u8)]) -> Option<Capability> {
    let vendor = interfaces
        .iter()
        .find(|(_, class_code)| *class_code == class::VENDOR_SPECIFIC);
    if let Some(&(interface, _)) = vendor {
        return Some(Capability::Vendor { interface });
    }
    interfaces
        .iter()
        .find(|(_, class_code)| *class_code == class::VIDEO)
        .map(|&(interface, _)| Capability::Uvc { interface })
}

/// Result of probing an attached device
pub enum ProbedTransport {
    Vendor(VendorTransport),
    /// UVC streaming belongs to a different driver stack
    Uvc { interface: u8 },
}

/// Devices matching `vendor_id` (any product when `product_id` is `None`)
pub fn list_devices(
    context: &Context,
    vendor_id: u16,
    product_id: Option<u16>,
) -> Result<Vec<DeviceSummary>> {
    let devices = context.devices().map_err(map_rusb_error)?;
    let mut found = Vec::new();

    for device in devices.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        if descriptor.vendor_id() != vendor_id
            || product_id.is_some_and(|pid| descriptor.product_id() != pid)
        {
            continue;
        }
        found.push(summarize(&device));
    }
    Ok(found)
}

/// Descriptor summary, with strings when the device can be opened
pub fn summarize(device: &Device<Context>) -> DeviceSummary {
    let descriptor = device.device_descriptor().ok();
    let strings = match (&descriptor, device.open()) {
        (Some(descriptor), Ok(handle)) => read_strings(&handle, descriptor),
        (_, Err(e)) => {
            debug!("Cannot open device to read strings: {}", e);
            (None, None, None)
        }
        _ => (None, None, None),
    };

    DeviceSummary {
        bus_number: device.bus_number(),
        address: device.address(),
        vendor_id: descriptor.as_ref().map_or(0, |d| d.vendor_id()),
        product_id: descriptor.as_ref().map_or(0, |d| d.product_id()),
        manufacturer: strings.0,
        product: strings.1,
        serial_number: strings.2,
        num_configurations: descriptor.as_ref().map_or(0, |d| d.num_configurations()),
    }
}

fn read_strings(
    handle: &DeviceHandle<Context>,
    descriptor: &rusb::DeviceDescriptor,
) -> (Option<String>, Option<String>, Option<String>) {
    (
        handle.read_manufacturer_string_ascii(descriptor).ok(),
        handle.read_product_string_ascii(descriptor).ok(),
        handle.read_serial_number_string_ascii(descriptor).ok(),
    )
}

/// First device with the configured identifiers
pub fn find_device(context: &Context, settings: &DeviceSettings) -> Result<Device<Context>> {
    let devices = context.devices().map_err(map_rusb_error)?;
    devices
        .iter()
        .find(|device| {
            device.device_descriptor().is_ok_and(|d| {
                d.vendor_id() == settings.vendor_id && d.product_id() == settings.product_id
            })
        })
        .ok_or(DriverError::NotFound {
            vendor_id: settings.vendor_id,
            product_id: settings.product_id,
        })
}

/// Every endpoint of every configuration and alternate setting
pub fn list_endpoints(device: &Device<Context>) -> Result<Vec<EndpointInfo>> {
    let descriptor = device.device_descriptor().map_err(map_rusb_error)?;
    let mut endpoints = Vec::new();

    for index in 0..descriptor.num_configurations() {
        let config = match device.config_descriptor(index) {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to read configuration {}: {}", index, e);
                continue;
            }
        };
        for interface in config.interfaces() {
            for alt in interface.descriptors() {
                for endpoint in alt.endpoint_descriptors() {
                    endpoints.push(EndpointInfo {
                        configuration: config.number(),
                        interface: alt.interface_number(),
                        alt_setting: alt.setting_number(),
                        interface_class: alt.class_code(),
                        address: endpoint.address(),
                        direction: endpoint.direction(),
                        transfer_type: endpoint.transfer_type(),
                        max_packet_size: endpoint.max_packet_size(),
                    });
                }
            }
        }
    }
    Ok(endpoints)
}

/// Interface numbers and classes of the active configuration
fn active_interfaces(device: &Device<Context>) -> Result<Vec<(u8, u8)>> {
    let config = device
        .active_config_descriptor()
        .map_err(map_rusb_error)?;
    Ok(config
        .interfaces()
        .filter_map(|interface| {
            interface
                .descriptors()
                .next()
                .map(|alt| (alt.interface_number(), alt.class_code()))
        })
        .collect())
}

/// Find, open and classify the device
///
/// The returned vendor transport is opened but not claimed.
pub fn probe(context: &Context, settings: &DeviceSettings) -> Result<ProbedTransport> {
    let device = find_device(context, settings)?;
    let handle = device.open().map_err(|e| match e {
        rusb::Error::Access => DriverError::PermissionDenied {
            vendor_id: settings.vendor_id,
            product_id: settings.product_id,
        },
        other => DriverError::Transport(map_rusb_error(other)),
    })?;

    // Best effort; some hosts refuse while a kernel driver is bound
    match handle.active_configuration() {
        Ok(0) => {
            if let Err(e) = handle.set_active_configuration(1) {
                debug!("Could not set configuration 1: {}", e);
            }
        }
        Ok(config) => debug!("Active configuration {}", config),
        Err(e) => debug!("Could not read active configuration: {}", e),
    }

    let interfaces = active_interfaces(&device)?;
    match classify_interfaces(&interfaces) {
        Some(Capability::Vendor { interface }) => {
            if interface != settings.interface {
                warn!(
                    "Vendor interface is {}, configured interface is {}",
                    interface, settings.interface
                );
            }
            info!(
                "Opened {:04x}:{:04x} on bus {} address {} (vendor interface {})",
                settings.vendor_id,
                settings.product_id,
                device.bus_number(),
                device.address(),
                interface
            );
            Ok(ProbedTransport::Vendor(VendorTransport::new(
                handle,
                settings.detach_kernel_driver,
            )))
        }
        Some(Capability::Uvc { interface }) => {
            warn!("Device exposes only UVC interface {}", interface);
            Ok(ProbedTransport::Uvc { interface })
        }
        None => Err(DriverError::UnsupportedTransport),
    }
}

/// [`Connector`] that opens the real device through libusb
pub struct RusbConnector {
    context: Context,
    settings: DeviceSettings,
}

impl RusbConnector {
    pub fn new(settings: DeviceSettings) -> Result<Self> {
        let context = Context::new().map_err(map_rusb_error)?;
        Ok(Self::with_context(context, settings))
    }

    pub fn with_context(context: Context, settings: DeviceSettings) -> Self {
        Self { context, settings }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl Connector for RusbConnector {
    fn connect(&self) -> Result<Arc<dyn Transport>> {
        match probe(&self.context, &self.settings)? {
            ProbedTransport::Vendor(transport) => Ok(Arc::new(transport)),
            ProbedTransport::Uvc { .. } => Err(DriverError::UnsupportedTransport),
        }
    }
}
