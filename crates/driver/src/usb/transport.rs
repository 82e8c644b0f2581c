//! `Transport` over a libusb device handle

use common::{ControlRequest, Transport, TransportError};
use rusb::{Context, DeviceHandle};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Opened vendor interface of the glasses
///
/// Claiming detaches a bound kernel driver first (when enabled) and
/// releasing hands the interface back to it.
pub struct VendorTransport {
    handle: DeviceHandle<Context>,
    detach_kernel_driver: bool,
    /// Interfaces we took away from a kernel driver
    detached: Mutex<HashSet<u8>>,
}

impl VendorTransport {
    pub fn new(handle: DeviceHandle<Context>, detach_kernel_driver: bool) -> Self {
        Self {
            handle,
            detach_kernel_driver,
            detached: Mutex::new(HashSet::new()),
        }
    }

    pub fn handle(&self) -> &DeviceHandle<Context> {
        &self.handle
    }

    fn detached(&self) -> std::sync::MutexGuard<'_, HashSet<u8>> {
        self.detached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Transport for VendorTransport {
    fn claim_interface(&self, interface: u8) -> Result<(), TransportError> {
        if self.detach_kernel_driver {
            match self.handle.kernel_driver_active(interface) {
                Ok(true) => {
                    debug!("Detaching kernel driver from interface {}", interface);
                    match self.handle.detach_kernel_driver(interface) {
                        Ok(()) => {
                            self.detached().insert(interface);
                        }
                        Err(e) => warn!(
                            "Failed to detach kernel driver from interface {}: {}",
                            interface, e
                        ),
                    }
                }
                Ok(false) => debug!("No kernel driver active on interface {}", interface),
                Err(e) => debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface, e
                ),
            }
        }

        self.handle
            .claim_interface(interface)
            .map_err(map_rusb_error)?;
        debug!("Claimed interface {}", interface);
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<(), TransportError> {
        let released = self
            .handle
            .release_interface(interface)
            .map_err(map_rusb_error);

        if self.detached().remove(&interface) {
            match self.handle.attach_kernel_driver(interface) {
                Ok(()) => debug!("Reattached kernel driver to interface {}", interface),
                Err(e) => debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                ),
            }
        }
        released
    }

    fn bulk_write(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        trace!(
            "Bulk OUT: endpoint={:#04x}, len={}, timeout={:?}",
            endpoint,
            data.len(),
            timeout
        );
        self.handle
            .write_bulk(endpoint, data, timeout)
            .map_err(map_rusb_error)
    }

    fn bulk_read(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.handle
            .read_bulk(endpoint, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn interrupt_read(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.handle
            .read_interrupt(endpoint, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn control_transfer(
        &self,
        request: ControlRequest,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        debug!(
            "Control transfer: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, len={}",
            request.request_type,
            request.request,
            request.value,
            request.index,
            buf.len()
        );

        let result = if request.is_in() {
            self.handle.read_control(
                request.request_type,
                request.request,
                request.value,
                request.index,
                buf,
                timeout,
            )
        } else {
            self.handle.write_control(
                request.request_type,
                request.request,
                request.value,
                request.index,
                buf,
                timeout,
            )
        };
        result.map_err(map_rusb_error)
    }
}

/// Map rusb errors onto the transport taxonomy
pub fn map_rusb_error(err: rusb::Error) -> TransportError {
    match err {
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::NoDevice => TransportError::Disconnected,
        rusb::Error::Access => TransportError::AccessDenied,
        rusb::Error::Busy => TransportError::Busy,
        rusb::Error::Pipe => TransportError::Stall,
        rusb::Error::Overflow => TransportError::Overflow,
        rusb::Error::Io => TransportError::Io,
        _ => TransportError::Other(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), TransportError::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), TransportError::Disconnected);
        assert_eq!(map_rusb_error(rusb::Error::Access), TransportError::AccessDenied);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), TransportError::Stall);
        assert!(matches!(
            map_rusb_error(rusb::Error::InvalidParam),
            TransportError::Other(_)
        ));
    }

    #[test]
    fn test_device_loss_is_fatal() {
        assert!(map_rusb_error(rusb::Error::NoDevice).is_fatal());
        assert!(!map_rusb_error(rusb::Error::Timeout).is_fatal());
    }
}
