//! Transport contract over raw USB primitives
//!
//! The driver never talks to libusb directly. Everything goes through
//! [`Transport`], which the platform USB layer implements (`rusb` in the
//! driver crate) and which tests replace with
//! [`FakeTransport`](crate::test_utils::FakeTransport).
//!
//! Every blocking call takes an explicit timeout. There is no "wait forever".

use std::time::Duration;
use thiserror::Error;

/// Failure talking to the OS USB layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Transfer timed out")]
    Timeout,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Access denied")]
    AccessDenied,

    #[error("Resource busy")]
    Busy,

    #[error("Endpoint stalled")]
    Stall,

    #[error("Transfer overflow")]
    Overflow,

    #[error("I/O error")]
    Io,

    #[error("Interface {0} is not claimed")]
    NotClaimed(u8),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }

    /// The device or our claim on it is gone; retrying cannot help
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Disconnected | TransportError::NotClaimed(_)
        )
    }
}

/// Setup fields of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlRequest {
    /// Bit 7 of `bmRequestType` set means device-to-host
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// Raw USB operations on one opened device
///
/// Implementations must be usable from several threads at once: the stream
/// reader, the keep-alive task and command callers each hold the same
/// transport. Serializing the command endpoints is the caller's job.
pub trait Transport: Send + Sync {
    fn claim_interface(&self, interface: u8) -> Result<(), TransportError>;

    fn release_interface(&self, interface: u8) -> Result<(), TransportError>;

    /// Write `data` to a bulk OUT endpoint, returning bytes written
    fn bulk_write(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Read one transfer from a bulk IN endpoint into `buf`
    fn bulk_read(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Read one transfer from an interrupt IN endpoint
    ///
    /// Transports without a distinct interrupt path read it like bulk.
    fn interrupt_read(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.bulk_read(endpoint, buf, timeout)
    }

    /// Control transfer on endpoint 0
    ///
    /// For IN requests `buf` receives data; for OUT requests it is sent.
    fn control_transfer(
        &self,
        request: ControlRequest,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(TransportError::Disconnected.is_fatal());
        assert!(TransportError::NotClaimed(0).is_fatal());
        assert!(!TransportError::Timeout.is_fatal());
        assert!(!TransportError::Io.is_fatal());
        assert!(TransportError::Timeout.is_timeout());
    }

    #[test]
    fn test_control_direction() {
        let read = ControlRequest {
            request_type: 0x80,
            request: 0x06,
            value: 0x0100,
            index: 0,
        };
        assert!(read.is_in());

        let write = ControlRequest {
            request_type: 0x21,
            ..read
        };
        assert!(!write.is_in());
    }
}
