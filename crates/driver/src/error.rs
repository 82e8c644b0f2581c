//! Driver error types

use crate::session::SessionState;
use common::TransportError;
use protocol::{ProtocolError, ResponsePacket};
use thiserror::Error;

/// Errors surfaced by the driver's public API
#[derive(Debug, Error)]
pub enum DriverError {
    /// I/O failure or timeout talking to the USB layer
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed, truncated or corrupted packet
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Device answered `NotReady`; an initialization step is missing
    #[error("Device busy: command {command:#04x} is not ready")]
    DeviceBusy { command: u8 },

    /// Device answered status 0x06
    #[error("Device state error for command {:#04x}", .response.command_id())]
    DeviceState { response: ResponsePacket },

    /// Device answered status 0x08
    #[error("Device rejected configuration for command {:#04x}", .response.command_id())]
    Configuration { response: ResponsePacket },

    /// Any other non-success status
    #[error("Command {:#04x} failed with {}", .response.command_id(), .response.status())]
    CommandFailed { response: ResponsePacket },

    /// Host denied access to the device
    #[error("Permission denied opening {vendor_id:04x}:{product_id:04x}")]
    PermissionDenied { vendor_id: u16, product_id: u16 },

    #[error("Device {vendor_id:04x}:{product_id:04x} not found")]
    NotFound { vendor_id: u16, product_id: u16 },

    /// The device only offers the standard video-class interface
    #[error("Device exposes only a UVC interface; vendor protocol unavailable")]
    UnsupportedTransport,

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("libusb has no hot-plug support on this platform")]
    HotplugUnsupported,

    #[error("Session closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),

    /// A background task or thread ended abnormally
    #[error("Task error: {0}")]
    Task(String),
}

impl DriverError {
    /// True if the underlying transport failure means the device is gone
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::Transport(e) if e.is_fatal())
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
