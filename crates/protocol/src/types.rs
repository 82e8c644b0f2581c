//! Wire constants and small protocol types
//!
//! Magic values are stored as the two bytes in the order they appear on the
//! wire, so `[0xFA, 0x55]` is what a capture shows at offset 0.

use serde::{Deserialize, Serialize};
use std::fmt;

/// USB vendor id of the glasses
pub const VENDOR_ID: u16 = 0x35CA;
/// Product id of the control interface this driver talks to
pub const PRODUCT_ID: u16 = 0x1101;
/// Companion microphone/HID device (not handled by the driver)
pub const MICROPHONE_PRODUCT_ID: u16 = 0x1102;

/// Vendor interface number carrying every endpoint below
pub const CONTROL_INTERFACE: u8 = 0;

/// USB endpoint roles on the control interface
pub mod endpoint {
    /// Interrupt IN, HID-style IMU reports (alternate path)
    pub const IMU_INTERRUPT_IN: u8 = 0x81;
    /// Bulk IN, multiplexed IMU and stereo frame stream
    pub const STREAM_IN: u8 = 0x82;
    /// Interrupt IN, button and status reports
    pub const STATUS_INTERRUPT_IN: u8 = 0x83;
    /// Bulk OUT, primary command channel
    pub const COMMAND_OUT: u8 = 0x04;
    /// Bulk IN, primary command responses
    pub const RESPONSE_IN: u8 = 0x85;
    /// Bulk OUT, secondary (heartbeat) command channel
    pub const HEARTBEAT_OUT: u8 = 0x06;
    /// Bulk IN, 512-byte heartbeat packets
    pub const HEARTBEAT_IN: u8 = 0x87;

    /// Returns true if the address names an IN endpoint
    pub fn is_in(address: u8) -> bool {
        address & 0x80 != 0
    }
}

/// Magic of short and long command packets and their responses
pub const COMMAND_MAGIC: [u8; 2] = [0xFA, 0x55];
/// Magic of CRC-protected framed packets used for extended commands
pub const FRAMED_MAGIC: [u8; 2] = [0xFF, 0xFE];
/// Magic of IMU telemetry chunks on the stream endpoint
pub const IMU_MAGIC: [u8; 2] = [0xA2, 0xC4];
/// Magic of stereo camera chunks on the stream endpoint
pub const FRAME_MAGIC: [u8; 2] = [0xAA, 0x8F];
/// Magic of heartbeat packets on the secondary channel
pub const HEARTBEAT_MAGIC: [u8; 2] = [0xFF, 0xFD];

/// Known command identifiers
pub mod command {
    /// Query the device model string
    pub const DEVICE_MODEL: u8 = 0xE5;
    /// Start or re-trigger the stereo camera stream
    pub const STEREO_TRIGGER: u8 = 0xEA;
    /// Query the serial number string
    pub const SERIAL_NUMBER: u8 = 0xED;
}

/// Trigger command parameters observed in captures
pub mod trigger {
    pub const SIZE_PARAM: u16 = 0x0800;
    pub const FLAG: u8 = 0x01;
    pub const CAMERA_ID: u8 = 0x00;
}

/// Command packet layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandFormat {
    /// `magic(2) + cmd(1) + param(2)`
    Short5,
    /// `magic(2) + cmd(1) + sizeParam(2) + flag(1) + cameraId(1) + reserved(6)`
    Long13,
    /// `magic(2) + crc(2) + len(2) + cmd(1) + payload(len)`
    Framed,
}

impl CommandFormat {
    /// Bytes following the command id, or `None` for variable length
    pub const fn body_len(self) -> Option<usize> {
        match self {
            CommandFormat::Short5 => Some(2),
            CommandFormat::Long13 => Some(10),
            CommandFormat::Framed => None,
        }
    }

    pub const fn magic(self) -> [u8; 2] {
        match self {
            CommandFormat::Short5 | CommandFormat::Long13 => COMMAND_MAGIC,
            CommandFormat::Framed => FRAMED_MAGIC,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            CommandFormat::Short5 => "short5",
            CommandFormat::Long13 => "long13",
            CommandFormat::Framed => "framed",
        }
    }
}

impl fmt::Display for CommandFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Response status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    /// Device needs an initialization step before this command
    NotReady,
    Error,
    StateError,
    ConfigError,
    Other(u8),
}

impl Status {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => Status::Success,
            0x01 => Status::NotReady,
            0x05 => Status::Error,
            0x06 => Status::StateError,
            0x08 => Status::ConfigError,
            other => Status::Other(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Status::Success => 0x00,
            Status::NotReady => 0x01,
            Status::Error => 0x05,
            Status::StateError => 0x06,
            Status::ConfigError => 0x08,
            Status::Other(byte) => byte,
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => write!(f, "Success"),
            Status::NotReady => write!(f, "NotReady"),
            Status::Error => write!(f, "Error"),
            Status::StateError => write!(f, "StateError"),
            Status::ConfigError => write!(f, "ConfigError"),
            Status::Other(byte) => write!(f, "Status({:#04x})", byte),
        }
    }
}

/// Which stereo camera produced a frame chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CameraSide {
    Left,
    Right,
}

impl CameraSide {
    pub fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0x00 => Some(CameraSide::Left),
            0x01 => Some(CameraSide::Right),
            _ => None,
        }
    }

    pub fn flag(self) -> u8 {
        match self {
            CameraSide::Left => 0x00,
            CameraSide::Right => 0x01,
        }
    }
}
