//! Session configuration
//!
//! Every timing knob of the driver lives here. Durations are stored as
//! milliseconds so a config file stays readable:
//!
//! ```toml
//! [command]
//! timeout_ms = 1500
//! retries = 3
//!
//! [keepalive]
//! period_ms = 1000
//! device_timeout_ms = 1500
//!
//! [reconnect]
//! max_attempts = 5
//! ```

use crate::error::{DriverError, Result};
use protocol::{CommandPacket, PRODUCT_ID, VENDOR_ID, command, endpoint, types::trigger};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub device: DeviceSettings,
    pub command: CommandSettings,
    pub stream: StreamSettings,
    pub reassembly: ReassemblySettings,
    pub keepalive: KeepAliveSettings,
    pub reconnect: ReconnectSettings,
}

impl SessionConfig {
    /// Reject values that would make the session misbehave
    pub fn validate(&self) -> Result<()> {
        if self.command.timeout_ms == 0 {
            return Err(DriverError::Config("command.timeout_ms must be > 0".into()));
        }
        if self.command.response_buffer_len < protocol::codec::FRAMED_RESPONSE_HEADER_LEN {
            return Err(DriverError::Config(
                "command.response_buffer_len is smaller than a response header".into(),
            ));
        }
        if self.stream.read_timeout_ms == 0 {
            return Err(DriverError::Config(
                "stream.read_timeout_ms must be > 0".into(),
            ));
        }
        if self.stream.chunk_size < protocol::stream::IMU_CHUNK_LEN {
            return Err(DriverError::Config(format!(
                "stream.chunk_size must hold at least one IMU packet ({} bytes)",
                protocol::stream::IMU_CHUNK_LEN
            )));
        }
        if self.stream.event_capacity == 0 {
            return Err(DriverError::Config(
                "stream.event_capacity must be > 0".into(),
            ));
        }
        if self.reassembly.window == 0 {
            return Err(DriverError::Config("reassembly.window must be > 0".into()));
        }
        if self.keepalive.enabled && self.keepalive.period_ms == 0 {
            return Err(DriverError::Config(
                "keepalive.period_ms must be > 0".into(),
            ));
        }
        // Device drops out of streaming mode if triggers stop for longer than this
        if self.keepalive.enabled && self.keepalive.period_ms >= self.keepalive.device_timeout_ms {
            return Err(DriverError::Config(format!(
                "keepalive.period_ms ({}) must be shorter than keepalive.device_timeout_ms ({})",
                self.keepalive.period_ms, self.keepalive.device_timeout_ms
            )));
        }
        if self.reconnect.initial_backoff_ms > self.reconnect.max_backoff_ms {
            return Err(DriverError::Config(
                "reconnect.initial_backoff_ms exceeds reconnect.max_backoff_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(DriverError::Config(
                "reconnect.jitter must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Which device to open and how
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Vendor interface claimed by the session
    pub interface: u8,
    /// Detach a kernel driver bound to the interface before claiming
    pub detach_kernel_driver: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            vendor_id: VENDOR_ID,
            product_id: PRODUCT_ID,
            interface: protocol::CONTROL_INTERFACE,
            detach_kernel_driver: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSettings {
    /// Per-attempt response timeout
    pub timeout_ms: u64,
    /// Extra attempts after a timeout
    pub retries: u32,
    /// Timeout of each read while draining stale responses
    pub drain_timeout_ms: u64,
    /// Upper bound on stale packets discarded before one exchange
    pub max_drain_reads: usize,
    pub response_buffer_len: usize,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 1500,
            retries: 3,
            drain_timeout_ms: 5,
            max_drain_reads: 8,
            response_buffer_len: 1024,
        }
    }
}

impl CommandSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Bulk IN endpoint carrying IMU and frame chunks
    pub endpoint: u8,
    /// Bounded read timeout; a timeout is a poll tick, not an error
    pub read_timeout_ms: u64,
    /// Read buffer size, one chunk per transfer
    pub chunk_size: usize,
    /// Consecutive non-timeout read errors before the link is declared lost
    pub max_consecutive_errors: u32,
    /// Capacity of the session event queue
    pub event_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            endpoint: endpoint::STREAM_IN,
            read_timeout_ms: 100,
            chunk_size: protocol::stream::MAX_CHUNK_LEN,
            max_consecutive_errors: 5,
            event_capacity: 256,
        }
    }
}

impl StreamSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblySettings {
    /// Maximum number of partially assembled frames held at once
    pub window: usize,
    /// Age after which an incomplete pair is dropped
    pub expiry_ms: u64,
}

impl Default for ReassemblySettings {
    fn default() -> Self {
        Self {
            window: 8,
            expiry_ms: 200,
        }
    }
}

impl ReassemblySettings {
    pub fn expiry(&self) -> Duration {
        Duration::from_millis(self.expiry_ms)
    }
}

/// Stereo trigger re-sent while streaming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSettings {
    pub command_id: u8,
    pub size_param: u16,
    pub flag: u8,
    pub camera_id: u8,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            command_id: command::STEREO_TRIGGER,
            size_param: trigger::SIZE_PARAM,
            flag: trigger::FLAG,
            camera_id: trigger::CAMERA_ID,
        }
    }
}

impl TriggerSettings {
    pub fn packet(&self) -> CommandPacket {
        CommandPacket::long(self.command_id, self.size_param, self.flag, self.camera_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveSettings {
    pub enabled: bool,
    pub period_ms: u64,
    /// Silence after which the device leaves streaming mode on its own
    pub device_timeout_ms: u64,
    pub trigger: TriggerSettings,
}

impl Default for KeepAliveSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            period_ms: 1000,
            device_timeout_ms: 1500,
            trigger: TriggerSettings::default(),
        }
    }
}

impl KeepAliveSettings {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    /// Attempts before the session gives up; 0 disables reconnection
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Random spread added to each delay, as a fraction of it
    pub jitter: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 250,
            max_backoff_ms: 8000,
            jitter: 0.1,
        }
    }
}

impl ReconnectSettings {
    /// Exponential delay before attempt `attempt` (zero-based), capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// [`backoff`](Self::backoff) plus up to `jitter` of random spread
    pub fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = rand::rng().random_range(0.0..=self.jitter);
        base + base.mul_f64(spread)
    }
}
