//! Protocol error types

use thiserror::Error;

/// Errors raised while encoding or decoding wire packets
///
/// A packet that fails to decode is dropped by the caller. None of these
/// errors is fatal to a device session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Leading magic bytes do not identify any known packet family
    #[error("Bad magic: {found:02x?}")]
    BadMagic { found: [u8; 2] },

    /// Packet shorter than its fixed header
    #[error("Malformed packet: need {needed} bytes, got {available}")]
    Malformed { needed: usize, available: usize },

    /// Declared payload length exceeds the bytes actually received
    #[error("Length mismatch: header declares {declared} payload bytes, {available} available")]
    LengthMismatch { declared: usize, available: usize },

    /// CRC-16 carried in a framed packet does not match its contents
    #[error("Checksum mismatch: packet carries {expected:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { expected: u16, computed: u16 },

    /// Payload does not fit the selected command format
    #[error("Payload too large for {format}: {size} bytes (max: {max})")]
    PayloadTooLarge {
        format: &'static str,
        size: usize,
        max: usize,
    },

    /// Stream chunk exceeds the maximum bulk transfer size
    #[error("Chunk too large: {size} bytes (max: {max})")]
    ChunkTooLarge { size: usize, max: usize },

    /// Unrecognised camera flag in a frame chunk header
    #[error("Invalid camera flag: {0:#04x}")]
    InvalidCameraFlag(u8),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
