//! Wire protocol for the glasses' vendor USB interface
//!
//! This crate defines the command/response packets exchanged on the command
//! endpoints, the CRC-16 protecting extended commands, and the chunk formats
//! multiplexed on the stream endpoint. It performs no I/O.
//!
//! # Example
//!
//! ```
//! use protocol::{CommandPacket, ResponsePacket, Status, command, decode_response};
//!
//! // Build a model query
//! let packet = CommandPacket::short(command::DEVICE_MODEL, 0);
//! assert_eq!(packet.encode().len(), 5);
//!
//! // Decode what the device sends back
//! let wire = ResponsePacket::new(command::DEVICE_MODEL, Status::Success, &b"P6SPIH"[..]).encode();
//! let response = decode_response(&wire).unwrap();
//! assert_eq!(response.payload_str(), "P6SPIH");
//! ```
//!
//! # Stream Chunks
//!
//! ```
//! use protocol::stream::{ChunkKind, classify, encode_imu};
//!
//! let chunk = encode_imu(1, &[0.0; 15]);
//! assert_eq!(classify(&chunk), ChunkKind::Imu);
//! ```

pub mod codec;
pub mod error;
pub mod integrity;
pub mod stream;
pub mod types;

pub use codec::{CommandPacket, ResponsePacket, decode_command, decode_response, encode_command};
pub use error::{ProtocolError, Result};
pub use stream::{ChunkKind, HeartbeatPacket, ImuSample, StereoFrameChunk};
pub use types::{
    CONTROL_INTERFACE, CameraSide, CommandFormat, PRODUCT_ID, Status, VENDOR_ID, command, endpoint,
};
