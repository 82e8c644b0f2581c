//! Multiplexed stream chunk parsing
//!
//! Every bulk read on the stream endpoint yields exactly one chunk. The first
//! two bytes say what it carries:
//!
//! ```text
//! IMU    A2 C4 | seq:u16le | 15 x f32le                       (64 bytes)
//! Frame  AA 8F | packet:u16le | frame:u16le | camera | rsvd | payload
//! ```
//!
//! Frame payloads are opaque. Nothing here assumes an image codec.

use crate::error::{ProtocolError, Result};
use crate::types::{CameraSide, FRAME_MAGIC, HEARTBEAT_MAGIC, IMU_MAGIC};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Instant;

/// Size of an IMU chunk
pub const IMU_CHUNK_LEN: usize = 64;
/// Number of raw floats carried by an IMU chunk
pub const IMU_FLOAT_COUNT: usize = 15;
/// Offset of the first float in an IMU chunk
const IMU_FLOATS_OFFSET: usize = 4;
/// Header length of a frame chunk
pub const FRAME_HEADER_LEN: usize = 8;
/// Largest chunk a single bulk read can deliver
pub const MAX_CHUNK_LEN: usize = 16384;
/// Size of a heartbeat packet on the secondary channel
pub const HEARTBEAT_LEN: usize = 512;

/// Classification of a stream chunk by its magic header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Imu,
    Frame,
    Unknown,
}

/// Classify a chunk without parsing it
pub fn classify(chunk: &[u8]) -> ChunkKind {
    match chunk {
        [a, b, ..] if [*a, *b] == IMU_MAGIC => ChunkKind::Imu,
        [a, b, ..] if [*a, *b] == FRAME_MAGIC => ChunkKind::Frame,
        _ => ChunkKind::Unknown,
    }
}

/// One inertial telemetry sample
#[derive(Debug, Clone, PartialEq)]
pub struct ImuSample {
    /// Counter carried in bytes 2..4
    pub sequence: u16,
    /// Raw sensor values, uninterpreted
    pub raw: [f32; IMU_FLOAT_COUNT],
    /// Host time the chunk was read
    pub captured_at: Instant,
}

/// Parse an IMU chunk
pub fn parse_imu(chunk: &[u8], captured_at: Instant) -> Result<ImuSample> {
    expect_magic(chunk, IMU_MAGIC)?;
    if chunk.len() < IMU_CHUNK_LEN {
        return Err(ProtocolError::Malformed {
            needed: IMU_CHUNK_LEN,
            available: chunk.len(),
        });
    }

    let mut raw = [0f32; IMU_FLOAT_COUNT];
    LittleEndian::read_f32_into(
        &chunk[IMU_FLOATS_OFFSET..IMU_FLOATS_OFFSET + IMU_FLOAT_COUNT * 4],
        &mut raw,
    );

    Ok(ImuSample {
        sequence: LittleEndian::read_u16(&chunk[2..4]),
        raw,
        captured_at,
    })
}

/// One camera's contribution to a stereo frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StereoFrameChunk {
    pub packet_id: u16,
    pub frame_number: u16,
    pub side: CameraSide,
    pub payload: Bytes,
}

impl StereoFrameChunk {
    /// Serialize back to chunk bytes (fakes and captures)
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.put_slice(&FRAME_MAGIC);
        buf.put_u16_le(self.packet_id);
        buf.put_u16_le(self.frame_number);
        buf.put_u8(self.side.flag());
        buf.put_u8(0);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Parse a frame chunk; the payload shares the chunk's buffer
pub fn parse_frame_chunk(chunk: Bytes) -> Result<StereoFrameChunk> {
    expect_magic(&chunk, FRAME_MAGIC)?;
    if chunk.len() < FRAME_HEADER_LEN {
        return Err(ProtocolError::Malformed {
            needed: FRAME_HEADER_LEN,
            available: chunk.len(),
        });
    }
    if chunk.len() > MAX_CHUNK_LEN {
        return Err(ProtocolError::ChunkTooLarge {
            size: chunk.len(),
            max: MAX_CHUNK_LEN,
        });
    }

    let side = CameraSide::from_flag(chunk[6]).ok_or(ProtocolError::InvalidCameraFlag(chunk[6]))?;

    Ok(StereoFrameChunk {
        packet_id: LittleEndian::read_u16(&chunk[2..4]),
        frame_number: LittleEndian::read_u16(&chunk[4..6]),
        side,
        payload: chunk.slice(FRAME_HEADER_LEN..),
    })
}

/// Heartbeat packet from the secondary channel; body is opaque
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatPacket {
    pub body: Bytes,
}

/// Parse a heartbeat packet
pub fn parse_heartbeat(packet: Bytes) -> Result<HeartbeatPacket> {
    expect_magic(&packet, HEARTBEAT_MAGIC)?;
    Ok(HeartbeatPacket {
        body: packet.slice(2..),
    })
}

fn expect_magic(bytes: &[u8], magic: [u8; 2]) -> Result<()> {
    match bytes {
        [a, b, ..] if [*a, *b] == magic => Ok(()),
        [a, b, ..] => Err(ProtocolError::BadMagic { found: [*a, *b] }),
        _ => Err(ProtocolError::Malformed {
            needed: 2,
            available: bytes.len(),
        }),
    }
}

/// Build a 64-byte IMU chunk (fakes and tests)
pub fn encode_imu(sequence: u16, raw: &[f32; IMU_FLOAT_COUNT]) -> Bytes {
    let mut buf = BytesMut::with_capacity(IMU_CHUNK_LEN);
    buf.put_slice(&IMU_MAGIC);
    buf.put_u16_le(sequence);
    for value in raw {
        buf.put_f32_le(*value);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify(&[0xA2, 0xC4, 0x00]), ChunkKind::Imu);
        assert_eq!(classify(&[0xAA, 0x8F]), ChunkKind::Frame);
        assert_eq!(classify(&[0xFF, 0xFD, 0x00]), ChunkKind::Unknown);
        assert_eq!(classify(&[0xA2]), ChunkKind::Unknown);
        assert_eq!(classify(&[]), ChunkKind::Unknown);
    }

    #[test]
    fn test_parse_imu_values() {
        let mut raw = [0f32; IMU_FLOAT_COUNT];
        raw[0] = 1.5;
        raw[14] = -9.81;
        let chunk = encode_imu(42, &raw);
        assert_eq!(chunk.len(), IMU_CHUNK_LEN);

        let sample = parse_imu(&chunk, Instant::now()).unwrap();
        assert_eq!(sample.sequence, 42);
        assert_eq!(sample.raw[0], 1.5);
        assert_eq!(sample.raw[14], -9.81);
    }

    #[test]
    fn test_parse_imu_short_read() {
        let chunk = [0xA2, 0xC4, 0x01, 0x00, 0x00];
        assert!(matches!(
            parse_imu(&chunk, Instant::now()),
            Err(ProtocolError::Malformed { needed: 64, .. })
        ));
    }

    #[test]
    fn test_parse_frame_chunk_fields() {
        let chunk = Bytes::from_static(&[
            0xAA, 0x8F, 0x03, 0x00, 0x34, 0x12, 0x01, 0x00, 0xDE, 0xAD,
        ]);
        let parsed = parse_frame_chunk(chunk).unwrap();
        assert_eq!(parsed.packet_id, 3);
        assert_eq!(parsed.frame_number, 0x1234);
        assert_eq!(parsed.side, CameraSide::Right);
        assert_eq!(&parsed.payload[..], &[0xDE, 0xAD]);
    }

    #[test]
    fn test_parse_frame_chunk_rejects_bad_flag() {
        let chunk = Bytes::from_static(&[0xAA, 0x8F, 0, 0, 0, 0, 0x07, 0]);
        assert_eq!(
            parse_frame_chunk(chunk),
            Err(ProtocolError::InvalidCameraFlag(0x07))
        );
    }

    #[test]
    fn test_parse_frame_chunk_rejects_oversize() {
        let mut data = vec![0u8; MAX_CHUNK_LEN + 1];
        data[..2].copy_from_slice(&FRAME_MAGIC);
        assert!(matches!(
            parse_frame_chunk(Bytes::from(data)),
            Err(ProtocolError::ChunkTooLarge { .. })
        ));
    }

    #[test]
    fn test_parse_heartbeat() {
        let mut data = vec![0u8; HEARTBEAT_LEN];
        data[..2].copy_from_slice(&HEARTBEAT_MAGIC);
        let heartbeat = parse_heartbeat(Bytes::from(data)).unwrap();
        assert_eq!(heartbeat.body.len(), HEARTBEAT_LEN - 2);

        assert!(parse_heartbeat(Bytes::from_static(&[0xFA, 0x55])).is_err());
    }
}
