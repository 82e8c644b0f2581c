//! Command and response packet codec
//!
//! # Packet Formats
//!
//! ```text
//! Short5   FA 55 | cmd | param:u16le
//! Long13   FA 55 | cmd | size:u16le | flag | camera | reserved[6]
//! Framed   FF FE | crc:u16le | len:u16le | cmd | payload[len]
//!
//! Response FA 55 | cmd | status | len:u16le | payload[len]
//! Framed   FF FE | crc:u16le | len:u16le | cmd | status | payload[len]
//! ```
//!
//! Framed checksums cover offset 4 (the length field) through the end of
//! the payload. Bytes after `payload[len]` are USB padding and are ignored.
//! Decoding never panics: every failure is a [`ProtocolError`].

use crate::error::{ProtocolError, Result};
use crate::integrity::checksum;
use crate::types::{COMMAND_MAGIC, CommandFormat, FRAMED_MAGIC, Status, command, trigger};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};

/// Header length of a plain response before its payload
pub const RESPONSE_HEADER_LEN: usize = 6;
/// Header length of a framed response before its payload
pub const FRAMED_RESPONSE_HEADER_LEN: usize = 8;
/// Header length of a framed command before its payload
pub const FRAMED_COMMAND_HEADER_LEN: usize = 7;

/// Offset where framed checksums start
const CRC_COVERAGE_START: usize = 4;

/// A command ready to be written to the command endpoint
///
/// `body` holds every byte after the command id. For the fixed formats it is
/// always exactly the format's body length, so the packet is immutable and
/// fully determined once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    format: CommandFormat,
    command_id: u8,
    body: Bytes,
}

impl CommandPacket {
    /// Build a 5-byte command carrying one 16-bit parameter
    pub fn short(command_id: u8, param: u16) -> Self {
        Self {
            format: CommandFormat::Short5,
            command_id,
            body: Bytes::copy_from_slice(&param.to_le_bytes()),
        }
    }

    /// Build a 13-byte command with zeroed reserved bytes
    pub fn long(command_id: u8, size_param: u16, flag: u8, camera_id: u8) -> Self {
        let mut body = [0u8; 10];
        LittleEndian::write_u16(&mut body[0..2], size_param);
        body[2] = flag;
        body[3] = camera_id;
        Self::long_raw(command_id, body)
    }

    /// Build a 13-byte command from its raw body, reserved bytes included
    ///
    /// The reserved bytes have no confirmed meaning and are carried verbatim.
    pub fn long_raw(command_id: u8, body: [u8; 10]) -> Self {
        Self {
            format: CommandFormat::Long13,
            command_id,
            body: Bytes::copy_from_slice(&body),
        }
    }

    /// Build a CRC-protected extended command
    pub fn framed(command_id: u8, payload: impl Into<Bytes>) -> Result<Self> {
        let body = payload.into();
        if body.len() > u16::MAX as usize {
            return Err(ProtocolError::PayloadTooLarge {
                format: CommandFormat::Framed.name(),
                size: body.len(),
                max: u16::MAX as usize,
            });
        }
        Ok(Self {
            format: CommandFormat::Framed,
            command_id,
            body,
        })
    }

    /// Stereo camera start/keep-alive command as observed in captures
    pub fn stereo_trigger() -> Self {
        Self::long(
            command::STEREO_TRIGGER,
            trigger::SIZE_PARAM,
            trigger::FLAG,
            trigger::CAMERA_ID,
        )
    }

    pub fn format(&self) -> CommandFormat {
        self.format
    }

    pub fn command_id(&self) -> u8 {
        self.command_id
    }

    pub fn magic(&self) -> [u8; 2] {
        self.format.magic()
    }

    /// Bytes following the command id (parameter fields or framed payload)
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Parameter of a short command
    pub fn param(&self) -> Option<u16> {
        (self.format == CommandFormat::Short5).then(|| LittleEndian::read_u16(&self.body))
    }

    /// Size parameter of a long command
    pub fn size_param(&self) -> Option<u16> {
        (self.format == CommandFormat::Long13).then(|| LittleEndian::read_u16(&self.body[0..2]))
    }

    pub fn flag(&self) -> Option<u8> {
        (self.format == CommandFormat::Long13).then(|| self.body[2])
    }

    pub fn camera_id(&self) -> Option<u8> {
        (self.format == CommandFormat::Long13).then(|| self.body[3])
    }

    /// Length of the encoded packet
    pub fn encoded_len(&self) -> usize {
        match self.format {
            CommandFormat::Short5 => 5,
            CommandFormat::Long13 => 13,
            CommandFormat::Framed => FRAMED_COMMAND_HEADER_LEN + self.body.len(),
        }
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        match self.format {
            CommandFormat::Short5 | CommandFormat::Long13 => {
                buf.put_slice(&COMMAND_MAGIC);
                buf.put_u8(self.command_id);
                buf.put_slice(&self.body);
            }
            CommandFormat::Framed => {
                buf.put_slice(&FRAMED_MAGIC);
                buf.put_u16_le(0); // checksum placeholder
                buf.put_u16_le(self.body.len() as u16);
                buf.put_u8(self.command_id);
                buf.put_slice(&self.body);
                let crc = checksum(&buf[CRC_COVERAGE_START..]);
                LittleEndian::write_u16(&mut buf[2..4], crc);
            }
        }
        buf.freeze()
    }
}

/// Encode a command packet
pub fn encode_command(packet: &CommandPacket) -> Bytes {
    packet.encode()
}

/// Parse a command packet from wire bytes
///
/// Used by device-side fakes and capture tooling. The format is inferred
/// from the magic and the packet length (5 or 13 bytes for the plain magic).
pub fn decode_command(bytes: &[u8]) -> Result<CommandPacket> {
    let magic = read_magic(bytes)?;
    match magic {
        COMMAND_MAGIC => match bytes.len() {
            5 => Ok(CommandPacket::short(
                bytes[2],
                LittleEndian::read_u16(&bytes[3..5]),
            )),
            13 => {
                let mut body = [0u8; 10];
                body.copy_from_slice(&bytes[3..13]);
                Ok(CommandPacket::long_raw(bytes[2], body))
            }
            n if n < 5 => Err(ProtocolError::Malformed {
                needed: 5,
                available: n,
            }),
            n => Err(ProtocolError::Malformed {
                needed: 13,
                available: n,
            }),
        },
        FRAMED_MAGIC => {
            ensure_len(bytes, FRAMED_COMMAND_HEADER_LEN)?;
            let declared = LittleEndian::read_u16(&bytes[4..6]) as usize;
            let end = checked_end(bytes, FRAMED_COMMAND_HEADER_LEN, declared)?;
            verify_framed_crc(bytes, end)?;
            CommandPacket::framed(
                bytes[6],
                Bytes::copy_from_slice(&bytes[FRAMED_COMMAND_HEADER_LEN..end]),
            )
        }
        found => Err(ProtocolError::BadMagic { found }),
    }
}

/// A decoded device response
///
/// Invariant: `payload.len() == data_length()` and the declared length was
/// fully present in the received bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePacket {
    framed: bool,
    command_id: u8,
    status: Status,
    payload: Bytes,
}

impl ResponsePacket {
    /// Build a plain response (device side / tests)
    pub fn new(command_id: u8, status: Status, payload: impl Into<Bytes>) -> Self {
        Self {
            framed: false,
            command_id,
            status,
            payload: payload.into(),
        }
    }

    /// Build a framed response (device side / tests)
    pub fn new_framed(command_id: u8, status: Status, payload: impl Into<Bytes>) -> Self {
        Self {
            framed: true,
            ..Self::new(command_id, status, payload)
        }
    }

    pub fn is_framed(&self) -> bool {
        self.framed
    }

    /// Magic echoed by the device
    pub fn magic_echo(&self) -> [u8; 2] {
        if self.framed {
            FRAMED_MAGIC
        } else {
            COMMAND_MAGIC
        }
    }

    /// Command id echoed by the device
    pub fn command_id(&self) -> u8 {
        self.command_id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn data_length(&self) -> u16 {
        self.payload.len() as u16
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload as text with trailing NUL padding removed
    pub fn payload_str(&self) -> String {
        let end = self
            .payload
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |pos| pos + 1);
        String::from_utf8_lossy(&self.payload[..end]).into_owned()
    }

    /// Serialize to wire bytes (device side / tests)
    pub fn encode(&self) -> Bytes {
        let len = self.payload.len().min(u16::MAX as usize);
        if self.framed {
            let mut buf = BytesMut::with_capacity(FRAMED_RESPONSE_HEADER_LEN + len);
            buf.put_slice(&FRAMED_MAGIC);
            buf.put_u16_le(0);
            buf.put_u16_le(len as u16);
            buf.put_u8(self.command_id);
            buf.put_u8(self.status.as_byte());
            buf.put_slice(&self.payload[..len]);
            let crc = checksum(&buf[CRC_COVERAGE_START..]);
            LittleEndian::write_u16(&mut buf[2..4], crc);
            buf.freeze()
        } else {
            let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_LEN + len);
            buf.put_slice(&COMMAND_MAGIC);
            buf.put_u8(self.command_id);
            buf.put_u8(self.status.as_byte());
            buf.put_u16_le(len as u16);
            buf.put_slice(&self.payload[..len]);
            buf.freeze()
        }
    }
}

/// Decode a response read from the response endpoint
pub fn decode_response(bytes: &[u8]) -> Result<ResponsePacket> {
    let magic = read_magic(bytes)?;
    match magic {
        COMMAND_MAGIC => {
            ensure_len(bytes, RESPONSE_HEADER_LEN)?;
            let declared = LittleEndian::read_u16(&bytes[4..6]) as usize;
            let end = checked_end(bytes, RESPONSE_HEADER_LEN, declared)?;
            Ok(ResponsePacket {
                framed: false,
                command_id: bytes[2],
                status: Status::from_byte(bytes[3]),
                payload: Bytes::copy_from_slice(&bytes[RESPONSE_HEADER_LEN..end]),
            })
        }
        FRAMED_MAGIC => {
            ensure_len(bytes, FRAMED_RESPONSE_HEADER_LEN)?;
            let declared = LittleEndian::read_u16(&bytes[4..6]) as usize;
            let end = checked_end(bytes, FRAMED_RESPONSE_HEADER_LEN, declared)?;
            verify_framed_crc(bytes, end)?;
            Ok(ResponsePacket {
                framed: true,
                command_id: bytes[6],
                status: Status::from_byte(bytes[7]),
                payload: Bytes::copy_from_slice(&bytes[FRAMED_RESPONSE_HEADER_LEN..end]),
            })
        }
        found => Err(ProtocolError::BadMagic { found }),
    }
}

fn read_magic(bytes: &[u8]) -> Result<[u8; 2]> {
    ensure_len(bytes, 2)?;
    Ok([bytes[0], bytes[1]])
}

fn ensure_len(bytes: &[u8], needed: usize) -> Result<()> {
    if bytes.len() < needed {
        return Err(ProtocolError::Malformed {
            needed,
            available: bytes.len(),
        });
    }
    Ok(())
}

/// End offset of a payload, checked against the bytes actually present
fn checked_end(bytes: &[u8], header_len: usize, declared: usize) -> Result<usize> {
    let available = bytes.len() - header_len;
    if declared > available {
        return Err(ProtocolError::LengthMismatch {
            declared,
            available,
        });
    }
    Ok(header_len + declared)
}

fn verify_framed_crc(bytes: &[u8], end: usize) -> Result<()> {
    let expected = LittleEndian::read_u16(&bytes[2..4]);
    let computed = checksum(&bytes[CRC_COVERAGE_START..end]);
    if expected != computed {
        return Err(ProtocolError::ChecksumMismatch { expected, computed });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_layout() {
        let bytes = CommandPacket::short(command::DEVICE_MODEL, 0x0102).encode();
        assert_eq!(&bytes[..], &[0xFA, 0x55, 0xE5, 0x02, 0x01]);
    }

    #[test]
    fn test_trigger_layout() {
        // Capture: fa55 ea 0008 01 00 000000000000
        let bytes = CommandPacket::stereo_trigger().encode();
        assert_eq!(
            &bytes[..],
            &[
                0xFA, 0x55, 0xEA, 0x00, 0x08, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00
            ]
        );
    }

    #[test]
    fn test_framed_layout() {
        let packet = CommandPacket::framed(0x15, vec![0x01, 0x00]).unwrap();
        let bytes = packet.encode();
        assert_eq!(
            &bytes[..],
            &[0xFF, 0xFE, 0x21, 0xDF, 0x02, 0x00, 0x15, 0x01, 0x00]
        );
        assert_eq!(bytes.len(), packet.encoded_len());
    }

    #[test]
    fn test_accessors_by_format() {
        let short = CommandPacket::short(0xE5, 7);
        assert_eq!(short.param(), Some(7));
        assert_eq!(short.flag(), None);

        let long = CommandPacket::long(0xEA, 0x40, 0x00, 0x01);
        assert_eq!(long.size_param(), Some(0x40));
        assert_eq!(long.flag(), Some(0x00));
        assert_eq!(long.camera_id(), Some(0x01));
        assert_eq!(long.param(), None);
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        // Declares 16 payload bytes, carries 4
        let bytes = [0xFA, 0x55, 0xED, 0x00, 0x10, 0x00, b'P', b'6', b'S', b'P'];
        assert_eq!(
            decode_response(&bytes),
            Err(ProtocolError::LengthMismatch {
                declared: 16,
                available: 4
            })
        );
    }

    #[test]
    fn test_decode_ignores_padding() {
        let mut bytes = ResponsePacket::new(0xE5, Status::Success, &b"P6SPIH"[..])
            .encode()
            .to_vec();
        bytes.extend_from_slice(&[0u8; 32]);
        let decoded = decode_response(&bytes).unwrap();
        assert_eq!(decoded.payload_str(), "P6SPIH");
        assert_eq!(decoded.data_length(), 6);
    }

    #[test]
    fn test_decode_bad_magic_and_short_input() {
        assert_eq!(
            decode_response(&[0x12, 0x34, 0, 0, 0, 0]),
            Err(ProtocolError::BadMagic {
                found: [0x12, 0x34]
            })
        );
        assert!(matches!(
            decode_response(&[0xFA]),
            Err(ProtocolError::Malformed { needed: 2, .. })
        ));
        assert!(matches!(
            decode_response(&[0xFA, 0x55, 0xE5]),
            Err(ProtocolError::Malformed { needed: 6, .. })
        ));
    }

    #[test]
    fn test_framed_crc_mismatch() {
        let mut bytes = ResponsePacket::new_framed(0xE5, Status::Success, &b"P6SPIH"[..])
            .encode()
            .to_vec();
        bytes[9] ^= 0xFF;
        assert!(matches!(
            decode_response(&bytes),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_payload_str_all_nul() {
        let response = ResponsePacket::new(0xE5, Status::Success, vec![0u8; 4]);
        assert_eq!(response.payload_str(), "");
    }
}
