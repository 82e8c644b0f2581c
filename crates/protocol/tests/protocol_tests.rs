//! Integration tests for the command codec and stream chunk parsing
//!
//! Packet vectors below are hand-assembled from the documented wire layout
//! and pinned as hex so format regressions show up as byte diffs.

use bytes::Bytes;
use protocol::integrity::checksum;
use protocol::stream::{ChunkKind, classify, encode_imu, parse_frame_chunk, parse_imu};
use protocol::{
    CameraSide, CommandFormat, CommandPacket, ProtocolError, ResponsePacket, Status,
    StereoFrameChunk, command, decode_command, decode_response,
};
use std::time::Instant;

/// Framed serial number response for command 0xED
const SERIAL_RESPONSE_FRAMED: &str = "fffec56d1000ed0050365350494835333230303336390000";
/// Plain serial number response for command 0xED
const SERIAL_RESPONSE_PLAIN: &str = "fa55ed0010005036535049483533323030333639000000000000000000";
/// Framed extended command 0xE5 without payload
const MODEL_COMMAND_FRAMED: &str = "fffe8bad0000e5";

fn unhex(s: &str) -> Vec<u8> {
    hex::decode(s).expect("valid hex fixture")
}

mod wire_vectors {
    use super::*;

    #[test]
    fn test_serial_number_framed_response() {
        let response = decode_response(&unhex(SERIAL_RESPONSE_FRAMED)).expect("decode");

        assert!(response.is_framed());
        assert_eq!(response.command_id(), command::SERIAL_NUMBER);
        assert_eq!(response.status(), Status::Success);
        assert_eq!(response.data_length(), 16);
        assert_eq!(response.payload().len(), 16);
        assert_eq!(response.payload_str(), "P6SPIH53200369");
    }

    #[test]
    fn test_serial_number_framed_crc_value() {
        let bytes = unhex(SERIAL_RESPONSE_FRAMED);
        let carried = u16::from_le_bytes([bytes[2], bytes[3]]);
        assert_eq!(carried, 0x6dc5);
        assert_eq!(checksum(&bytes[4..]), carried);
    }

    #[test]
    fn test_serial_number_plain_response_with_padding() {
        let response = decode_response(&unhex(SERIAL_RESPONSE_PLAIN)).expect("decode");

        assert!(!response.is_framed());
        assert_eq!(response.status(), Status::Success);
        assert_eq!(response.data_length(), 16);
        assert_eq!(response.payload_str(), "P6SPIH53200369");
    }

    #[test]
    fn test_model_command_framed_encoding() {
        let packet = CommandPacket::framed(command::DEVICE_MODEL, Bytes::new()).unwrap();
        assert_eq!(hex::encode(packet.encode()), MODEL_COMMAND_FRAMED);

        let decoded = decode_command(&unhex(MODEL_COMMAND_FRAMED)).expect("decode");
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_trigger_matches_wire_layout() {
        assert_eq!(
            hex::encode(CommandPacket::stereo_trigger().encode()),
            "fa55ea00080100000000000000"
        );
    }
}

mod command_roundtrip {
    use super::*;

    #[test]
    fn test_short_roundtrip_all_fields() {
        for (cmd, param) in [(0x00, 0x0000), (0xE5, 0x0001), (0xFF, 0xFFFF), (0x7F, 0x8000)] {
            let packet = CommandPacket::short(cmd, param);
            let bytes = packet.encode();
            assert_eq!(bytes.len(), 5);

            let decoded = decode_command(&bytes).expect("decode");
            assert_eq!(decoded.format(), CommandFormat::Short5);
            assert_eq!(decoded.command_id(), cmd);
            assert_eq!(decoded.param(), Some(param));
            assert_eq!(decoded.magic(), [0xFA, 0x55]);
        }
    }

    #[test]
    fn test_long_roundtrip_all_fields() {
        let cases = [
            (0xEA, 0x0800, 0x01, 0x00),
            (0xEA, 0x0800, 0x01, 0x01),
            (0xEA, 0x0040, 0x00, 0x00),
            (0x01, 0xFFFF, 0xFF, 0xFF),
        ];
        for (cmd, size, flag, camera) in cases {
            let packet = CommandPacket::long(cmd, size, flag, camera);
            let bytes = packet.encode();
            assert_eq!(bytes.len(), 13);

            let decoded = decode_command(&bytes).expect("decode");
            assert_eq!(decoded.format(), CommandFormat::Long13);
            assert_eq!(decoded.command_id(), cmd);
            assert_eq!(decoded.size_param(), Some(size));
            assert_eq!(decoded.flag(), Some(flag));
            assert_eq!(decoded.camera_id(), Some(camera));
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn test_long_reserved_bytes_are_opaque() {
        let body = [0x00, 0x08, 0x01, 0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
        let packet = CommandPacket::long_raw(0xEA, body);
        let decoded = decode_command(&packet.encode()).expect("decode");
        assert_eq!(decoded.body(), &body);
    }

    #[test]
    fn test_framed_roundtrip() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let packet = CommandPacket::framed(0x20, payload.clone()).unwrap();
        let decoded = decode_command(&packet.encode()).expect("decode");
        assert_eq!(decoded.body(), &payload[..]);
        assert_eq!(decoded.command_id(), 0x20);
    }

    #[test]
    fn test_framed_payload_limit() {
        let payload = vec![0u8; u16::MAX as usize + 1];
        assert!(matches!(
            CommandPacket::framed(0x20, payload),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_command_wrong_length() {
        assert!(matches!(
            decode_command(&[0xFA, 0x55, 0xE5, 0x00]),
            Err(ProtocolError::Malformed { needed: 5, .. })
        ));
        assert!(matches!(
            decode_command(&[0xFA, 0x55, 0xE5, 0x00, 0x00, 0x00, 0x00]),
            Err(ProtocolError::Malformed { needed: 13, .. })
        ));
    }
}

mod response_roundtrip {
    use super::*;

    #[test]
    fn test_plain_and_framed_roundtrip() {
        for status in [
            Status::Success,
            Status::NotReady,
            Status::Error,
            Status::StateError,
            Status::ConfigError,
            Status::Other(0x42),
        ] {
            for framed in [false, true] {
                let response = if framed {
                    ResponsePacket::new_framed(0xED, status, &b"P6SPIH53200369\0\0"[..])
                } else {
                    ResponsePacket::new(0xED, status, &b"P6SPIH53200369\0\0"[..])
                };
                let decoded = decode_response(&response.encode()).expect("decode");
                assert_eq!(decoded, response);
            }
        }
    }

    #[test]
    fn test_declared_length_exceeds_available() {
        let mut bytes = ResponsePacket::new_framed(0xED, Status::Success, vec![1u8; 16])
            .encode()
            .to_vec();
        bytes.truncate(bytes.len() - 3);
        assert_eq!(
            decode_response(&bytes),
            Err(ProtocolError::LengthMismatch {
                declared: 16,
                available: 13
            })
        );
    }

    #[test]
    fn test_empty_payload() {
        let response = ResponsePacket::new(0xEA, Status::Success, Bytes::new());
        let decoded = decode_response(&response.encode()).expect("decode");
        assert_eq!(decoded.data_length(), 0);
        assert!(decoded.payload().is_empty());
    }
}

mod stream_chunks {
    use super::*;

    #[test]
    fn test_frame_chunk_roundtrip() {
        let chunk = StereoFrameChunk {
            packet_id: 9,
            frame_number: 65535,
            side: CameraSide::Left,
            payload: Bytes::from(vec![0x5A; 16376]),
        };
        let bytes = chunk.encode();
        assert_eq!(bytes.len(), 16384);
        assert_eq!(classify(&bytes), ChunkKind::Frame);
        assert_eq!(parse_frame_chunk(bytes).expect("parse"), chunk);
    }

    #[test]
    fn test_imu_rejects_frame_magic() {
        let chunk = StereoFrameChunk {
            packet_id: 0,
            frame_number: 0,
            side: CameraSide::Right,
            payload: Bytes::from(vec![0u8; 64]),
        }
        .encode();
        assert!(matches!(
            parse_imu(&chunk, Instant::now()),
            Err(ProtocolError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_imu_chunk_classified() {
        let chunk = encode_imu(7, &[0.25; 15]);
        assert_eq!(classify(&chunk), ChunkKind::Imu);
        let sample = parse_imu(&chunk, Instant::now()).expect("parse");
        assert!(sample.raw.iter().all(|v| *v == 0.25));
    }
}
