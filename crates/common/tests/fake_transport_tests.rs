//! FakeTransport integration tests
//!
//! Exercises the in-memory transport the way the driver uses it: from
//! several threads at once, through the `Transport` trait object.
//!
//! # Test Scenarios
//! - Scripted responder answers on the response endpoint
//! - Stream chunks are served in order and then time out
//! - Fault injection (dropped responses, failing writes, disconnect)
//! - Cross-thread waiting on written commands
//!
//! Run with: `cargo test -p common --test fake_transport_tests`

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, FAKE_SERIAL, FakeTransport, status_responder, with_timeout,
};
use common::{ControlRequest, Transport, TransportError};
use protocol::{CommandPacket, Status, command, decode_response, endpoint};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const SHORT: Duration = Duration::from_millis(20);

fn claimed(fake: FakeTransport) -> Arc<FakeTransport> {
    fake.claim_interface(0).unwrap();
    Arc::new(fake)
}

fn exchange(transport: &dyn Transport, packet: CommandPacket) -> Result<Vec<u8>, TransportError> {
    transport.bulk_write(endpoint::COMMAND_OUT, &packet.encode(), SHORT)?;
    let mut buf = [0u8; 256];
    let n = transport.bulk_read(endpoint::RESPONSE_IN, &mut buf, SHORT)?;
    Ok(buf[..n].to_vec())
}

// ============================================================================
// Responder
// ============================================================================

#[test]
fn test_serial_query_through_trait_object() {
    let fake = claimed(FakeTransport::glasses());
    let transport: Arc<dyn Transport> = fake.clone();

    let raw = exchange(
        transport.as_ref(),
        CommandPacket::short(command::SERIAL_NUMBER, 0),
    )
    .unwrap();
    let response = decode_response(&raw).unwrap();

    assert_eq!(response.status(), Status::Success);
    assert_eq!(response.data_length(), 16);
    assert_eq!(response.payload_str(), FAKE_SERIAL);
    assert_eq!(fake.commands_sent(command::SERIAL_NUMBER), 1);
}

#[test]
fn test_status_responder_echoes_command() {
    let fake = claimed(FakeTransport::new());
    fake.set_responder(status_responder(Status::ConfigError));

    let raw = exchange(fake.as_ref(), CommandPacket::stereo_trigger()).unwrap();
    let response = decode_response(&raw).unwrap();
    assert_eq!(response.command_id(), command::STEREO_TRIGGER);
    assert_eq!(response.status(), Status::ConfigError);
}

// ============================================================================
// Stream Endpoint
// ============================================================================

#[test]
fn test_stream_chunks_in_order_then_timeout() {
    let fake = claimed(FakeTransport::new());
    fake.push_stream_chunk(vec![0xA2, 0xC4, 1]);
    fake.push_stream_chunk(vec![0xAA, 0x8F, 2]);

    let mut buf = [0u8; 16];
    let n = fake.bulk_read(endpoint::STREAM_IN, &mut buf, SHORT).unwrap();
    assert_eq!(&buf[..n], &[0xA2, 0xC4, 1]);
    let n = fake.bulk_read(endpoint::STREAM_IN, &mut buf, SHORT).unwrap();
    assert_eq!(&buf[..n], &[0xAA, 0x8F, 2]);

    assert_eq!(
        fake.bulk_read(endpoint::STREAM_IN, &mut buf, SHORT),
        Err(TransportError::Timeout)
    );
}

#[test]
fn test_reader_wakes_on_pushed_chunk() {
    let fake = claimed(FakeTransport::new());
    let reader = {
        let fake = fake.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 8];
            fake.bulk_read(endpoint::STREAM_IN, &mut buf, Duration::from_secs(2))
                .map(|n| buf[..n].to_vec())
        })
    };

    thread::sleep(Duration::from_millis(10));
    fake.push_stream_chunk(vec![7, 7, 7]);
    assert_eq!(reader.join().unwrap().unwrap(), vec![7, 7, 7]);
}

#[test]
fn test_queued_error_then_sticky_error() {
    let fake = claimed(FakeTransport::new());
    fake.push_in_error(endpoint::STREAM_IN, TransportError::Overflow);
    fake.fail_reads_with(endpoint::STREAM_IN, TransportError::Stall);

    let mut buf = [0u8; 8];
    assert_eq!(
        fake.bulk_read(endpoint::STREAM_IN, &mut buf, SHORT),
        Err(TransportError::Overflow)
    );
    for _ in 0..3 {
        assert_eq!(
            fake.bulk_read(endpoint::STREAM_IN, &mut buf, SHORT),
            Err(TransportError::Stall)
        );
    }
}

// ============================================================================
// Fault Injection
// ============================================================================

#[test]
fn test_dropped_response_times_out_once() {
    let fake = claimed(FakeTransport::glasses());
    fake.drop_next_responses(1);

    let first = exchange(fake.as_ref(), CommandPacket::short(command::DEVICE_MODEL, 0));
    assert_eq!(first, Err(TransportError::Timeout));

    let second = exchange(fake.as_ref(), CommandPacket::short(command::DEVICE_MODEL, 0)).unwrap();
    assert_eq!(decode_response(&second).unwrap().payload_str(), "P6SPIH");
}

#[test]
fn test_failed_writes_are_not_recorded() {
    let fake = claimed(FakeTransport::glasses());
    fake.fail_next_writes(2);

    let packet = CommandPacket::stereo_trigger().encode();
    for _ in 0..2 {
        assert_eq!(
            fake.bulk_write(endpoint::COMMAND_OUT, &packet, SHORT),
            Err(TransportError::Timeout)
        );
    }
    assert_eq!(fake.bulk_write(endpoint::COMMAND_OUT, &packet, SHORT), Ok(packet.len()));
    assert_eq!(fake.writes(endpoint::COMMAND_OUT).len(), 1);
}

#[test]
fn test_disconnect_wakes_blocked_reader() {
    let fake = claimed(FakeTransport::new());
    let reader = {
        let fake = fake.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 8];
            fake.bulk_read(endpoint::STREAM_IN, &mut buf, Duration::from_secs(2))
        })
    };

    thread::sleep(Duration::from_millis(10));
    fake.disconnect();
    assert_eq!(reader.join().unwrap(), Err(TransportError::Disconnected));
    let get_descriptor = ControlRequest {
        request_type: 0x80,
        request: 0x06,
        value: 0x0100,
        index: 0,
    };
    assert_eq!(
        fake.control_transfer(get_descriptor, &mut [0; 18], SHORT),
        Err(TransportError::Disconnected)
    );
}

#[test]
fn test_release_counts_and_reclaim() {
    let fake = claimed(FakeTransport::new());
    fake.release_interface(0).unwrap();
    assert!(!fake.is_claimed(0));
    assert_eq!(fake.release_count(), 1);

    assert_eq!(fake.release_interface(0), Err(TransportError::NotClaimed(0)));
    fake.claim_interface(0).unwrap();
    assert!(fake.is_claimed(0));
}

// ============================================================================
// Waiting
// ============================================================================

#[tokio::test]
async fn test_wait_for_commands_from_other_thread() {
    let fake = claimed(FakeTransport::glasses());
    let writer = {
        let fake = fake.clone();
        thread::spawn(move || {
            for _ in 0..3 {
                thread::sleep(Duration::from_millis(5));
                let _ = exchange(fake.as_ref(), CommandPacket::stereo_trigger());
            }
        })
    };

    let waiter = {
        let fake = fake.clone();
        tokio::task::spawn_blocking(move || {
            fake.wait_for_commands(command::STEREO_TRIGGER, 3, Duration::from_secs(2))
        })
    };
    let reached = with_timeout(DEFAULT_TEST_TIMEOUT, waiter)
        .await
        .expect("wait timed out")
        .unwrap();

    assert!(reached);
    writer.join().unwrap();
    assert!(!fake.wait_for_commands(command::STEREO_TRIGGER, 4, SHORT));
}
