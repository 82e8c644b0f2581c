//! Test utilities for glasses-usb
//!
//! [`FakeTransport`] is an in-memory stand-in for an opened device. It
//! records every write, answers commands through a scripted responder,
//! serves queued chunks on IN endpoints, and can inject faults.
//!
//! # Example
//!
//! ```
//! use common::test_utils::FakeTransport;
//! use common::Transport;
//! use protocol::{CommandPacket, command, endpoint};
//! use std::time::Duration;
//!
//! let fake = FakeTransport::glasses();
//! fake.claim_interface(0).unwrap();
//!
//! let packet = CommandPacket::short(command::DEVICE_MODEL, 0).encode();
//! fake.bulk_write(endpoint::COMMAND_OUT, &packet, Duration::from_millis(10)).unwrap();
//!
//! let mut buf = [0u8; 64];
//! let n = fake
//!     .bulk_read(endpoint::RESPONSE_IN, &mut buf, Duration::from_millis(10))
//!     .unwrap();
//! let response = protocol::decode_response(&buf[..n]).unwrap();
//! assert_eq!(response.payload_str(), "P6SPIH");
//! ```

use crate::transport::{ControlRequest, Transport, TransportError};
use bytes::Bytes;
use protocol::{ResponsePacket, Status, command, decode_command, endpoint};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Model string reported by [`FakeTransport::glasses`]
pub const FAKE_MODEL: &str = "P6SPIH";
/// Serial number reported by [`FakeTransport::glasses`]
pub const FAKE_SERIAL: &str = "P6SPIH53200369";

/// Produces the response packets for one written command
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Bytes> + Send>;

/// In-memory transport double
pub struct FakeTransport {
    state: Mutex<FakeState>,
    changed: Condvar,
}

#[derive(Default)]
struct FakeState {
    claimed: HashSet<u8>,
    releases: usize,
    disconnected: bool,
    writes: Vec<(u8, Vec<u8>)>,
    controls: Vec<ControlRequest>,
    inbound: HashMap<u8, VecDeque<Result<Bytes, TransportError>>>,
    sticky_errors: HashMap<u8, TransportError>,
    responder: Option<Responder>,
    dropped_responses: usize,
    failed_writes: usize,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    /// Transport with no responder: commands are recorded and never answered
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            changed: Condvar::new(),
        }
    }

    /// Transport whose responder behaves like the glasses
    ///
    /// Model and serial queries answer with [`FAKE_MODEL`] and a NUL-padded
    /// [`FAKE_SERIAL`]; the stereo trigger succeeds with an empty payload;
    /// anything else answers `Status::Error`.
    pub fn glasses() -> Self {
        let fake = Self::new();
        fake.set_responder(glasses_responder());
        fake
    }

    pub fn set_responder(&self, responder: Responder) {
        self.lock().responder = Some(responder);
    }

    /// Queue one transfer for an IN endpoint
    pub fn push_in(&self, endpoint: u8, data: impl Into<Bytes>) {
        self.lock()
            .inbound
            .entry(endpoint)
            .or_default()
            .push_back(Ok(data.into()));
        self.changed.notify_all();
    }

    /// Queue a single failed read for an IN endpoint
    pub fn push_in_error(&self, endpoint: u8, error: TransportError) {
        self.lock()
            .inbound
            .entry(endpoint)
            .or_default()
            .push_back(Err(error));
        self.changed.notify_all();
    }

    /// Queue one chunk on the multiplexed stream endpoint
    pub fn push_stream_chunk(&self, chunk: impl Into<Bytes>) {
        self.push_in(endpoint::STREAM_IN, chunk);
    }

    /// Every read on `endpoint` fails with `error` once its queue is empty
    pub fn fail_reads_with(&self, endpoint: u8, error: TransportError) {
        self.lock().sticky_errors.insert(endpoint, error);
        self.changed.notify_all();
    }

    /// Swallow the responses to the next `count` commands
    pub fn drop_next_responses(&self, count: usize) {
        self.lock().dropped_responses = count;
    }

    /// Make the next `count` writes time out
    pub fn fail_next_writes(&self, count: usize) {
        self.lock().failed_writes = count;
    }

    /// Simulate the device vanishing from the bus
    pub fn disconnect(&self) {
        self.lock().disconnected = true;
        self.changed.notify_all();
    }

    pub fn is_claimed(&self, interface: u8) -> bool {
        self.lock().claimed.contains(&interface)
    }

    pub fn release_count(&self) -> usize {
        self.lock().releases
    }

    /// Payloads written to `endpoint`, oldest first
    pub fn writes(&self, endpoint: u8) -> Vec<Vec<u8>> {
        self.lock()
            .writes
            .iter()
            .filter(|(ep, _)| *ep == endpoint)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Number of commands with `command_id` written to the command endpoint
    pub fn commands_sent(&self, command_id: u8) -> usize {
        count_commands(&self.lock(), command_id)
    }

    pub fn control_requests(&self) -> Vec<ControlRequest> {
        self.lock().controls.clone()
    }

    /// Block until `count` commands with `command_id` were written
    pub fn wait_for_commands(&self, command_id: u8, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if count_commands(&state, command_id) >= count {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.changed.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_usable(state: &FakeState) -> Result<(), TransportError> {
        if state.disconnected {
            return Err(TransportError::Disconnected);
        }
        if !state.claimed.contains(&protocol::CONTROL_INTERFACE) {
            return Err(TransportError::NotClaimed(protocol::CONTROL_INTERFACE));
        }
        Ok(())
    }
}

impl Transport for FakeTransport {
    fn claim_interface(&self, interface: u8) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.disconnected {
            return Err(TransportError::Disconnected);
        }
        if !state.claimed.insert(interface) {
            return Err(TransportError::Busy);
        }
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.claimed.remove(&interface) {
            return Err(TransportError::NotClaimed(interface));
        }
        state.releases += 1;
        self.changed.notify_all();
        Ok(())
    }

    fn bulk_write(
        &self,
        endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut state = self.lock();
        Self::check_usable(&state)?;
        if state.failed_writes > 0 {
            state.failed_writes -= 1;
            return Err(TransportError::Timeout);
        }

        state.writes.push((endpoint, data.to_vec()));

        if endpoint == endpoint::COMMAND_OUT {
            let replies = match state.responder.as_mut() {
                Some(responder) => responder(data),
                None => Vec::new(),
            };
            if state.dropped_responses > 0 {
                state.dropped_responses -= 1;
            } else {
                let queue = state.inbound.entry(endpoint::RESPONSE_IN).or_default();
                queue.extend(replies.into_iter().map(Ok));
            }
        }

        self.changed.notify_all();
        Ok(data.len())
    }

    fn bulk_read(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            Self::check_usable(&state)?;

            if let Some(item) = state.inbound.get_mut(&endpoint).and_then(|q| q.pop_front()) {
                let data = item?;
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                return Ok(n);
            }
            if let Some(error) = state.sticky_errors.get(&endpoint) {
                return Err(error.clone());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout);
            }
            state = match self.changed.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn control_transfer(
        &self,
        request: ControlRequest,
        _buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut state = self.lock();
        if state.disconnected {
            return Err(TransportError::Disconnected);
        }
        state.controls.push(request);
        Ok(0)
    }
}

fn count_commands(state: &FakeState, command_id: u8) -> usize {
    state
        .writes
        .iter()
        .filter(|(ep, _)| *ep == endpoint::COMMAND_OUT)
        .filter_map(|(_, data)| decode_command(data).ok())
        .filter(|packet| packet.command_id() == command_id)
        .count()
}

/// Responder emulating the glasses' answers to known commands
pub fn glasses_responder() -> Responder {
    Box::new(|written: &[u8]| {
        let Ok(packet) = decode_command(written) else {
            return Vec::new();
        };
        let id = packet.command_id();
        let response = match id {
            command::DEVICE_MODEL => {
                ResponsePacket::new(id, Status::Success, FAKE_MODEL.as_bytes().to_vec())
            }
            command::SERIAL_NUMBER => {
                let mut serial = FAKE_SERIAL.as_bytes().to_vec();
                serial.resize(16, 0);
                ResponsePacket::new(id, Status::Success, serial)
            }
            command::STEREO_TRIGGER => ResponsePacket::new(id, Status::Success, Bytes::new()),
            _ => ResponsePacket::new(id, Status::Error, Bytes::new()),
        };
        vec![response.encode()]
    })
}

/// Responder that answers every command with the given status
pub fn status_responder(status: Status) -> Responder {
    Box::new(move |written: &[u8]| match decode_command(written) {
        Ok(packet) => vec![ResponsePacket::new(packet.command_id(), status, Bytes::new()).encode()],
        Err(_) => Vec::new(),
    })
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
