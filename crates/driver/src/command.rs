//! Serialized request/response exchanges on a command endpoint pair
//!
//! The glasses answer every command on a single response endpoint and carry
//! no request id, so at most one exchange may be in flight per pair. The
//! channel holds a lock for the whole write-then-read sequence, discards
//! stale bytes left by an earlier timed-out exchange, and retries only on
//! timeout.

use crate::config::CommandSettings;
use crate::error::{DriverError, Result};
use common::{Transport, TransportError};
use protocol::{CommandPacket, ResponsePacket, decode_response, endpoint};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// OUT/IN endpoint pair used for one command channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointPair {
    pub out: u8,
    pub input: u8,
}

impl EndpointPair {
    /// Primary command channel (0x04 out, 0x85 in)
    pub const PRIMARY: EndpointPair = EndpointPair {
        out: endpoint::COMMAND_OUT,
        input: endpoint::RESPONSE_IN,
    };

    /// Secondary heartbeat channel (0x06 out, 0x87 in)
    pub const HEARTBEAT: EndpointPair = EndpointPair {
        out: endpoint::HEARTBEAT_OUT,
        input: endpoint::HEARTBEAT_IN,
    };
}

/// Counters kept per channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    /// Exchanges that produced a response
    pub completed: u64,
    /// Attempts that timed out
    pub timeouts: u64,
    /// Exchanges that failed after all attempts or on a hard error
    pub failed: u64,
    /// Stale packets discarded before writing
    pub drained: u64,
    /// Responses discarded because they echoed a different command
    pub unrelated: u64,
}

/// One command endpoint pair on an open device
pub struct CommandChannel {
    transport: Arc<dyn Transport>,
    endpoints: EndpointPair,
    settings: CommandSettings,
    /// Held for the duration of an exchange
    exchange: Mutex<ExchangeStats>,
}

impl CommandChannel {
    pub fn new(transport: Arc<dyn Transport>, settings: CommandSettings) -> Self {
        Self::with_endpoints(transport, EndpointPair::PRIMARY, settings)
    }

    pub fn with_endpoints(
        transport: Arc<dyn Transport>,
        endpoints: EndpointPair,
        settings: CommandSettings,
    ) -> Self {
        Self {
            transport,
            endpoints,
            settings,
            exchange: Mutex::new(ExchangeStats::default()),
        }
    }

    pub fn endpoints(&self) -> EndpointPair {
        self.endpoints
    }

    pub fn stats(&self) -> ExchangeStats {
        *self.lock()
    }

    /// Send a command and wait for its response, using the configured timeout
    ///
    /// Any device status is returned as `Ok`; interpreting it is up to the
    /// caller. Errors are transport failures (after retries, for timeouts)
    /// and undecodable responses.
    pub fn send(&self, packet: &CommandPacket) -> Result<ResponsePacket> {
        self.send_with_timeout(packet, self.settings.timeout())
    }

    pub fn send_with_timeout(
        &self,
        packet: &CommandPacket,
        timeout: Duration,
    ) -> Result<ResponsePacket> {
        let mut stats = self.lock();
        self.attempt_all(&mut stats, packet, timeout, None)?
            .ok_or(DriverError::Closed)
    }

    /// Like `send`, but gives up without writing once `cancelled` is set
    ///
    /// The flag is checked after the exchange lock is taken and before each
    /// attempt, so a caller queued behind a slow exchange never writes after
    /// cancellation. Returns `Ok(None)` when cancelled.
    pub fn send_unless(
        &self,
        packet: &CommandPacket,
        cancelled: &AtomicBool,
    ) -> Result<Option<ResponsePacket>> {
        let mut stats = self.lock();
        self.attempt_all(&mut stats, packet, self.settings.timeout(), Some(cancelled))
    }

    fn attempt_all(
        &self,
        stats: &mut ExchangeStats,
        packet: &CommandPacket,
        timeout: Duration,
        cancelled: Option<&AtomicBool>,
    ) -> Result<Option<ResponsePacket>> {
        let encoded = packet.encode();
        let attempts = self.settings.retries.saturating_add(1);

        for attempt in 1..=attempts {
            if cancelled.is_some_and(|flag| flag.load(Ordering::Acquire)) {
                debug!(
                    "Command {:#04x} cancelled before attempt {}",
                    packet.command_id(),
                    attempt
                );
                return Ok(None);
            }

            match self.exchange_once(stats, packet.command_id(), &encoded, timeout) {
                Ok(response) => {
                    stats.completed += 1;
                    debug!(
                        "Command {:#04x} ({}) attempt {}/{}: status {}",
                        packet.command_id(),
                        packet.format(),
                        attempt,
                        attempts,
                        response.status()
                    );
                    return Ok(Some(response));
                }
                Err(DriverError::Transport(TransportError::Timeout)) => {
                    stats.timeouts += 1;
                    warn!(
                        "Command {:#04x} attempt {}/{} timed out after {:?}",
                        packet.command_id(),
                        attempt,
                        attempts,
                        timeout
                    );
                }
                Err(e) => {
                    stats.failed += 1;
                    warn!(
                        "Command {:#04x} attempt {}/{} failed: {}",
                        packet.command_id(),
                        attempt,
                        attempts,
                        e
                    );
                    return Err(e);
                }
            }
        }

        stats.failed += 1;
        Err(TransportError::Timeout.into())
    }

    fn exchange_once(
        &self,
        stats: &mut ExchangeStats,
        command_id: u8,
        encoded: &[u8],
        timeout: Duration,
    ) -> Result<ResponsePacket> {
        self.drain(stats)?;

        let written = self
            .transport
            .bulk_write(self.endpoints.out, encoded, timeout)?;
        trace!("Wrote {} bytes to endpoint {:#04x}", written, self.endpoints.out);

        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; self.settings.response_buffer_len];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout.into());
            }

            let len = self
                .transport
                .bulk_read(self.endpoints.input, &mut buf, remaining)?;
            if len == 0 {
                continue;
            }

            let response = decode_response(&buf[..len])?;
            if response.command_id() != command_id {
                stats.unrelated += 1;
                warn!(
                    "Discarding response for {:#04x} while waiting for {:#04x}",
                    response.command_id(),
                    command_id
                );
                continue;
            }
            return Ok(response);
        }
    }

    /// Discard whatever is already queued on the response endpoint
    fn drain(&self, stats: &mut ExchangeStats) -> Result<()> {
        let mut buf = vec![0u8; self.settings.response_buffer_len];
        for _ in 0..self.settings.max_drain_reads {
            match self.transport.bulk_read(
                self.endpoints.input,
                &mut buf,
                self.settings.drain_timeout(),
            ) {
                Ok(len) => {
                    stats.drained += 1;
                    debug!(
                        "Drained {} stale bytes from endpoint {:#04x}",
                        len, self.endpoints.input
                    );
                }
                Err(TransportError::Timeout) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    trace!(
                        "Ignoring drain error on {:#04x}: {}",
                        self.endpoints.input, e
                    );
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, ExchangeStats> {
        match self.exchange.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{FAKE_MODEL, FakeTransport, status_responder};
    use protocol::{Status, command};
    use std::thread;

    fn settings() -> CommandSettings {
        CommandSettings {
            timeout_ms: 50,
            retries: 3,
            drain_timeout_ms: 1,
            max_drain_reads: 8,
            response_buffer_len: 1024,
        }
    }

    fn channel(fake: &Arc<FakeTransport>) -> CommandChannel {
        fake.claim_interface(0).unwrap();
        CommandChannel::new(fake.clone(), settings())
    }

    #[test]
    fn test_model_query() {
        let fake = Arc::new(FakeTransport::glasses());
        let channel = channel(&fake);

        let response = channel
            .send(&CommandPacket::short(command::DEVICE_MODEL, 0))
            .unwrap();
        assert_eq!(response.status(), Status::Success);
        assert_eq!(response.payload_str(), FAKE_MODEL);
        assert_eq!(fake.writes(endpoint::COMMAND_OUT).len(), 1);
        assert_eq!(channel.stats().completed, 1);
    }

    #[test]
    fn test_not_ready_returned_without_retry() {
        let fake = Arc::new(FakeTransport::new());
        fake.set_responder(status_responder(Status::NotReady));
        let channel = channel(&fake);

        let response = channel.send(&CommandPacket::stereo_trigger()).unwrap();
        assert_eq!(response.status(), Status::NotReady);
        assert_eq!(fake.commands_sent(command::STEREO_TRIGGER), 1);
    }

    #[test]
    fn test_retries_after_timeout() {
        let fake = Arc::new(FakeTransport::glasses());
        fake.drop_next_responses(2);
        let channel = channel(&fake);

        let response = channel
            .send(&CommandPacket::short(command::DEVICE_MODEL, 0))
            .unwrap();
        assert_eq!(response.payload_str(), FAKE_MODEL);
        assert_eq!(fake.commands_sent(command::DEVICE_MODEL), 3);

        let stats = channel.stats();
        assert_eq!(stats.timeouts, 2);
        assert_eq!(stats.completed, 1);
    }

    #[test]
    fn test_gives_up_after_retries() {
        let fake = Arc::new(FakeTransport::glasses());
        fake.drop_next_responses(10);
        let channel = channel(&fake);

        let err = channel
            .send(&CommandPacket::short(command::DEVICE_MODEL, 0))
            .unwrap_err();
        assert!(matches!(err, DriverError::Transport(TransportError::Timeout)));
        assert_eq!(fake.commands_sent(command::DEVICE_MODEL), 4);
        assert_eq!(channel.stats().failed, 1);
    }

    #[test]
    fn test_write_timeout_is_retried() {
        let fake = Arc::new(FakeTransport::glasses());
        fake.fail_next_writes(1);
        let channel = channel(&fake);

        channel
            .send(&CommandPacket::short(command::SERIAL_NUMBER, 0))
            .unwrap();
        assert_eq!(channel.stats().timeouts, 1);
    }

    #[test]
    fn test_stale_response_is_drained() {
        let fake = Arc::new(FakeTransport::glasses());
        let channel = channel(&fake);

        // Late answer from an exchange that already gave up
        fake.push_in(
            endpoint::RESPONSE_IN,
            ResponsePacket::new(command::SERIAL_NUMBER, Status::Success, &b"stale"[..]).encode(),
        );

        let response = channel
            .send(&CommandPacket::short(command::DEVICE_MODEL, 0))
            .unwrap();
        assert_eq!(response.command_id(), command::DEVICE_MODEL);
        assert_eq!(channel.stats().drained, 1);
    }

    #[test]
    fn test_corrupt_response_is_protocol_error() {
        let fake = Arc::new(FakeTransport::new());
        fake.set_responder(Box::new(|_| {
            vec![bytes::Bytes::from_static(&[0x12, 0x34, 0x56])]
        }));
        let channel = channel(&fake);

        let err = channel
            .send(&CommandPacket::short(command::DEVICE_MODEL, 0))
            .unwrap_err();
        assert!(matches!(err, DriverError::Protocol(_)));
    }

    #[test]
    fn test_disconnect_is_not_retried() {
        let fake = Arc::new(FakeTransport::glasses());
        let channel = channel(&fake);
        fake.disconnect();

        let err = channel
            .send(&CommandPacket::short(command::DEVICE_MODEL, 0))
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(fake.commands_sent(command::DEVICE_MODEL), 0);
    }

    #[test]
    fn test_cancelled_caller_never_writes() {
        let fake = Arc::new(FakeTransport::glasses());
        let channel = channel(&fake);
        let cancelled = AtomicBool::new(false);

        let response = channel
            .send_unless(&CommandPacket::stereo_trigger(), &cancelled)
            .unwrap();
        assert!(response.is_some());

        cancelled.store(true, Ordering::Release);
        let response = channel
            .send_unless(&CommandPacket::stereo_trigger(), &cancelled)
            .unwrap();
        assert!(response.is_none());
        assert_eq!(fake.commands_sent(command::STEREO_TRIGGER), 1);
    }

    #[test]
    fn test_concurrent_callers_are_serialized() {
        let fake = Arc::new(FakeTransport::glasses());
        let channel = Arc::new(channel(&fake));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let channel = channel.clone();
                thread::spawn(move || {
                    let id = if i % 2 == 0 {
                        command::DEVICE_MODEL
                    } else {
                        command::SERIAL_NUMBER
                    };
                    let response = channel.send(&CommandPacket::short(id, 0)).unwrap();
                    assert_eq!(response.command_id(), id);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(channel.stats().completed, 8);
        assert_eq!(channel.stats().unrelated, 0);
    }
}
