//! Device session: lifecycle, component wiring and public API
//!
//! ```text
//! Disconnected ──attach──▶ PermissionPending ──claimed──▶ Idle ◀──stop──▶ Streaming
//!       ▲                        │  ▲                       │    start        │
//!       │                        ▼  │ reconnect             ▼                 ▼
//!       └──────detach/close───  Error ◀─────────── unrecoverable transport error
//! ```
//!
//! The session is the only owner of the interface claim. Commands, the
//! stream reader and the keep-alive borrow the transport through it. A fatal
//! transport error from any of them is reported on a per-link fault channel;
//! a supervisor task tears the link down and reconnects with backoff.

use crate::command::{CommandChannel, ExchangeStats};
use crate::config::SessionConfig;
use crate::demux::{DemuxStats, StreamReader};
use crate::error::{DriverError, Result};
use crate::events::{EventReceiver, EventSender, SessionEvent, event_channel};
use crate::keepalive::{KeepAliveScheduler, KeepAliveStats};
use async_channel::{Receiver, Sender};
use common::{Transport, TransportError};
use protocol::{CommandPacket, ResponsePacket, Status, command};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a [`DeviceSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    /// Device found, waiting for access and the interface claim
    PermissionPending,
    /// Connected, commands allowed
    Idle,
    Streaming,
    /// Link lost; reconnection may be in progress
    Error,
}

impl SessionState {
    /// Whether `self -> next` is an edge of the lifecycle graph
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (a, b) if a == b => false,
            (_, Disconnected) => true,
            (Disconnected | Error, PermissionPending) => true,
            (PermissionPending, Idle) => true,
            (Idle, Streaming) | (Streaming, Idle) => true,
            (PermissionPending | Idle | Streaming, Error) => true,
            _ => false,
        }
    }

    /// Commands can be exchanged in this state
    pub fn is_connected(self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Streaming)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::PermissionPending => "permission pending",
            SessionState::Idle => "idle",
            SessionState::Streaming => "streaming",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Locates and opens the device
///
/// Implementations return an opened but unclaimed transport; the session
/// claims and releases the interface itself.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Arc<dyn Transport>>;
}

/// Snapshot of session counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub state: SessionState,
    /// Command channel counters of the current link
    pub commands: Option<ExchangeStats>,
    /// Current or most recent stream reader counters
    pub stream: Option<DemuxStats>,
    /// Current or most recent keep-alive counters
    pub keepalive: Option<KeepAliveStats>,
    /// Successful automatic reconnections
    pub reconnects: u64,
    /// Events lost to a full queue
    pub events_dropped: u64,
}

/// Handle to one physical device
///
/// Cheap to clone; all clones drive the same session. Sessions share no
/// global state, so any number can coexist.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<Inner>,
}

struct Inner {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<SessionState>,
    /// Serializes lifecycle operations
    link: AsyncMutex<Option<Link>>,
    events: EventSender,
    closed: AtomicBool,
    generation: AtomicU64,
    reconnects: AtomicU64,
    last_stream: Mutex<(Option<DemuxStats>, Option<KeepAliveStats>)>,
}

/// Resources of one successful connection
struct Link {
    generation: u64,
    transport: Arc<dyn Transport>,
    commands: Arc<CommandChannel>,
    fault: Sender<TransportError>,
    streaming: Option<Streaming>,
}

struct Streaming {
    reader: StreamReader,
    keepalive: Option<KeepAliveScheduler>,
}

impl DeviceSession {
    /// Create a disconnected session; performs no I/O
    pub fn new(config: SessionConfig, connector: Arc<dyn Connector>) -> (Self, EventReceiver) {
        let (events, receiver) = event_channel(config.stream.event_capacity);
        let session = Self {
            inner: Arc::new(Inner {
                config,
                connector,
                state: Mutex::new(SessionState::Disconnected),
                link: AsyncMutex::new(None),
                events,
                closed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                reconnects: AtomicU64::new(0),
                last_stream: Mutex::new((None, None)),
            }),
        };
        (session, receiver)
    }

    /// Create a session and attach to the device
    pub async fn open(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<(Self, EventReceiver)> {
        config.validate()?;
        let (session, events) = Self::new(config, connector);
        session.attach().await?;
        Ok((session, events))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    /// Open the device and claim its interface
    ///
    /// Allowed from `Disconnected`, and from `Error` after reconnection gave
    /// up. On failure the session returns to `Disconnected`.
    pub async fn attach(&self) -> Result<()> {
        self.ensure_open()?;
        self.inner.config.validate()?;

        let mut link = self.inner.link.lock().await;
        let state = self.state();
        if !matches!(state, SessionState::Disconnected | SessionState::Error) {
            return Err(DriverError::InvalidState {
                operation: "attach",
                state,
            });
        }

        self.transition(SessionState::PermissionPending);
        match self.connect().await {
            Ok((new_link, fault_rx)) => {
                spawn_supervisor(&self.inner, fault_rx, new_link.generation);
                *link = Some(new_link);
                self.transition(SessionState::Idle);
                Ok(())
            }
            Err(e) => {
                warn!("Attach failed: {}", e);
                self.transition(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Release everything; the device may already be gone
    pub async fn detach(&self) {
        let mut link = self.inner.link.lock().await;
        if let Some(old) = link.take() {
            self.teardown(old).await;
        }
        self.transition(SessionState::Disconnected);
    }

    /// Stop streaming, release the interface, and refuse further use
    ///
    /// Returns only after the reader thread exited and the claim is released.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.detach().await;
        info!("Session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Send a command and map the response status to an error
    ///
    /// `NotReady` becomes [`DriverError::DeviceBusy`] and is not retried.
    pub async fn send_command(&self, packet: CommandPacket) -> Result<ResponsePacket> {
        let (commands, fault) = {
            let link = self.inner.link.lock().await;
            let state = self.state();
            match link.as_ref() {
                Some(link) if state.is_connected() => (link.commands.clone(), link.fault.clone()),
                _ => {
                    return Err(DriverError::InvalidState {
                        operation: "send command",
                        state,
                    });
                }
            }
        };

        match exchange(commands, packet).await {
            Ok(response) => check_status(response),
            Err(DriverError::Transport(e)) if e.is_fatal() => {
                let _ = fault.try_send(e.clone());
                Err(DriverError::Transport(e))
            }
            Err(e) => Err(e),
        }
    }

    /// Model string reported by command 0xE5
    pub async fn device_model(&self) -> Result<String> {
        let response = self
            .send_command(CommandPacket::short(command::DEVICE_MODEL, 0))
            .await?;
        Ok(response.payload_str())
    }

    /// Serial number reported by command 0xED
    pub async fn serial_number(&self) -> Result<String> {
        let response = self
            .send_command(CommandPacket::short(command::SERIAL_NUMBER, 0))
            .await?;
        Ok(response.payload_str())
    }

    /// Trigger the cameras, then start the stream reader and keep-alive
    pub async fn start_streaming(&self) -> Result<()> {
        let mut guard = self.inner.link.lock().await;
        let state = self.state();
        let link = match guard.as_mut() {
            Some(link) if state == SessionState::Idle => link,
            _ => {
                return Err(DriverError::InvalidState {
                    operation: "start streaming",
                    state,
                });
            }
        };

        let config = &self.inner.config;
        let trigger = config.keepalive.trigger.packet();
        match exchange(link.commands.clone(), trigger).await {
            Ok(response) => {
                check_status(response)?;
            }
            Err(DriverError::Transport(e)) if e.is_fatal() => {
                let _ = link.fault.try_send(e.clone());
                return Err(DriverError::Transport(e));
            }
            Err(e) => return Err(e),
        }

        let reader = StreamReader::spawn(
            link.transport.clone(),
            config.stream.clone(),
            config.reassembly.clone(),
            self.inner.events.clone(),
            link.fault.clone(),
        )
        .map_err(|e| DriverError::Task(format!("Failed to spawn stream reader: {}", e)))?;

        let keepalive = config.keepalive.enabled.then(|| {
            KeepAliveScheduler::start(
                link.commands.clone(),
                &config.keepalive,
                Some(link.fault.clone()),
            )
        });

        link.streaming = Some(Streaming { reader, keepalive });
        self.transition(SessionState::Streaming);
        Ok(())
    }

    /// Stop the keep-alive and the reader; the session stays open
    pub async fn stop_streaming(&self) -> Result<()> {
        let mut guard = self.inner.link.lock().await;
        let state = self.state();
        let streaming = match guard.as_mut() {
            Some(link) if state == SessionState::Streaming => link.streaming.take(),
            _ => {
                return Err(DriverError::InvalidState {
                    operation: "stop streaming",
                    state,
                });
            }
        };

        if let Some(streaming) = streaming {
            self.stop_stream(streaming).await;
        }
        self.transition(SessionState::Idle);
        Ok(())
    }

    pub async fn stats(&self) -> SessionStats {
        let link = self.inner.link.lock().await;
        let (mut stream, mut keepalive) = *lock(&self.inner.last_stream);
        let mut commands = None;

        if let Some(link) = link.as_ref() {
            commands = Some(link.commands.stats());
            if let Some(streaming) = &link.streaming {
                stream = Some(streaming.reader.stats());
                keepalive = streaming.keepalive.as_ref().map(|k| k.stats());
            }
        }

        SessionStats {
            state: self.state(),
            commands,
            stream,
            keepalive,
            reconnects: self.inner.reconnects.load(Ordering::Relaxed),
            events_dropped: self.inner.events.overflowed(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DriverError::Closed);
        }
        Ok(())
    }

    /// Open and claim a fresh link; the caller installs it
    async fn connect(&self) -> Result<(Link, Receiver<TransportError>)> {
        let connector = self.inner.connector.clone();
        let device = self.inner.config.device.clone();

        let transport = tokio::task::spawn_blocking(move || -> Result<Arc<dyn Transport>> {
            let transport = connector.connect()?;
            transport
                .claim_interface(device.interface)
                .map_err(|e| match e {
                    TransportError::AccessDenied => DriverError::PermissionDenied {
                        vendor_id: device.vendor_id,
                        product_id: device.product_id,
                    },
                    other => DriverError::Transport(other),
                })?;
            Ok(transport)
        })
        .await
        .map_err(|e| DriverError::Task(e.to_string()))??;

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "Claimed interface {} (link {})",
            self.inner.config.device.interface, generation
        );

        let (fault, fault_rx) = async_channel::bounded(1);
        let link = Link {
            generation,
            commands: Arc::new(CommandChannel::new(
                transport.clone(),
                self.inner.config.command.clone(),
            )),
            transport,
            fault,
            streaming: None,
        };
        Ok((link, fault_rx))
    }

    /// Stop streaming and release the claim, ignoring errors from a gone device
    async fn teardown(&self, link: Link) {
        if let Some(streaming) = link.streaming {
            self.stop_stream(streaming).await;
        }

        let interface = self.inner.config.device.interface;
        let transport = link.transport;
        match tokio::task::spawn_blocking(move || transport.release_interface(interface)).await {
            Ok(Ok(())) => debug!("Released interface {} (link {})", interface, link.generation),
            Ok(Err(e)) => debug!("Release of interface {} failed: {}", interface, e),
            Err(e) => error!("Release task failed: {}", e),
        }
    }

    /// Keep-alive first so no trigger races the reader shutdown
    async fn stop_stream(&self, streaming: Streaming) {
        let keepalive = match streaming.keepalive {
            Some(keepalive) => Some(keepalive.stop().await),
            None => None,
        };

        let reader = streaming.reader;
        let stream = match tokio::task::spawn_blocking(move || reader.join()).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                error!("Stream reader join failed: {}", e);
                None
            }
        };

        *lock(&self.inner.last_stream) = (stream, keepalive);
    }

    /// Tear down a failed link and try to reconnect
    async fn recover(&self, generation: u64, fault: TransportError) {
        let old = {
            let mut link = self.inner.link.lock().await;
            if link.as_ref().map(|l| l.generation) != Some(generation) {
                debug!("Ignoring fault from stale link {}: {}", generation, fault);
                return;
            }
            link.take()
        };

        error!("Link {} lost: {}", generation, fault);
        self.transition(SessionState::Error);
        if let Some(old) = old {
            self.teardown(old).await;
        }

        let reconnect = &self.inner.config.reconnect;
        for attempt in 0..reconnect.max_attempts {
            let delay = reconnect.backoff_with_jitter(attempt);
            info!(
                "Reconnect attempt {}/{} in {:?}",
                attempt + 1,
                reconnect.max_attempts,
                delay
            );
            tokio::time::sleep(delay).await;

            if self.is_closed() {
                return;
            }
            let mut link = self.inner.link.lock().await;
            if !self.transition_from(SessionState::Error, SessionState::PermissionPending) {
                debug!("Reconnect abandoned, session is {}", self.state());
                return;
            }

            match self.connect().await {
                Ok((new_link, fault_rx)) => {
                    spawn_supervisor(&self.inner, fault_rx, new_link.generation);
                    *link = Some(new_link);
                    self.inner.reconnects.fetch_add(1, Ordering::Relaxed);
                    self.transition(SessionState::Idle);
                    info!("Reconnected after {} attempt(s)", attempt + 1);
                    return;
                }
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt + 1, e);
                    self.transition(SessionState::Error);
                }
            }
        }

        error!("Giving up after {} reconnect attempts", reconnect.max_attempts);
        self.inner.events.emit(SessionEvent::ReconnectFailed {
            attempts: reconnect.max_attempts,
        });
    }

    fn transition(&self, to: SessionState) -> bool {
        let mut state = self.lock_state();
        self.apply(&mut state, to)
    }

    /// Transition only if the session is currently in `from`
    fn transition_from(&self, from: SessionState, to: SessionState) -> bool {
        let mut state = self.lock_state();
        *state == from && self.apply(&mut state, to)
    }

    fn apply(&self, state: &mut SessionState, to: SessionState) -> bool {
        let from = *state;
        if from == to {
            return false;
        }
        if !from.can_transition_to(to) {
            warn!("Ignoring invalid transition {} -> {}", from, to);
            return false;
        }
        *state = to;
        info!("Session state: {} -> {}", from, to);
        self.inner.events.emit(SessionEvent::StateChanged { from, to });
        true
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        lock(&self.inner.state)
    }
}

/// Watch a link's fault channel; runs until a fault or until the link is gone
///
/// A plain function so the recursive spawn from `recover` stays a
/// type-level leaf.
fn spawn_supervisor(inner: &Arc<Inner>, fault_rx: Receiver<TransportError>, generation: u64) {
    let inner = Arc::downgrade(inner);
    tokio::spawn(supervise(inner, fault_rx, generation));
}

async fn supervise(inner: Weak<Inner>, fault_rx: Receiver<TransportError>, generation: u64) {
    let Ok(fault) = fault_rx.recv().await else {
        return;
    };
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let session = DeviceSession { inner };
    session.recover(generation, fault).await;
}

/// Run one blocking exchange off the runtime
async fn exchange(commands: Arc<CommandChannel>, packet: CommandPacket) -> Result<ResponsePacket> {
    tokio::task::spawn_blocking(move || commands.send(&packet))
        .await
        .map_err(|e| DriverError::Task(e.to_string()))?
}

/// Map device statuses to typed errors
pub fn check_status(response: ResponsePacket) -> Result<ResponsePacket> {
    match response.status() {
        Status::Success => Ok(response),
        Status::NotReady => Err(DriverError::DeviceBusy {
            command: response.command_id(),
        }),
        Status::StateError => Err(DriverError::DeviceState { response }),
        Status::ConfigError => Err(DriverError::Configuration { response }),
        Status::Error | Status::Other(_) => Err(DriverError::CommandFailed { response }),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
