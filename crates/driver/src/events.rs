//! Session event bridge between the USB threads and consumers
//!
//! Producers run on blocking threads (the stream reader) and inside tokio
//! tasks (state changes, reconnect). Neither may stall on a slow consumer,
//! so sends never wait: a full queue drops the event and counts it.
//! Consumers read with `recv().await` or `recv_blocking()`.

use crate::reassembler::{FrameEvent, StereoFramePair};
use crate::session::SessionState;
use async_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use common::Error;
use protocol::ImuSample;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Everything a session reports to its consumer
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Imu(ImuSample),
    StereoFrame(StereoFramePair),
    /// Pair that expired or was evicted before both sides arrived
    FrameDropped(StereoFramePair),
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// Reconnection gave up; the session stays in `Error`
    ReconnectFailed { attempts: u32 },
}

impl From<FrameEvent> for SessionEvent {
    fn from(event: FrameEvent) -> Self {
        match event {
            FrameEvent::Complete(pair) => SessionEvent::StereoFrame(pair),
            FrameEvent::Dropped(pair) => SessionEvent::FrameDropped(pair),
        }
    }
}

/// Producer half, cloned into every task that reports events
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<SessionEvent>,
    overflowed: Arc<AtomicU64>,
}

impl EventSender {
    /// Queue an event without blocking
    ///
    /// Returns false if the event was not delivered.
    pub fn emit(&self, event: SessionEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                let total = self.overflowed.fetch_add(1, Ordering::Relaxed) + 1;
                // Log the first overflow and then every 1000th
                if total == 1 || total % 1000 == 0 {
                    warn!(
                        "Event queue full, dropped {:?} ({} dropped so far)",
                        EventKind::of(&event),
                        total
                    );
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Events lost to a full queue
    pub fn overflowed(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half handed out by `DeviceSession::new`
#[derive(Clone)]
pub struct EventReceiver {
    rx: Receiver<SessionEvent>,
}

impl EventReceiver {
    /// Receive the next event (async)
    pub async fn recv(&self) -> common::Result<SessionEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| Error::Channel(e.to_string()))
    }

    /// Receive the next event (blocking)
    pub fn recv_blocking(&self) -> common::Result<SessionEvent> {
        self.rx
            .recv_blocking()
            .map_err(|e| Error::Channel(e.to_string()))
    }

    /// Next queued event, if any
    pub fn try_recv(&self) -> Option<SessionEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Take every queued event without waiting
    pub fn drain(&self) -> Vec<SessionEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create the bounded event queue
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    (
        EventSender {
            tx,
            overflowed: Arc::new(AtomicU64::new(0)),
        },
        EventReceiver { rx },
    )
}

/// Payload-free discriminant for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Imu,
    StereoFrame,
    FrameDropped,
    StateChanged,
    ReconnectFailed,
}

impl EventKind {
    pub fn of(event: &SessionEvent) -> Self {
        match event {
            SessionEvent::Imu(_) => EventKind::Imu,
            SessionEvent::StereoFrame(_) => EventKind::StereoFrame,
            SessionEvent::FrameDropped(_) => EventKind::FrameDropped,
            SessionEvent::StateChanged { .. } => EventKind::StateChanged,
            SessionEvent::ReconnectFailed { .. } => EventKind::ReconnectFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_event() -> SessionEvent {
        SessionEvent::StateChanged {
            from: SessionState::Idle,
            to: SessionState::Streaming,
        }
    }

    #[test]
    fn test_emit_and_drain() {
        let (tx, rx) = event_channel(4);
        assert!(tx.emit(state_event()));
        assert!(tx.emit(SessionEvent::ReconnectFailed { attempts: 3 }));

        let events = rx.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(EventKind::of(&events[1]), EventKind::ReconnectFailed);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_full_queue_counts_overflow() {
        let (tx, rx) = event_channel(1);
        assert!(tx.emit(state_event()));
        assert!(!tx.emit(state_event()));
        assert!(!tx.emit(state_event()));
        assert_eq!(tx.overflowed(), 2);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_closed_receiver() {
        let (tx, rx) = event_channel(4);
        drop(rx);
        assert!(tx.is_closed());
        assert!(!tx.emit(state_event()));
        assert_eq!(tx.overflowed(), 0);
    }

    #[tokio::test]
    async fn test_async_recv_after_sender_dropped() {
        let (tx, rx) = event_channel(4);
        tx.emit(state_event());
        drop(tx);

        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::StateChanged { .. }
        ));
        assert!(matches!(rx.recv().await, Err(Error::Channel(_))));
    }
}
