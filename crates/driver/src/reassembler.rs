//! Left/right stereo frame pairing
//!
//! Frame chunks arrive on the multiplexed stream in arrival order, but the
//! two sides of one frame number may come in either order. The reassembler
//! holds at most `window` open pairs; a pair completes when both sides are
//! present, and is dropped when it outlives the expiry or is evicted to make
//! room. Payloads are opaque.

use crate::config::ReassemblySettings;
use bytes::Bytes;
use protocol::{CameraSide, StereoFrameChunk};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Lifecycle of a [`StereoFramePair`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    AwaitingPeer,
    Complete,
    Expired,
}

/// Left and right chunks sharing a frame number
#[derive(Debug, Clone, PartialEq)]
pub struct StereoFramePair {
    pub frame_number: u16,
    pub left: Option<Bytes>,
    pub right: Option<Bytes>,
    pub first_seen: Instant,
    pub state: PairState,
}

impl StereoFramePair {
    fn new(frame_number: u16, first_seen: Instant) -> Self {
        Self {
            frame_number,
            left: None,
            right: None,
            first_seen,
            state: PairState::AwaitingPeer,
        }
    }

    pub fn side(&self, side: CameraSide) -> Option<&Bytes> {
        match side {
            CameraSide::Left => self.left.as_ref(),
            CameraSide::Right => self.right.as_ref(),
        }
    }

    fn slot(&mut self, side: CameraSide) -> &mut Option<Bytes> {
        match side {
            CameraSide::Left => &mut self.left,
            CameraSide::Right => &mut self.right,
        }
    }

    pub fn has_both(&self) -> bool {
        self.left.is_some() && self.right.is_some()
    }
}

/// Output of the reassembler
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    Complete(StereoFramePair),
    /// Expired or evicted before its peer arrived
    Dropped(StereoFramePair),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub completed: u64,
    pub dropped: u64,
    /// Subset of `dropped` pushed out by a full window
    pub evicted: u64,
    /// Second chunk for a side that is already filled
    pub duplicates: u64,
    /// Chunk for a frame number that was already completed or dropped
    pub late: u64,
}

pub struct FrameReassembler {
    window: usize,
    expiry: Duration,
    open: HashMap<u16, StereoFramePair>,
    /// Open frame numbers, oldest first
    order: VecDeque<u16>,
    /// Recently completed or dropped frame numbers
    retired: VecDeque<u16>,
    stats: ReassemblyStats,
}

impl FrameReassembler {
    pub fn new(settings: &ReassemblySettings) -> Self {
        let window = settings.window.max(1);
        Self {
            window,
            expiry: settings.expiry(),
            open: HashMap::with_capacity(window),
            order: VecDeque::with_capacity(window),
            retired: VecDeque::with_capacity(window * 2),
            stats: ReassemblyStats::default(),
        }
    }

    /// Number of pairs currently awaiting their peer
    pub fn in_flight(&self) -> usize {
        self.open.len()
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    /// Feed one chunk
    ///
    /// Stale pairs are expired first, so a single call may emit several
    /// events.
    pub fn push(
        &mut self,
        chunk: StereoFrameChunk,
        now: Instant,
        emit: &mut impl FnMut(FrameEvent),
    ) {
        self.expire(now, emit);

        let frame_number = chunk.frame_number;
        if !self.open.contains_key(&frame_number) && self.retired.contains(&frame_number) {
            self.stats.late += 1;
            trace!(
                "Ignoring {:?} chunk for retired frame {}",
                chunk.side, frame_number
            );
            return;
        }

        if !self.open.contains_key(&frame_number) {
            if self.open.len() >= self.window {
                self.evict_oldest(emit);
            }
            self.open
                .insert(frame_number, StereoFramePair::new(frame_number, now));
            self.order.push_back(frame_number);
        }

        let Some(pair) = self.open.get_mut(&frame_number) else {
            return;
        };
        let slot = pair.slot(chunk.side);
        if slot.is_some() {
            self.stats.duplicates += 1;
            debug!(
                "Duplicate {:?} chunk for frame {} (packet {})",
                chunk.side, frame_number, chunk.packet_id
            );
            return;
        }
        *slot = Some(chunk.payload);

        if pair.has_both() {
            if let Some(mut pair) = self.take(frame_number) {
                pair.state = PairState::Complete;
                self.stats.completed += 1;
                trace!("Frame {} complete", frame_number);
                emit(FrameEvent::Complete(pair));
            }
        }
    }

    /// Drop every pair older than the expiry
    pub fn expire(&mut self, now: Instant, emit: &mut impl FnMut(FrameEvent)) {
        while let Some(&oldest) = self.order.front() {
            let expired = self
                .open
                .get(&oldest)
                .is_some_and(|pair| now.saturating_duration_since(pair.first_seen) >= self.expiry);
            if !expired {
                break;
            }
            if let Some(pair) = self.take(oldest) {
                self.drop_pair(pair, emit);
            }
        }
    }

    /// Drop everything still open, e.g. when streaming stops
    pub fn flush(&mut self, emit: &mut impl FnMut(FrameEvent)) {
        while let Some(&oldest) = self.order.front() {
            if let Some(pair) = self.take(oldest) {
                self.drop_pair(pair, emit);
            }
        }
    }

    fn evict_oldest(&mut self, emit: &mut impl FnMut(FrameEvent)) {
        if let Some(&oldest) = self.order.front() {
            if let Some(pair) = self.take(oldest) {
                self.stats.evicted += 1;
                self.drop_pair(pair, emit);
            }
        }
    }

    fn drop_pair(&mut self, mut pair: StereoFramePair, emit: &mut impl FnMut(FrameEvent)) {
        pair.state = PairState::Expired;
        self.stats.dropped += 1;
        warn!(
            "Dropping frame {} (left: {}, right: {})",
            pair.frame_number,
            pair.left.is_some(),
            pair.right.is_some()
        );
        emit(FrameEvent::Dropped(pair));
    }

    /// Remove an open pair and remember its number as retired
    fn take(&mut self, frame_number: u16) -> Option<StereoFramePair> {
        let pair = self.open.remove(&frame_number)?;
        self.order.retain(|&n| n != frame_number);
        if self.retired.len() >= self.window * 2 {
            self.retired.pop_front();
        }
        self.retired.push_back(frame_number);
        Some(pair)
    }
}
