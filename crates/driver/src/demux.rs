//! Multiplexed stream endpoint reader
//!
//! Endpoint 0x82 carries IMU samples and stereo frame chunks in a single
//! bulk stream, one chunk per transfer. [`StreamDemultiplexer`] classifies
//! chunks by magic and routes them; [`StreamReader`] owns the dedicated
//! thread that polls the endpoint and feeds it.

use crate::config::{ReassemblySettings, StreamSettings};
use crate::events::{EventSender, SessionEvent};
use crate::reassembler::{FrameReassembler, ReassemblyStats};
use async_channel::Sender;
use bytes::Bytes;
use common::{Transport, TransportError};
use protocol::stream::{ChunkKind, classify, parse_frame_chunk, parse_imu};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Counters for the stream path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxStats {
    pub chunks: u64,
    pub imu_samples: u64,
    pub frame_chunks: u64,
    /// Chunks with an unrecognized header
    pub unknown: u64,
    /// Chunks with a known header that failed to parse
    pub malformed: u64,
    /// Reads that returned nothing before the timeout
    pub idle_polls: u64,
    pub read_errors: u64,
    pub reassembly: ReassemblyStats,
}

/// Routes stream chunks to the IMU path or the frame reassembler
pub struct StreamDemultiplexer {
    reassembler: FrameReassembler,
    stats: DemuxStats,
}

impl StreamDemultiplexer {
    pub fn new(reassembly: &ReassemblySettings) -> Self {
        Self {
            reassembler: FrameReassembler::new(reassembly),
            stats: DemuxStats::default(),
        }
    }

    /// Route one chunk; malformed or unknown chunks are counted and skipped
    pub fn process(&mut self, chunk: Bytes, now: Instant, sink: &mut impl FnMut(SessionEvent)) {
        self.stats.chunks += 1;

        match classify(&chunk) {
            ChunkKind::Imu => match parse_imu(&chunk, now) {
                Ok(sample) => {
                    self.stats.imu_samples += 1;
                    sink(SessionEvent::Imu(sample));
                }
                Err(e) => {
                    self.stats.malformed += 1;
                    debug!(
                        "Skipping malformed IMU chunk ({} bytes): {}",
                        chunk.len(),
                        e
                    );
                }
            },
            ChunkKind::Frame => match parse_frame_chunk(chunk) {
                Ok(frame) => {
                    self.stats.frame_chunks += 1;
                    trace!(
                        "Frame chunk: frame={} packet={} side={:?} len={}",
                        frame.frame_number,
                        frame.packet_id,
                        frame.side,
                        frame.payload.len()
                    );
                    self.reassembler
                        .push(frame, now, &mut |event| sink(event.into()));
                }
                Err(e) => {
                    self.stats.malformed += 1;
                    debug!("Skipping malformed frame chunk: {}", e);
                }
            },
            ChunkKind::Unknown => {
                self.stats.unknown += 1;
                trace!(
                    "Dropping unknown chunk ({} bytes, header {:02x?})",
                    chunk.len(),
                    &chunk[..chunk.len().min(2)]
                );
            }
        }
    }

    /// Expire stalled frame pairs
    pub fn tick(&mut self, now: Instant, sink: &mut impl FnMut(SessionEvent)) {
        self.reassembler
            .expire(now, &mut |event| sink(event.into()));
    }

    /// Drop every open pair
    pub fn flush(&mut self, sink: &mut impl FnMut(SessionEvent)) {
        self.reassembler.flush(&mut |event| sink(event.into()));
    }

    pub fn in_flight(&self) -> usize {
        self.reassembler.in_flight()
    }

    pub fn stats(&self) -> DemuxStats {
        DemuxStats {
            reassembly: self.reassembler.stats(),
            ..self.stats
        }
    }
}

/// The single reader of the stream endpoint
///
/// Stopping is cooperative: the thread notices the flag at its next read
/// timeout boundary.
pub struct StreamReader {
    stop: Arc<AtomicBool>,
    stats: Arc<Mutex<DemuxStats>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamReader {
    /// Spawn the reader thread
    ///
    /// A fatal read error, or `max_consecutive_errors` failures in a row, is
    /// sent once on `fault` and ends the thread.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        settings: StreamSettings,
        reassembly: ReassemblySettings,
        events: EventSender,
        fault: Sender<TransportError>,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(DemuxStats::default()));

        let thread = {
            let stop = stop.clone();
            let stats = stats.clone();
            thread::Builder::new()
                .name("glasses-stream".into())
                .spawn(move || {
                    read_loop(
                        transport.as_ref(),
                        &settings,
                        StreamDemultiplexer::new(&reassembly),
                        &events,
                        &fault,
                        &stop,
                        &stats,
                    )
                })?
        };

        Ok(Self {
            stop,
            stats,
            thread: Some(thread),
        })
    }

    /// Ask the thread to exit at its next timeout boundary
    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    pub fn stats(&self) -> DemuxStats {
        match self.stats.lock() {
            Ok(stats) => *stats,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Stop and wait for the thread; blocks up to one read timeout
    pub fn join(mut self) -> DemuxStats {
        self.signal_stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Stream reader thread panicked");
            }
        }
        self.stats()
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

fn read_loop(
    transport: &dyn Transport,
    settings: &StreamSettings,
    mut demux: StreamDemultiplexer,
    events: &EventSender,
    fault: &Sender<TransportError>,
    stop: &AtomicBool,
    shared: &Mutex<DemuxStats>,
) {
    info!("Stream reader started on endpoint {:#04x}", settings.endpoint);
    let mut emit = |event: SessionEvent| {
        events.emit(event);
    };
    let mut buf = vec![0u8; settings.chunk_size];
    let mut consecutive_errors = 0u32;

    while !stop.load(Ordering::Acquire) {
        match transport.bulk_read(settings.endpoint, &mut buf, settings.read_timeout()) {
            Ok(0) => consecutive_errors = 0,
            Ok(len) => {
                consecutive_errors = 0;
                demux.process(
                    Bytes::copy_from_slice(&buf[..len]),
                    Instant::now(),
                    &mut emit,
                );
            }
            Err(TransportError::Timeout) => {
                // Streaming pauses without a keep-alive; not an error
                consecutive_errors = 0;
                demux.stats.idle_polls += 1;
            }
            Err(e) => {
                consecutive_errors += 1;
                demux.stats.read_errors += 1;
                if e.is_fatal() || consecutive_errors >= settings.max_consecutive_errors {
                    error!(
                        "Stream endpoint {:#04x} failed ({} consecutive errors): {}",
                        settings.endpoint, consecutive_errors, e
                    );
                    let _ = fault.try_send(e);
                    break;
                }
                warn!(
                    "Stream read error {}/{}: {}",
                    consecutive_errors, settings.max_consecutive_errors, e
                );
            }
        }

        demux.tick(Instant::now(), &mut emit);
        publish(shared, demux.stats());
    }

    demux.flush(&mut emit);
    let stats = demux.stats();
    publish(shared, stats);
    info!(
        "Stream reader stopped: {} chunks, {} IMU, {} frames complete, {} dropped, {} unknown",
        stats.chunks,
        stats.imu_samples,
        stats.reassembly.completed,
        stats.reassembly.dropped,
        stats.unknown
    );
}

fn publish(shared: &Mutex<DemuxStats>, stats: DemuxStats) {
    match shared.lock() {
        Ok(mut guard) => *guard = stats,
        Err(poisoned) => *poisoned.into_inner() = stats,
    }
}
