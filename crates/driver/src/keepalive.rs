//! Periodic stereo trigger while streaming
//!
//! The glasses stop emitting camera data when no trigger arrives within
//! their streaming timeout. The scheduler resends the trigger on a fixed
//! period, regardless of traffic, until stopped. Once `stop` is called no
//! trigger is written, even one queued behind another exchange; one
//! already on the wire is allowed to finish.

use crate::command::CommandChannel;
use crate::config::KeepAliveSettings;
use crate::error::DriverError;
use async_channel::Sender;
use common::TransportError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepAliveStats {
    /// Triggers the device acknowledged
    pub sent: u64,
    /// Triggers that failed or were answered with a non-success status
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> KeepAliveStats {
        KeepAliveStats {
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

pub struct KeepAliveScheduler {
    stopped: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    counters: Arc<Counters>,
    task: JoinHandle<()>,
}

impl KeepAliveScheduler {
    /// Start sending triggers; the first one goes out one period from now
    ///
    /// A fatal transport error is reported once on `fault` and ends the
    /// scheduler.
    pub fn start(
        channel: Arc<CommandChannel>,
        settings: &KeepAliveSettings,
        fault: Option<Sender<TransportError>>,
    ) -> Self {
        let stopped = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());
        let first = Instant::now() + settings.period();

        let task = tokio::spawn(run(
            channel,
            settings.clone(),
            first,
            stopped.clone(),
            stop_rx,
            counters.clone(),
            fault,
        ));

        Self {
            stopped,
            stop_tx,
            counters,
            task,
        }
    }

    pub fn stats(&self) -> KeepAliveStats {
        self.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cancel and wait for the task to exit
    pub async fn stop(self) -> KeepAliveStats {
        self.stopped.store(true, Ordering::Release);
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            error!("Keep-alive task failed: {}", e);
        }
        self.counters.snapshot()
    }
}

async fn run(
    channel: Arc<CommandChannel>,
    settings: KeepAliveSettings,
    first: Instant,
    stopped: Arc<AtomicBool>,
    mut stop_rx: watch::Receiver<bool>,
    counters: Arc<Counters>,
    fault: Option<Sender<TransportError>>,
) {
    let period = settings.period();
    let packet = settings.trigger.packet();
    info!("Keep-alive started: trigger {:#04x} every {:?}", packet.command_id(), period);

    let mut ticker = time::interval_at(first, period);
    // Fixed cadence; a late tick must not cause a burst
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            _ = ticker.tick() => {}
        }
        if stopped.load(Ordering::Acquire) {
            break;
        }

        let send = {
            let channel = channel.clone();
            let packet = packet.clone();
            let stopped = stopped.clone();
            tokio::task::spawn_blocking(move || channel.send_unless(&packet, &stopped))
        };

        match send.await {
            Ok(Ok(None)) => break,
            Ok(Ok(Some(response))) if response.status().is_success() => {
                counters.sent.fetch_add(1, Ordering::Relaxed);
                debug!("Keep-alive trigger acknowledged");
            }
            Ok(Ok(Some(response))) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Keep-alive trigger answered {}", response.status());
            }
            Ok(Err(DriverError::Transport(e))) if e.is_fatal() => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!("Keep-alive lost the device: {}", e);
                if let Some(fault) = &fault {
                    let _ = fault.try_send(e);
                }
                break;
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Keep-alive trigger failed: {}", e);
            }
            Err(e) => {
                error!("Keep-alive send panicked: {}", e);
                break;
            }
        }
    }

    let stats = counters.snapshot();
    info!(
        "Keep-alive stopped: {} sent, {} failed",
        stats.sent, stats.failed
    );
}
