//! Hot-plug monitoring
//!
//! libusb delivers hot-plug callbacks from inside `handle_events`, so the
//! monitor runs its own event thread and forwards arrivals and removals of
//! the configured device over a channel. [`drive_session`] turns those
//! notifications into `attach`/`detach` calls on a session.

use super::transport::map_rusb_error;
use crate::config::DeviceSettings;
use crate::error::{DriverError, Result};
use crate::session::{DeviceSession, SessionState};
use async_channel::{Receiver, Sender, bounded};
use rusb::{Context, Device, Hotplug, HotplugBuilder, UsbContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::task::JoinHandle as TaskHandle;
use tracing::{debug, error, info, warn};

/// Poll interval of the libusb event loop
const EVENT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEvent {
    Arrived { bus_number: u8, address: u8 },
    Left { bus_number: u8, address: u8 },
}

struct Callback {
    tx: Sender<HotplugEvent>,
}

impl<T: UsbContext> Hotplug<T> for Callback {
    fn device_arrived(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.tx.try_send(HotplugEvent::Arrived {
            bus_number: device.bus_number(),
            address: device.address(),
        });
    }

    fn device_left(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.tx.try_send(HotplugEvent::Left {
            bus_number: device.bus_number(),
            address: device.address(),
        });
    }
}

/// Owns the libusb event thread and hot-plug registration
pub struct HotplugMonitor {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HotplugMonitor {
    /// Register for the configured device and start the event thread
    ///
    /// Devices already present are reported as arrivals.
    pub fn start(settings: &DeviceSettings) -> Result<(Self, Receiver<HotplugEvent>)> {
        if !rusb::has_hotplug() {
            return Err(DriverError::HotplugUnsupported);
        }

        let context = Context::new().map_err(map_rusb_error)?;
        let (tx, rx) = bounded(32);
        let registration = HotplugBuilder::new()
            .vendor_id(settings.vendor_id)
            .product_id(settings.product_id)
            .enumerate(true)
            .register::<Context, _>(&context, Box::new(Callback { tx }))
            .map_err(map_rusb_error)?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("glasses-hotplug".into())
                .spawn(move || {
                    let _registration = registration;
                    info!("Hot-plug monitor started");
                    while !stop.load(Ordering::Acquire) {
                        match context.handle_events(Some(EVENT_POLL)) {
                            Ok(()) => {}
                            Err(rusb::Error::Interrupted) => {
                                debug!("USB event handling interrupted");
                            }
                            Err(e) => {
                                warn!("Error handling USB events: {}", e);
                                thread::sleep(EVENT_POLL);
                            }
                        }
                    }
                    info!("Hot-plug monitor stopped");
                })
                .map_err(|e| {
                    DriverError::Task(format!("Failed to spawn hot-plug thread: {}", e))
                })?
        };

        Ok((
            Self {
                stop,
                thread: Some(thread),
            },
            rx,
        ))
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Hot-plug thread panicked");
            }
        }
    }
}

impl Drop for HotplugMonitor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// Attach on arrival and detach on removal until the channel closes
///
/// A failed attach is logged; the next arrival tries again.
pub fn drive_session(session: DeviceSession, events: Receiver<HotplugEvent>) -> TaskHandle<()> {
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if session.is_closed() {
                break;
            }
            match event {
                HotplugEvent::Arrived {
                    bus_number,
                    address,
                } => {
                    if !matches!(
                        session.state(),
                        SessionState::Disconnected | SessionState::Error
                    ) {
                        debug!(
                            "Ignoring arrival at {}:{}, session already attached",
                            bus_number, address
                        );
                        continue;
                    }
                    info!("Device arrived at bus {} address {}", bus_number, address);
                    if let Err(e) = session.attach().await {
                        warn!("Attach after arrival failed: {}", e);
                    }
                }
                HotplugEvent::Left {
                    bus_number,
                    address,
                } => {
                    info!("Device left bus {} address {}", bus_number, address);
                    session.detach().await;
                }
            }
        }
        debug!("Hot-plug driver finished");
    })
}
