//! Subcommand implementations
//!
//! Every command opens its own libusb context; nothing is shared between
//! invocations.

use crate::config::ProbeConfig;
use crate::hexdump::hexdump;
use anyhow::{Context as _, Result, anyhow, bail};
use common::{Transport, TransportError};
use driver::config::DeviceSettings;
use driver::usb::{
    self, HotplugMonitor, ProbedTransport, RusbConnector, drive_session, find_device,
    list_devices, list_endpoints,
};
use driver::{DeviceSession, DriverError, EventReceiver, SessionEvent};
use protocol::CommandPacket;
use rusb::Context;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{debug, info, warn};

/// Command variations tried by `scan`: label, command id, size, flag, camera
const SCAN_VARIATIONS: &[(&str, u8, u16, u8, u8)] = &[
    ("Stereo trigger", 0xEA, 0x0800, 0x01, 0x00),
    ("Camera 1", 0xEA, 0x0800, 0x01, 0x01),
    ("No flag", 0xEA, 0x0800, 0x00, 0x00),
    ("Command 0x01", 0x01, 0x0800, 0x01, 0x00),
    ("Command 0x00", 0x00, 0x0800, 0x01, 0x00),
    ("Small size", 0xEA, 0x0040, 0x01, 0x00),
];

const SCAN_PAUSE: Duration = Duration::from_millis(200);
const LISTEN_TIMEOUT: Duration = Duration::from_millis(1000);
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Print every configuration/interface/endpoint of the device
pub fn endpoints(config: &ProbeConfig) -> Result<()> {
    let settings = &config.session.device;
    let context = Context::new().context("Failed to initialize libusb")?;

    let devices = list_devices(&context, settings.vendor_id, None)?;
    if devices.is_empty() {
        println!("No devices with vendor id {:04x} found.", settings.vendor_id);
        return Ok(());
    }
    println!("Found {} device(s):", devices.len());
    for device in &devices {
        println!("  {}", device);
    }

    let device = find_device(&context, settings)?;
    let endpoints = list_endpoints(&device)?;
    println!("\nEndpoints of {:04x}:{:04x}:", settings.vendor_id, settings.product_id);
    for endpoint in endpoints {
        println!("  {}", endpoint);
    }
    Ok(())
}

/// Classify the device, then send the stereo trigger once
pub async fn probe(config: &ProbeConfig) -> Result<()> {
    let settings = config.session.device.clone();
    let capability = tokio::task::spawn_blocking(move || -> Result<ProbedTransport> {
        let context = Context::new().context("Failed to initialize libusb")?;
        Ok(usb::probe(&context, &settings)?)
    })
    .await??;

    match capability {
        ProbedTransport::Vendor(_) => println!("Transport: vendor bulk interface"),
        ProbedTransport::Uvc { interface } => {
            println!("Transport: UVC only (interface {})", interface);
            bail!("Device does not expose the vendor interface");
        }
    }

    let (session, _events) = open_session(config).await?;
    let trigger = config.session.keepalive.trigger.packet();
    println!("Sending stereo trigger:\n{}", hexdump(&trigger.encode()));

    let result = session.send_command(trigger).await;
    report_response(&result);
    session.close().await;
    result.map(|_| ()).map_err(Into::into)
}

/// Send each scan variation and dump whatever comes back
pub async fn scan(config: &ProbeConfig) -> Result<()> {
    let (session, _events) = open_session(config).await?;

    for (i, &(label, command_id, size_param, flag, camera_id)) in
        SCAN_VARIATIONS.iter().enumerate()
    {
        let packet = CommandPacket::long(command_id, size_param, flag, camera_id);
        println!(
            "\n[{}/{}] {}: {}",
            i + 1,
            SCAN_VARIATIONS.len(),
            label,
            hex::encode(packet.encode())
        );

        let result = session.send_command(packet).await;
        report_response(&result);
        if let Err(e) = &result
            && e.is_fatal()
        {
            warn!("Stopping scan: {}", e);
            break;
        }
        tokio::time::sleep(SCAN_PAUSE).await;
    }

    session.close().await;
    Ok(())
}

/// Model and serial number
pub async fn info(config: &ProbeConfig) -> Result<()> {
    let (session, _events) = open_session(config).await?;

    let model = session.device_model().await.context("Device model query failed")?;
    let serial = session
        .serial_number()
        .await
        .context("Serial number query failed")?;
    println!("Model:  {}", model);
    println!("Serial: {}", serial);

    session.close().await;
    Ok(())
}

/// Hex-dump one IN endpoint until Ctrl+C
pub async fn listen(config: &ProbeConfig, endpoint: u8, length: usize, bulk: bool) -> Result<()> {
    if !protocol::endpoint::is_in(endpoint) {
        bail!("Endpoint {:#04x} is not an IN endpoint", endpoint);
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                stop.store(true, Ordering::Release);
            }
        });
    }

    let settings = config.session.device.clone();
    println!("Listening on EP {:#04x} (Ctrl+C to stop)...", endpoint);
    tokio::task::spawn_blocking(move || listen_blocking(&settings, endpoint, length, bulk, &stop))
        .await?
}

fn listen_blocking(
    settings: &DeviceSettings,
    endpoint: u8,
    length: usize,
    bulk: bool,
    stop: &AtomicBool,
) -> Result<()> {
    let context = Context::new().context("Failed to initialize libusb")?;
    let transport = match usb::probe(&context, settings)? {
        ProbedTransport::Vendor(transport) => transport,
        ProbedTransport::Uvc { .. } => bail!("Device does not expose the vendor interface"),
    };
    transport.claim_interface(settings.interface)?;

    let started = Instant::now();
    let mut buf = vec![0u8; length];
    let mut outcome = Ok(());
    while !stop.load(Ordering::Acquire) {
        let read = if bulk {
            transport.bulk_read(endpoint, &mut buf, LISTEN_TIMEOUT)
        } else {
            transport.interrupt_read(endpoint, &mut buf, LISTEN_TIMEOUT)
        };
        match read {
            Ok(0) => {}
            Ok(n) => {
                println!(
                    "\n[{:>8.3}s] {} bytes from EP {:#04x}",
                    started.elapsed().as_secs_f64(),
                    n,
                    endpoint
                );
                println!("{}", hexdump(&buf[..n]));
            }
            Err(TransportError::Timeout) => {}
            Err(e) if e.is_fatal() => {
                outcome = Err(anyhow!(e).context("Endpoint read failed"));
                break;
            }
            Err(e) => {
                warn!("Read from {:#04x} failed: {}", endpoint, e);
                std::thread::sleep(LISTEN_TIMEOUT / 10);
            }
        }
    }

    if let Err(e) = transport.release_interface(settings.interface) {
        debug!("Release failed: {}", e);
    }
    outcome
}

/// Stream until Ctrl+C or `duration`, reporting rates once a second
pub async fn stream(config: &ProbeConfig, duration: Option<Duration>) -> Result<()> {
    let (session, events) = open_session(config).await?;
    session.start_streaming().await?;
    info!("Streaming started");

    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut report = tokio::time::interval(REPORT_INTERVAL);
    report.tick().await;
    let mut counts = StreamCounts::default();

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = &mut deadline => break,
            _ = report.tick() => {
                println!("{}", counts);
                counts = StreamCounts::default();
            }
            event = events.recv() => {
                let Ok(event) = event else { break };
                if !counts.record(&event) {
                    break;
                }
            }
        }
    }

    if session.state() == driver::SessionState::Streaming {
        session.stop_streaming().await?;
    }
    let stats = session.stats().await;
    session.close().await;

    if let Some(stream) = stats.stream {
        println!(
            "Totals: {} chunks, {} IMU samples, {} frames complete, {} dropped, {} unknown, {} malformed",
            stream.chunks,
            stream.imu_samples,
            stream.reassembly.completed,
            stream.reassembly.dropped + stream.reassembly.evicted,
            stream.unknown,
            stream.malformed
        );
    }
    if let Some(keepalive) = stats.keepalive {
        println!("Keep-alive: {} sent, {} failed", keepalive.sent, keepalive.failed);
    }
    if stats.events_dropped > 0 {
        println!("Events dropped by slow consumer: {}", stats.events_dropped);
    }
    Ok(())
}

/// Follow hot-plug arrivals and removals, printing session events
pub async fn watch(config: &ProbeConfig) -> Result<()> {
    let settings = config.session.device.clone();
    let (monitor, arrivals) = HotplugMonitor::start(&settings)?;
    let connector = Arc::new(RusbConnector::new(settings)?);
    let (session, events) = DeviceSession::new(config.session.clone(), connector);
    let driver = drive_session(session.clone(), arrivals);

    println!(
        "Watching for {:04x}:{:04x} (Ctrl+C to stop)...",
        config.session.device.vendor_id, config.session.device.product_id
    );
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SessionEvent::StateChanged { from, to }) => println!("{} -> {}", from, to),
                Ok(SessionEvent::ReconnectFailed { attempts }) => {
                    println!("Reconnect failed after {} attempts", attempts)
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    }

    session.close().await;
    monitor.stop();
    driver.abort();
    Ok(())
}

async fn open_session(config: &ProbeConfig) -> Result<(DeviceSession, EventReceiver)> {
    let connector = Arc::new(RusbConnector::new(config.session.device.clone())?);
    let opened = DeviceSession::open(config.session.clone(), connector).await;
    match opened {
        Err(DriverError::PermissionDenied { vendor_id, product_id }) => Err(anyhow!(
            "Permission denied opening {:04x}:{:04x}; add a udev rule or run as root",
            vendor_id,
            product_id
        )),
        other => other.context("Failed to open device session"),
    }
}

fn report_response(result: &driver::Result<protocol::ResponsePacket>) {
    match result {
        Ok(response) => {
            println!(
                "Response: command {:#04x} status {:?}, {} payload bytes",
                response.command_id(),
                response.status(),
                response.payload().len()
            );
            println!("{}", hexdump(&response.encode()));
        }
        Err(
            DriverError::DeviceState { response }
            | DriverError::Configuration { response }
            | DriverError::CommandFailed { response },
        ) => {
            println!(
                "Rejected: command {:#04x} status {:?}",
                response.command_id(),
                response.status()
            );
            println!("{}", hexdump(&response.encode()));
        }
        Err(e) => println!("No usable response: {}", e),
    }
}

/// Per-interval event counters for `stream`
#[derive(Default)]
struct StreamCounts {
    imu: u64,
    frames: u64,
    dropped: u64,
    last_frame: Option<u16>,
}

impl StreamCounts {
    /// Returns false when streaming can no longer continue
    fn record(&mut self, event: &SessionEvent) -> bool {
        match event {
            SessionEvent::Imu(_) => self.imu += 1,
            SessionEvent::StereoFrame(pair) => {
                self.frames += 1;
                self.last_frame = Some(pair.frame_number);
            }
            SessionEvent::FrameDropped(_) => self.dropped += 1,
            SessionEvent::StateChanged { from, to } => {
                println!("Session {} -> {}", from, to);
            }
            SessionEvent::ReconnectFailed { attempts } => {
                println!("Device lost; reconnect failed after {} attempts", attempts);
                return false;
            }
        }
        true
    }
}

impl std::fmt::Display for StreamCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "IMU {:>4}/s  frames {:>3}/s  dropped {:>3}",
            self.imu, self.frames, self.dropped
        )?;
        if let Some(frame) = self.last_frame {
            write!(f, "  last frame #{}", frame)?;
        }
        Ok(())
    }
}
