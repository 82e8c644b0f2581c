//! Host-side driver for the glasses' vendor USB interface
//!
//! The driver owns one [`DeviceSession`] per physical device. A session
//! serializes command exchanges through a [`CommandChannel`], polls the
//! multiplexed stream endpoint on a dedicated reader thread
//! ([`StreamReader`]), pairs left/right camera chunks in a
//! [`FrameReassembler`], and keeps the cameras running with a
//! [`KeepAliveScheduler`]. Consumers receive [`SessionEvent`]s on an
//! [`EventReceiver`].
//!
//! # Example
//!
//! ```no_run
//! use driver::{DeviceSession, SessionConfig, SessionEvent, usb::RusbConnector};
//! use std::sync::Arc;
//!
//! # async fn run() -> driver::Result<()> {
//! let config = SessionConfig::default();
//! let connector = Arc::new(RusbConnector::new(config.device.clone())?);
//! let (session, events) = DeviceSession::open(config, connector).await?;
//!
//! println!("model: {}", session.device_model().await?);
//! session.start_streaming().await?;
//! while let Ok(event) = events.recv().await {
//!     if let SessionEvent::StereoFrame(pair) = event {
//!         println!("frame {}", pair.frame_number);
//!     }
//! }
//! session.close().await;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod config;
pub mod demux;
pub mod error;
pub mod events;
pub mod keepalive;
pub mod reassembler;
pub mod session;
pub mod usb;

pub use command::{CommandChannel, EndpointPair, ExchangeStats};
pub use config::SessionConfig;
pub use demux::{DemuxStats, StreamDemultiplexer, StreamReader};
pub use error::{DriverError, Result};
pub use events::{EventReceiver, EventSender, SessionEvent, event_channel};
pub use keepalive::{KeepAliveScheduler, KeepAliveStats};
pub use reassembler::{FrameEvent, FrameReassembler, PairState, StereoFramePair};
pub use session::{Connector, DeviceSession, SessionState, SessionStats};
