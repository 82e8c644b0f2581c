//! Common utilities for glasses-usb
//!
//! This crate provides what the driver and the probe tool share: the
//! `Transport` contract over raw USB primitives, error types, tracing setup,
//! and in-memory test doubles for the transport.

pub mod error;
pub mod logging;
pub mod test_utils;
pub mod transport;

pub use error::{Error, Result};
pub use logging::{LogFormat, setup_logging};
pub use transport::{ControlRequest, Transport, TransportError};
