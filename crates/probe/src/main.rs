//! glasses-probe
//!
//! Command-line tool for bringing up and inspecting the glasses' vendor USB
//! interface: endpoint listing, command probing, raw endpoint dumps, and a
//! full streaming session with keep-alive.

mod commands;
mod config;
mod hexdump;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::setup_logging;
use config::ProbeConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "glasses-probe")]
#[command(author, version, about = "Probe and stream from the glasses over USB")]
#[command(long_about = "
Talks to the glasses' vendor bulk interface directly through libusb.

EXAMPLES:
    # Show every interface and endpoint
    glasses-probe list-endpoints

    # Query model and serial number
    glasses-probe info

    # Send the documented command variations and dump responses
    glasses-probe scan

    # Dump the button/status endpoint
    glasses-probe listen --endpoint 0x83

    # Stream IMU and stereo frames for ten seconds
    glasses-probe stream --seconds 10

CONFIGURATION:
    The tool looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/glasses-usb/probe.toml
    3. /etc/glasses-usb/probe.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Save default configuration (to --config or the default location) and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Claim this interface instead of the configured one
    #[arg(short, long, global = true)]
    interface: Option<u8>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List matching devices and all their endpoints
    ListEndpoints,
    /// Classify the transport and send one stereo trigger
    Probe,
    /// Send a table of command variations
    Scan,
    /// Print model and serial number
    Info,
    /// Hex-dump an IN endpoint until interrupted
    Listen {
        /// Endpoint address, e.g. 0x83
        #[arg(short, long, default_value = "0x83", value_parser = parse_u8)]
        endpoint: u8,
        /// Read buffer length
        #[arg(long, default_value_t = 1024)]
        length: usize,
        /// Use bulk reads instead of interrupt reads
        #[arg(long)]
        bulk: bool,
    },
    /// Start streaming and report IMU/frame rates
    Stream {
        /// Stop after this many seconds
        #[arg(short, long)]
        seconds: Option<u64>,
    },
    /// Attach and detach on hot-plug events
    Watch,
}

/// Accept `0x`-prefixed hex or decimal
fn parse_u8(s: &str) -> std::result::Result<u8, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| format!("Invalid byte value '{}'", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let path = args
            .config
            .as_deref()
            .map(config::expand_path)
            .unwrap_or_else(ProbeConfig::default_path);
        ProbeConfig::default()
            .save(&path)
            .context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        ProbeConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        ProbeConfig::load_or_default()
    };
    if let Some(interface) = args.interface {
        config.session.device.interface = interface;
    }

    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    setup_logging(log_level, config.log_format).context("Failed to setup logging")?;

    info!("glasses-probe v{}", env!("CARGO_PKG_VERSION"));

    match args.command.unwrap_or(Command::Info) {
        Command::ListEndpoints => commands::endpoints(&config),
        Command::Probe => commands::probe(&config).await,
        Command::Scan => commands::scan(&config).await,
        Command::Info => commands::info(&config).await,
        Command::Listen {
            endpoint,
            length,
            bulk,
        } => commands::listen(&config, endpoint, length, bulk).await,
        Command::Stream { seconds } => {
            commands::stream(&config, seconds.map(Duration::from_secs)).await
        }
        Command::Watch => commands::watch(&config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_u8() {
        assert_eq!(parse_u8("0x83").unwrap(), 0x83);
        assert_eq!(parse_u8("0X87").unwrap(), 0x87);
        assert_eq!(parse_u8("130").unwrap(), 130);
        assert!(parse_u8("0x183").is_err());
        assert!(parse_u8("ep").is_err());
    }

    #[test]
    fn test_listen_defaults() {
        let args = Args::try_parse_from(["glasses-probe", "listen"]).unwrap();
        match args.command {
            Some(Command::Listen {
                endpoint,
                length,
                bulk,
            }) => {
                assert_eq!(endpoint, 0x83);
                assert_eq!(length, 1024);
                assert!(!bulk);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
