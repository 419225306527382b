//! This module implements the CLI interface and the controller
//! configuration string.
//!
//! The configuration string follows the classic device-model syntax:
//! elements separated by `,` or `:`, where a leading digit declares a
//! host `bus-port` assignment and the remaining elements are options:
//!
//! ```text
//! 1-2,2-2:tablet:log=D:cap=apl
//! ```

use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;
use tracing::{warn, Level};

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    long_about = None
)]
pub struct Cli {
    /// Enable verbose logging. Can be specified multiple times to
    /// increase verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// The path where to create the listening Unix domain socket for
    /// hot-plug commands.
    #[arg(long, value_name = "PATH")]
    pub hotplug_socket: PathBuf,

    /// File backing guest memory. When absent, DMA goes nowhere until a
    /// backing is installed at runtime.
    #[arg(long, value_name = "PATH")]
    pub memory: Option<PathBuf>,

    /// Controller configuration string, e.g. "1-2,2-2:tablet:log=D:cap=apl".
    #[arg(long, value_name = "CONFIG", default_value = "")]
    pub controller: String,
}

/// A host root-hub port declared on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPort {
    pub bus: u8,
    pub port: u8,
}

/// Parsed controller configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XhciConfig {
    /// Host ports assigned to this controller.
    pub ports: Vec<HostPort>,
    /// Attach the internal tablet.
    pub tablet: bool,
    /// Use the Apollo Lake extended-capability layout (with DRD).
    pub apl: bool,
    /// Log level requested via `log=<level>`.
    pub log_level: Option<Level>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigParseError {
    #[error("invalid bus-port element {0:?}")]
    InvalidBusPort(String),
    #[error("invalid log level {0:?}")]
    InvalidLogLevel(String),
    #[error("unknown configuration element {0:?}")]
    UnknownElement(String),
}

impl XhciConfig {
    /// Parse a configuration string.
    pub fn parse(options: &str) -> Result<Self, ConfigParseError> {
        let mut config = Self::default();

        for element in options.split([',', ':']).filter(|e| !e.is_empty()) {
            if element.starts_with(|c: char| c.is_ascii_digit()) {
                config.ports.push(parse_bus_port(element)?);
            } else if element == "tablet" {
                config.tablet = true;
            } else if let Some(level) = element.strip_prefix("log=") {
                config.log_level = Some(parse_log_level(level)?);
            } else if let Some(cap) = element.strip_prefix("cap=") {
                if cap == "apl" {
                    config.apl = true;
                } else {
                    // An unknown capability layout falls back to the
                    // default one, matching the permissive option
                    // handling of other device models.
                    warn!("unknown capability layout {cap:?}, using the default layout");
                }
            } else {
                return Err(ConfigParseError::UnknownElement(element.to_string()));
            }
        }

        Ok(config)
    }
}

fn parse_bus_port(element: &str) -> Result<HostPort, ConfigParseError> {
    let invalid = || ConfigParseError::InvalidBusPort(element.to_string());
    let (bus, port) = element.split_once('-').ok_or_else(invalid)?;
    Ok(HostPort {
        bus: bus.parse().map_err(|_| invalid())?,
        port: port.parse().map_err(|_| invalid())?,
    })
}

fn parse_log_level(level: &str) -> Result<Level, ConfigParseError> {
    match level.chars().next().map(|c| c.to_ascii_uppercase()) {
        Some('F' | 'E') => Ok(Level::ERROR),
        Some('W') => Ok(Level::WARN),
        Some('I') => Ok(Level::INFO),
        Some('D') => Ok(Level::DEBUG),
        Some('V' | 'T') => Ok(Level::TRACE),
        _ => Err(ConfigParseError::InvalidLogLevel(level.to_string())),
    }
}
