//! Serial devices
//!
//! - [`SerialScanner`]: ping/pong discovery over every visible port
//! - [`SerialConnection`]: one persistent line-oriented session
//!
//! Both reach the hardware through a [`PortProvider`], so the same code runs
//! against OS ports ([`SystemPorts`]) and simulated devices.

mod connection;
mod line;
mod port;
mod scanner;

pub use connection::SerialConnection;
pub use line::{frame_line, LineReader};
pub use port::{
    order_candidates, LinkSettings, PortCandidate, PortProvider, SerialLink, SystemPorts,
};
pub use scanner::SerialScanner;

#[cfg(test)]
pub use port::MockPortProvider;

use thiserror::Error;

/// Serial errors
#[derive(Error, Debug)]
pub enum SerialError {
    /// No port name given
    #[error("No port selected")]
    EmptyPort,

    /// No open session
    #[error("Not connected")]
    NotConnected,

    /// Port does not exist
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Access denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Another session holds the port
    #[error("Port busy: {0}")]
    PortBusy(String),

    /// Open failed for another reason
    #[error("Open failed: {0}")]
    OpenFailed(String),

    /// Driver error
    #[error("Serial port error: {0}")]
    Port(#[from] serialport::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
