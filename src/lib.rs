//! # Benchlink Core Library
//!
//! Orchestration of flaky bench hardware from one control surface:
//! - Serial microcontrollers found by ping/pong discovery
//! - Persistent line-oriented serial sessions
//! - Cameras with ordered capture-backend fallback
//! - A relay / USB-switch box
//!
//! Every component works on its own background thread and reports through
//! one [`EventBus`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use benchlink_core::{AppConfig, BackendSet, DeviceHub, Event, SystemPorts, Topic};
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let hub = DeviceHub::new(
//!         AppConfig::load()?,
//!         Arc::new(SystemPorts::new()),
//!         Arc::new(BackendSet::new()),
//!         None,
//!     )?;
//!
//!     hub.bus().subscribe(Topic::ScanResult, |event| {
//!         if let Event::ScanResult(report) = event {
//!             println!("best port: {:?}", report.best);
//!         }
//!     });
//!     hub.scan_and_connect();
//!
//!     std::thread::sleep(std::time::Duration::from_secs(10));
//!     hub.send("STATUS")?;
//!     hub.shutdown();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{ExitStatus, Outcome};
pub use crate::config::{AppConfig, CameraSettings, LoggingConfig, RelayConfig, SerialLinkConfig};
pub use crate::core::bus::{ConnectionState, Event, EventBus, ScanReport, SubscriptionId, Topic};
pub use crate::core::capture::{
    BackendKind, BackendSet, CapturePhase, CaptureWorker, Frame, OpenCoordinator,
};
pub use crate::core::hub::{DeviceHub, HubError};
pub use crate::core::serial::{
    PortCandidate, PortProvider, SerialConnection, SerialError, SerialScanner, SystemPorts,
};
pub use crate::core::simulator::{SimulatedDevice, SimulatedPorts};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
