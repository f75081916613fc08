//! # Event Bus Module
//!
//! In-process publish/subscribe broker shared by every device component.
//!
//! - Publishing enqueues and returns immediately
//! - One dispatcher thread delivers events in publish order across all topics
//! - A panicking handler is isolated from the other handlers and later events
//! - Handlers only see events published after they registered
//!
//! ## Usage
//!
//! ```rust,no_run
//! use benchlink_core::core::bus::{Event, EventBus, Topic};
//!
//! let bus = EventBus::new();
//! bus.subscribe(Topic::LogLine, |event| {
//!     if let Event::LogLine(line) = event {
//!         println!("{line}");
//!     }
//! });
//! bus.publish_log("hello");
//! ```

mod broker;
mod events;

pub use broker::*;
pub use events::*;

use thiserror::Error;

/// Event bus errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Topic key is not one of the fixed topics
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),
}
