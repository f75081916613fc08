//! Device orchestration core
//!
//! - Event bus with total delivery order
//! - Serial discovery and sessions
//! - Camera capture with backend fallback
//! - Relay box client
//! - Simulated serial devices
//! - The hub wiring it all together

pub mod bus;
pub mod capture;
pub mod hub;
pub mod logger;
pub mod relay;
pub mod serial;
pub mod simulator;
