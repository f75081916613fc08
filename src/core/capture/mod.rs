//! Camera capture
//!
//! [`CaptureWorker`] drives one camera on a background thread: it tries the
//! configured backends in order, warms the device up, then delivers
//! normalized RGB [`Frame`]s to a callback until stopped. All workers share
//! an [`OpenCoordinator`] so device opens never overlap.

mod backend;
mod coordinator;
mod frame;
mod synthetic;
mod worker;

pub use backend::*;
pub use coordinator::OpenCoordinator;
pub use frame::*;
pub use synthetic::*;
pub use worker::*;

use thiserror::Error;

/// Capture errors
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Backend has no device at this index
    #[error("Camera index {index} not available")]
    DeviceUnavailable {
        /// Requested camera index
        index: u32,
    },

    /// No registered backend matches the preference
    #[error("No capture backend available for '{0}'")]
    BackendUnavailable(String),

    /// Backend name not recognized
    #[error("Unknown capture backend: {0}")]
    UnknownBackend(String),

    /// Snapshot before the first frame
    #[error("No frame captured yet")]
    NoFrame,

    /// Frame buffer does not match its dimensions
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Previous acquisition thread has not exited yet
    #[error("Camera {0} is still stopping")]
    StillStopping(String),

    /// PNG encoding failed
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
