//! Capture backends
//!
//! A backend is one OS video-capture subsystem. Workers try the backends of
//! their preference in order until one both opens and streams.

use super::frame::RawFrame;
use super::CaptureError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Video-capture backend identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BackendKind {
    /// Platform trial list
    #[default]
    #[serde(rename = "auto")]
    Auto,
    /// DirectShow (Windows)
    #[serde(rename = "dshow", alias = "directshow")]
    DirectShow,
    /// Media Foundation (Windows)
    #[serde(rename = "msmf", alias = "mediafoundation")]
    MediaFoundation,
    /// Video4Linux2
    #[serde(rename = "v4l2", alias = "v4l")]
    V4l2,
    /// AVFoundation (macOS)
    #[serde(rename = "avfoundation", alias = "avf")]
    AvFoundation,
    /// Generated test pattern
    #[serde(rename = "synthetic")]
    Synthetic,
    /// Whatever the capture library picks by itself
    #[serde(rename = "any")]
    Any,
}

impl BackendKind {
    /// Short config name
    pub fn label(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::DirectShow => "dshow",
            Self::MediaFoundation => "msmf",
            Self::V4l2 => "v4l2",
            Self::AvFoundation => "avfoundation",
            Self::Synthetic => "synthetic",
            Self::Any => "any",
        }
    }

    /// Backends to try, in order: the preference first, then its fallbacks
    pub fn trial_order(self) -> Vec<BackendKind> {
        match self {
            Self::Auto => platform_trial_order(),
            Self::DirectShow => vec![Self::DirectShow, Self::MediaFoundation, Self::Any],
            Self::MediaFoundation | Self::V4l2 | Self::AvFoundation => vec![self, Self::Any],
            Self::Synthetic | Self::Any => vec![self],
        }
    }
}

#[cfg(windows)]
fn platform_trial_order() -> Vec<BackendKind> {
    vec![BackendKind::DirectShow, BackendKind::MediaFoundation, BackendKind::Any]
}

#[cfg(target_os = "macos")]
fn platform_trial_order() -> Vec<BackendKind> {
    vec![BackendKind::AvFoundation, BackendKind::Any]
}

#[cfg(not(any(windows, target_os = "macos")))]
fn platform_trial_order() -> Vec<BackendKind> {
    vec![BackendKind::V4l2, BackendKind::Any]
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for BackendKind {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "dshow" | "directshow" => Ok(Self::DirectShow),
            "msmf" | "mediafoundation" => Ok(Self::MediaFoundation),
            "v4l2" | "v4l" => Ok(Self::V4l2),
            "avfoundation" | "avf" => Ok(Self::AvFoundation),
            "synthetic" => Ok(Self::Synthetic),
            "any" | "default" => Ok(Self::Any),
            _ => Err(CaptureError::UnknownBackend(s.to_string())),
        }
    }
}

/// Device property requested after open. Drivers may ignore any of them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CaptureProperty {
    /// Pixel transport format code
    FourCc([u8; 4]),
    /// Internal frame buffer depth
    BufferSize(u32),
    /// Frame width
    FrameWidth(u32),
    /// Frame height
    FrameHeight(u32),
    /// Frame rate
    Fps(f64),
}

/// Handle to one opened (or opening) capture device
pub trait CaptureDevice: Send {
    /// Whether the driver reports the device open
    fn is_opened(&self) -> bool;

    /// Apply a property; returns whether the driver accepted it
    fn set(&mut self, property: CaptureProperty) -> bool;

    /// Grab one frame; `None` on a failed read
    fn read(&mut self) -> Option<RawFrame>;

    /// Release the device. Called exactly once per handle.
    fn release(&mut self);
}

/// One OS capture subsystem
pub trait CaptureBackend: Send + Sync {
    /// Which subsystem this is
    fn kind(&self) -> BackendKind;

    /// Request a handle for `index`; the handle may report opened later
    fn open(&self, index: u32) -> Result<Box<dyn CaptureDevice>, CaptureError>;
}

/// Registered backends, looked up by kind
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: HashMap<BackendKind, Arc<dyn CaptureBackend>>,
}

impl BackendSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a backend, builder style
    #[must_use]
    pub fn with(mut self, backend: Arc<dyn CaptureBackend>) -> Self {
        self.register(backend);
        self
    }

    /// Add or replace the backend of its kind
    pub fn register(&mut self, backend: Arc<dyn CaptureBackend>) {
        self.backends.insert(backend.kind(), backend);
    }

    /// Backend of a kind
    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn CaptureBackend>> {
        self.backends.get(&kind).cloned()
    }

    /// Registered backends to try for a preference, in trial order
    pub fn resolve(&self, preference: BackendKind) -> Vec<Arc<dyn CaptureBackend>> {
        preference
            .trial_order()
            .into_iter()
            .filter_map(|kind| self.get(kind))
            .collect()
    }

    /// Registered kinds
    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<_> = self.backends.keys().copied().collect();
        kinds.sort_by_key(|k| k.label());
        kinds
    }
}

impl fmt::Debug for BackendSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSet").field("kinds", &self.kinds()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::capture::SyntheticBackend;

    #[test]
    fn test_parse_backend_names() {
        assert_eq!("DSHOW".parse::<BackendKind>().unwrap(), BackendKind::DirectShow);
        assert_eq!("msmf".parse::<BackendKind>().unwrap(), BackendKind::MediaFoundation);
        assert_eq!("auto".parse::<BackendKind>().unwrap(), BackendKind::Auto);
        assert!("gstreamer-ish".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_preference_comes_first() {
        assert_eq!(
            BackendKind::DirectShow.trial_order(),
            vec![BackendKind::DirectShow, BackendKind::MediaFoundation, BackendKind::Any]
        );
        assert_eq!(BackendKind::V4l2.trial_order(), vec![BackendKind::V4l2, BackendKind::Any]);
        assert_eq!(BackendKind::Synthetic.trial_order(), vec![BackendKind::Synthetic]);
        let auto = BackendKind::Auto.trial_order();
        assert!(auto.len() > 1);
        assert_eq!(auto.last(), Some(&BackendKind::Any));
    }

    #[test]
    fn test_resolve_skips_unregistered() {
        let set = BackendSet::new().with(Arc::new(SyntheticBackend::new(BackendKind::Any)));
        let resolved = set.resolve(BackendKind::Auto);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].kind(), BackendKind::Any);
        assert!(set.resolve(BackendKind::Synthetic).is_empty());
    }
}
