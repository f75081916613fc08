//! Synthetic capture backend
//!
//! Scriptable virtual cameras producing a test pattern. Used for demos without
//! hardware and for exercising fallback, warm-up and failure-streak handling.

use super::backend::{BackendKind, CaptureBackend, CaptureDevice, CaptureProperty};
use super::frame::{ChannelOrder, RawFrame};
use super::CaptureError;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Which reads succeed: `script[n]` for the n-th read, `then` afterwards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPlan {
    /// Outcome of the first reads
    pub script: Vec<bool>,
    /// Outcome once the script is exhausted
    pub then: bool,
}

impl ReadPlan {
    /// Every read succeeds
    pub fn always() -> Self {
        Self {
            script: Vec::new(),
            then: true,
        }
    }

    /// No read ever succeeds
    pub fn never() -> Self {
        Self {
            script: Vec::new(),
            then: false,
        }
    }

    /// Scripted outcomes followed by `then`
    pub fn script(script: Vec<bool>, then: bool) -> Self {
        Self { script, then }
    }

    fn outcome(&self, read: usize) -> bool {
        self.script.get(read).copied().unwrap_or(self.then)
    }
}

/// Behavior of one virtual camera
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticCamera {
    /// Whether the handle ever reports opened
    pub opens: bool,
    /// Delay before the handle reports opened
    pub open_delay: Duration,
    /// Read outcomes
    pub reads: ReadPlan,
    /// Channel order of produced frames
    pub order: ChannelOrder,
    /// Produce bottom-up frames
    pub bottom_up: bool,
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self {
            opens: true,
            open_delay: Duration::ZERO,
            reads: ReadPlan::always(),
            order: ChannelOrder::Bgr,
            bottom_up: false,
        }
    }
}

impl SyntheticCamera {
    /// Camera that streams forever
    pub fn streaming() -> Self {
        Self::default()
    }

    /// Camera that reports opened but never delivers a frame
    pub fn dead() -> Self {
        Self {
            reads: ReadPlan::never(),
            ..Self::default()
        }
    }

    /// Camera whose handle never reports opened
    pub fn unopenable() -> Self {
        Self {
            opens: false,
            ..Self::default()
        }
    }

    /// Replace the read plan
    #[must_use]
    pub fn with_reads(mut self, reads: ReadPlan) -> Self {
        self.reads = reads;
        self
    }
}

/// Counters shared by a backend and its handles
#[derive(Debug, Default)]
pub struct SyntheticStats {
    opens: AtomicUsize,
    releases: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    properties: Mutex<Vec<CaptureProperty>>,
}

impl SyntheticStats {
    /// Handles requested
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Handles released
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Most handles that were between open request and first frame at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Every property applied to any handle
    pub fn properties(&self) -> Vec<CaptureProperty> {
        self.properties.lock().clone()
    }

    fn enter_flight(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn leave_flight(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Backend serving virtual cameras by index
pub struct SyntheticBackend {
    kind: BackendKind,
    cameras: RwLock<HashMap<u32, SyntheticCamera>>,
    stats: Arc<SyntheticStats>,
}

impl SyntheticBackend {
    /// Empty backend registered as `kind`
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            cameras: RwLock::new(HashMap::new()),
            stats: Arc::new(SyntheticStats::default()),
        }
    }

    /// Add a camera, builder style
    #[must_use]
    pub fn with_camera(self, index: u32, camera: SyntheticCamera) -> Self {
        self.set_camera(index, camera);
        self
    }

    /// Add or replace a camera
    pub fn set_camera(&self, index: u32, camera: SyntheticCamera) {
        self.cameras.write().insert(index, camera);
    }

    /// Counters
    pub fn stats(&self) -> Arc<SyntheticStats> {
        self.stats.clone()
    }
}

impl CaptureBackend for SyntheticBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn open(&self, index: u32) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        let camera = self
            .cameras
            .read()
            .get(&index)
            .cloned()
            .ok_or(CaptureError::DeviceUnavailable { index })?;

        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        self.stats.enter_flight();

        Ok(Box::new(SyntheticDevice {
            camera,
            requested_at: Instant::now(),
            reads: 0,
            frames: 0,
            width: 640,
            height: 480,
            in_flight: true,
            released: false,
            stats: self.stats.clone(),
        }))
    }
}

struct SyntheticDevice {
    camera: SyntheticCamera,
    requested_at: Instant,
    reads: usize,
    frames: u64,
    width: u32,
    height: u32,
    in_flight: bool,
    released: bool,
    stats: Arc<SyntheticStats>,
}

impl SyntheticDevice {
    fn pattern(&self) -> Vec<u8> {
        let shade = (self.frames % 256) as u8;
        let mut data = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for y in 0..self.height {
            let row = (y % 256) as u8;
            for x in 0..self.width {
                data.extend_from_slice(&[shade, row, (x % 256) as u8]);
            }
        }
        data
    }

    fn land(&mut self) {
        if self.in_flight {
            self.in_flight = false;
            self.stats.leave_flight();
        }
    }
}

impl CaptureDevice for SyntheticDevice {
    fn is_opened(&self) -> bool {
        !self.released && self.camera.opens && self.requested_at.elapsed() >= self.camera.open_delay
    }

    fn set(&mut self, property: CaptureProperty) -> bool {
        self.stats.properties.lock().push(property);
        match property {
            CaptureProperty::FrameWidth(w) if w > 0 => self.width = w,
            CaptureProperty::FrameHeight(h) if h > 0 => self.height = h,
            _ => {}
        }
        true
    }

    fn read(&mut self) -> Option<RawFrame> {
        if !self.is_opened() {
            return None;
        }
        let ok = self.camera.reads.outcome(self.reads);
        self.reads += 1;
        if !ok {
            return None;
        }
        self.land();
        let frame = RawFrame {
            width: self.width,
            height: self.height,
            data: self.pattern(),
            order: self.camera.order,
            bottom_up: self.camera.bottom_up,
        };
        self.frames += 1;
        Some(frame)
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.land();
        self.stats.releases.fetch_add(1, Ordering::SeqCst);
    }
}
