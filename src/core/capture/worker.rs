//! Capture worker
//!
//! One worker drives one camera on its own thread:
//!
//! ```text
//! NotStarted -> Opening(backend) -> Opened (steady state)
//!                               \-> Failed
//! any state  -- stop() ---------------> Stopped
//! ```
//!
//! The backend trial sequence (open wait, configuration, warm-up) runs while
//! holding the shared [`OpenCoordinator`], so at most one device open is in
//! flight across all workers.

use super::backend::{BackendKind, BackendSet, CaptureDevice, CaptureProperty};
use super::coordinator::OpenCoordinator;
use super::frame::Frame;
use super::CaptureError;
use crate::config::CameraSettings;
use crate::core::bus::EventBus;
use chrono::Local;
use parking_lot::{Mutex, RwLock};
use std::ops::{Deref, DerefMut};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Receives every delivered frame, on the worker thread
pub type FrameCallback = Arc<dyn Fn(&Frame) + Send + Sync>;

const POLL: Duration = Duration::from_millis(50);

/// Worker lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapturePhase {
    /// `start()` not called yet
    #[default]
    NotStarted,
    /// Trying a backend
    Opening(BackendKind),
    /// A backend passed warm-up; steady-state reads running
    Opened,
    /// Every backend failed, or a never-opened device kept failing
    Failed,
    /// Stopped by `stop()`
    Stopped,
}

#[derive(Default)]
struct CaptureState {
    phase: RwLock<CapturePhase>,
    stop: AtomicBool,
    opened: AtomicBool,
    backend: RwLock<Option<BackendKind>>,
    last_frame: RwLock<Option<Frame>>,
}

impl CaptureState {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Record a phase unless a stop was requested, which always wins
    fn set_phase(&self, phase: CapturePhase) {
        let mut current = self.phase.write();
        *current = if self.stopping() {
            CapturePhase::Stopped
        } else {
            phase
        };
    }

    fn reset(&self) {
        self.stop.store(false, Ordering::SeqCst);
        self.opened.store(false, Ordering::SeqCst);
        *self.backend.write() = None;
        *self.last_frame.write() = None;
        *self.phase.write() = CapturePhase::NotStarted;
    }
}

/// Releases the device on every exit path
struct DeviceGuard(Box<dyn CaptureDevice>);

impl Deref for DeviceGuard {
    type Target = dyn CaptureDevice;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl DerefMut for DeviceGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.as_mut()
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Acquires frames from one capture device
pub struct CaptureWorker {
    settings: Arc<CameraSettings>,
    backends: Arc<BackendSet>,
    coordinator: OpenCoordinator,
    bus: EventBus,
    on_frame: Option<FrameCallback>,
    state: Arc<CaptureState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureWorker {
    /// Create a worker; nothing is opened until `start()`
    pub fn new(
        settings: CameraSettings,
        backends: Arc<BackendSet>,
        coordinator: OpenCoordinator,
        bus: EventBus,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            backends,
            coordinator,
            bus,
            on_frame: None,
            state: Arc::new(CaptureState::default()),
            task: Mutex::new(None),
        }
    }

    /// Set the frame callback. Panics inside it are caught and logged.
    #[must_use]
    pub fn on_frame<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        self.on_frame = Some(Arc::new(callback));
        self
    }

    /// Camera name
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Camera settings
    pub fn settings(&self) -> &CameraSettings {
        &self.settings
    }

    /// Spawn the acquisition thread. No-op while already running.
    pub fn start(&self) -> Result<(), CaptureError> {
        let mut task = self.task.lock();
        if let Some(handle) = task.as_ref() {
            if !handle.is_finished() {
                if self.state.stopping() {
                    return Err(CaptureError::StillStopping(self.settings.name.clone()));
                }
                tracing::debug!("Camera {} already running", self.settings.name);
                return Ok(());
            }
        }
        if let Some(handle) = task.take() {
            let _ = handle.join();
        }

        if self.backends.resolve(self.settings.backend).is_empty() {
            self.bus.publish_log(format!(
                "[{}] No capture backend available for '{}'",
                self.settings.name, self.settings.backend
            ));
            return Err(CaptureError::BackendUnavailable(
                self.settings.backend.label().to_string(),
            ));
        }

        self.state.reset();
        let run = RunContext {
            settings: self.settings.clone(),
            backends: self.backends.clone(),
            coordinator: self.coordinator.clone(),
            bus: self.bus.clone(),
            on_frame: self.on_frame.clone(),
            state: self.state.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("capture-{}", self.settings.name))
            .spawn(move || run.run())?;
        *task = Some(handle);
        Ok(())
    }

    /// Signal the acquisition thread to exit and wait for it, bounded
    ///
    /// The device is released by the thread on its way out. Idempotent.
    pub fn stop(&self) {
        self.state.stop.store(true, Ordering::SeqCst);
        *self.state.phase.write() = CapturePhase::Stopped;

        let Some(handle) = self.task.lock().take() else {
            return;
        };
        let deadline = Instant::now() + self.settings.stop_timeout();
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if handle.is_finished() {
            if handle.join().is_err() {
                tracing::warn!("Capture thread of {} panicked", self.settings.name);
            }
        } else {
            tracing::warn!(
                "Capture thread of {} still running after {:?}",
                self.settings.name,
                self.settings.stop_timeout()
            );
            *self.task.lock() = Some(handle);
        }
    }

    /// True once at least one frame was delivered in the current run
    pub fn is_opened(&self) -> bool {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Whether the acquisition thread is alive
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Current phase
    pub fn phase(&self) -> CapturePhase {
        *self.state.phase.read()
    }

    /// Backend that passed warm-up in the current run
    pub fn actual_backend(&self) -> Option<BackendKind> {
        *self.state.backend.read()
    }

    /// Latest delivered frame
    pub fn last_frame(&self) -> Option<Frame> {
        self.state.last_frame.read().clone()
    }

    /// Save the latest frame as `<name>_<timestamp>.png` inside `dir`
    pub fn snapshot(&self, dir: &Path) -> Result<PathBuf, CaptureError> {
        let frame = self.last_frame().ok_or(CaptureError::NoFrame)?;
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "{}_{}.png",
            self.settings.name,
            Local::now().format("%Y%m%d-%H%M%S%.3f")
        ));
        frame.save_png(&path)?;
        self.bus.publish_log(format!(
            "[{}] Snapshot saved: {}",
            self.settings.name,
            path.display()
        ));
        Ok(path)
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.state.stop.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for CaptureWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureWorker")
            .field("name", &self.settings.name)
            .field("index", &self.settings.index)
            .field("phase", &self.phase())
            .field("backend", &self.actual_backend())
            .finish()
    }
}

struct RunContext {
    settings: Arc<CameraSettings>,
    backends: Arc<BackendSet>,
    coordinator: OpenCoordinator,
    bus: EventBus,
    on_frame: Option<FrameCallback>,
    state: Arc<CaptureState>,
}

impl RunContext {
    fn run(self) {
        let started = Instant::now();
        let name = &self.settings.name;

        let acquired = match self.coordinator.acquire_unless(|| self.state.stopping()) {
            Some(_turn) => self.open_first_working(),
            None => None,
        };

        let Some((kind, mut device)) = acquired else {
            if !self.state.stopping() {
                tracing::warn!("Camera {} (index {}) not available", name, self.settings.index);
                self.bus.publish_log(format!("[{name}] Camera not available"));
            }
            self.state.set_phase(CapturePhase::Failed);
            return;
        };

        *self.state.backend.write() = Some(kind);
        self.state.set_phase(CapturePhase::Opened);
        tracing::info!("Camera {} opened via {}", name, kind);

        let outcome = self.stream(&mut device, kind, started);
        drop(device);
        self.state.set_phase(outcome);
    }

    /// Walk the backend preference list until one opens and streams
    fn open_first_working(&self) -> Option<(BackendKind, DeviceGuard)> {
        let index = self.settings.index;
        for backend in self.backends.resolve(self.settings.backend) {
            if self.state.stopping() {
                return None;
            }
            let kind = backend.kind();
            self.state.set_phase(CapturePhase::Opening(kind));

            let mut device = match backend.open(index) {
                Ok(device) => DeviceGuard(device),
                Err(e) => {
                    tracing::debug!("Camera {} via {}: {}", index, kind, e);
                    continue;
                }
            };

            if !self.wait_opened(&device) {
                tracing::debug!(
                    "Camera {} via {} not opened within {:?}",
                    index,
                    kind,
                    self.settings.backend_open_timeout()
                );
                continue;
            }

            self.configure(&mut device);

            if self.warm_up(&mut device) {
                return Some((kind, device));
            }
            tracing::info!("Camera {} via {} opened but delivered no frames", index, kind);
        }
        None
    }

    fn wait_opened(&self, device: &DeviceGuard) -> bool {
        let deadline = Instant::now() + self.settings.backend_open_timeout();
        loop {
            if device.is_opened() {
                return true;
            }
            if self.state.stopping() || Instant::now() >= deadline {
                return false;
            }
            thread::sleep(POLL);
        }
    }

    fn configure(&self, device: &mut DeviceGuard) {
        let settings = &self.settings;
        let requests = [
            CaptureProperty::FourCc(settings.fourcc_code()),
            CaptureProperty::BufferSize(1),
            CaptureProperty::FrameWidth(settings.width),
            CaptureProperty::FrameHeight(settings.height),
            CaptureProperty::Fps(settings.target_fps),
        ];
        for property in requests {
            if !device.set(property) {
                tracing::debug!("Camera {} ignored {:?}", settings.index, property);
            }
        }
    }

    fn warm_up(&self, device: &mut DeviceGuard) -> bool {
        for attempt in 0..self.settings.warmup_reads {
            if self.state.stopping() {
                return false;
            }
            if device.read().is_some() {
                return true;
            }
            if attempt + 1 < self.settings.warmup_reads {
                thread::sleep(self.settings.warmup_interval());
            }
        }
        false
    }

    fn stream(&self, device: &mut DeviceGuard, kind: BackendKind, started: Instant) -> CapturePhase {
        let name = &self.settings.name;
        let interval = self.settings.read_interval();
        let threshold = self.settings.failure_threshold.max(1);
        let grace = self.settings.open_grace();
        let mut failures: u32 = 0;
        let mut sequence: u64 = 0;

        while !self.state.stopping() {
            let frame = match device.read().map(|raw| raw.normalize(sequence)) {
                Some(Ok(frame)) => Some(frame),
                Some(Err(e)) => {
                    tracing::debug!("Camera {} delivered a bad frame: {}", name, e);
                    None
                }
                None => None,
            };

            match frame {
                Some(frame) => {
                    failures = 0;
                    sequence += 1;
                    if !self.state.opened.swap(true, Ordering::SeqCst) {
                        self.bus.publish_log(format!(
                            "[{name}] Streaming {}x{} via {kind}",
                            frame.width(),
                            frame.height()
                        ));
                    }
                    *self.state.last_frame.write() = Some(frame.clone());
                    if let Some(callback) = &self.on_frame {
                        if catch_unwind(AssertUnwindSafe(|| callback(&frame))).is_err() {
                            tracing::warn!("Frame callback of {} panicked", name);
                        }
                    }
                }
                None => {
                    failures = failures.saturating_add(1);
                    let never_opened = !self.state.opened.load(Ordering::SeqCst);
                    if never_opened && failures >= threshold && started.elapsed() >= grace {
                        tracing::warn!("Camera {} gave no frames after {} reads", name, failures);
                        self.bus
                            .publish_log(format!("[{name}] No frames after {failures} reads, giving up"));
                        return CapturePhase::Failed;
                    }
                }
            }

            self.pause(interval);
        }
        CapturePhase::Stopped
    }

    fn pause(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.state.stopping() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(POLL));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::capture::{ReadPlan, SyntheticBackend, SyntheticCamera};
    use std::sync::atomic::AtomicUsize;

    fn fast_settings(backend: BackendKind, index: u32) -> CameraSettings {
        CameraSettings {
            backend,
            target_fps: 50.0,
            backend_open_timeout_ms: 200,
            warmup_reads: 3,
            warmup_interval_ms: 10,
            open_grace_ms: 400,
            failure_threshold: 30,
            width: 32,
            height: 24,
            ..CameraSettings::new("CamT", index)
        }
    }

    fn wait_for(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        check()
    }

    #[test]
    fn test_streams_and_delivers_rgb_frames() {
        let backend = Arc::new(
            SyntheticBackend::new(BackendKind::Synthetic).with_camera(0, SyntheticCamera::streaming()),
        );
        let stats = backend.stats();
        let backends = Arc::new(BackendSet::new().with(backend));
        let delivered = Arc::new(AtomicUsize::new(0));
        let d = delivered.clone();

        let worker = CaptureWorker::new(
            fast_settings(BackendKind::Synthetic, 0),
            backends,
            OpenCoordinator::new(),
            EventBus::new(),
        )
        .on_frame(move |frame| {
            assert_eq!((frame.width(), frame.height()), (32, 24));
            d.fetch_add(1, Ordering::SeqCst);
        });

        worker.start().unwrap();
        assert!(wait_for(Duration::from_secs(2), || delivered.load(Ordering::SeqCst) >= 3));
        assert!(worker.is_opened());
        assert_eq!(worker.phase(), CapturePhase::Opened);
        assert_eq!(worker.actual_backend(), Some(BackendKind::Synthetic));

        worker.stop();
        assert_eq!(worker.phase(), CapturePhase::Stopped);
        assert!(!worker.is_running());
        assert_eq!(stats.opens(), stats.releases());
        assert!(stats
            .properties()
            .contains(&CaptureProperty::FourCc(*b"MJPG")));
        assert!(stats.properties().contains(&CaptureProperty::BufferSize(1)));
    }

    #[test]
    fn test_callback_panic_does_not_stop_loop() {
        let backend = Arc::new(
            SyntheticBackend::new(BackendKind::Synthetic).with_camera(0, SyntheticCamera::streaming()),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let worker = CaptureWorker::new(
            fast_settings(BackendKind::Synthetic, 0),
            Arc::new(BackendSet::new().with(backend)),
            OpenCoordinator::new(),
            EventBus::new(),
        )
        .on_frame(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            panic!("display went away");
        });

        worker.start().unwrap();
        assert!(wait_for(Duration::from_secs(2), || calls.load(Ordering::SeqCst) >= 3));
        assert_eq!(worker.phase(), CapturePhase::Opened);
        worker.stop();
    }

    #[test]
    fn test_start_is_idempotent_and_restartable() {
        let backend = Arc::new(
            SyntheticBackend::new(BackendKind::Synthetic).with_camera(0, SyntheticCamera::streaming()),
        );
        let stats = backend.stats();
        let worker = CaptureWorker::new(
            fast_settings(BackendKind::Synthetic, 0),
            Arc::new(BackendSet::new().with(backend)),
            OpenCoordinator::new(),
            EventBus::new(),
        );

        worker.start().unwrap();
        worker.start().unwrap();
        assert!(wait_for(Duration::from_secs(2), || worker.is_opened()));
        assert_eq!(stats.opens(), 1);

        worker.stop();
        worker.stop();
        assert_eq!(worker.phase(), CapturePhase::Stopped);

        worker.start().unwrap();
        assert!(wait_for(Duration::from_secs(2), || worker.is_opened()));
        worker.stop();
        assert_eq!(stats.opens(), 2);
        assert_eq!(stats.releases(), 2);
    }

    #[test]
    fn test_missing_backend_is_config_fault() {
        let worker = CaptureWorker::new(
            fast_settings(BackendKind::DirectShow, 0),
            Arc::new(BackendSet::new()),
            OpenCoordinator::new(),
            EventBus::new(),
        );
        assert!(matches!(
            worker.start(),
            Err(CaptureError::BackendUnavailable(_))
        ));
        assert!(!worker.is_running());
        assert_eq!(worker.phase(), CapturePhase::NotStarted);
    }

    #[test]
    fn test_snapshot_requires_frame() {
        let worker = CaptureWorker::new(
            fast_settings(BackendKind::Synthetic, 0),
            Arc::new(BackendSet::new()),
            OpenCoordinator::new(),
            EventBus::new(),
        );
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(worker.snapshot(dir.path()), Err(CaptureError::NoFrame)));
    }

    #[test]
    fn test_bad_warmup_falls_through_to_next_backend() {
        let dead = Arc::new(
            SyntheticBackend::new(BackendKind::DirectShow).with_camera(0, SyntheticCamera::dead()),
        );
        // two failed warm-up reads, third one lands
        let flaky = Arc::new(SyntheticBackend::new(BackendKind::MediaFoundation).with_camera(
            0,
            SyntheticCamera::streaming().with_reads(ReadPlan::script(vec![false, false], true)),
        ));
        let dead_stats = dead.stats();
        let backends = Arc::new(BackendSet::new().with(dead).with(flaky));

        let worker = CaptureWorker::new(
            fast_settings(BackendKind::DirectShow, 0),
            backends,
            OpenCoordinator::new(),
            EventBus::new(),
        );
        worker.start().unwrap();
        assert!(wait_for(Duration::from_secs(2), || worker.is_opened()));
        assert_eq!(worker.actual_backend(), Some(BackendKind::MediaFoundation));
        assert_eq!(dead_stats.opens(), 1);
        assert_eq!(dead_stats.releases(), 1);
        worker.stop();
    }
}
