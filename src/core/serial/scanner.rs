//! Ping/pong discovery
//!
//! Every non-bluetooth port is opened in turn, given time to reset, sent
//! `PING <token>` and watched for a line starting with the pong prefix. Each
//! probe is a complete session: the port is closed again before the next one
//! is touched, win or lose.

use super::line::LineReader;
use super::port::{order_candidates, LinkSettings, PortProvider};
use super::SerialError;
use crate::config::SerialLinkConfig;
use crate::core::bus::{Event, EventBus, ScanReport};
use parking_lot::{Mutex, RwLock};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct ScanShared {
    config: SerialLinkConfig,
    ports: Arc<dyn PortProvider>,
    bus: EventBus,
    scanning: AtomicBool,
    cancel: AtomicBool,
    best: RwLock<Option<String>>,
    last_ports: RwLock<Vec<String>>,
}

/// Discovers which serial port hosts the device
pub struct SerialScanner {
    shared: Arc<ScanShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SerialScanner {
    /// Create a scanner
    pub fn new(config: SerialLinkConfig, ports: Arc<dyn PortProvider>, bus: EventBus) -> Self {
        Self {
            shared: Arc::new(ScanShared {
                config,
                ports,
                bus,
                scanning: AtomicBool::new(false),
                cancel: AtomicBool::new(false),
                best: RwLock::new(None),
                last_ports: RwLock::new(Vec::new()),
            }),
            task: Mutex::new(None),
        }
    }

    /// Start one discovery pass in the background
    ///
    /// Returns false, without queueing anything, while a pass is running.
    /// The outcome arrives as a `scan:result` event.
    pub fn scan_async(&self) -> bool {
        if self
            .shared
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Scan already running");
            self.shared.bus.publish_log("[scan] Scan already running");
            return false;
        }
        self.shared.cancel.store(false, Ordering::SeqCst);

        let mut task = self.task.lock();
        if let Some(previous) = task.take() {
            let _ = previous.join();
        }

        let shared = self.shared.clone();
        match thread::Builder::new()
            .name("serial-scan".to_string())
            .spawn(move || shared.run())
        {
            Ok(handle) => {
                *task = Some(handle);
                true
            }
            Err(e) => {
                tracing::error!("Failed to spawn scan thread: {}", e);
                self.shared.scanning.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Whether a pass is running
    pub fn is_scanning(&self) -> bool {
        self.shared.scanning.load(Ordering::SeqCst)
    }

    /// Winner of the last completed pass
    pub fn best_port(&self) -> Option<String> {
        self.shared.best.read().clone()
    }

    /// Ports seen by the last completed pass
    pub fn last_ports(&self) -> Vec<String> {
        self.shared.last_ports.read().clone()
    }

    /// Ask a running pass to stop after the current step
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::SeqCst);
    }

    /// Wait up to `timeout` for the running pass. True when none is left.
    pub fn join(&self, timeout: Duration) -> bool {
        let Some(handle) = self.task.lock().take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if handle.is_finished() {
            let _ = handle.join();
            true
        } else {
            *self.task.lock() = Some(handle);
            false
        }
    }
}

impl Drop for SerialScanner {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl ScanShared {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn run(&self) {
        let report = self.scan();
        *self.best.write() = report.best.clone();
        *self.last_ports.write() = report.ports.clone();
        self.scanning.store(false, Ordering::SeqCst);

        match &report.best {
            Some(best) => tracing::info!("Scan selected {}", best),
            None => tracing::info!("Scan found no responder among {} port(s)", report.ports.len()),
        }
        self.bus.publish(Event::ScanResult(report));
    }

    fn scan(&self) -> ScanReport {
        let candidates = match self.ports.list_ports() {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!("Port enumeration failed: {}", e);
                self.bus.publish_log(format!("[scan] Port enumeration failed: {e}"));
                return ScanReport::default();
            }
        };

        let ports: Vec<String> = candidates.iter().map(|c| c.device_name.clone()).collect();
        let ordered = order_candidates(candidates, self.config.priority_port.as_deref());
        self.bus.publish_log(format!(
            "[scan] {} port(s) found, probing {}",
            ports.len(),
            ordered.len()
        ));

        let mut best = None;
        for candidate in ordered {
            if self.cancelled() {
                tracing::debug!("Scan cancelled");
                break;
            }
            let name = candidate.device_name;
            match self.probe(&name) {
                Ok(Some(banner)) => {
                    self.bus.publish_log(format!("[scan] {name}: {banner}"));
                    best = Some(name);
                    break;
                }
                Ok(None) => {
                    tracing::debug!("No pong from {}", name);
                }
                Err(e) => {
                    tracing::debug!("Probe of {} failed: {}", name, e);
                    self.bus.publish_log(format!("[scan] {name}: {e}"));
                }
            }
        }

        ScanReport { ports, best }
    }

    /// One full probe session; the port is closed when this returns
    fn probe(&self, port: &str) -> Result<Option<String>, SerialError> {
        let config = &self.config;
        let mut link = self.ports.open(port, &LinkSettings::from(config))?;

        if !self.settle(config.settle_delay()) {
            return Ok(None);
        }
        link.clear_input()?;
        link.clear_output()?;
        link.write_all(config.probe_line().as_bytes())?;
        link.flush()?;

        let deadline = Instant::now() + config.scan_timeout();
        let mut reader = LineReader::new(config.line_delimiter());
        while let Some(line) = reader.read_line(link.as_mut(), deadline)? {
            if line.starts_with(config.pong_prefix.as_str()) {
                return Ok(Some(line));
            }
            tracing::trace!("{} answered {:?}", port, line);
        }
        Ok(None)
    }

    /// Sleep unless cancelled; false when cancelled
    fn settle(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        while !self.cancelled() {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(20)));
        }
        false
    }
}
