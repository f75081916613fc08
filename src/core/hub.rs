//! Device hub
//!
//! Wires one bus, one scanner, one serial connection, the relay box and a
//! capture worker per configured camera, and tears them all down in order.
//! Front ends talk to the hub and listen on [`DeviceHub::bus`].

use crate::config::{AppConfig, ConfigError};
use crate::core::bus::{Event, EventBus, SubscriptionId, Topic};
use crate::core::capture::{BackendSet, CaptureError, CaptureWorker, Frame, OpenCoordinator};
use crate::core::relay::{RelayClient, RelayDriver, RelayError};
use crate::core::serial::{PortProvider, SerialConnection, SerialError, SerialScanner};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Receives `(camera name, frame)` for every camera
pub type FrameSink = Arc<dyn Fn(&str, &Frame) + Send + Sync>;

/// Hub errors
#[derive(Error, Debug)]
pub enum HubError {
    /// Config load or validation failed
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Serial error
    #[error(transparent)]
    Serial(#[from] SerialError),

    /// Capture error
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// Relay error
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// No camera configured under that name
    #[error("Unknown camera: {0}")]
    UnknownCamera(String),

    /// Relay command without a relay
    #[error("No relay attached")]
    NoRelay,
}

/// Owns every device of one bench
pub struct DeviceHub {
    config: AppConfig,
    bus: EventBus,
    scanner: SerialScanner,
    connection: Arc<SerialConnection>,
    coordinator: OpenCoordinator,
    cameras: Vec<CaptureWorker>,
    relay: Option<RelayClient>,
    pending_connect: Mutex<Option<SubscriptionId>>,
    connect_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    shut_down: AtomicBool,
}

impl DeviceHub {
    /// Build the hub; nothing is opened yet
    pub fn new(
        config: AppConfig,
        ports: Arc<dyn PortProvider>,
        backends: Arc<BackendSet>,
        frame_sink: Option<FrameSink>,
    ) -> Result<Self, HubError> {
        config.validate()?;

        let bus = EventBus::new();
        let scanner = SerialScanner::new(config.serial.clone(), ports.clone(), bus.clone());
        let connection = Arc::new(SerialConnection::new(config.serial.clone(), ports, bus.clone()));
        let coordinator = OpenCoordinator::new();

        let cameras = config
            .cameras
            .iter()
            .map(|settings| {
                let worker = CaptureWorker::new(
                    settings.clone(),
                    backends.clone(),
                    coordinator.clone(),
                    bus.clone(),
                );
                match &frame_sink {
                    Some(sink) => {
                        let sink = sink.clone();
                        let name = settings.name.clone();
                        worker.on_frame(move |frame| sink(&name, frame))
                    }
                    None => worker,
                }
            })
            .collect();

        Ok(Self {
            config,
            bus,
            scanner,
            connection,
            coordinator,
            cameras,
            relay: None,
            pending_connect: Mutex::new(None),
            connect_task: Arc::new(Mutex::new(None)),
            shut_down: AtomicBool::new(false),
        })
    }

    /// The bus every device reports on
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Configuration in use
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Discovery scanner
    pub fn scanner(&self) -> &SerialScanner {
        &self.scanner
    }

    /// Serial session
    pub fn connection(&self) -> &SerialConnection {
        &self.connection
    }

    /// Shared open coordinator of the cameras
    pub fn coordinator(&self) -> &OpenCoordinator {
        &self.coordinator
    }

    /// Start a discovery pass
    pub fn scan(&self) -> bool {
        self.scanner.scan_async()
    }

    /// Start a discovery pass and open its winner
    ///
    /// Uses a one-shot subscription; a previous pending one is dropped first.
    pub fn scan_and_connect(&self) -> bool {
        let mut pending = self.pending_connect.lock();
        if let Some(stale) = pending.take() {
            self.bus.unsubscribe(stale);
        }

        let connection = self.connection.clone();
        let bus = self.bus.clone();
        let task = self.connect_task.clone();
        let id = self.bus.subscribe_once(Topic::ScanResult, move |event| {
            let Event::ScanResult(report) = event else {
                return;
            };
            let Some(best) = report.best.clone() else {
                bus.publish_log("[scan] No device answered, not connecting");
                return;
            };
            let connection = connection.clone();
            let spawned = thread::Builder::new()
                .name("auto-connect".to_string())
                .spawn(move || {
                    if let Err(e) = connection.open(&best) {
                        tracing::warn!("Auto-connect to {} failed: {}", best, e);
                    }
                });
            match spawned {
                Ok(handle) => *task.lock() = Some(handle),
                Err(e) => tracing::error!("Failed to spawn auto-connect: {}", e),
            }
        });

        if self.scanner.scan_async() {
            *pending = Some(id);
            true
        } else {
            self.bus.unsubscribe(id);
            false
        }
    }

    /// Open `port`, or the last scan winner when none is given
    pub fn connect(&self, port: Option<&str>) -> Result<(), HubError> {
        let port = port
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .or_else(|| self.scanner.best_port())
            .unwrap_or_default();
        self.connection.open(&port)?;
        Ok(())
    }

    /// Close the serial session
    pub fn disconnect(&self) {
        self.connection.close();
    }

    /// Send one line over the serial session
    pub fn send(&self, text: &str) -> Result<(), HubError> {
        self.connection.write_line(text)?;
        Ok(())
    }

    /// Capture workers in configuration order
    pub fn cameras(&self) -> &[CaptureWorker] {
        &self.cameras
    }

    /// Capture worker by camera name
    pub fn camera(&self, name: &str) -> Option<&CaptureWorker> {
        self.cameras.iter().find(|c| c.name() == name)
    }

    /// Start a camera
    pub fn start_camera(&self, name: &str) -> Result<(), HubError> {
        let camera = self
            .camera(name)
            .ok_or_else(|| HubError::UnknownCamera(name.to_string()))?;
        camera.start()?;
        Ok(())
    }

    /// Stop a camera
    pub fn stop_camera(&self, name: &str) -> Result<(), HubError> {
        let camera = self
            .camera(name)
            .ok_or_else(|| HubError::UnknownCamera(name.to_string()))?;
        camera.stop();
        Ok(())
    }

    /// Start every camera marked `enabled_on_start`; returns how many started
    pub fn apply_startup(&self) -> usize {
        let mut started = 0;
        for camera in self.cameras.iter().filter(|c| c.settings().enabled_on_start) {
            match camera.start() {
                Ok(()) => started += 1,
                Err(e) => tracing::warn!("Camera {} not started: {}", camera.name(), e),
            }
        }
        started
    }

    /// Attach the relay box driver
    pub fn attach_relay(&mut self, driver: Box<dyn RelayDriver>) -> &RelayClient {
        if let Some(old) = self.relay.take() {
            old.disconnect();
        }
        self.relay
            .insert(RelayClient::new(self.config.relay.clone(), driver, self.bus.clone()))
    }

    /// Attached relay client
    pub fn relay(&self) -> Option<&RelayClient> {
        self.relay.as_ref()
    }

    /// Run a named relay action, connecting first when needed
    pub fn relay_action(&self, name: &str) -> Result<(), HubError> {
        let relay = self.relay.as_ref().ok_or(HubError::NoRelay)?;
        if !relay.is_connected() {
            relay.connect()?;
        }
        relay.action(name)?;
        Ok(())
    }

    /// Stop every device and the bus. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down devices");

        for camera in &self.cameras {
            camera.stop();
        }

        if let Some(id) = self.pending_connect.lock().take() {
            self.bus.unsubscribe(id);
        }
        self.scanner.cancel();
        let serial = &self.config.serial;
        if !self.scanner.join(serial.scan_timeout() + Duration::from_secs(1)) {
            tracing::warn!("Scan still running at shutdown");
        }

        let connect = self.connect_task.lock().take();
        if let Some(handle) = connect {
            let deadline = Instant::now() + serial.settle_delay() + Duration::from_secs(1);
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            }
        }

        self.connection.close();
        if let Some(relay) = &self.relay {
            relay.disconnect();
        }

        if !self.bus.flush(Duration::from_secs(1)) {
            tracing::debug!("Bus flush timed out at shutdown");
        }
        self.bus.shutdown();
    }
}

impl Drop for DeviceHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DeviceHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHub")
            .field("connection", &self.connection.state())
            .field("cameras", &self.cameras)
            .field("relay", &self.relay.as_ref().map(RelayClient::is_connected))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraSettings;
    use crate::core::capture::{BackendKind, SyntheticBackend, SyntheticCamera};
    use crate::core::relay::SimulatedRelay;
    use crate::core::simulator::{SimulatedDevice, SimulatedPorts};

    fn quick_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.serial.settle_delay_ms = 10;
        config.serial.scan_timeout_ms = 300;
        config.cameras = vec![CameraSettings {
            backend: BackendKind::Synthetic,
            enabled_on_start: true,
            warmup_interval_ms: 10,
            ..CameraSettings::new("Top", 0)
        }];
        config
    }

    fn hub(ports: SimulatedPorts) -> DeviceHub {
        let backends = BackendSet::new().with(Arc::new(
            SyntheticBackend::new(BackendKind::Synthetic).with_camera(0, SyntheticCamera::streaming()),
        ));
        DeviceHub::new(quick_config(), Arc::new(ports), Arc::new(backends), None).unwrap()
    }

    fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + Duration::from_secs(3);
        while Instant::now() < end {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_scan_and_connect_opens_winner_once() {
        let ports = SimulatedPorts::new()
            .with_device(SimulatedDevice::silent("A"))
            .with_device(SimulatedDevice::pong("B", "PONG RFBOX v3", Duration::from_millis(20)));
        let hub = hub(ports);

        assert!(hub.scan_and_connect());
        assert!(wait_for(|| hub.connection().is_connected()));
        assert_eq!(hub.connection().port().as_deref(), Some("B"));

        // the one-shot handler is gone after firing
        assert!(hub.bus().flush(Duration::from_secs(1)));
        assert_eq!(hub.bus().subscriber_count(), 0);

        hub.send("STATUS").unwrap();
        hub.shutdown();
        assert!(!hub.connection().is_connected());
    }

    #[test]
    fn test_repeated_scans_do_not_accumulate_handlers() {
        let hub = hub(SimulatedPorts::new());
        for _ in 0..3 {
            assert!(hub.scan_and_connect());
            assert!(hub.scanner().join(Duration::from_secs(2)));
        }
        assert!(hub.bus().flush(Duration::from_secs(1)));
        assert_eq!(hub.bus().subscriber_count(), 0);
    }

    #[test]
    fn test_connect_without_port_or_scan_fails() {
        let hub = hub(SimulatedPorts::new());
        assert!(matches!(
            hub.connect(None),
            Err(HubError::Serial(SerialError::EmptyPort))
        ));
    }

    #[test]
    fn test_startup_cameras_and_relay() {
        let mut hub = hub(SimulatedPorts::new());
        assert_eq!(hub.apply_startup(), 1);
        assert!(wait_for(|| hub.camera("Top").is_some_and(CaptureWorker::is_opened)));
        assert!(matches!(hub.start_camera("Side"), Err(HubError::UnknownCamera(_))));

        assert!(matches!(hub.relay_action("USB_ON"), Err(HubError::NoRelay)));
        let driver = SimulatedRelay::new();
        hub.attach_relay(Box::new(driver.clone()));
        hub.relay_action("USB_ON").unwrap();
        assert_eq!(driver.commands(), vec!["SK3".to_string()]);

        hub.stop_camera("Top").unwrap();
        hub.shutdown();
        hub.shutdown();
    }
}
