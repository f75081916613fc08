//! Application settings

use super::ConfigError;
use crate::core::capture::BackendKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Serial link settings
    pub serial: SerialLinkConfig,
    /// Cameras, in display order
    pub cameras: Vec<CameraSettings>,
    /// Logging settings
    pub logging: LoggingConfig,
    /// Relay / USB switch box
    pub relay: RelayConfig,
}

impl AppConfig {
    /// Load config from the platform config directory, or defaults if absent
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to the platform config directory
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::default_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.save_to(&path)
    }

    /// Load from an explicit file; `.yaml`/`.yml` are read as YAML, anything else as TOML
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = if is_yaml(path) {
            serde_yaml::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Save to an explicit file, format chosen by extension
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = if is_yaml(path) {
            serde_yaml::to_string(self)?
        } else {
            toml::to_string_pretty(self)?
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings no device component can run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Invalid("serial.baud_rate must be non-zero".into()));
        }
        if self.serial.eol.is_empty() {
            return Err(ConfigError::Invalid("serial.eol must not be empty".into()));
        }
        if self.serial.pong_prefix.is_empty() {
            return Err(ConfigError::Invalid("serial.pong_prefix must not be empty".into()));
        }

        let mut names = HashSet::new();
        for camera in &self.cameras {
            if !names.insert(camera.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate camera name '{}'",
                    camera.name
                )));
            }
            if camera.target_fps <= 0.0 || !camera.target_fps.is_finite() {
                return Err(ConfigError::Invalid(format!(
                    "camera '{}' needs a positive target_fps",
                    camera.name
                )));
            }
            if camera.width == 0 || camera.height == 0 {
                return Err(ConfigError::Invalid(format!(
                    "camera '{}' needs a non-zero resolution",
                    camera.name
                )));
            }
        }
        Ok(())
    }

    /// Camera settings by name
    pub fn camera(&self, name: &str) -> Option<&CameraSettings> {
        self.cameras.iter().find(|c| c.name == name)
    }

    fn default_path() -> Result<PathBuf, ConfigError> {
        super::config_dir()
            .map(|dir| dir.join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Serial link settings, shared by discovery and the persistent connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialLinkConfig {
    /// Baud rate
    pub baud_rate: u32,
    /// Line terminator
    pub eol: String,
    /// Token sent in the discovery probe (`PING <token>`)
    pub ping_token: String,
    /// Prefix a responding device's reply must start with
    pub pong_prefix: String,
    /// How long to wait for the reply, per port
    pub scan_timeout_ms: u64,
    /// Wait after opening before talking (boards may reset on open)
    pub settle_delay_ms: u64,
    /// Per-operation read/write timeout of the port
    pub io_timeout_ms: u64,
    /// Port probed first when present
    pub priority_port: Option<String>,
    /// How long `close()` waits for the reader thread
    pub reader_join_timeout_ms: u64,
    /// Tag prefixed to received lines; the port name when unset
    pub read_tag: Option<String>,
}

impl Default for SerialLinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            eol: "\n".to_string(),
            ping_token: "scan".to_string(),
            pong_prefix: "PONG".to_string(),
            scan_timeout_ms: 800,
            settle_delay_ms: 2000,
            io_timeout_ms: 100,
            priority_port: None,
            reader_join_timeout_ms: 600,
            read_tag: None,
        }
    }
}

impl SerialLinkConfig {
    /// Full probe line including the terminator
    pub fn probe_line(&self) -> String {
        format!("PING {}{}", self.ping_token, self.eol)
    }

    /// Byte that ends an incoming line
    pub fn line_delimiter(&self) -> u8 {
        self.eol.as_bytes().last().copied().unwrap_or(b'\n')
    }

    /// Reply window per probed port
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    /// Post-open settle delay
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Port I/O timeout
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Reader join bound on close
    pub fn reader_join_timeout(&self) -> Duration {
        Duration::from_millis(self.reader_join_timeout_ms)
    }
}

/// One camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// Display name (e.g. "CamA")
    pub name: String,
    /// OS device index
    pub index: u32,
    /// Requested frame width
    pub width: u32,
    /// Requested frame height
    pub height: u32,
    /// Requested frame rate
    pub target_fps: f64,
    /// Backend preference
    pub backend: BackendKind,
    /// Start when the application comes up
    pub enabled_on_start: bool,
    /// Compressed pixel format requested from the driver
    pub fourcc: String,
    /// How long a backend may take to report the device opened
    pub backend_open_timeout_ms: u64,
    /// Reads attempted to prove a backend delivers frames
    pub warmup_reads: u32,
    /// Pause between warm-up reads
    pub warmup_interval_ms: u64,
    /// Window after start in which a never-opened device may keep failing
    pub open_grace_ms: u64,
    /// Consecutive read failures that end a never-opened worker
    pub failure_threshold: u32,
    /// How long `stop()` waits for the acquisition thread
    pub stop_timeout_ms: u64,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            name: "Cam".to_string(),
            index: 0,
            width: 640,
            height: 480,
            target_fps: 20.0,
            backend: BackendKind::Auto,
            enabled_on_start: false,
            fourcc: "MJPG".to_string(),
            backend_open_timeout_ms: 2000,
            warmup_reads: 6,
            warmup_interval_ms: 50,
            open_grace_ms: 3000,
            failure_threshold: 30,
            stop_timeout_ms: 1000,
        }
    }
}

impl CameraSettings {
    /// Settings for a named camera at `index`, defaults elsewhere
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
            ..Self::default()
        }
    }

    /// Time between steady-state reads
    pub fn read_interval(&self) -> Duration {
        let fps = if self.target_fps > 0.0 { self.target_fps } else { 20.0 };
        Duration::from_secs_f64(1.0 / fps).max(Duration::from_millis(20))
    }

    /// Backend open wait
    pub fn backend_open_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_open_timeout_ms)
    }

    /// Warm-up read spacing
    pub fn warmup_interval(&self) -> Duration {
        Duration::from_millis(self.warmup_interval_ms)
    }

    /// Grace window for never-opened devices
    pub fn open_grace(&self) -> Duration {
        Duration::from_millis(self.open_grace_ms)
    }

    /// Stop join bound
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Four-character format code, space padded
    pub fn fourcc_code(&self) -> [u8; 4] {
        let mut code = [b' '; 4];
        for (slot, byte) in code.iter_mut().zip(self.fourcc.bytes()) {
            *slot = byte;
        }
        code
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Folder for `app_<timestamp>.log` files; the data dir's `logs` when unset
    pub folder: Option<PathBuf>,
    /// Default level (trace, debug, info, warn, error)
    pub level: String,
    /// Mirror bus log lines (serial traffic included) into the log file
    pub also_log_serial: bool,
    /// Emit JSON records instead of text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            folder: None,
            level: "info".to_string(),
            also_log_serial: true,
            json: false,
        }
    }
}

/// Relay / USB switch box settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// USB product id of the box
    pub product_id: u32,
    /// Driver call timeout
    pub timeout_ms: u64,
    /// Action name to driver command
    pub actions: BTreeMap<String, String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let actions = [
            ("USB_ON", "SK3"),
            ("USB_OFF", "RK3"),
            ("LIGHT_ON", "SK1"),
            ("LIGHT_OFF", "RK1"),
        ]
        .into_iter()
        .map(|(name, cmd)| (name.to_string(), cmd.to_string()))
        .collect();

        Self {
            product_id: 218,
            timeout_ms: 5000,
            actions,
        }
    }
}

impl RelayConfig {
    /// Driver call timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.serial.probe_line(), "PING scan\n");
        assert_eq!(config.serial.line_delimiter(), b'\n');
        assert_eq!(config.relay.actions.get("USB_ON").map(String::as_str), Some("SK3"));
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.serial.priority_port = Some("COM7".into());
        config.cameras.push(CameraSettings::new("CamA", 1));
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_yaml_partial_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.yaml");
        std::fs::write(
            &path,
            "serial:\n  baud_rate: 9600\n  eol: \"\\r\\n\"\ncameras:\n  - name: CamB\n    index: 2\n    backend: dshow\n",
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.serial.eol, "\r\n");
        assert_eq!(config.serial.scan_timeout_ms, 800);
        let cam = config.camera("CamB").unwrap();
        assert_eq!(cam.index, 2);
        assert_eq!(cam.backend, BackendKind::DirectShow);
        assert_eq!(cam.width, 640);
    }

    #[test]
    fn test_validation_faults() {
        let mut config = AppConfig::default();
        config.cameras.push(CameraSettings::new("CamA", 0));
        config.cameras.push(CameraSettings::new("CamA", 1));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AppConfig::default();
        config.serial.eol.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_camera_timing() {
        let mut cam = CameraSettings::new("CamA", 0);
        cam.target_fps = 100.0;
        assert_eq!(cam.read_interval(), Duration::from_millis(20));
        cam.target_fps = 10.0;
        assert_eq!(cam.read_interval(), Duration::from_millis(100));
        cam.fourcc = "YU".into();
        assert_eq!(&cam.fourcc_code(), b"YU  ");
    }
}
