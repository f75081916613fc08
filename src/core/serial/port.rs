//! Port enumeration and opening

use super::SerialError;
use crate::config::SerialLinkConfig;
use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, SerialPort, SerialPortInfo, SerialPortType};
use std::io::{Read, Write};
use std::time::Duration;

/// A port reported by the OS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCandidate {
    /// Device name (COM3, /dev/ttyUSB0)
    pub device_name: String,
    /// Human-readable description
    pub description: String,
    /// Bluetooth serial link; never probed
    pub bluetooth: bool,
}

impl PortCandidate {
    /// Candidate with an inferred bluetooth flag
    pub fn new(device_name: impl Into<String>, description: impl Into<String>) -> Self {
        let device_name = device_name.into();
        let description = description.into();
        let bluetooth = looks_bluetooth(&device_name) || looks_bluetooth(&description);
        Self {
            device_name,
            description,
            bluetooth,
        }
    }
}

fn looks_bluetooth(text: &str) -> bool {
    let text = text.to_lowercase();
    text.contains("bluetooth") || text.contains("rfcomm")
}

/// Settings applied when opening a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Per-operation read/write timeout
    pub timeout: Duration,
}

impl From<&SerialLinkConfig> for LinkSettings {
    fn from(config: &SerialLinkConfig) -> Self {
        Self {
            baud_rate: config.baud_rate,
            timeout: config.io_timeout(),
        }
    }
}

/// An opened serial port
///
/// Reads block for at most the link timeout and then fail with
/// `ErrorKind::TimedOut`.
pub trait SerialLink: Read + Write + Send {
    /// Device name
    fn name(&self) -> &str;

    /// Discard bytes received but not read
    fn clear_input(&mut self) -> Result<(), SerialError>;

    /// Discard bytes written but not transmitted
    fn clear_output(&mut self) -> Result<(), SerialError>;

    /// Second handle to the same port
    fn try_clone(&self) -> Result<Box<dyn SerialLink>, SerialError>;
}

/// Source of serial ports
#[cfg_attr(test, mockall::automock)]
pub trait PortProvider: Send + Sync {
    /// Ports currently visible
    fn list_ports(&self) -> Result<Vec<PortCandidate>, SerialError>;

    /// Open a port
    fn open(&self, port: &str, settings: &LinkSettings) -> Result<Box<dyn SerialLink>, SerialError>;
}

/// Probe order: bluetooth links dropped, the priority port first, the rest
/// sorted by device name
pub fn order_candidates(candidates: Vec<PortCandidate>, priority: Option<&str>) -> Vec<PortCandidate> {
    let mut ordered: Vec<PortCandidate> = candidates.into_iter().filter(|c| !c.bluetooth).collect();
    ordered.sort_by(|a, b| a.device_name.cmp(&b.device_name));
    if let Some(priority) = priority {
        if let Some(pos) = ordered.iter().position(|c| c.device_name == priority) {
            let first = ordered.remove(pos);
            ordered.insert(0, first);
        }
    }
    ordered
}

/// OS serial ports through the `serialport` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPorts;

impl SystemPorts {
    /// Provider for the ports of this machine
    pub fn new() -> Self {
        Self
    }
}

impl PortProvider for SystemPorts {
    fn list_ports(&self) -> Result<Vec<PortCandidate>, SerialError> {
        let ports = serialport::available_ports()?;
        Ok(ports.iter().map(candidate_from_info).collect())
    }

    fn open(&self, port: &str, settings: &LinkSettings) -> Result<Box<dyn SerialLink>, SerialError> {
        let handle = serialport::new(port, settings.baud_rate)
            .timeout(settings.timeout)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => SerialError::PortNotFound(port.to_string()),
                serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    SerialError::PermissionDenied(port.to_string())
                }
                serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
                    SerialError::PortNotFound(port.to_string())
                }
                _ => SerialError::OpenFailed(format!("{port}: {e}")),
            })?;

        Ok(Box::new(SystemLink {
            name: port.to_string(),
            port: handle,
        }))
    }
}

fn candidate_from_info(info: &SerialPortInfo) -> PortCandidate {
    let description = match &info.port_type {
        SerialPortType::UsbPort(usb) => {
            let mut desc = usb
                .product
                .clone()
                .or_else(|| usb.manufacturer.clone())
                .unwrap_or_else(|| "USB Serial".to_string());
            desc.push_str(&format!(" ({:04X}:{:04X})", usb.vid, usb.pid));
            desc
        }
        SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        SerialPortType::PciPort => "PCI Serial".to_string(),
        SerialPortType::Unknown => "Serial Port".to_string(),
    };

    let mut candidate = PortCandidate::new(&info.port_name, description);
    candidate.bluetooth |= matches!(info.port_type, SerialPortType::BluetoothPort);
    candidate
}

struct SystemLink {
    name: String,
    port: Box<dyn SerialPort>,
}

impl Read for SystemLink {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SystemLink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port.flush()
    }
}

impl SerialLink for SystemLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn clear_input(&mut self) -> Result<(), SerialError> {
        Ok(self.port.clear(ClearBuffer::Input)?)
    }

    fn clear_output(&mut self) -> Result<(), SerialError> {
        Ok(self.port.clear(ClearBuffer::Output)?)
    }

    fn try_clone(&self) -> Result<Box<dyn SerialLink>, SerialError> {
        Ok(Box::new(SystemLink {
            name: self.name.clone(),
            port: self.port.try_clone()?,
        }))
    }
}
