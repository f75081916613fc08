//! Simulated serial devices
//!
//! Scriptable line-oriented devices behind the [`PortProvider`] trait. Rules
//! match incoming lines and schedule replies; everything a host writes is
//! kept in a transcript so tests can assert on exact wire bytes.

use crate::core::serial::{LinkSettings, PortCandidate, PortProvider, SerialError, SerialLink};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Which received lines a rule reacts to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MatchCondition {
    /// Line starts with `prefix`
    Prefix {
        /// Required line start
        prefix: String,
    },
    /// Line contains `text`
    Text {
        /// Substring to look for
        text: String,
        /// Compare case-sensitively
        case_sensitive: bool,
    },
    /// Every line
    Any,
}

impl MatchCondition {
    /// Check a received line (terminator stripped)
    pub fn matches(&self, line: &str) -> bool {
        match self {
            Self::Prefix { prefix } => line.starts_with(prefix.as_str()),
            Self::Text {
                text,
                case_sensitive,
            } => {
                if *case_sensitive {
                    line.contains(text.as_str())
                } else {
                    line.to_lowercase().contains(&text.to_lowercase())
                }
            }
            Self::Any => true,
        }
    }
}

/// What a matching rule sends back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResponseAction {
    /// Send `text` plus newline after `delay_ms`
    Reply {
        /// Reply line, newline added
        text: String,
        /// Delay before the reply lands
        delay_ms: u64,
    },
    /// Send the line back
    Echo,
    /// Stay silent
    None,
}

/// Response rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRule {
    /// Rule name
    pub name: String,
    /// Match condition
    pub condition: MatchCondition,
    /// Response action
    pub action: ResponseAction,
    /// Priority (higher = checked first)
    #[serde(default)]
    pub priority: i32,
    /// Enabled
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    /// Disable after first match
    #[serde(default)]
    pub one_shot: bool,
    /// Match count
    #[serde(default)]
    pub match_count: u64,
}

fn enabled_default() -> bool {
    true
}

impl ResponseRule {
    /// Reply `text` after `delay` to lines starting with `prefix`
    pub fn reply(name: &str, prefix: &str, text: &str, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            condition: MatchCondition::Prefix {
                prefix: prefix.to_string(),
            },
            action: ResponseAction::Reply {
                text: text.to_string(),
                delay_ms: delay.as_millis() as u64,
            },
            priority: 10,
            enabled: true,
            one_shot: false,
            match_count: 0,
        }
    }

    /// Echo every line
    pub fn echo(name: &str) -> Self {
        Self {
            name: name.to_string(),
            condition: MatchCondition::Any,
            action: ResponseAction::Echo,
            priority: 0,
            enabled: true,
            one_shot: false,
            match_count: 0,
        }
    }
}

struct Outbound {
    due: Instant,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct DeviceIo {
    handles: usize,
    unplugged: bool,
    received: Vec<u8>,
    outbound: VecDeque<Outbound>,
    transcript: Vec<u8>,
    opens: usize,
}

impl DeviceIo {
    fn schedule(&mut self, due: Instant, bytes: Vec<u8>) {
        let pos = self
            .outbound
            .iter()
            .position(|o| o.due > due)
            .unwrap_or(self.outbound.len());
        self.outbound.insert(pos, Outbound { due, bytes });
    }

    fn next_due(&self) -> Option<Instant> {
        self.outbound.front().map(|o| o.due)
    }

    fn take_due(&mut self, buf: &mut [u8], now: Instant) -> usize {
        let mut filled = 0;
        while filled < buf.len() {
            let Some(front) = self.outbound.front_mut() else {
                break;
            };
            if front.due > now {
                break;
            }
            let n = front.bytes.len().min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&front.bytes[..n]);
            front.bytes.drain(..n);
            filled += n;
            if front.bytes.is_empty() {
                self.outbound.pop_front();
            }
        }
        filled
    }
}

struct DeviceCore {
    name: String,
    description: String,
    bluetooth: bool,
    banner: Vec<u8>,
    rules: Mutex<Vec<ResponseRule>>,
    io: Mutex<DeviceIo>,
    arrived: Condvar,
}

/// A simulated device; clones share the same device
#[derive(Clone)]
pub struct SimulatedDevice {
    core: Arc<DeviceCore>,
}

impl SimulatedDevice {
    /// Device that never answers
    pub fn silent(name: &str) -> Self {
        Self::build(name, "Simulated Serial", false, Vec::new(), Vec::new())
    }

    /// Device answering `PING` lines with `reply` after `delay`
    pub fn pong(name: &str, reply: &str, delay: Duration) -> Self {
        Self::silent(name).with_rule(ResponseRule::reply("pong", "PING", reply, delay))
    }

    /// Device with a rule list
    pub fn with_rules(name: &str, rules: Vec<ResponseRule>) -> Self {
        Self::build(name, "Simulated Serial", false, Vec::new(), rules)
    }

    fn build(
        name: &str,
        description: &str,
        bluetooth: bool,
        banner: Vec<u8>,
        mut rules: Vec<ResponseRule>,
    ) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self {
            core: Arc::new(DeviceCore {
                name: name.to_string(),
                description: description.to_string(),
                bluetooth,
                banner,
                rules: Mutex::new(rules),
                io: Mutex::new(DeviceIo::default()),
                arrived: Condvar::new(),
            }),
        }
    }

    fn rebuild(self, description: &str, bluetooth: bool, banner: Vec<u8>) -> Self {
        let rules = self.core.rules.lock().clone();
        Self::build(&self.core.name, description, bluetooth, banner, rules)
    }

    /// Add a rule, builder style
    #[must_use]
    pub fn with_rule(self, rule: ResponseRule) -> Self {
        self.add_rule(rule);
        self
    }

    /// Text already waiting in the input buffer whenever the port opens
    #[must_use]
    pub fn with_banner(self, banner: &str) -> Self {
        let description = self.core.description.clone();
        let bluetooth = self.core.bluetooth;
        self.rebuild(&description, bluetooth, banner.as_bytes().to_vec())
    }

    /// Report the device as a bluetooth serial link
    #[must_use]
    pub fn bluetooth(self) -> Self {
        let banner = self.core.banner.clone();
        self.rebuild("Standard Serial over Bluetooth link", true, banner)
    }

    /// Add a rule
    pub fn add_rule(&self, rule: ResponseRule) {
        let mut rules = self.core.rules.lock();
        rules.push(rule);
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Rules with their match counts
    pub fn rules(&self) -> Vec<ResponseRule> {
        self.core.rules.lock().clone()
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Whether a host holds the port open
    pub fn is_open(&self) -> bool {
        self.core.io.lock().handles > 0
    }

    /// Times the port was opened
    pub fn opens(&self) -> usize {
        self.core.io.lock().opens
    }

    /// Every byte hosts wrote, across sessions
    pub fn transcript(&self) -> Vec<u8> {
        self.core.io.lock().transcript.clone()
    }

    /// Send an unsolicited line to the open host after `delay`
    pub fn emit_line(&self, text: &str, delay: Duration) {
        let mut io = self.core.io.lock();
        if io.handles == 0 {
            return;
        }
        io.schedule(Instant::now() + delay, format!("{text}\n").into_bytes());
        self.core.arrived.notify_all();
    }

    /// Pull the cable: open links fail, new opens are refused
    pub fn unplug(&self) {
        self.core.io.lock().unplugged = true;
        self.core.arrived.notify_all();
    }

    /// Plug the cable back in
    pub fn replug(&self) {
        self.core.io.lock().unplugged = false;
    }

    fn candidate(&self) -> PortCandidate {
        PortCandidate {
            device_name: self.core.name.clone(),
            description: self.core.description.clone(),
            bluetooth: self.core.bluetooth,
        }
    }

    fn attach(&self) -> Result<SimulatedLink, SerialError> {
        let mut io = self.core.io.lock();
        if io.unplugged {
            return Err(SerialError::PortNotFound(self.core.name.clone()));
        }
        if io.handles > 0 {
            return Err(SerialError::PortBusy(self.core.name.clone()));
        }
        io.handles = 1;
        io.opens += 1;
        if !self.core.banner.is_empty() {
            let banner = self.core.banner.clone();
            io.schedule(Instant::now(), banner);
        }
        Ok(SimulatedLink {
            device: self.clone(),
            timeout: Duration::from_millis(100),
        })
    }

    fn on_received(&self, io: &mut DeviceIo, bytes: &[u8]) {
        io.transcript.extend_from_slice(bytes);
        io.received.extend_from_slice(bytes);

        while let Some(pos) = io.received.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = io.received.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            let now = Instant::now();

            let mut rules = self.core.rules.lock();
            let Some(rule) = rules
                .iter_mut()
                .find(|r| r.enabled && r.condition.matches(&line))
            else {
                continue;
            };
            rule.match_count += 1;
            if rule.one_shot {
                rule.enabled = false;
            }
            match &rule.action {
                ResponseAction::Reply { text, delay_ms } => {
                    let due = now + Duration::from_millis(*delay_ms);
                    io.schedule(due, format!("{text}\n").into_bytes());
                }
                ResponseAction::Echo => io.schedule(now, format!("{line}\n").into_bytes()),
                ResponseAction::None => {}
            }
        }
        self.core.arrived.notify_all();
    }
}

impl std::fmt::Debug for SimulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedDevice")
            .field("name", &self.core.name)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Host side of a simulated port
struct SimulatedLink {
    device: SimulatedDevice,
    timeout: Duration,
}

impl Read for SimulatedLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let core = &self.device.core;
        let give_up = Instant::now() + self.timeout;
        let mut io = core.io.lock();
        loop {
            if io.unplugged {
                return Err(io::Error::new(ErrorKind::BrokenPipe, "device unplugged"));
            }
            let now = Instant::now();
            let n = io.take_due(buf, now);
            if n > 0 {
                return Ok(n);
            }
            if now >= give_up {
                return Err(io::Error::new(ErrorKind::TimedOut, "read timed out"));
            }
            let wake = io.next_due().map_or(give_up, |due| due.min(give_up));
            core.arrived.wait_until(&mut io, wake);
        }
    }
}

impl Write for SimulatedLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut io = self.device.core.io.lock();
        if io.unplugged {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "device unplugged"));
        }
        self.device.on_received(&mut io, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialLink for SimulatedLink {
    fn name(&self) -> &str {
        self.device.name()
    }

    fn clear_input(&mut self) -> Result<(), SerialError> {
        let now = Instant::now();
        self.device.core.io.lock().outbound.retain(|o| o.due > now);
        Ok(())
    }

    fn clear_output(&mut self) -> Result<(), SerialError> {
        Ok(())
    }

    fn try_clone(&self) -> Result<Box<dyn SerialLink>, SerialError> {
        self.device.core.io.lock().handles += 1;
        Ok(Box::new(SimulatedLink {
            device: self.device.clone(),
            timeout: self.timeout,
        }))
    }
}

impl Drop for SimulatedLink {
    fn drop(&mut self) {
        let mut io = self.device.core.io.lock();
        io.handles = io.handles.saturating_sub(1);
        if io.handles == 0 {
            io.outbound.clear();
            io.received.clear();
        }
    }
}

/// Port provider serving simulated devices
#[derive(Default)]
pub struct SimulatedPorts {
    devices: RwLock<Vec<SimulatedDevice>>,
    enumerations: AtomicUsize,
}

impl SimulatedPorts {
    /// No devices
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device, builder style
    #[must_use]
    pub fn with_device(self, device: SimulatedDevice) -> Self {
        self.add(device);
        self
    }

    /// Add or replace a device
    pub fn add(&self, device: SimulatedDevice) {
        let mut devices = self.devices.write();
        devices.retain(|d| d.name() != device.name());
        devices.push(device);
    }

    /// Remove a device; open links keep working until closed
    pub fn remove(&self, name: &str) -> Option<SimulatedDevice> {
        let mut devices = self.devices.write();
        let pos = devices.iter().position(|d| d.name() == name)?;
        Some(devices.remove(pos))
    }

    /// Device by name
    pub fn device(&self, name: &str) -> Option<SimulatedDevice> {
        self.devices.read().iter().find(|d| d.name() == name).cloned()
    }

    /// Times `list_ports` was called
    pub fn enumerations(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }

    /// Bench setup for demos: one silent port, one responder that answers
    /// probes with `<pong_prefix> BENCHLINK sim` and echoes commands
    pub fn demo(pong_prefix: &str) -> Self {
        let responder = SimulatedDevice::pong(
            "SIM1",
            &format!("{pong_prefix} BENCHLINK sim"),
            Duration::from_millis(50),
        )
        .with_rule(ResponseRule::echo("echo"));
        Self::new()
            .with_device(SimulatedDevice::silent("SIM0"))
            .with_device(responder)
    }
}

impl PortProvider for SimulatedPorts {
    fn list_ports(&self) -> Result<Vec<PortCandidate>, SerialError> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .devices
            .read()
            .iter()
            .filter(|d| !d.core.io.lock().unplugged)
            .map(SimulatedDevice::candidate)
            .collect())
    }

    fn open(&self, port: &str, settings: &LinkSettings) -> Result<Box<dyn SerialLink>, SerialError> {
        let device = self
            .device(port)
            .ok_or_else(|| SerialError::PortNotFound(port.to_string()))?;
        let mut link = device.attach()?;
        link.timeout = settings.timeout;
        Ok(Box::new(link))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> LinkSettings {
        LinkSettings {
            baud_rate: 115200,
            timeout: Duration::from_millis(50),
        }
    }

    fn read_text(link: &mut dyn SerialLink) -> String {
        let mut buf = [0u8; 128];
        match link.read(&mut buf) {
            Ok(n) => String::from_utf8_lossy(&buf[..n]).to_string(),
            Err(_) => String::new(),
        }
    }

    #[test]
    fn test_match_conditions() {
        let prefix = MatchCondition::Prefix {
            prefix: "PING".to_string(),
        };
        assert!(prefix.matches("PING scan"));
        assert!(!prefix.matches("xPING"));

        let text = MatchCondition::Text {
            text: "led".to_string(),
            case_sensitive: false,
        };
        assert!(text.matches("SET LED 1"));
    }

    #[test]
    fn test_rules_deserialize() {
        let rules: Vec<ResponseRule> = serde_json::from_str(
            r#"[{"name":"pong","condition":{"type":"prefix","prefix":"PING"},
                 "action":{"type":"reply","text":"PONG X","delay_ms":10}}]"#,
        )
        .unwrap();
        assert!(rules[0].enabled);
        assert_eq!(rules[0].condition, MatchCondition::Prefix { prefix: "PING".into() });
    }

    #[test]
    fn test_pong_after_delay() {
        let ports = SimulatedPorts::new().with_device(SimulatedDevice::pong(
            "A",
            "PONG A",
            Duration::from_millis(20),
        ));
        let mut link = ports.open("A", &settings()).unwrap();
        link.write_all(b"PING scan\n").unwrap();
        let start = Instant::now();
        assert_eq!(read_text(link.as_mut()), "PONG A\n");
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_open_is_exclusive_and_released() {
        let device = SimulatedDevice::silent("A");
        let ports = SimulatedPorts::new().with_device(device.clone());

        let link = ports.open("A", &settings()).unwrap();
        assert!(matches!(ports.open("A", &settings()), Err(SerialError::PortBusy(_))));
        let clone = link.try_clone().unwrap();
        drop(link);
        assert!(device.is_open());
        drop(clone);
        assert!(!device.is_open());
        assert!(ports.open("A", &settings()).is_ok());
        assert!(matches!(ports.open("Z", &settings()), Err(SerialError::PortNotFound(_))));
    }

    #[test]
    fn test_banner_cleared_by_clear_input() {
        let ports = SimulatedPorts::new().with_device(SimulatedDevice::silent("A").with_banner("boot v1\n"));
        let mut link = ports.open("A", &settings()).unwrap();
        link.clear_input().unwrap();
        assert_eq!(read_text(link.as_mut()), "");
    }

    #[test]
    fn test_unplug_fails_reads() {
        let device = SimulatedDevice::silent("A");
        let ports = SimulatedPorts::new().with_device(device.clone());
        let mut link = ports.open("A", &settings()).unwrap();
        device.unplug();
        let mut buf = [0u8; 8];
        assert_eq!(link.read(&mut buf).unwrap_err().kind(), ErrorKind::BrokenPipe);
        assert!(ports.list_ports().unwrap().is_empty());
    }
}
