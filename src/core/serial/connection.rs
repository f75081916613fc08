//! Persistent serial session
//!
//! `open` starts one reader thread per session. Every session carries a
//! generation number; a reader only touches the connection state while its
//! generation is current, so a reader outliving its session cannot report a
//! newer session as lost.

use super::line::{frame_line, LineReader};
use super::port::{LinkSettings, PortProvider, SerialLink};
use super::SerialError;
use crate::config::SerialLinkConfig;
use crate::core::bus::{ConnectionState, Event, EventBus};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::{Mutex, RwLock};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

struct ConnShared {
    config: SerialLinkConfig,
    ports: Arc<dyn PortProvider>,
    bus: EventBus,
    state: RwLock<ConnectionState>,
    generation: AtomicU64,
}

struct Session {
    writer: Box<dyn SerialLink>,
    stop: Arc<AtomicBool>,
    done: Receiver<()>,
    reader: JoinHandle<()>,
}

/// Line-oriented session against one serial port
pub struct SerialConnection {
    shared: Arc<ConnShared>,
    session: Mutex<Option<Session>>,
}

impl SerialConnection {
    /// Create a closed connection
    pub fn new(config: SerialLinkConfig, ports: Arc<dyn PortProvider>, bus: EventBus) -> Self {
        Self {
            shared: Arc::new(ConnShared {
                config,
                ports,
                bus,
                state: RwLock::new(ConnectionState::default()),
                generation: AtomicU64::new(0),
            }),
            session: Mutex::new(None),
        }
    }

    /// Open `port`, replacing any current session
    ///
    /// Blocks for the settle delay. An empty name fails without touching
    /// any port. Concurrent calls run one after the other; the last one wins.
    pub fn open(&self, port: &str) -> Result<(), SerialError> {
        let port = port.trim();
        if port.is_empty() {
            self.shared.bus.publish_log("[serial] No port selected");
            return Err(SerialError::EmptyPort);
        }

        // held until the new session is stored, so concurrent opens queue
        let mut session = self.session.lock();
        if let Some(previous) = session.take() {
            self.end_session(previous);
        }

        match self.establish(port) {
            Ok(established) => {
                *session = Some(established);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to open {}: {}", port, e);
                self.shared.generation.fetch_add(1, Ordering::SeqCst);
                *self.shared.state.write() = ConnectionState::default();
                self.shared.bus.publish_log(format!("[serial] Open {port} failed: {e}"));
                self.shared
                    .bus
                    .publish(Event::ConnState(ConnectionState::disconnected(None)));
                Err(e)
            }
        }
    }

    fn establish(&self, port: &str) -> Result<Session, SerialError> {
        let shared = &self.shared;
        let config = &shared.config;

        let mut link = shared.ports.open(port, &LinkSettings::from(config))?;
        thread::sleep(config.settle_delay());
        link.clear_input()?;
        link.clear_output()?;
        let reader_link = link.try_clone()?;

        let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done) = bounded::<()>(1);

        *shared.state.write() = ConnectionState::connected(port);
        shared.bus.publish(Event::ConnState(ConnectionState::connected(port)));
        shared
            .bus
            .publish_log(format!("[serial] Connected {port} @ {}", config.baud_rate));
        tracing::info!("Serial connected: {} @ {}", port, config.baud_rate);

        let reader_shared = shared.clone();
        let reader_stop = stop.clone();
        let reader_port = port.to_string();
        let reader = thread::Builder::new()
            .name(format!("serial-reader-{port}"))
            .spawn(move || {
                reader_shared.read_loop(reader_link, reader_stop, generation, reader_port);
                drop(done_tx);
            })?;

        Ok(Session {
            writer: link,
            stop,
            done,
            reader,
        })
    }

    /// Close the session. Idempotent.
    pub fn close(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            self.end_session(session);
        }
        *self.shared.state.write() = ConnectionState::default();
        self.shared
            .bus
            .publish(Event::ConnState(ConnectionState::disconnected(None)));
    }

    fn end_session(&self, session: Session) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        session.stop.store(true, Ordering::SeqCst);

        match session.done.recv_timeout(self.shared.config.reader_join_timeout()) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    "Serial reader still running after {:?}",
                    self.shared.config.reader_join_timeout()
                );
            }
            _ => {
                if session.reader.join().is_err() {
                    tracing::warn!("Serial reader panicked");
                }
            }
        }
        let port = session.writer.name().to_string();
        drop(session.writer);
        tracing::info!("Serial closed: {}", port);
    }

    /// Send one line, adding the terminator when missing
    ///
    /// Pending input is discarded first so the reply that follows is not
    /// mixed with stale bytes.
    pub fn write_line(&self, text: &str) -> Result<(), SerialError> {
        let mut session = self.session.lock();
        let connected = self.shared.state.read().connected;
        let Some(session) = session.as_mut().filter(|_| connected) else {
            self.shared
                .bus
                .publish_log("[ERR] write failed (not connected)");
            return Err(SerialError::NotConnected);
        };

        let framed = frame_line(text, &self.shared.config.eol);
        match send(session.writer.as_mut(), &framed) {
            Ok(()) => {
                self.shared.bus.publish_log(format!("→ {}", framed.trim_end()));
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Serial write failed: {}", e);
                self.shared.bus.publish_log(format!("[ERR] write failed: {e}"));
                Err(e)
            }
        }
    }

    /// Whether a session is open
    pub fn is_connected(&self) -> bool {
        self.shared.state.read().connected
    }

    /// Port of the open session
    pub fn port(&self) -> Option<String> {
        let state = self.shared.state.read();
        if state.connected {
            state.port.clone()
        } else {
            None
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.shared.state.read().clone()
    }
}

impl Drop for SerialConnection {
    fn drop(&mut self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(session) = self.session.get_mut().take() {
            session.stop.store(true, Ordering::SeqCst);
        }
    }
}

fn send(link: &mut dyn SerialLink, framed: &str) -> Result<(), SerialError> {
    link.clear_input()?;
    link.write_all(framed.as_bytes())?;
    link.flush()?;
    Ok(())
}

impl ConnShared {
    fn read_loop(
        &self,
        mut link: Box<dyn SerialLink>,
        stop: Arc<AtomicBool>,
        generation: u64,
        port: String,
    ) {
        let tag = self.config.read_tag.clone().unwrap_or_else(|| port.clone());
        let timeout = self.config.io_timeout();
        let mut reader = LineReader::new(self.config.line_delimiter());
        tracing::debug!("Serial reader started: {}", port);

        while !stop.load(Ordering::SeqCst) {
            match reader.read_line(link.as_mut(), Instant::now() + timeout) {
                Ok(Some(line)) if !line.is_empty() => {
                    self.bus.publish_log(format!("[{tag}] {line}"));
                }
                Ok(_) => {}
                Err(e) => {
                    if !stop.load(Ordering::SeqCst) {
                        self.reader_died(generation, &port, &e);
                    }
                    break;
                }
            }
        }
        tracing::debug!("Serial reader stopped: {}", port);
    }

    fn reader_died(&self, generation: u64, port: &str, error: &std::io::Error) {
        let mut state = self.state.write();
        if self.generation.load(Ordering::SeqCst) != generation || !state.connected {
            return;
        }
        tracing::warn!("Serial link {} lost: {}", port, error);
        *state = ConnectionState::disconnected(Some(port.to_string()));
        self.bus.publish_log(format!("[serial] {port} lost: {error}"));
        self.bus.publish(Event::ConnState(ConnectionState::disconnected(Some(
            port.to_string(),
        ))));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bus::Topic;
    use crate::core::serial::MockPortProvider;
    use crate::core::simulator::{SimulatedDevice, SimulatedPorts};
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn test_empty_port_does_no_io() {
        let mut ports = MockPortProvider::new();
        ports.expect_open().never();
        ports.expect_list_ports().never();

        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe_channel(Topic::ConnState);
        let connection = SerialConnection::new(SerialLinkConfig::default(), Arc::new(ports), bus.clone());

        assert!(matches!(connection.open(""), Err(SerialError::EmptyPort)));
        assert!(matches!(connection.open("   "), Err(SerialError::EmptyPort)));
        assert!(!connection.is_connected());
        assert!(bus.flush(Duration::from_secs(1)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_open_failure_publishes_disconnected() {
        let mut ports = MockPortProvider::new();
        ports
            .expect_open()
            .times(1)
            .returning(|port, _| Err(SerialError::PortNotFound(port.to_string())));

        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe_channel(Topic::ConnState);
        let connection = SerialConnection::new(SerialLinkConfig::default(), Arc::new(ports), bus.clone());

        assert!(matches!(connection.open("COM42"), Err(SerialError::PortNotFound(_))));
        assert!(bus.flush(Duration::from_secs(1)));
        assert_eq!(
            rx.try_recv().unwrap(),
            Event::ConnState(ConnectionState::disconnected(None))
        );
        assert_eq!(connection.state(), ConnectionState::default());
    }

    #[test]
    fn test_send_drops_stale_input() {
        let device = SimulatedDevice::pong("COM5", "PONG fresh", Duration::ZERO);
        let ports = SimulatedPorts::new().with_device(device.clone());
        let settings = LinkSettings {
            baud_rate: 115200,
            timeout: Duration::from_millis(50),
        };
        let mut link = ports.open("COM5", &settings).unwrap();

        // arrived before the command went out
        device.emit_line("PONG stale", Duration::ZERO);
        send(link.as_mut(), "PING\n").unwrap();

        let mut reader = LineReader::new(b'\n');
        let line = reader
            .read_line(link.as_mut(), Instant::now() + Duration::from_millis(200))
            .unwrap();
        assert_eq!(line.as_deref(), Some("PONG fresh"));
        assert_eq!(device.transcript(), b"PING\n".to_vec());
    }

    #[test]
    fn test_concurrent_opens_leave_one_session() {
        let first = SimulatedDevice::silent("COM1");
        let second = SimulatedDevice::silent("COM2");
        let ports = Arc::new(
            SimulatedPorts::new()
                .with_device(first.clone())
                .with_device(second.clone()),
        );
        let config = SerialLinkConfig {
            settle_delay_ms: 10,
            io_timeout_ms: 20,
            ..SerialLinkConfig::default()
        };
        let connection = Arc::new(SerialConnection::new(config, ports, EventBus::new()));
        let barrier = Arc::new(Barrier::new(2));

        let openers: Vec<_> = ["COM1", "COM2"]
            .into_iter()
            .map(|port| {
                let connection = connection.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    connection.open(port).unwrap();
                })
            })
            .collect();
        for opener in openers {
            opener.join().unwrap();
        }

        // the losing session was ended, reader and both handles included
        assert!(first.is_open() ^ second.is_open());
        let winner = if first.is_open() { "COM1" } else { "COM2" };
        assert_eq!(connection.port().as_deref(), Some(winner));
        connection.close();
        assert!(!first.is_open() && !second.is_open());
    }

    #[test]
    fn test_write_when_closed_fails() {
        let ports = MockPortProvider::new();
        let connection = SerialConnection::new(SerialLinkConfig::default(), Arc::new(ports), EventBus::new());
        assert!(matches!(connection.write_line("LED ON"), Err(SerialError::NotConnected)));
    }

    #[test]
    fn test_close_twice_same_state() {
        let ports = MockPortProvider::new();
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe_channel(Topic::ConnState);
        let connection = SerialConnection::new(SerialLinkConfig::default(), Arc::new(ports), bus.clone());

        connection.close();
        let first = connection.state();
        connection.close();
        assert_eq!(connection.state(), first);
        assert!(bus.flush(Duration::from_secs(1)));
        assert_eq!(rx.try_recv().unwrap(), rx.try_recv().unwrap());
    }
}
