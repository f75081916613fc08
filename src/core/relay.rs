//! Relay / USB-switch box
//!
//! The vendor binding lives outside this crate and is plugged in through
//! [`RelayDriver`]. [`RelayClient`] adds the connection bookkeeping, the
//! action-name table and bus logging.

use crate::config::RelayConfig;
use crate::core::bus::EventBus;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Relay errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// No board attached
    #[error("Relay not connected")]
    NotConnected,

    /// Driver refused to open the board
    #[error("Relay open failed (product_id={0})")]
    OpenFailed(u32),

    /// Command not accepted by the board
    #[error("Relay command {0} failed")]
    WriteFailed(String),

    /// Action name missing from the action table
    #[error("Unknown relay action: {0}")]
    UnknownAction(String),
}

/// Native relay binding
pub trait RelayDriver: Send {
    /// Open the first device with `product_id`
    fn open(&mut self, product_id: u32, timeout: Duration) -> bool;

    /// Close the device
    fn close(&mut self);

    /// Send one command
    fn write(&mut self, command: &str, timeout: Duration) -> bool;
}

/// Relay box client
pub struct RelayClient {
    config: RelayConfig,
    bus: EventBus,
    driver: Mutex<Box<dyn RelayDriver>>,
    connected: Mutex<bool>,
}

impl RelayClient {
    /// Wrap a driver
    pub fn new(config: RelayConfig, driver: Box<dyn RelayDriver>, bus: EventBus) -> Self {
        Self {
            config,
            bus,
            driver: Mutex::new(driver),
            connected: Mutex::new(false),
        }
    }

    /// Open the device
    pub fn connect(&self) -> Result<(), RelayError> {
        let mut connected = self.connected.lock();
        if *connected {
            return Ok(());
        }
        let product_id = self.config.product_id;
        if self.driver.lock().open(product_id, self.config.timeout()) {
            *connected = true;
            self.bus
                .publish_log(format!("[relay] Connected (product_id={product_id})"));
            Ok(())
        } else {
            tracing::warn!("Relay open failed for product id {}", product_id);
            self.bus
                .publish_log(format!("[relay] Connect failed (product_id={product_id})"));
            Err(RelayError::OpenFailed(product_id))
        }
    }

    /// Close the device. Idempotent.
    pub fn disconnect(&self) {
        let mut connected = self.connected.lock();
        if *connected {
            self.driver.lock().close();
            self.bus.publish_log("[relay] Disconnected");
        }
        *connected = false;
    }

    /// Whether the device is open
    pub fn is_connected(&self) -> bool {
        *self.connected.lock()
    }

    /// Send a raw command
    pub fn write(&self, command: &str) -> Result<(), RelayError> {
        if !*self.connected.lock() {
            self.bus.publish_log("[relay] Write failed: not connected");
            return Err(RelayError::NotConnected);
        }
        let ok = self.driver.lock().write(command, self.config.timeout());
        self.bus.publish_log(format!(
            "[relay] TX {command} -> {}",
            if ok { "OK" } else { "FAIL" }
        ));
        if ok {
            Ok(())
        } else {
            Err(RelayError::WriteFailed(command.to_string()))
        }
    }

    /// Run a named action (`USB_ON`, `LIGHT_OFF`, ...)
    pub fn action(&self, name: &str) -> Result<(), RelayError> {
        let Some(command) = self.config.actions.get(name).cloned() else {
            self.bus.publish_log(format!("[relay] Unknown action: {name}"));
            return Err(RelayError::UnknownAction(name.to_string()));
        };
        self.write(&command)
    }

    /// Action names and their commands
    pub fn actions(&self) -> &BTreeMap<String, String> {
        &self.config.actions
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        if *self.connected.get_mut() {
            self.driver.get_mut().close();
        }
    }
}

/// Driver that accepts every command and records it
#[derive(Debug, Clone, Default)]
pub struct SimulatedRelay {
    commands: Arc<Mutex<Vec<String>>>,
    refuse_open: bool,
}

impl SimulatedRelay {
    /// Driver with a shared command log
    pub fn new() -> Self {
        Self::default()
    }

    /// Driver whose device is never found
    pub fn absent() -> Self {
        Self {
            refuse_open: true,
            ..Self::default()
        }
    }

    /// Commands written so far
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

impl RelayDriver for SimulatedRelay {
    fn open(&mut self, _product_id: u32, _timeout: Duration) -> bool {
        !self.refuse_open
    }

    fn close(&mut self) {}

    fn write(&mut self, command: &str, _timeout: Duration) -> bool {
        self.commands.lock().push(command.to_string());
        true
    }
}
