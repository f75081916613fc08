//! Topics and payloads carried by the event bus
//!
//! Every topic key has exactly one payload shape. The string keys are kept for
//! interoperability with consumers that only know the wire names.

use super::BusError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;

/// Bus topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// Human-readable log line (`log:line`)
    LogLine,
    /// Serial connection state change (`conn:state`)
    ConnState,
    /// Result of a discovery scan (`scan:result`)
    ScanResult,
}

impl Topic {
    /// Every known topic
    pub const ALL: [Topic; 3] = [Topic::LogLine, Topic::ConnState, Topic::ScanResult];

    /// Wire name of the topic
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LogLine => "log:line",
            Self::ConnState => "conn:state",
            Self::ScanResult => "scan:result",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| BusError::UnknownTopic(s.to_string()))
    }
}

/// Serial connection state, owned by `SerialConnection`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    /// Whether a session is open
    pub connected: bool,
    /// Port of the session, if known
    pub port: Option<String>,
}

impl ConnectionState {
    /// Connected to `port`
    pub fn connected(port: impl Into<String>) -> Self {
        Self {
            connected: true,
            port: Some(port.into()),
        }
    }

    /// Not connected
    pub fn disconnected(port: Option<String>) -> Self {
        Self {
            connected: false,
            port,
        }
    }
}

/// Outcome of one discovery scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    /// Every device name the OS reported
    pub ports: Vec<String>,
    /// The first port that answered the probe
    pub best: Option<String>,
}

/// Event published on the bus
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// `log:line` payload
    LogLine(String),
    /// `conn:state` payload
    ConnState(ConnectionState),
    /// `scan:result` payload
    ScanResult(ScanReport),
}

impl Event {
    /// Log line event
    pub fn log(line: impl Into<String>) -> Self {
        Self::LogLine(line.into())
    }

    /// Topic this event is published on
    pub fn topic(&self) -> Topic {
        match self {
            Self::LogLine(_) => Topic::LogLine,
            Self::ConnState(_) => Topic::ConnState,
            Self::ScanResult(_) => Topic::ScanResult,
        }
    }

    /// Log text, if this is a `log:line` event
    pub fn as_log_line(&self) -> Option<&str> {
        match self {
            Self::LogLine(line) => Some(line),
            _ => None,
        }
    }

    /// Payload in its stable JSON shape
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::LogLine(line) => json!(line),
            Self::ConnState(state) => json!({
                "connected": state.connected,
                "port": state.port,
            }),
            Self::ScanResult(report) => json!({
                "ports": report.ports,
                "best": report.best,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_keys() {
        for topic in Topic::ALL {
            assert_eq!(topic.as_str().parse::<Topic>().unwrap(), topic);
        }
        assert!(matches!(
            "log:lines".parse::<Topic>(),
            Err(BusError::UnknownTopic(_))
        ));
    }

    #[test]
    fn test_payload_shapes() {
        let event = Event::ConnState(ConnectionState::disconnected(None));
        assert_eq!(event.topic(), Topic::ConnState);
        assert_eq!(event.to_json(), json!({"connected": false, "port": null}));

        let event = Event::ScanResult(ScanReport {
            ports: vec!["COM3".into(), "COM4".into()],
            best: Some("COM4".into()),
        });
        assert_eq!(
            event.to_json(),
            json!({"ports": ["COM3", "COM4"], "best": "COM4"})
        );

        assert_eq!(Event::log("hello").to_json(), json!("hello"));
    }
}
