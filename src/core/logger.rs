//! Process logging
//!
//! `tracing` records go to stderr and, when a folder is configured, to
//! `app_<timestamp>.log` in that folder. Bus log lines can be mirrored into
//! the log file.

use crate::config::LoggingConfig;
use crate::core::bus::{EventBus, SubscriptionId, Topic};
use chrono::{DateTime, Local};
use std::path::PathBuf;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Target of mirrored bus lines
pub const BUS_TARGET: &str = "benchlink::bus";

/// Logging setup errors
#[derive(Error, Debug)]
pub enum LoggingError {
    /// Filter directive did not parse
    #[error("Invalid log filter: {0}")]
    Filter(String),

    /// A global subscriber is already set
    #[error("Logging already initialized: {0}")]
    Init(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Keeps the file writer alive; drop it last
pub struct LogHandle {
    file: Option<PathBuf>,
    _guard: Option<WorkerGuard>,
}

impl LogHandle {
    /// Log file being written, if any
    pub fn file(&self) -> Option<&PathBuf> {
        self.file.as_ref()
    }
}

/// File name for a run started at `started`
pub fn log_file_name(started: DateTime<Local>) -> String {
    format!("app_{}.log", started.format("%Y%m%d-%H%M%S"))
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Install the global subscriber
///
/// `RUST_LOG` overrides the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<LogHandle, LoggingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| LoggingError::Filter(e.to_string()))?,
    };

    let mut layers: Vec<BoxedLayer> = Vec::new();
    // bus lines go to the log file only
    let console = filter_fn(|meta| meta.target() != BUS_TARGET);
    layers.push(if config.json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(console)
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(console)
            .boxed()
    });

    let mut file = None;
    let mut guard = None;
    if let Some(folder) = &config.folder {
        std::fs::create_dir_all(folder)?;
        let name = log_file_name(Local::now());
        let appender = tracing_appender::rolling::never(folder, &name);
        let (writer, worker_guard) = tracing_appender::non_blocking(appender);
        layers.push(if config.json {
            fmt::layer().json().with_writer(writer).boxed()
        } else {
            fmt::layer().with_ansi(false).with_writer(writer).boxed()
        });
        file = Some(folder.join(name));
        guard = Some(worker_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    if let Some(path) = &file {
        tracing::info!("Logging to {}", path.display());
    }
    Ok(LogHandle {
        file,
        _guard: guard,
    })
}

/// Re-emit every `log:line` event as an info record under [`BUS_TARGET`]
pub fn mirror_bus_log(bus: &EventBus) -> SubscriptionId {
    bus.subscribe(Topic::LogLine, |event| {
        if let Some(line) = event.as_log_line() {
            tracing::info!(target: "benchlink::bus", "{}", line);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_log_file_name() {
        let started = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(log_file_name(started), "app_20240309-140507.log");
    }

    #[test]
    fn test_mirror_subscribes_to_log_lines() {
        let bus = EventBus::new();
        let id = mirror_bus_log(&bus);
        assert_eq!(bus.subscriber_count(), 1);
        bus.publish_log("hello");
        assert!(bus.flush(std::time::Duration::from_secs(1)));
        assert!(bus.unsubscribe(id));
    }
}
