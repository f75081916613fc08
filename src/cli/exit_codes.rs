//! Process exit status
//!
//! Stable exit codes so scripts driving a bench can tell failures apart.

use crate::config::ConfigError;
use crate::core::capture::CaptureError;
use crate::core::hub::HubError;
use crate::core::serial::SerialError;
use std::fmt;
use std::process::ExitCode;

/// Exit status of the `benchlink` binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExitStatus {
    /// Finished normally
    Success = 0,
    /// Anything not covered below
    Error = 1,
    /// Bad command line
    InvalidArgs = 2,
    /// Serial open or write failed
    ConnectionFailed = 3,
    /// A bounded wait ran out
    Timeout = 4,
    /// The OS refused access to the port
    PermissionDenied = 7,
    /// Unreadable or invalid config file
    ConfigError = 8,
    /// Ctrl-C
    Cancelled = 11,
    /// No device answered the discovery probe
    NoResponder = 12,
    /// Port held by another session
    DeviceBusy = 13,
    /// Port not present
    PortNotFound = 14,
    /// No capture backend delivered frames
    CameraUnavailable = 18,
    /// Platform setup failed
    Internal = 127,
}

impl ExitStatus {
    /// Numeric process exit code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Short description for `--help` tables and logs
    pub fn description(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Error => "General error",
            Self::InvalidArgs => "Invalid arguments",
            Self::ConnectionFailed => "Connection failed",
            Self::Timeout => "Timeout",
            Self::PermissionDenied => "Permission denied",
            Self::ConfigError => "Configuration error",
            Self::Cancelled => "Operation cancelled",
            Self::NoResponder => "No device answered",
            Self::DeviceBusy => "Device busy",
            Self::PortNotFound => "Port not found",
            Self::CameraUnavailable => "Camera not available",
            Self::Internal => "Internal error",
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        ExitCode::from(status.code())
    }
}

impl From<&SerialError> for ExitStatus {
    fn from(err: &SerialError) -> Self {
        match err {
            SerialError::EmptyPort => Self::InvalidArgs,
            SerialError::PortNotFound(_) => Self::PortNotFound,
            SerialError::PermissionDenied(_) => Self::PermissionDenied,
            SerialError::PortBusy(_) => Self::DeviceBusy,
            SerialError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::ConnectionFailed,
        }
    }
}

impl From<&HubError> for ExitStatus {
    fn from(err: &HubError) -> Self {
        match err {
            HubError::Serial(e) => Self::from(e),
            HubError::Config(ConfigError::NoConfigDir) => Self::Internal,
            HubError::Config(_) => Self::ConfigError,
            HubError::Capture(CaptureError::UnknownBackend(_)) | HubError::UnknownCamera(_) => {
                Self::InvalidArgs
            }
            HubError::Capture(_) => Self::CameraUnavailable,
            HubError::Relay(_) | HubError::NoRelay => Self::Error,
        }
    }
}

/// What a subcommand reports back: a status and an optional line for the user
///
/// Success messages go to stdout, failure messages to stderr.
#[derive(Debug, PartialEq, Eq)]
pub struct Outcome {
    status: ExitStatus,
    message: Option<String>,
}

impl Outcome {
    /// Success, nothing to print
    pub fn ok() -> Self {
        Self {
            status: ExitStatus::Success,
            message: None,
        }
    }

    /// Success with a line for stdout
    pub fn ok_with(message: impl Into<String>) -> Self {
        Self {
            status: ExitStatus::Success,
            message: Some(message.into()),
        }
    }

    /// Failure
    pub fn fail(status: ExitStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
        }
    }

    /// Exit status
    pub fn status(&self) -> ExitStatus {
        self.status
    }

    /// Message, if any
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Whether the command succeeded
    pub fn is_success(&self) -> bool {
        self.status == ExitStatus::Success
    }
}

impl From<&SerialError> for Outcome {
    fn from(err: &SerialError) -> Self {
        Self::fail(ExitStatus::from(err), err.to_string())
    }
}

impl From<&HubError> for Outcome {
    fn from(err: &HubError) -> Self {
        Self::fail(ExitStatus::from(err), err.to_string())
    }
}

impl From<Outcome> for ExitCode {
    fn from(outcome: Outcome) -> Self {
        outcome.status.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome() {
        let done = Outcome::ok();
        assert!(done.is_success());
        assert_eq!(done.status().code(), 0);
        assert_eq!(done.message(), None);

        let failed = Outcome::fail(ExitStatus::NoResponder, "No device answered the probe");
        assert!(!failed.is_success());
        assert_eq!(failed.status().code(), 12);
        assert_eq!(failed.message(), Some("No device answered the probe"));
    }

    #[test]
    fn test_serial_errors_map_to_distinct_codes() {
        assert_eq!(
            ExitStatus::from(&SerialError::PortBusy("COM3".into())),
            ExitStatus::DeviceBusy
        );
        assert_eq!(
            ExitStatus::from(&HubError::Serial(SerialError::EmptyPort)),
            ExitStatus::InvalidArgs
        );
        assert_eq!(
            ExitStatus::from(&HubError::Config(ConfigError::Invalid("x".into()))),
            ExitStatus::ConfigError
        );
        assert_eq!(ExitStatus::CameraUnavailable.to_string(), "Camera not available (18)");
    }
}
