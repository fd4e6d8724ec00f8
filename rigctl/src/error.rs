//! Error types for rigctl.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::protocol::Role;

/// Result type for rigctl operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for rigctl operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial read/write, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The device could not be opened. Links retry this indefinitely.
    #[error("Port {port} unavailable: {reason}")]
    PortUnavailable {
        /// Device identifier that failed to open.
        port: String,
        /// Underlying failure description.
        reason: String,
    },

    /// A line arrived on a link without the tag of the role bound to it.
    #[error("Wrong port for {role}: {line:?}")]
    ProtocolViolation {
        /// Role of the link that delivered the line.
        role: Role,
        /// The offending line.
        line: String,
    },

    /// Master and Target resolved to the same device.
    #[error("Master and Target are both bound to {device}")]
    CrossWiring {
        /// The shared device identifier.
        device: String,
    },

    /// No device is selected for a role.
    #[error("No port selected for {0}")]
    NoPortSelected(Role),

    /// The external tool could not build the DFU package.
    #[error("Failed to create DFU package: {0}")]
    FlashPackaging(String),

    /// The external tool could not upload the package.
    #[error("Failed to upload firmware: {0}")]
    FlashUpload(String),

    /// A flash job is already in flight.
    #[error("A flash job is already running")]
    FlashBusy,

    /// Firmware image does not exist.
    #[error("Firmware file not found: {}", .0.display())]
    FirmwareNotFound(PathBuf),

    /// External flashing tool could not be located.
    #[error("Flashing tool not found: {0}")]
    ToolNotFound(String),

    /// Operation cancelled by request.
    #[error("Cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error is a transient link fault that a reconnect can clear.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(_) | Self::PortUnavailable { .. } => true,
            #[cfg(feature = "native")]
            Self::Serial(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let io = Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(io.is_transient());
        assert!(
            Error::PortUnavailable {
                port: "COM3".into(),
                reason: "busy".into()
            }
            .is_transient()
        );
        assert!(!Error::FlashBusy.is_transient());
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn test_flash_messages_carry_diagnostics() {
        let err = Error::FlashUpload("timeout waiting for ack".into());
        assert_eq!(
            err.to_string(),
            "Failed to upload firmware: timeout waiting for ack"
        );
        let err = Error::ProtocolViolation {
            role: Role::Target,
            line: "Master: READY".into(),
        };
        assert!(err.to_string().contains("target"));
    }
}
