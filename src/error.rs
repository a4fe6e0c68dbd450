//! # Error Module
//!
//! This module provides the error types for the `usbserial` crate.
//! It uses the `thiserror` crate for ergonomic error handling.

use thiserror::Error;

/// Result type alias for `usbserial` operations.
pub type Result<T> = std::result::Result<T, PortError>;

/// Main error type for serial port operations.
#[derive(Debug, Error)]
pub enum PortError {
    /// The device path is empty or otherwise unusable.
    #[error("Invalid device path")]
    InvalidPath,

    /// A port must be opened to receive, transmit, or both.
    #[error("Port must be opened to receive, transmit, or both")]
    MustReceiveOrTransmit,

    /// The OS refused to open the device node.
    #[error("Failed to open serial port '{path}': {source}")]
    FailedToOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// An I/O operation was attempted on a closed port.
    #[error("Port must be open")]
    MustBeOpen,

    /// Accumulated bytes did not form valid UTF-8.
    #[error("Strings must be UTF-8")]
    StringsMustBeUtf8,

    /// The device node vanished underneath an open handle.
    #[error("Device is not connected")]
    DeviceNotConnected,

    /// A byte outside the 7-bit ASCII range arrived in a character read.
    #[error("Unable to convert byte to character")]
    UnableToConvertByteToCharacter,

    /// A caller-supplied argument was out of range.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Applying terminal settings to the handle failed.
    #[error("Failed to apply terminal settings: {0}")]
    Config(String),

    /// Raw read/write syscall failure.
    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PortError {
    /// Creates a new open-failure error.
    #[must_use]
    pub fn failed_to_open(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::FailedToOpen {
            path: path.into(),
            source,
        }
    }

    /// Creates a new invalid-argument error.
    #[must_use]
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Creates a new settings-apply error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_to_open_error() {
        let source = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        let error = PortError::failed_to_open("/dev/ttyUSB0", source);
        let msg = error.to_string();
        assert!(msg.contains("/dev/ttyUSB0"));
    }

    #[test]
    fn test_invalid_argument_error() {
        let error = PortError::invalid_argument("length 9 exceeds buffer size 4");
        assert!(error.to_string().contains("length 9 exceeds buffer size 4"));
    }

    #[test]
    fn test_config_error() {
        let error = PortError::config("tcsetattr failed");
        assert!(error.to_string().contains("tcsetattr failed"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        let error: PortError = io_err.into();
        assert!(matches!(error, PortError::Io(_)));
    }
}
