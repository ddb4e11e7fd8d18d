/// Error taxonomy for the time-lapse controller
///
/// Every user-facing operation returns one of these; the control panel turns
/// them into notices instead of letting them escape.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AutosliceError {
    /// No port enumerated, or the selection is empty / a placeholder.
    #[error("{0}")]
    PortUnavailable(String),

    #[error("Failed to connect to {port}: {reason}")]
    ConnectionFailure { port: String, reason: String },

    /// Write or read error on an established connection.
    #[error("Serial transport error: {0}")]
    TransportFailure(String),

    #[error("Arduino is not connected.")]
    NotConnected,

    #[error("{0}")]
    Configuration(String),

    #[error("Capture to {} failed: {reason}", path.display())]
    CaptureFailure { path: PathBuf, reason: String },

    #[error("Motor command '{command}' failed: {reason}")]
    MotorCommandFailure { command: String, reason: String },

    #[error("Preview failed: {0}")]
    PreviewFailure(String),

    /// A run is active, or a second run was requested.
    #[error("{0}")]
    Busy(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AutosliceError>;
