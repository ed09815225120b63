//! Error types for the comport library.

use thiserror::Error;

/// The main error type for port operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Opening the device failed.
    ///
    /// Carries the attempted path and the underlying OS error so callers
    /// can tell a missing device from a permission problem.
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The port has not been opened, or has already been closed.
    #[error("port is not open")]
    NotOpen,

    /// The requested line rate is not representable on this platform.
    #[error("unsupported baud rate: {0}")]
    UnsupportedBaudRate(u32),

    /// Pseudo-terminal setup (unlock or peer path resolution) failed.
    #[error("pseudo-terminal setup failed: {0}")]
    Pty(#[source] std::io::Error),
}

/// Result type alias for port operations.
pub type Result<T> = std::result::Result<T, Error>;
