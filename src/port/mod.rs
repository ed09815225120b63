//! The transport-independent port contract.
//!
//! A [`Port`] is a byte-stream device with asynchronous, reactor-driven
//! reads and synchronous-feeling writes callable from any task. Concrete
//! transports (currently the serial/TTY implementation in [`tty`]) implement the
//! same operation set without touching the buffering or state-machine
//! logic in [`buffered`].

pub mod buffered;
pub mod sys;
pub mod tty;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::Result;

pub use buffered::BufferedPort;
pub use tty::TtyPort;

/// Default bounded wait applied to a write that would block.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Size of the per-read receive buffer. Received bytes are copied into the
/// buffering layer immediately; the transport retains no backlog.
pub const READ_BUFFER_SIZE: usize = 1024;

/// Observable lifecycle state of a port.
///
/// Exactly one value at any instant. Read concurrently from any thread,
/// written only by the owning port's I/O path. Once `Failed`, a port never
/// reports `Ready` again without an explicit reopen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Not yet opened.
    Unknown,
    /// An open is in progress.
    Connecting,
    /// The port is live; I/O may be attempted.
    Ready,
    /// The port failed or the peer closed; terminal until reopened.
    Failed,
}

/// Outcome of a writability wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The device is writable.
    Ready,
    /// The timeout expired before the device became writable.
    Timeout,
    /// The port is not live; no wait was attempted.
    Failed,
}

/// Configuration for opening a port.
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Device path (e.g., "/dev/ttyUSB0").
    pub path: String,
    /// Initial line rate.
    pub baud_rate: u32,
    /// Bounded wait applied when a write would block.
    pub write_timeout: Duration,
}

impl PortConfig {
    /// Creates a configuration for the given device path and baud rate.
    #[must_use]
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Sets the write timeout.
    #[must_use]
    pub const fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

/// The uniform operation set implemented by every transport.
///
/// Writes may be issued from any task or thread; they serialize internally
/// with the close sequence. Reads are never issued by callers: each
/// transport owns a single outstanding asynchronous read that feeds the
/// buffering layer until the port fails or closes.
pub trait Port: Send + Sync {
    /// Opens the device and arms the first read.
    ///
    /// On success the port reports [`PortState::Ready`] and the listener
    /// has been notified. On failure no read is armed and the port is left
    /// in a non-`Ready` state.
    ///
    /// Some Android builds first shell out (`su -c 'chmod 666 <path>'`) to
    /// make USB adapters readable before calling this; that is an external
    /// privilege-escalation collaborator, not part of this contract.
    fn open<'a>(
        &'a mut self,
        path: &'a str,
        baud_rate: u32,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Closes the port, cancelling the outstanding read and waiting for it
    /// to finish before releasing the device.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Attempts to write `data`, waiting up to the configured write timeout
    /// if the device would block.
    ///
    /// Returns the number of bytes accepted; 0 means the port is not live
    /// or the device stayed blocked. A partial count is never silently
    /// retried here; callers own retry-for-full-delivery.
    fn write<'a>(
        &'a self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = usize> + Send + 'a>>;

    /// Waits for writability without performing I/O.
    fn wait_write(
        &self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = WaitResult> + Send + '_>>;

    /// Discards unread input at the OS level and in the buffering layer.
    /// No-op if the port is not live.
    fn flush(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Blocks until all queued output has been physically transmitted.
    ///
    /// Platforms lacking the primitive report success unconditionally.
    fn drain(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;

    /// Lock-free read of the current state.
    fn state(&self) -> PortState;

    /// Queries the current line rate; 0 if the device does not support the
    /// query. Never affects [`PortState`].
    fn baud_rate(&self) -> u32;

    /// Sets the line rate. May fail independently of overall port validity
    /// and never affects [`PortState`].
    fn set_baud_rate(&self, rate: u32) -> Result<()>;
}

/// Lists available serial ports.
///
/// # Errors
///
/// Returns an error if the port list cannot be retrieved.
pub fn list_ports() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports().map_err(crate::error::Error::Serial)?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_config_defaults() {
        let config = PortConfig::new("/dev/ttyUSB0", 115_200);
        assert_eq!(config.path, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.write_timeout, DEFAULT_WRITE_TIMEOUT);
    }

    #[test]
    fn test_port_config_builder() {
        let config =
            PortConfig::new("/dev/ttyS0", 9600).write_timeout(Duration::from_millis(250));
        assert_eq!(config.write_timeout, Duration::from_millis(250));
    }

    #[test]
    #[ignore = "enumeration needs real tty device nodes"]
    fn test_list_ports_enumerates() {
        let ports = list_ports().unwrap();
        for name in ports {
            assert!(!name.is_empty());
        }
    }
}
