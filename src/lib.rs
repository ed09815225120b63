//! # comport
//!
//! Asynchronous communication-port abstraction for byte-stream devices.
//!
//! This library provides a transport-independent port layer: it opens a
//! serial device or pseudo-terminal, performs non-blocking reads and
//! writes on a Tokio reactor, buffers and redistributes received bytes to
//! a protocol-decoding consumer, and exposes a small state machine with
//! safe concurrent teardown.
//!
//! ## Features
//!
//! - One uniform [`Port`] contract for all transports, with a serial/TTY
//!   implementation ([`TtyPort`]) including pseudo-terminal support
//! - Background read loop with strictly ordered delivery to a
//!   [`DataHandler`]
//! - Lock-free liveness flag gating writes from any thread
//! - Two-phase close that cancels and awaits the in-flight read before
//!   releasing the device
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use comport::{DataHandler, Port, TtyPort};
//!
//! struct Printer;
//!
//! impl DataHandler for Printer {
//!     fn on_data_received(&self, data: &[u8]) {
//!         println!("got {} bytes", data.len());
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), comport::Error> {
//!     let reactor = tokio::runtime::Handle::current();
//!     let mut port = TtyPort::new(reactor, Arc::new(Printer), None);
//!
//!     port.open("/dev/ttyUSB0", 115_200).await?;
//!     let sent = port.write(b"PING").await;
//!     println!("wrote {sent} bytes");
//!
//!     port.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`port`] - The [`Port`] contract, state types and the buffering layer
//! - [`port::tty`] - The serial/TTY transport driving the read loop
//! - [`handler`] - Consumer contracts ([`DataHandler`], [`PortListener`])
//! - [`error`] - Error types

pub mod error;
pub mod handler;
pub mod port;

// Re-exports for convenience
pub use error::{Error, Result};
pub use handler::{DataHandler, PortListener};
pub use port::{
    BufferedPort, DEFAULT_WRITE_TIMEOUT, Port, PortConfig, PortState, TtyPort, WaitResult,
    list_ports,
};
