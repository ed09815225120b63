//! Consumer contracts for received data and port lifecycle events.
//!
//! Both traits are implemented by the layer above the port (protocol
//! decoders, device drivers) and passed in at construction as shared
//! references. The port never owns its consumers; it only borrows them
//! for the duration of its own lifetime.

use crate::port::PortState;

/// Consumer of raw received bytes.
///
/// Called zero or more times, strictly sequentially, from the reactor's
/// execution context until the port fails or closes. No two calls for the
/// same port ever overlap. Implementations must not block: they run on the
/// reactor and anything long-running stalls every port sharing it.
pub trait DataHandler: Send + Sync {
    /// Handles one chunk of received bytes.
    ///
    /// Chunk boundaries carry no meaning; the same byte stream may arrive
    /// in any segmentation.
    fn on_data_received(&self, data: &[u8]);
}

/// Observer of port lifecycle transitions.
///
/// Implementations must not perform long-running work synchronously.
pub trait PortListener: Send + Sync {
    /// Fired after any `Ready`/`Failed` transition.
    fn on_port_state_changed(&self, state: PortState);

    /// Human-readable side channel for asynchronous read failures.
    ///
    /// The OS error behind a `Ready` → `Failed` transition is reported
    /// here; callers of `write` only ever observe the state change.
    fn on_port_error(&self, _message: &str) {}
}
