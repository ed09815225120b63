//! Buffering layer between a transport's raw reads and the [`DataHandler`].
//!
//! A transport delivers bytes in whatever chunks the device produced;
//! [`BufferedPort`] forwards them in order, decoupling the transport's
//! chunk boundaries from the decoder above. While forwarding is paused
//! (a foreground consumer has taken over the stream, see
//! [`BufferedPort::pause`]) incoming bytes accumulate as a backlog and are
//! delivered as one chunk on resume. It also owns the close-sequencing
//! protocol: forwarding and [`BufferedPort::begin_close`] take the same
//! lock, so once `begin_close` returns no forwarding call is in flight and
//! none will start, even if the transport's pending read completes
//! afterwards.

use std::sync::Arc;
use std::sync::Mutex;

use bytes::BytesMut;

use crate::handler::DataHandler;

struct Inner {
    pending: BytesMut,
    paused: bool,
    closed: bool,
}

/// Redistribution layer between raw transport reads and the data handler.
pub struct BufferedPort {
    handler: Arc<dyn DataHandler>,
    inner: Mutex<Inner>,
}

impl BufferedPort {
    /// Creates a buffering layer forwarding to the given handler.
    #[must_use]
    pub fn new(handler: Arc<dyn DataHandler>) -> Self {
        Self {
            handler,
            inner: Mutex::new(Inner {
                pending: BytesMut::new(),
                paused: false,
                closed: false,
            }),
        }
    }

    /// Accepts one chunk delivered by the transport.
    ///
    /// Returns `false` when the chunk must not be accepted: either the
    /// close sequence has begun, or the chunk is zero-length (a closed or
    /// failed connection, not data). The transport stops its read loop on
    /// `false`. While paused the bytes are retained instead of forwarded;
    /// the port stays live.
    ///
    /// Forwarding happens under the internal lock, which is what makes the
    /// per-port ordering guarantee hold: calls to the handler never
    /// interleave or re-enter.
    pub fn data_received(&self, data: &[u8]) -> bool {
        let mut inner = self.inner.lock().expect("buffered port lock poisoned");

        if inner.closed || data.is_empty() {
            return false;
        }

        inner.pending.extend_from_slice(data);

        if !inner.paused {
            let chunk = inner.pending.split();
            self.handler.on_data_received(&chunk);
        }

        true
    }

    /// Suspends forwarding; subsequent deliveries accumulate as a backlog.
    pub fn pause(&self) {
        let mut inner = self.inner.lock().expect("buffered port lock poisoned");
        inner.paused = true;
    }

    /// Resumes forwarding, delivering any backlog as one in-order chunk.
    pub fn resume(&self) {
        let mut inner = self.inner.lock().expect("buffered port lock poisoned");
        inner.paused = false;
        if !inner.closed && !inner.pending.is_empty() {
            let chunk = inner.pending.split();
            self.handler.on_data_received(&chunk);
        }
    }

    /// Discards any buffered unread input.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().expect("buffered port lock poisoned");
        inner.pending.clear();
    }

    /// First phase of shutdown: suspends forwarding.
    ///
    /// When this returns, any forwarding call that was in flight has
    /// completed and no further one can start; a paused consumer waiting on
    /// the backlog sees its deliveries refused. The transport must then
    /// cancel its pending read and wait for the cancellation before calling
    /// [`BufferedPort::end_close`].
    pub fn begin_close(&self) {
        let mut inner = self.inner.lock().expect("buffered port lock poisoned");
        inner.closed = true;
    }

    /// Final phase of shutdown: discards the backlog. The layer is inert
    /// and safe to drop after this returns.
    pub fn end_close(&self) {
        let mut inner = self.inner.lock().expect("buffered port lock poisoned");
        inner.pending.clear();
    }

    /// Re-arms the layer for a reopen of the owning port.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("buffered port lock poisoned");
        inner.pending.clear();
        inner.paused = false;
        inner.closed = false;
    }

    /// Returns the number of backlogged bytes.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.inner
            .lock()
            .expect("buffered port lock poisoned")
            .pending
            .len()
    }
}
