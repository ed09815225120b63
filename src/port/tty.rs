//! Serial/TTY transport implementation.
//!
//! [`TtyPort`] implements the [`Port`] contract over a serial device or a
//! pseudo-terminal. The stream is split into halves: the read half is owned
//! by a single read loop spawned on the port's reactor, the write half is
//! shared behind a mutex so writes may originate from any task. The one
//! piece of state shared between the two contexts is the relaxed-atomic
//! liveness flag; a stale load costs at most one failed operation.

use std::future::Future;
use std::io;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::error::{Error, Result};
use crate::handler::{DataHandler, PortListener};
use crate::port::{
    BufferedPort, DEFAULT_WRITE_TIMEOUT, Port, PortConfig, PortState, READ_BUFFER_SIZE, WaitResult,
};

use super::sys::Descriptor;

/// Open-sequencing phase, private to the port. The cross-context liveness
/// signal lives in the shared atomic flag, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unopened,
    Connecting,
    Opened,
}

/// Serial/TTY port driven by an explicit reactor.
///
/// The reactor handle is passed in at construction rather than taken from
/// ambient context, so independent reactors can drive independent ports
/// (and tests can run several side by side).
pub struct TtyPort {
    reactor: Handle,
    handler: Arc<dyn DataHandler>,
    listener: Option<Arc<dyn PortListener>>,
    buffer: Arc<BufferedPort>,
    valid: Arc<AtomicBool>,
    phase: Phase,
    write_timeout: Duration,
    writer: Mutex<Option<WriteHalf<SerialStream>>>,
    descriptor: Option<Descriptor>,
    read_task: Option<JoinHandle<()>>,
}

impl TtyPort {
    /// Creates an idle port.
    ///
    /// `handler` receives every chunk of read bytes; `listener`, if given,
    /// is notified on state transitions. Both must outlive the port, which
    /// the shared references guarantee.
    #[must_use]
    pub fn new(
        reactor: Handle,
        handler: Arc<dyn DataHandler>,
        listener: Option<Arc<dyn PortListener>>,
    ) -> Self {
        let buffer = Arc::new(BufferedPort::new(Arc::clone(&handler)));
        Self {
            reactor,
            handler,
            listener,
            buffer,
            valid: Arc::new(AtomicBool::new(false)),
            phase: Phase::Unopened,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            writer: Mutex::new(None),
            descriptor: None,
            read_task: None,
        }
    }

    /// Opens the device described by `config`.
    ///
    /// Equivalent to [`Port::open`] but with the write timeout taken from
    /// the configuration instead of the default.
    pub async fn open_config(&mut self, config: &PortConfig) -> Result<()> {
        if self.read_task.is_some() {
            self.close_inner().await;
        }

        self.write_timeout = config.write_timeout;
        self.phase = Phase::Connecting;

        let stream = {
            // Register the stream with this port's reactor, not whichever
            // runtime happens to be current.
            let _reactor = self.reactor.enter();
            tokio_serial::new(&config.path, config.baud_rate).open_native_async()
        };
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                self.phase = Phase::Unopened;
                return Err(open_error(&config.path, e));
            }
        };

        tracing::info!("opened {} at {} baud", config.path, config.baud_rate);
        self.attach(stream);
        Ok(())
    }

    /// Opens a pseudo-terminal master and returns the peer path a
    /// counterpart can open.
    ///
    /// The master is unlocked and its peer resolved before the read loop is
    /// armed; otherwise this behaves exactly like an `open`.
    #[cfg(unix)]
    pub async fn open_pseudo(&mut self) -> Result<String> {
        const PTMX: &str = "/dev/ptmx";

        if self.read_task.is_some() {
            self.close_inner().await;
        }

        self.phase = Phase::Connecting;

        let stream = {
            let _reactor = self.reactor.enter();
            tokio_serial::new(PTMX, 9600).open_native_async()
        };
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                self.phase = Phase::Unopened;
                return Err(open_error(PTMX, e));
            }
        };

        let peer = match descriptor_of(&stream).unlock_pty() {
            Ok(peer) => peer,
            Err(e) => {
                self.phase = Phase::Unopened;
                return Err(Error::Pty(e));
            }
        };

        tracing::info!("opened pseudo-terminal, peer {peer}");
        self.attach(stream);
        Ok(peer)
    }

    /// Transitions to `Ready`: splits the stream, arms the read loop and
    /// notifies the listener. Called only with no read loop running.
    fn attach(&mut self, stream: SerialStream) {
        let descriptor = descriptor_of(&stream);
        let (reader, writer) = tokio::io::split(stream);

        self.buffer.reset();
        *self.writer.get_mut() = Some(writer);
        self.descriptor = Some(descriptor);
        self.valid.store(true, Ordering::Relaxed);
        self.phase = Phase::Opened;

        let task = self.reactor.spawn(run_read_loop(
            reader,
            Arc::clone(&self.buffer),
            Arc::clone(&self.valid),
            self.listener.clone(),
        ));
        self.read_task = Some(task);

        if let Some(listener) = &self.listener {
            listener.on_port_state_changed(PortState::Ready);
        }
    }

    /// Two-phase teardown: suspend forwarding, cancel the read and wait for
    /// the cancellation to land, release the device, finalize.
    async fn close_inner(&mut self) {
        self.buffer.begin_close();

        if let Some(task) = self.read_task.take() {
            task.abort();
            // The reactor may still be running the read completion; wait
            // until it has observed the cancellation before releasing the
            // handle underneath it.
            let _ = task.await;
        }

        self.valid.store(false, Ordering::Relaxed);
        *self.writer.get_mut() = None;
        self.descriptor = None;
        self.phase = Phase::Unopened;

        self.buffer.end_close();
    }

    /// Returns the data handler this port forwards to.
    #[must_use]
    pub fn handler(&self) -> &Arc<dyn DataHandler> {
        &self.handler
    }
}

impl Port for TtyPort {
    fn open<'a>(
        &'a mut self,
        path: &'a str,
        baud_rate: u32,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let config = PortConfig::new(path, baud_rate).write_timeout(self.write_timeout);
            self.open_config(&config).await
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.close_inner())
    }

    fn write<'a>(&'a self, data: &'a [u8]) -> Pin<Box<dyn Future<Output = usize> + Send + 'a>> {
        Box::pin(async move {
            if !self.valid.load(Ordering::Relaxed) {
                return 0;
            }

            let mut writer = self.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                return 0;
            };

            write_bounded(writer, data, self.write_timeout).await
        })
    }

    fn wait_write(
        &self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = WaitResult> + Send + '_>> {
        Box::pin(async move {
            if !self.valid.load(Ordering::Relaxed) {
                return WaitResult::Failed;
            }

            let mut writer = self.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                return WaitResult::Failed;
            };

            // An empty write completes only once the descriptor reports
            // writable, which probes readiness without transferring bytes.
            let probe = futures::future::poll_fn(|cx| Pin::new(&mut *writer).poll_write(cx, &[]));
            match tokio::time::timeout(timeout, probe).await {
                Ok(Ok(_)) => WaitResult::Ready,
                Ok(Err(_)) => WaitResult::Failed,
                Err(_) => WaitResult::Timeout,
            }
        })
    }

    fn flush(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if !self.valid.load(Ordering::Relaxed) {
                return;
            }

            if let Some(descriptor) = self.descriptor {
                if let Err(e) = descriptor.flush_input() {
                    tracing::debug!("input flush failed: {}", e);
                }
            }
            self.buffer.flush();
        })
    }

    fn drain(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            if !self.valid.load(Ordering::Relaxed) {
                return false;
            }
            let Some(descriptor) = self.descriptor else {
                return false;
            };

            // tcdrain blocks until physical transmission completes; keep it
            // off the reactor thread.
            self.reactor
                .spawn_blocking(move || descriptor.drain())
                .await
                .unwrap_or(false)
        })
    }

    fn state(&self) -> PortState {
        match self.phase {
            Phase::Unopened => PortState::Unknown,
            Phase::Connecting => PortState::Connecting,
            Phase::Opened => {
                if self.valid.load(Ordering::Relaxed) {
                    PortState::Ready
                } else {
                    PortState::Failed
                }
            }
        }
    }

    fn baud_rate(&self) -> u32 {
        self.descriptor.map_or(0, Descriptor::baud_rate)
    }

    fn set_baud_rate(&self, rate: u32) -> Result<()> {
        let Some(descriptor) = self.descriptor else {
            return Err(Error::NotOpen);
        };
        descriptor.set_baud_rate(rate).map_err(|e| {
            if e.kind() == io::ErrorKind::Unsupported {
                Error::UnsupportedBaudRate(rate)
            } else {
                Error::Io(e)
            }
        })
    }
}

impl Drop for TtyPort {
    fn drop(&mut self) {
        // Best-effort teardown when close() was never called. The aborted
        // task only holds Arc clones, so nothing dangles; begin_close still
        // guarantees no forwarding call outlives this point.
        self.buffer.begin_close();
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

/// The per-port read loop: one read outstanding at any time. Each
/// completion either forwards and re-arms, or marks the port failed and
/// stops. Cancellation (task abort) drops the loop at the await point
/// without touching any state.
async fn run_read_loop(
    mut reader: ReadHalf<SerialStream>,
    buffer: Arc<BufferedPort>,
    valid: Arc<AtomicBool>,
    listener: Option<Arc<dyn PortListener>>,
) {
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("device closed");
                read_failed(&valid, listener.as_deref(), None);
                return;
            }
            Ok(n) => {
                tracing::trace!("received {} bytes", n);
                if !buffer.data_received(&buf[..n]) {
                    // Close sequence has begun; stop without touching state.
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::error!("serial read error: {}", e);
                read_failed(&valid, listener.as_deref(), Some(&e.to_string()));
                return;
            }
        }
    }
}

/// Writes with a bounded wait for writability.
///
/// The write future parks until the device is writable, so the timeout
/// subsumes the wait-then-retry policy for a full output fifo. Still
/// blocked at the deadline or errored reads as 0 bytes; retry policy
/// belongs to the caller.
async fn write_bounded<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
    timeout: Duration,
) -> usize {
    match tokio::time::timeout(timeout, writer.write(data)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            tracing::warn!("serial write error: {}", e);
            0
        }
        Err(_) => {
            tracing::debug!("write blocked for {timeout:?}, giving up");
            0
        }
    }
}

/// Marks the port failed from the read path and notifies the listener.
/// The read loop never re-arms after this.
fn read_failed(valid: &AtomicBool, listener: Option<&dyn PortListener>, message: Option<&str>) {
    valid.store(false, Ordering::Relaxed);
    if let Some(listener) = listener {
        listener.on_port_state_changed(PortState::Failed);
        if let Some(message) = message {
            listener.on_port_error(message);
        }
    }
}

#[cfg(unix)]
fn descriptor_of(stream: &SerialStream) -> Descriptor {
    Descriptor::new(stream.as_raw_fd())
}

#[cfg(not(unix))]
fn descriptor_of(_stream: &SerialStream) -> Descriptor {
    Descriptor
}

fn open_error(path: &str, e: tokio_serial::Error) -> Error {
    let source = match e.kind {
        tokio_serial::ErrorKind::NoDevice => io::Error::new(io::ErrorKind::NotFound, e.description),
        tokio_serial::ErrorKind::InvalidInput => {
            io::Error::new(io::ErrorKind::InvalidInput, e.description)
        }
        tokio_serial::ErrorKind::Io(kind) => io::Error::new(kind, e.description),
        tokio_serial::ErrorKind::Unknown => io::Error::other(e.description),
    };
    Error::Open {
        path: path.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;
    use std::task::{Context, Poll};

    /// Writer whose output fifo stays full until `release` fires; with no
    /// release it blocks forever.
    struct BlockedWriter {
        release: Option<Pin<Box<tokio::time::Sleep>>>,
    }

    impl AsyncWrite for BlockedWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let this = self.get_mut();
            match this.release.as_mut() {
                Some(release) => match release.as_mut().poll(cx) {
                    Poll::Ready(()) => Poll::Ready(Ok(buf.len())),
                    Poll::Pending => Poll::Pending,
                },
                None => Poll::Pending,
            }
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Writer whose device has gone away.
    struct BrokenWriter;

    impl AsyncWrite for BrokenWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_write_completes_once_writable() {
        // Full fifo that drains after 50 ms, well inside the timeout.
        let mut writer = BlockedWriter {
            release: Some(Box::pin(tokio::time::sleep(Duration::from_millis(50)))),
        };

        let started = tokio::time::Instant::now();
        let n = write_bounded(&mut writer, b"PING", DEFAULT_WRITE_TIMEOUT).await;
        let elapsed = started.elapsed();

        assert_eq!(n, 4, "full byte count once writability arrives");
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < DEFAULT_WRITE_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_write_gives_up_at_deadline() {
        let mut writer = BlockedWriter { release: None };

        let started = tokio::time::Instant::now();
        let n = write_bounded(&mut writer, b"PING", Duration::from_millis(100)).await;

        assert_eq!(n, 0, "still-blocked write reads as zero bytes");
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_write_error_reads_as_zero_bytes() {
        let mut writer = BrokenWriter;
        assert_eq!(write_bounded(&mut writer, b"PING", DEFAULT_WRITE_TIMEOUT).await, 0);
    }

    #[derive(Default)]
    struct RecordingHandler {
        chunks: StdMutex<Vec<Vec<u8>>>,
    }

    impl DataHandler for RecordingHandler {
        fn on_data_received(&self, data: &[u8]) {
            self.chunks.lock().unwrap().push(data.to_vec());
        }
    }

    #[derive(Default)]
    struct CountingListener {
        changes: StdMutex<Vec<PortState>>,
        errors: AtomicUsize,
    }

    impl PortListener for CountingListener {
        fn on_port_state_changed(&self, state: PortState) {
            self.changes.lock().unwrap().push(state);
        }

        fn on_port_error(&self, _message: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn idle_port() -> (TtyPort, Arc<RecordingHandler>) {
        let handler = Arc::new(RecordingHandler::default());
        let port = TtyPort::new(
            Handle::current(),
            Arc::clone(&handler) as Arc<dyn DataHandler>,
            None,
        );
        (port, handler)
    }

    #[tokio::test]
    async fn test_unopened_port_reports_unknown() {
        let (port, _) = idle_port();
        assert_eq!(port.state(), PortState::Unknown);
    }

    #[tokio::test]
    async fn test_not_live_port_refuses_io() {
        let (port, _) = idle_port();

        assert_eq!(port.write(b"data").await, 0);
        assert_eq!(
            port.wait_write(Duration::from_millis(10)).await,
            WaitResult::Failed
        );
        // Flush on a non-live port is a no-op, not an error.
        port.flush().await;
        assert!(!port.drain().await);
    }

    #[tokio::test]
    async fn test_baud_rate_sentinels_when_unopened() {
        let (port, _) = idle_port();
        assert_eq!(port.baud_rate(), 0);
        assert!(matches!(port.set_baud_rate(9600), Err(Error::NotOpen)));
    }

    #[tokio::test]
    async fn test_open_missing_device_fails_with_path() {
        let (mut port, _) = idle_port();
        let err = port
            .open("/dev/does-not-exist-comport", 9600)
            .await
            .unwrap_err();
        match err {
            Error::Open { path, .. } => assert_eq!(path, "/dev/does-not-exist-comport"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(port.state(), PortState::Unknown);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pty_loopback_ping() {
        let listener = Arc::new(CountingListener::default());
        let handler = Arc::new(RecordingHandler::default());
        let mut master = TtyPort::new(
            Handle::current(),
            Arc::clone(&handler) as Arc<dyn DataHandler>,
            Some(Arc::clone(&listener) as Arc<dyn PortListener>),
        );

        let peer_path = master.open_pseudo().await.unwrap();
        assert_eq!(master.state(), PortState::Ready);
        assert_eq!(*listener.changes.lock().unwrap(), vec![PortState::Ready]);

        let (mut peer, _) = idle_port();
        peer.open(&peer_path, 9600).await.unwrap();
        assert_eq!(peer.state(), PortState::Ready);

        assert_eq!(peer.write(b"PING").await, 4);

        // Give the reactor time to run the read completion.
        let mut received = Vec::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let chunks = handler.chunks.lock().unwrap();
            if !chunks.is_empty() {
                received = chunks.clone();
                break;
            }
        }
        assert_eq!(received.len(), 1, "expected one delivery, got {received:?}");
        assert_eq!(received[0], b"PING");

        peer.close().await;
        master.close().await;
        assert_eq!(master.state(), PortState::Unknown);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_write_ready_on_live_pty() {
        let (mut master, _) = idle_port();
        let _peer_path = master.open_pseudo().await.unwrap();

        assert_eq!(
            master.wait_write(Duration::from_millis(100)).await,
            WaitResult::Ready
        );
        master.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_peer_close_marks_port_failed_once() {
        let listener = Arc::new(CountingListener::default());
        let handler = Arc::new(RecordingHandler::default());
        let mut master = TtyPort::new(
            Handle::current(),
            handler as Arc<dyn DataHandler>,
            Some(Arc::clone(&listener) as Arc<dyn PortListener>),
        );

        let peer_path = master.open_pseudo().await.unwrap();

        // Open and immediately drop the peer end; the master's next read
        // completes with closed/error and the port must fail exactly once.
        {
            let _peer = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&peer_path)
                .unwrap();
        }

        let mut failed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if master.state() == PortState::Failed {
                failed = true;
                break;
            }
        }
        assert!(failed, "port never transitioned to Failed");

        let changes = listener.changes.lock().unwrap().clone();
        assert_eq!(changes, vec![PortState::Ready, PortState::Failed]);

        // A failed port refuses writes without touching the device.
        assert_eq!(master.write(b"late").await, 0);
        assert_eq!(
            master.wait_write(Duration::from_millis(10)).await,
            WaitResult::Failed
        );

        master.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_baud_rate_round_trip_on_pty() {
        let (mut master, _) = idle_port();
        let _peer_path = master.open_pseudo().await.unwrap();

        master.set_baud_rate(9600).unwrap();
        assert_eq!(master.baud_rate(), 9600);

        // A rate outside the termios table is rejected, not applied.
        assert!(matches!(
            master.set_baud_rate(12_345),
            Err(Error::UnsupportedBaudRate(12_345))
        ));
        assert_eq!(master.baud_rate(), 9600);

        master.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_silences_handler_and_listener() {
        let listener = Arc::new(CountingListener::default());
        let handler = Arc::new(RecordingHandler::default());
        let mut master = TtyPort::new(
            Handle::current(),
            Arc::clone(&handler) as Arc<dyn DataHandler>,
            Some(Arc::clone(&listener) as Arc<dyn PortListener>),
        );

        let peer_path = master.open_pseudo().await.unwrap();
        master.close().await;
        assert_eq!(master.state(), PortState::Unknown);

        // Writes racing the close observe a dead port.
        assert_eq!(master.write(b"x").await, 0);

        // Nothing may land after close() returned, even though the peer
        // path no longer leads anywhere.
        let calls_after_close = handler.chunks.lock().unwrap().len();
        let changes_after_close = listener.changes.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.chunks.lock().unwrap().len(), calls_after_close);
        assert_eq!(listener.changes.lock().unwrap().len(), changes_after_close);
        drop(peer_path);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reopen_after_failure() {
        let (mut master, _) = idle_port();
        let _first = master.open_pseudo().await.unwrap();
        // Reopen without an explicit close; the port tears the old device
        // down first.
        let _second = master.open_pseudo().await.unwrap();
        assert_eq!(master.state(), PortState::Ready);
        master.close().await;
    }
}
