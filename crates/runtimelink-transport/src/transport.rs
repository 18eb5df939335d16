use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Lifecycle of a single transport instance.
///
/// `Ready` is entered at most once. `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportState {
    Setup,
    Preparing,
    Ready,
    /// Transient trouble; treated as a precursor to `Failed`.
    Waiting(String),
    Failed(String),
    Cancelled,
}

impl TransportState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportState::Failed(_) | TransportState::Cancelled)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportState::Setup => f.write_str("setup"),
            TransportState::Preparing => f.write_str("preparing"),
            TransportState::Ready => f.write_str("ready"),
            TransportState::Waiting(reason) => write!(f, "waiting ({reason})"),
            TransportState::Failed(reason) => write!(f, "failed ({reason})"),
            TransportState::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Receives raw bytes from the transport's reader thread.
pub type BytesCallback = Box<dyn FnMut(&[u8]) + Send>;

/// Observes every state transition.
pub type StateCallback = Box<dyn FnMut(&TransportState) + Send>;

/// A bidirectional byte channel.
///
/// Transports never parse messages. Received bytes are pushed to the
/// `on_bytes` callback in arrival order from a single reader context.
pub trait Transport: Send + Sync {
    /// Short human-readable label used in logs.
    fn name(&self) -> &str;

    /// Install the byte sink. Must be called before `start()`.
    fn on_bytes(&self, callback: BytesCallback);

    /// Install the state observer. Must be called before `start()`.
    fn on_state_change(&self, callback: StateCallback);

    /// Begin reading. Fails with `AlreadyStarted` on a second call.
    fn start(&self) -> Result<()>;

    /// Write all of `bytes`, blocking until the write completes.
    fn send(&self, bytes: &[u8]) -> Result<()>;

    /// Close the underlying handles. Idempotent.
    fn stop(&self);

    fn state(&self) -> TransportState;
}

type Closer = Box<dyn FnOnce() + Send>;

struct Shared {
    name: String,
    state: Mutex<TransportState>,
    on_bytes: Mutex<Option<BytesCallback>>,
    on_state: Mutex<Option<StateCallback>>,
    stopping: AtomicBool,
}

impl Shared {
    fn transition(&self, next: TransportState) {
        {
            let mut state = lock(&self.state);
            if state.is_terminal() || *state == next {
                return;
            }
            *state = next.clone();
        }
        match &next {
            TransportState::Failed(reason) => warn!(transport = %self.name, %reason, "transport failed"),
            other => debug!(transport = %self.name, state = %other, "transport state"),
        }
        if let Some(callback) = lock(&self.on_state).as_mut() {
            callback(&next);
        }
    }
}

/// A transport over an already-connected pair of blocking byte streams.
///
/// Every concrete transport in this crate ends up here once its socket or
/// pipe is connected: TCP and loopback sockets pass a cloned stream for each
/// direction, the stdio transport passes two independent handles.
pub struct StreamTransport {
    shared: Arc<Shared>,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    closer: Mutex<Option<Closer>>,
    reader_thread: Mutex<Option<JoinHandle<()>>>,
    join_on_stop: bool,
}

impl StreamTransport {
    /// Wrap a reader/writer pair. `closer` must unblock a pending read on
    /// `reader` (for sockets, `shutdown(Both)`).
    pub fn new(
        name: impl Into<String>,
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        closer: Option<Closer>,
    ) -> Self {
        let join_on_stop = closer.is_some();
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(TransportState::Setup),
                on_bytes: Mutex::new(None),
                on_state: Mutex::new(None),
                stopping: AtomicBool::new(false),
            }),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closer: Mutex::new(closer),
            reader_thread: Mutex::new(None),
            join_on_stop,
        }
    }

    fn read_loop(shared: Arc<Shared>, mut reader: Box<dyn Read + Send>) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    info!(transport = %shared.name, "peer closed");
                    shared.transition(TransportState::Cancelled);
                    return;
                }
                Ok(n) => {
                    if let Some(callback) = lock(&shared.on_bytes).as_mut() {
                        callback(&buf[..n]);
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err)
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
                        && !shared.stopping.load(Ordering::Acquire) =>
                {
                    continue
                }
                Err(err) => {
                    if shared.stopping.load(Ordering::Acquire) {
                        shared.transition(TransportState::Cancelled);
                    } else {
                        shared.transition(TransportState::Failed(err.to_string()));
                    }
                    return;
                }
            }
        }
    }
}

impl Transport for StreamTransport {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn on_bytes(&self, callback: BytesCallback) {
        *lock(&self.shared.on_bytes) = Some(callback);
    }

    fn on_state_change(&self, callback: StateCallback) {
        *lock(&self.shared.on_state) = Some(callback);
    }

    fn start(&self) -> Result<()> {
        let reader = lock(&self.reader).take().ok_or(TransportError::AlreadyStarted)?;
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        self.shared.transition(TransportState::Preparing);
        self.shared.transition(TransportState::Ready);

        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name(format!("{}-reader", self.shared.name))
            .spawn(move || Self::read_loop(shared, reader));
        match spawned {
            Ok(handle) => {
                *lock(&self.reader_thread) = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.transition(TransportState::Failed(err.to_string()));
                Err(TransportError::Io(err))
            }
        }
    }

    fn send(&self, bytes: &[u8]) -> Result<()> {
        if self.shared.stopping.load(Ordering::Acquire) || lock(&self.shared.state).is_terminal() {
            return Err(TransportError::NotConnected);
        }
        let mut guard = lock(&self.writer);
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let mut offset = 0usize;
        while offset < bytes.len() {
            match writer.write(&bytes[offset..]) {
                Ok(0) => return Err(TransportError::NotConnected),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(_) if self.shared.stopping.load(Ordering::Acquire) => {
                    return Err(TransportError::NotConnected)
                }
                Err(err) => {
                    drop(guard);
                    self.shared.transition(TransportState::Failed(err.to_string()));
                    return Err(TransportError::Io(err));
                }
            }
        }
        loop {
            match writer.flush() {
                Ok(()) => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
        debug!(transport = %self.shared.name, bytes = bytes.len(), "sent");
        Ok(())
    }

    fn stop(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(transport = %self.shared.name, "stopping");
        // The closer is what unblocks a send stuck in `write`, so it runs
        // before the writer lock is touched.
        if let Some(close) = lock(&self.closer).take() {
            close();
        }
        match self.writer.try_lock() {
            Ok(mut writer) => drop(writer.take()),
            Err(TryLockError::Poisoned(poisoned)) => drop(poisoned.into_inner().take()),
            Err(TryLockError::WouldBlock) => {
                debug!(transport = %self.shared.name, "send in flight, writer released on return")
            }
        }
        let handle = lock(&self.reader_thread).take();
        if let Some(handle) = handle {
            let on_reader = handle.thread().id() == std::thread::current().id();
            if self.join_on_stop && !on_reader {
                let _ = handle.join();
            }
        }
        self.shared.transition(TransportState::Cancelled);
    }

    fn state(&self) -> TransportState {
        lock(&self.shared.state).clone()
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
