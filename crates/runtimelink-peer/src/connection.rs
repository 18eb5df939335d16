use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use bytes::Bytes;
use runtimelink_frame::{encode, encode_error, CodecConfig, Envelope, FrameCodec, Inbound, RemoteError};
use runtimelink_transport::{Transport, TransportError, TransportState};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{PeerError, Result};
use crate::registry::HandlerRegistry;
use crate::request::{Null, Request};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection lifecycle. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Starting,
    Running,
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Starting => "starting",
            ConnectionState::Running => "running",
            ConnectionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Connection behavior config.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub codec: CodecConfig,
    /// Upper bound on waiting for a reply. `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// How long `start()` waits for the transport to become ready.
    pub ready_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            codec: CodecConfig::default(),
            request_timeout: None,
            ready_timeout: Duration::from_secs(10),
        }
    }
}

type ReadyCallback = Box<dyn FnOnce() + Send>;
type StoppedCallback = Box<dyn FnOnce(Option<String>) + Send>;
type StateObserver = Arc<dyn Fn(ConnectionState) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_ready: Option<ReadyCallback>,
    on_stopped: Option<StoppedCallback>,
    observers: Vec<StateObserver>,
}

enum Reply {
    Envelope(Envelope),
    Error(RemoteError),
    Closed,
}

/// The single outstanding round trip, if any.
struct Pending {
    identifier: String,
    tx: mpsc::SyncSender<Reply>,
}

enum Event {
    Bytes(Vec<u8>),
    Transport(TransportState),
}

struct Inner {
    id: u64,
    transport: Arc<dyn Transport>,
    registry: Arc<HandlerRegistry>,
    config: ConnectionConfig,
    state: Mutex<ConnectionState>,
    state_changed: Condvar,
    /// Held across a state change and its observer calls so observers see
    /// transitions in order.
    transitions: Mutex<()>,
    stop_reason: Mutex<Option<String>>,
    /// Serializes sends so at most one round trip is in flight.
    flight: Mutex<()>,
    dispatch_thread: OnceLock<ThreadId>,
    pending: Mutex<Option<Pending>>,
    callbacks: Mutex<Callbacks>,
}

/// A message-oriented RPC channel over a [`Transport`].
///
/// Cloning yields another handle to the same connection. The connection
/// stops when [`Connection::stop`] is called, when the transport fails or
/// the peer closes, or when the last handle is dropped.
///
/// Handlers run one at a time on the connection's dispatch thread, in the
/// order their messages arrived. A handler may [`send`](Connection::send) or
/// [`notify`](Connection::notify) on the connection dispatching it; those
/// writes skip the single-flight guard. A [`call`](Connection::call) from a
/// handler is refused with [`PeerError::Unsupported`], since its reply could
/// only be routed by the thread that is waiting for it.
///
/// While a call is outstanding, the next envelope carrying the call's
/// identifier is taken as its reply. The wire has no request ids, so a peer
/// request that happens to reuse that identifier completes the call instead
/// of reaching the local handler. Envelopes under any other identifier are
/// dispatched as usual.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("transport", &self.inner.transport.name())
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Create a connection with its own, empty handler registry.
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        Self::with_registry(transport, Arc::new(HandlerRegistry::new()), config)
    }

    /// Create a connection that dispatches through a shared registry.
    pub fn with_registry(
        transport: Arc<dyn Transport>,
        registry: Arc<HandlerRegistry>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                transport,
                registry,
                config,
                state: Mutex::new(ConnectionState::Idle),
                state_changed: Condvar::new(),
                transitions: Mutex::new(()),
                stop_reason: Mutex::new(None),
                flight: Mutex::new(()),
                dispatch_thread: OnceLock::new(),
                pending: Mutex::new(None),
                callbacks: Mutex::new(Callbacks::default()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn transport_name(&self) -> &str {
        self.inner.transport.name()
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    /// Why the connection stopped, once it has.
    pub fn stop_reason(&self) -> Option<String> {
        lock(&self.inner.stop_reason).clone()
    }

    /// Start the transport and block until it is ready.
    pub fn start(&self) -> Result<()> {
        if !self
            .inner
            .transition_if(ConnectionState::Starting, |state| state == ConnectionState::Idle)
        {
            return Err(TransportError::AlreadyStarted.into());
        }

        let (tx, rx) = mpsc::channel();
        let bytes_tx = tx.clone();
        self.inner.transport.on_bytes(Box::new(move |bytes| {
            let _ = bytes_tx.send(Event::Bytes(bytes.to_vec()));
        }));
        self.inner.transport.on_state_change(Box::new(move |state| {
            let _ = tx.send(Event::Transport(state.clone()));
        }));

        let weak = Arc::downgrade(&self.inner);
        let codec = FrameCodec::with_config(self.inner.config.codec.clone());
        let spawned = std::thread::Builder::new()
            .name(format!("runtimelink-conn-{}", self.inner.id))
            .spawn(move || dispatch_loop(weak, rx, codec));
        match spawned {
            Ok(handle) => {
                let _ = self.inner.dispatch_thread.set(handle.thread().id());
            }
            Err(err) => {
                self.inner.shutdown(format!("dispatch thread failed: {err}"));
                return Err(TransportError::Io(err).into());
            }
        }

        if let Err(err) = self.inner.transport.start() {
            self.inner.shutdown(format!("transport start failed: {err}"));
            return Err(err.into());
        }
        self.wait_ready(self.inner.config.ready_timeout)
    }

    /// Block until the connection is running.
    pub fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let state = self.inner.wait_for(timeout, |state| {
            matches!(state, ConnectionState::Running | ConnectionState::Stopped)
        });
        match state {
            ConnectionState::Running => Ok(()),
            ConnectionState::Stopped => Err(PeerError::NotConnected),
            _ => {
                self.inner.shutdown("not ready in time".to_string());
                Err(PeerError::Timeout(timeout))
            }
        }
    }

    /// Block until the connection stops. Returns `false` on timeout.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        self.inner
            .wait_for(timeout, |state| state == ConnectionState::Stopped)
            == ConnectionState::Stopped
    }

    /// Run `callback` once when the connection becomes ready. Runs
    /// immediately if it already is.
    pub fn on_ready(&self, callback: impl FnOnce() + Send + 'static) {
        let mut callbacks = lock(&self.inner.callbacks);
        if self.state() == ConnectionState::Running {
            drop(callbacks);
            callback();
            return;
        }
        callbacks.on_ready = Some(Box::new(callback));
    }

    /// Run `callback` once when the connection stops, with the stop reason.
    /// Runs immediately if it already has.
    pub fn on_stopped(&self, callback: impl FnOnce(Option<String>) + Send + 'static) {
        let mut callbacks = lock(&self.inner.callbacks);
        if self.state() == ConnectionState::Stopped {
            drop(callbacks);
            callback(self.stop_reason());
            return;
        }
        callbacks.on_stopped = Some(Box::new(callback));
    }

    /// Observe every state transition. Observers must not start or stop
    /// the connection they observe.
    pub fn on_state_change(&self, observer: impl Fn(ConnectionState) + Send + Sync + 'static) {
        lock(&self.inner.callbacks).observers.push(Arc::new(observer));
    }

    /// Fire-and-forget: send a message without waiting for a reply.
    pub fn send<T: Serialize + ?Sized>(&self, identifier: &str, payload: &T) -> Result<()> {
        let envelope = Envelope::from_value(identifier, payload)?;
        let wire = encode(&envelope)?;
        self.inner.ensure_running()?;

        // Handler writes go straight to the transport, like handler replies.
        let _flight = (!self.inner.on_dispatch_thread()).then(|| lock(&self.inner.flight));
        self.inner.ensure_running()?;
        self.inner.transport.send(&wire)?;
        debug!(connection_id = self.inner.id, identifier, bytes = wire.len(), "sent message");
        Ok(())
    }

    /// Send a payload-less message.
    pub fn notify(&self, identifier: &str) -> Result<()> {
        self.send(identifier, &Null {})
    }

    /// Send `request` under `identifier` and wait for the reply.
    pub fn call<Req, Res>(&self, identifier: &str, request: &Req) -> Result<Res>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        self.call_with_timeout(identifier, request, self.inner.config.request_timeout)
    }

    /// [`Connection::call`] with an explicit reply timeout.
    pub fn call_with_timeout<Req, Res>(
        &self,
        identifier: &str,
        request: &Req,
        timeout: Option<Duration>,
    ) -> Result<Res>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let envelope = Envelope::from_value(identifier, request)?;
        let reply = self.round_trip(envelope, timeout)?;
        decode_reply(&reply)
    }

    /// Send a typed request and wait for its typed response.
    pub fn request<R: Request>(&self, request: &R) -> Result<R::Response> {
        self.call(R::IDENTIFIER, request)
    }

    pub fn request_with_timeout<R: Request>(
        &self,
        request: &R,
        timeout: Option<Duration>,
    ) -> Result<R::Response> {
        self.call_with_timeout(R::IDENTIFIER, request, timeout)
    }

    /// Stop the transport and fail any outstanding call. Idempotent.
    pub fn stop(&self) {
        self.inner.shutdown("stopped by caller".to_string());
    }

    fn round_trip(&self, envelope: Envelope, timeout: Option<Duration>) -> Result<Bytes> {
        if self.inner.on_dispatch_thread() {
            return Err(PeerError::Unsupported(format!(
                "request {:?} issued from a handler of the same connection",
                envelope.identifier
            )));
        }
        let wire = encode(&envelope)?;
        self.inner.ensure_running()?;

        let _flight = lock(&self.inner.flight);
        let (tx, rx) = mpsc::sync_channel(1);
        *lock(&self.inner.pending) = Some(Pending {
            identifier: envelope.identifier.clone(),
            tx,
        });
        // A stop that happened before the slot was filled would never
        // resolve it.
        if let Err(err) = self.inner.ensure_running() {
            self.inner.clear_pending();
            return Err(err);
        }
        if let Err(err) = self.inner.transport.send(&wire) {
            self.inner.clear_pending();
            return Err(err.into());
        }
        debug!(
            connection_id = self.inner.id,
            identifier = %envelope.identifier,
            bytes = wire.len(),
            "sent request"
        );

        let reply = match timeout {
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(reply) => reply,
                Err(RecvTimeoutError::Timeout) => {
                    self.inner.clear_pending();
                    warn!(
                        connection_id = self.inner.id,
                        identifier = %envelope.identifier,
                        ?timeout,
                        "request timed out"
                    );
                    return Err(PeerError::Timeout(timeout));
                }
                Err(RecvTimeoutError::Disconnected) => Reply::Closed,
            },
            None => rx.recv().unwrap_or(Reply::Closed),
        };

        match reply {
            Reply::Envelope(reply) => Ok(reply.payload),
            Reply::Error(error) => Err(PeerError::Remote(error.message)),
            Reply::Closed => Err(PeerError::Closed),
        }
    }
}

/// A reply payload with the `{message}` shape is a relayed error, whatever
/// `Res` is.
fn decode_reply<Res: DeserializeOwned>(payload: &[u8]) -> Result<Res> {
    if let Ok(error) = serde_json::from_slice::<RemoteError>(payload) {
        return Err(PeerError::Remote(error.message));
    }
    Ok(serde_json::from_slice(payload)?)
}

impl Inner {
    fn ensure_running(&self) -> Result<()> {
        match *lock(&self.state) {
            ConnectionState::Running => Ok(()),
            ConnectionState::Stopped => Err(PeerError::Closed),
            _ => Err(PeerError::NotConnected),
        }
    }

    fn on_dispatch_thread(&self) -> bool {
        self.dispatch_thread.get() == Some(&std::thread::current().id())
    }

    fn clear_pending(&self) {
        lock(&self.pending).take();
    }

    fn wait_for(
        &self,
        timeout: Duration,
        done: impl Fn(ConnectionState) -> bool,
    ) -> ConnectionState {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if done(*state) {
                return *state;
            }
            let now = Instant::now();
            if now >= deadline {
                return *state;
            }
            state = self
                .state_changed
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Move to `next`. Returns `false` when already stopped or unchanged.
    fn transition(&self, next: ConnectionState) -> bool {
        self.transition_if(next, |_| true)
    }

    fn transition_if(&self, next: ConnectionState, allowed: impl Fn(ConnectionState) -> bool) -> bool {
        let order = lock(&self.transitions);
        {
            let mut state = lock(&self.state);
            if *state == ConnectionState::Stopped || *state == next || !allowed(*state) {
                return false;
            }
            *state = next;
        }
        info!(connection_id = self.id, transport = self.transport.name(), state = %next, "connection state");
        self.notify_observers(next);
        drop(order);
        self.state_changed.notify_all();

        if next == ConnectionState::Running {
            let on_ready = lock(&self.callbacks).on_ready.take();
            if let Some(callback) = on_ready {
                callback();
            }
        }
        true
    }

    fn notify_observers(&self, state: ConnectionState) {
        let observers = lock(&self.callbacks).observers.clone();
        for observer in observers {
            observer(state);
        }
    }

    fn shutdown(&self, reason: String) {
        {
            let mut stop_reason = lock(&self.stop_reason);
            if stop_reason.is_none() {
                *stop_reason = Some(reason.clone());
            }
        }
        if !self.transition(ConnectionState::Stopped) {
            return;
        }
        if let Some(pending) = lock(&self.pending).take() {
            let _ = pending.tx.try_send(Reply::Closed);
        }
        self.transport.stop();

        let on_stopped = lock(&self.callbacks).on_stopped.take();
        if let Some(callback) = on_stopped {
            callback(Some(reason));
        }
    }

    fn handle_transport_state(&self, state: TransportState) {
        match state {
            TransportState::Ready => {
                self.transition(ConnectionState::Running);
            }
            TransportState::Waiting(reason) => {
                warn!(connection_id = self.id, %reason, "transport waiting");
            }
            TransportState::Failed(reason) => self.shutdown(reason),
            TransportState::Cancelled => self.shutdown("peer closed".to_string()),
            TransportState::Setup | TransportState::Preparing => {}
        }
    }

    fn handle_inbound(&self, inbound: Inbound) {
        match inbound {
            Inbound::Envelope(envelope) => {
                let pending = {
                    let mut slot = lock(&self.pending);
                    match slot.as_ref() {
                        Some(p) if p.identifier == envelope.identifier => slot.take(),
                        _ => None,
                    }
                };
                match pending {
                    Some(pending) => {
                        let _ = pending.tx.try_send(Reply::Envelope(envelope));
                    }
                    None => self.dispatch(envelope),
                }
            }
            Inbound::Error(error) => match lock(&self.pending).take() {
                Some(pending) => {
                    let _ = pending.tx.try_send(Reply::Error(error));
                }
                None => {
                    warn!(connection_id = self.id, message = %error.message, "dropping unsolicited error");
                }
            },
        }
    }

    fn dispatch(&self, envelope: Envelope) {
        let identifier = envelope.identifier.as_str();
        let Some(handler) = self.registry.get(identifier) else {
            warn!(connection_id = self.id, identifier, "no handler registered, dropping message");
            return;
        };
        debug!(connection_id = self.id, identifier, bytes = envelope.payload.len(), "dispatching");

        let outcome = catch_unwind(AssertUnwindSafe(|| handler.call(&envelope.payload)))
            .unwrap_or_else(|panic| Err(panic_message(panic.as_ref()).into()));

        let wire = match outcome {
            Ok(_) if !handler.replies() => return,
            Ok(reply) => Envelope::new(identifier, reply).and_then(|reply| encode(&reply)),
            Err(err) => {
                warn!(connection_id = self.id, identifier, error = %err, "handler failed, relaying error");
                encode_error(&RemoteError::new(err.to_string()))
            }
        };
        let result = wire
            .map_err(PeerError::from)
            .and_then(|wire| self.transport.send(&wire).map_err(PeerError::from));
        if let Err(err) = result {
            warn!(connection_id = self.id, identifier, error = %err, "failed to send reply");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.transport.stop();
    }
}

fn dispatch_loop(inner: Weak<Inner>, rx: mpsc::Receiver<Event>, mut codec: FrameCodec) {
    while let Ok(event) = rx.recv() {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            Event::Bytes(bytes) => {
                if *lock(&inner.state) == ConnectionState::Stopped {
                    continue;
                }
                for item in codec.feed(&bytes) {
                    match item {
                        Ok(inbound) => inner.handle_inbound(inbound),
                        Err(err) => {
                            warn!(connection_id = inner.id, error = %err, "dropping undecodable message")
                        }
                    }
                }
            }
            Event::Transport(state) => {
                let stopped = state.is_terminal();
                inner.handle_transport_state(state);
                if stopped {
                    codec.clear();
                    return;
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
