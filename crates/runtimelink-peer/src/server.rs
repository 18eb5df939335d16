use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use runtimelink_transport::{
    Acceptor, ServiceAdvertiser, ServiceRecord, TcpAcceptor, TcpOptions, Transport,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::connection::{Connection, ConnectionConfig};
use crate::discovery::PortDiscovery;
use crate::error::{PeerError, Result};
use crate::registry::HandlerRegistry;
use crate::request::Request;

/// Accept-loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Waiting for a peer.
    Listening,
    /// Serving one peer; the next is accepted after it disconnects.
    Accepted,
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Listening => "listening",
            ServerState::Accepted => "accepted",
            ServerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Server behavior config.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Applied to every accepted connection.
    pub connection: ConnectionConfig,
    pub tcp: TcpOptions,
    /// How often the accept loop checks for shutdown.
    pub accept_poll_interval: Duration,
    /// Handlers bound to every accepted connection.
    pub handlers: Arc<HandlerRegistry>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            tcp: TcpOptions::default(),
            accept_poll_interval: Duration::from_millis(50),
            handlers: Arc::new(HandlerRegistry::new()),
        }
    }
}

type Cleanup = Box<dyn FnOnce() + Send>;

struct Shared {
    acceptor: Box<dyn Acceptor>,
    config: ServerConfig,
    state: Mutex<ServerState>,
    state_changed: Condvar,
    current: Mutex<Option<Connection>>,
    stopping: AtomicBool,
}

/// Listens on one socket and serves one peer at a time.
///
/// When the current peer disconnects the server goes back to listening and
/// the next peer gets a fresh [`Connection`] bound to the same handlers.
pub struct Server {
    shared: Arc<Shared>,
    host: Option<Ipv4Addr>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    cleanup: Mutex<Option<Cleanup>>,
}

impl Server {
    /// Start serving on any acceptor.
    pub fn with_acceptor(acceptor: Box<dyn Acceptor>, config: ServerConfig) -> Result<Self> {
        Self::start(acceptor, None, config)
    }

    /// Direct TCP on all interfaces. Port `0` picks an ephemeral port.
    pub fn direct_tcp(port: u16, config: ServerConfig) -> Result<Self> {
        let acceptor = TcpAcceptor::bind(port, config.tcp.clone())?;
        let host = acceptor.host();
        Self::start(Box::new(acceptor), host, config)
    }

    /// Direct TCP advertised as `name` through `advertiser`. The
    /// advertisement is withdrawn when the server stops.
    pub fn advertised(
        name: &str,
        advertiser: Arc<dyn ServiceAdvertiser>,
        config: ServerConfig,
    ) -> Result<Self> {
        let server = Self::direct_tcp(0, config)?;
        let host = server
            .host
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| Ipv4Addr::LOCALHOST.to_string());
        advertiser.advertise(ServiceRecord::new(name, host, server.port()))?;

        let name = name.to_string();
        server.set_cleanup(Box::new(move || advertiser.withdraw(&name)));
        Ok(server)
    }

    /// Loopback socket on `127.0.0.1:port`.
    #[cfg(unix)]
    pub fn loopback(port: u16, config: ServerConfig) -> Result<Self> {
        let acceptor = runtimelink_transport::LoopbackAcceptor::bind(port)?;
        Self::start(Box::new(acceptor), Some(Ipv4Addr::LOCALHOST), config)
    }

    /// Loopback socket on an ephemeral port published through a port file
    /// for `identifier`. The file is removed when the server stops.
    #[cfg(unix)]
    pub fn loopback_discoverable(
        identifier: &str,
        discovery: &PortDiscovery,
        config: ServerConfig,
    ) -> Result<Self> {
        let server = Self::loopback(0, config)?;
        discovery.write(identifier, server.port())?;

        let discovery = discovery.clone();
        let identifier = identifier.to_string();
        server.set_cleanup(Box::new(move || discovery.remove(&identifier)));
        Ok(server)
    }

    /// Loopback socket on the port computed from `identifier`.
    #[cfg(unix)]
    pub fn loopback_computed(identifier: &str, config: ServerConfig) -> Result<Self> {
        Self::loopback(PortDiscovery::compute_port(identifier), config)
    }

    fn start(acceptor: Box<dyn Acceptor>, host: Option<Ipv4Addr>, config: ServerConfig) -> Result<Self> {
        let port = acceptor.port();
        let shared = Arc::new(Shared {
            acceptor,
            config,
            state: Mutex::new(ServerState::Listening),
            state_changed: Condvar::new(),
            current: Mutex::new(None),
            stopping: AtomicBool::new(false),
        });

        let loop_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("runtimelink-accept-{port}"))
            .spawn(move || accept_loop(&loop_shared))
            .map_err(runtimelink_transport::TransportError::Io)?;
        info!(port, "server listening");

        Ok(Self {
            shared,
            host,
            accept_thread: Mutex::new(Some(handle)),
            cleanup: Mutex::new(None),
        })
    }

    fn set_cleanup(&self, cleanup: Cleanup) {
        *lock(&self.cleanup) = Some(cleanup);
    }

    pub fn port(&self) -> u16 {
        self.shared.acceptor.port()
    }

    /// Best-guess address peers can reach this server at.
    pub fn host(&self) -> Option<Ipv4Addr> {
        self.host
    }

    pub fn state(&self) -> ServerState {
        *lock(&self.shared.state)
    }

    /// Handlers bound to every accepted connection.
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.shared.config.handlers
    }

    /// The connection to the current peer, if one is attached.
    pub fn connection(&self) -> Option<Connection> {
        lock(&self.shared.current).clone()
    }

    /// Block until a peer is attached.
    pub fn wait_for_peer(&self, timeout: Duration) -> Result<Connection> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.shared.state);
        loop {
            match *state {
                ServerState::Accepted => {
                    if let Some(connection) = self.connection() {
                        return Ok(connection);
                    }
                }
                ServerState::Stopped => return Err(PeerError::Closed),
                ServerState::Listening => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PeerError::Timeout(timeout));
            }
            state = self
                .shared
                .state_changed
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Fire-and-forget to the current peer.
    pub fn send<T: Serialize + ?Sized>(&self, identifier: &str, payload: &T) -> Result<()> {
        self.peer()?.send(identifier, payload)
    }

    /// Round trip to the current peer.
    pub fn call<Req, Res>(&self, identifier: &str, request: &Req) -> Result<Res>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        self.peer()?.call(identifier, request)
    }

    pub fn request<R: Request>(&self, request: &R) -> Result<R::Response> {
        self.peer()?.request(request)
    }

    fn peer(&self) -> Result<Connection> {
        self.connection().ok_or(PeerError::NotConnected)
    }

    /// Stop accepting, drop the current peer and release the listening
    /// socket's rendezvous (port file or advertisement). Idempotent.
    pub fn stop(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(connection) = lock(&self.shared.current).take() {
            connection.stop();
        }
        if let Some(handle) = lock(&self.accept_thread).take() {
            let _ = handle.join();
        }
        if let Some(cleanup) = lock(&self.cleanup).take() {
            cleanup();
        }
        self.shared.set_state(ServerState::Stopped);
        info!(port = self.port(), "server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("port", &self.port())
            .field("host", &self.host)
            .field("state", &self.state())
            .finish()
    }
}

impl Shared {
    fn set_state(&self, next: ServerState) {
        let mut state = lock(&self.state);
        if *state == ServerState::Stopped {
            return;
        }
        *state = next;
        drop(state);
        self.state_changed.notify_all();
    }

    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

fn accept_loop(shared: &Shared) {
    let poll = shared.config.accept_poll_interval;
    while !shared.stopping() {
        let transport = match shared.acceptor.accept_timeout(poll) {
            Ok(Some(transport)) => transport,
            Ok(None) => continue,
            Err(err) => {
                error!(port = shared.acceptor.port(), error = %err, "accept failed");
                std::thread::sleep(poll);
                continue;
            }
        };

        let transport: Arc<dyn Transport> = Arc::new(transport);
        let connection = Connection::with_registry(
            transport,
            Arc::clone(&shared.config.handlers),
            shared.config.connection.clone(),
        );
        if let Err(err) = connection.start() {
            warn!(error = %err, "accepted peer failed to start");
            continue;
        }

        {
            let mut current = lock(&shared.current);
            if shared.stopping() {
                connection.stop();
                break;
            }
            *current = Some(connection.clone());
        }
        shared.set_state(ServerState::Accepted);
        info!(connection_id = connection.id(), "peer attached");

        while !connection.wait_stopped(poll) {
            if shared.stopping() {
                connection.stop();
                break;
            }
        }

        lock(&shared.current).take();
        if !shared.stopping() {
            info!(
                connection_id = connection.id(),
                reason = connection.stop_reason().as_deref().unwrap_or("unknown"),
                "peer detached, listening again"
            );
            shared.set_state(ServerState::Listening);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
