//! Session sources and the communicator that opens them.
//!
//! For loopback sockets the source names describe the *business* role, not
//! the socket role. The inspecting side (business client) binds and listens;
//! the inspected side (business server, possibly sandboxed where `bind()` is
//! denied) connects.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use runtimelink_transport::{InMemoryServiceDirectory, ServiceAdvertiser, ServiceBrowser};

use crate::connection::Connection;
use crate::connector::{self, ConnectOptions};
use crate::discovery::PortDiscovery;
use crate::error::{PeerError, Result};
use crate::registry::HandlerRegistry;
use crate::request::Request;
use crate::server::{Server, ServerConfig};

/// Business role of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Sends requests and consumes responses.
    Client,
    /// Answers requests.
    Server,
}

/// How a session is established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuntimeSource {
    DirectTcpClient { name: String, host: String, port: u16 },
    DirectTcpServer { name: String, port: u16 },
    BonjourClient { name: String },
    BonjourServer { name: String },
    /// Inspector side of a loopback session; binds and listens.
    LocalSocketClient { name: String, identifier: String },
    /// Inspected side of a loopback session; connects.
    LocalSocketServer { name: String, identifier: String },
    Stdio { name: String },
}

impl RuntimeSource {
    pub fn name(&self) -> &str {
        match self {
            RuntimeSource::DirectTcpClient { name, .. }
            | RuntimeSource::DirectTcpServer { name, .. }
            | RuntimeSource::BonjourClient { name }
            | RuntimeSource::BonjourServer { name }
            | RuntimeSource::LocalSocketClient { name, .. }
            | RuntimeSource::LocalSocketServer { name, .. }
            | RuntimeSource::Stdio { name } => name,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            RuntimeSource::DirectTcpClient { .. }
            | RuntimeSource::BonjourClient { .. }
            | RuntimeSource::LocalSocketClient { .. }
            | RuntimeSource::Stdio { .. } => Role::Client,
            RuntimeSource::DirectTcpServer { .. }
            | RuntimeSource::BonjourServer { .. }
            | RuntimeSource::LocalSocketServer { .. } => Role::Server,
        }
    }
}

impl fmt::Display for RuntimeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeSource::DirectTcpClient { name, host, port } => {
                write!(f, "{name} (tcp {host}:{port})")
            }
            RuntimeSource::DirectTcpServer { name, port } => write!(f, "{name} (tcp :{port})"),
            RuntimeSource::BonjourClient { name } => write!(f, "{name} (bonjour client)"),
            RuntimeSource::BonjourServer { name } => write!(f, "{name} (bonjour server)"),
            RuntimeSource::LocalSocketClient { name, identifier } => {
                write!(f, "{name} (local socket client {identifier})")
            }
            RuntimeSource::LocalSocketServer { name, identifier } => {
                write!(f, "{name} (local socket server {identifier})")
            }
            RuntimeSource::Stdio { name } => write!(f, "{name} (stdio)"),
        }
    }
}

/// How the two sides of a loopback session agree on a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rendezvous {
    /// The listener writes its ephemeral port to a port file.
    #[default]
    PortFile,
    /// Both sides derive the port from the identifier.
    Computed,
}

/// An open session: either a single connection or a re-accepting server.
#[derive(Debug)]
pub enum Session {
    Connection(Connection),
    Server(Server),
}

impl Session {
    /// The connection to talk over right now, if any.
    pub fn connection(&self) -> Option<Connection> {
        match self {
            Session::Connection(connection) => Some(connection.clone()),
            Session::Server(server) => server.connection(),
        }
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        match self {
            Session::Connection(connection) => connection.handlers(),
            Session::Server(server) => server.handlers(),
        }
    }

    pub fn send<T: Serialize + ?Sized>(&self, identifier: &str, payload: &T) -> Result<()> {
        self.connection()
            .ok_or(PeerError::NotConnected)?
            .send(identifier, payload)
    }

    pub fn call<Req, Res>(&self, identifier: &str, request: &Req) -> Result<Res>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        self.connection()
            .ok_or(PeerError::NotConnected)?
            .call(identifier, request)
    }

    pub fn request<R: Request>(&self, request: &R) -> Result<R::Response> {
        self.connection()
            .ok_or(PeerError::NotConnected)?
            .request(request)
    }

    pub fn stop(&self) {
        match self {
            Session::Connection(connection) => connection.stop(),
            Session::Server(server) => server.stop(),
        }
    }
}

/// Opens sessions from [`RuntimeSource`] descriptions.
///
/// Everything a session needs is held here explicitly; there is no
/// process-wide state.
pub struct Communicator {
    pub discovery: PortDiscovery,
    pub rendezvous: Rendezvous,
    pub advertiser: Arc<dyn ServiceAdvertiser>,
    pub browser: Arc<dyn ServiceBrowser>,
    pub connect: ConnectOptions,
    pub server: ServerConfig,
}

impl Default for Communicator {
    fn default() -> Self {
        let directory = Arc::new(InMemoryServiceDirectory::new());
        Self {
            discovery: PortDiscovery::default(),
            rendezvous: Rendezvous::default(),
            advertiser: directory.clone(),
            browser: directory,
            connect: ConnectOptions::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Communicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use one service directory for both advertising and browsing.
    pub fn with_service_directory<D>(mut self, directory: Arc<D>) -> Self
    where
        D: ServiceAdvertiser + ServiceBrowser + 'static,
    {
        self.advertiser = directory.clone();
        self.browser = directory;
        self
    }

    pub fn with_discovery(mut self, discovery: PortDiscovery) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_rendezvous(mut self, rendezvous: Rendezvous) -> Self {
        self.rendezvous = rendezvous;
        self
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.connect.discovery_timeout = timeout;
        self
    }

    /// Open a session for `source`. `configure` registers handlers before
    /// any traffic can arrive.
    pub fn connect(
        &self,
        source: &RuntimeSource,
        configure: impl FnOnce(&HandlerRegistry),
    ) -> Result<Session> {
        let handlers = Arc::new(HandlerRegistry::new());
        configure(&handlers);
        let connect = ConnectOptions {
            handlers: Arc::clone(&handlers),
            ..self.connect.clone()
        };
        let server = ServerConfig {
            handlers,
            ..self.server.clone()
        };
        info!(source = %source, "opening session");

        let session = match source {
            RuntimeSource::DirectTcpClient { host, port, .. } => {
                Session::Connection(connector::connect_tcp(host, *port, &connect)?)
            }
            RuntimeSource::DirectTcpServer { port, .. } => {
                Session::Server(Server::direct_tcp(*port, server)?)
            }
            RuntimeSource::BonjourClient { name } => Session::Connection(
                connector::connect_discovered(self.browser.as_ref(), name, &connect)?,
            ),
            RuntimeSource::BonjourServer { name } => {
                Session::Server(Server::advertised(name, Arc::clone(&self.advertiser), server)?)
            }
            RuntimeSource::LocalSocketClient { identifier, .. } => {
                Session::Server(self.listen_loopback(identifier, server)?)
            }
            RuntimeSource::LocalSocketServer { identifier, .. } => {
                Session::Connection(self.connect_loopback(identifier, &connect)?)
            }
            RuntimeSource::Stdio { .. } => Session::Connection(connector::connect_stdio(&connect)?),
        };
        Ok(session)
    }

    #[cfg(unix)]
    fn listen_loopback(&self, identifier: &str, config: ServerConfig) -> Result<Server> {
        match self.rendezvous {
            Rendezvous::PortFile => Server::loopback_discoverable(identifier, &self.discovery, config),
            Rendezvous::Computed => Server::loopback_computed(identifier, config),
        }
    }

    #[cfg(unix)]
    fn connect_loopback(&self, identifier: &str, options: &ConnectOptions) -> Result<Connection> {
        match self.rendezvous {
            Rendezvous::PortFile => {
                connector::connect_loopback_discovered(identifier, &self.discovery, options)
            }
            Rendezvous::Computed => connector::connect_loopback_computed(identifier, options),
        }
    }

    #[cfg(not(unix))]
    fn listen_loopback(&self, _identifier: &str, _config: ServerConfig) -> Result<Server> {
        Err(PeerError::Unsupported("loopback sockets require unix".to_string()))
    }

    #[cfg(not(unix))]
    fn connect_loopback(&self, _identifier: &str, _options: &ConnectOptions) -> Result<Connection> {
        Err(PeerError::Unsupported("loopback sockets require unix".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_socket_roles_are_business_roles() {
        let inspector = RuntimeSource::LocalSocketClient {
            name: "viewer".into(),
            identifier: "com.example.app".into(),
        };
        let inspected = RuntimeSource::LocalSocketServer {
            name: "app".into(),
            identifier: "com.example.app".into(),
        };
        assert_eq!(inspector.role(), Role::Client);
        assert_eq!(inspected.role(), Role::Server);
        assert_eq!(inspected.name(), "app");
    }

    #[test]
    fn source_serializes_with_kind_tag() {
        let source = RuntimeSource::DirectTcpClient {
            name: "device".into(),
            host: "10.0.0.2".into(),
            port: 9000,
        };
        let json = serde_json::to_value(&source).unwrap();
        assert_eq!(json["kind"], "direct_tcp_client");
        let back: RuntimeSource = serde_json::from_value(json).unwrap();
        assert_eq!(back, source);
        assert_eq!(back.to_string(), "device (tcp 10.0.0.2:9000)");
    }
}
