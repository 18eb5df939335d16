use std::process::{Child, Command};
use std::sync::Arc;
use std::time::Duration;

use runtimelink_transport::{stdio, tcp, ServiceBrowser, TcpOptions, Transport};

use crate::connection::{Connection, ConnectionConfig};
use crate::discovery::PortDiscovery;
use crate::error::Result;
use crate::registry::HandlerRegistry;

/// Options shared by every client-side connect function.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connection: ConnectionConfig,
    pub tcp: TcpOptions,
    /// Bound on service resolution, port-file polling and loopback retries.
    pub discovery_timeout: Duration,
    /// Handlers the connection dispatches to. Register before connecting to
    /// catch messages the peer sends right away.
    pub handlers: Arc<HandlerRegistry>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            tcp: TcpOptions::default(),
            discovery_timeout: Duration::from_secs(10),
            handlers: Arc::new(HandlerRegistry::new()),
        }
    }
}

/// Start a connection over an already-connected transport.
///
/// This is also the entry point for transports implemented outside this
/// workspace, such as an OS-provided IPC channel.
pub fn open(transport: Arc<dyn Transport>, options: &ConnectOptions) -> Result<Connection> {
    let connection = Connection::with_registry(
        transport,
        Arc::clone(&options.handlers),
        options.connection.clone(),
    );
    connection.start()?;
    Ok(connection)
}

/// Direct TCP to `host:port`.
pub fn connect_tcp(host: &str, port: u16, options: &ConnectOptions) -> Result<Connection> {
    let transport = tcp::connect(host, port, &options.tcp)?;
    open(Arc::new(transport), options)
}

/// TCP to the service advertised as `name`.
pub fn connect_discovered(
    browser: &dyn ServiceBrowser,
    name: &str,
    options: &ConnectOptions,
) -> Result<Connection> {
    let transport = runtimelink_transport::service::connect(
        browser,
        name,
        options.discovery_timeout,
        &options.tcp,
    )?;
    open(Arc::new(transport), options)
}

/// Loopback socket to a known port.
#[cfg(unix)]
pub fn connect_loopback(port: u16, options: &ConnectOptions) -> Result<Connection> {
    let transport = runtimelink_transport::loopback::connect(port)?;
    open(Arc::new(transport), options)
}

/// Loopback socket to the port published in the port file for `identifier`.
#[cfg(unix)]
pub fn connect_loopback_discovered(
    identifier: &str,
    discovery: &PortDiscovery,
    options: &ConnectOptions,
) -> Result<Connection> {
    let port = discovery.read(identifier, options.discovery_timeout)?;
    connect_loopback(port, options)
}

/// Loopback socket to the port computed from `identifier`, retrying until
/// the listener is up or the discovery timeout elapses.
#[cfg(unix)]
pub fn connect_loopback_computed(identifier: &str, options: &ConnectOptions) -> Result<Connection> {
    let port = PortDiscovery::compute_port(identifier);
    let transport =
        runtimelink_transport::loopback::connect_with_retry(port, options.discovery_timeout)?;
    open(Arc::new(transport), options)
}

/// This process's stdin/stdout.
pub fn connect_stdio(options: &ConnectOptions) -> Result<Connection> {
    open(Arc::new(stdio::process()), options)
}

/// Spawn `command` and talk to it over its stdin/stdout.
pub fn connect_child(command: &mut Command, options: &ConnectOptions) -> Result<(Connection, Child)> {
    let (transport, child) = stdio::spawn(command)?;
    let connection = open(Arc::new(transport), options)?;
    Ok((connection, child))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::PeerError;

    #[test]
    fn tcp_refused_is_transport_error() {
        let port = {
            let scratch = std::net::TcpListener::bind("127.0.0.1:0").expect("scratch listener should bind");
            scratch.local_addr().expect("scratch listener has address").port()
        };
        let err = connect_tcp("127.0.0.1", port, &ConnectOptions::default())
            .expect_err("nothing listens here");
        assert!(matches!(err, PeerError::Transport(_)));
    }

    #[test]
    fn discovered_port_file_missing() {
        let dir = tempfile::tempdir().expect("temp dir should be creatable");
        let discovery = PortDiscovery::new(dir.path());
        let options = ConnectOptions {
            discovery_timeout: Duration::from_millis(50),
            ..ConnectOptions::default()
        };
        let err = connect_loopback_discovered("absent", &discovery, &options)
            .expect_err("no port file");
        assert!(matches!(err, PeerError::Discovery(_)));
    }

    #[test]
    fn unknown_service_is_not_found() {
        let directory = runtimelink_transport::InMemoryServiceDirectory::new();
        let options = ConnectOptions {
            discovery_timeout: Duration::from_millis(50),
            ..ConnectOptions::default()
        };
        let err = connect_discovered(&directory, "nobody", &options).expect_err("not advertised");
        assert!(matches!(
            err,
            PeerError::Transport(runtimelink_transport::TransportError::ServiceNotFound { .. })
        ));
    }
}
