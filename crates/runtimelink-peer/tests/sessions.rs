#![cfg(unix)]

//! End-to-end sessions over real sockets, port files and child pipes.

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use runtimelink_peer::{
    connect_child, connect_discovered, connect_loopback_discovered, connect_tcp, Communicator,
    ConnectOptions, PeerError, PortDiscovery, Rendezvous, RuntimeSource, Server, ServerConfig,
    ServerState, Session,
};
use runtimelink_transport::{InMemoryServiceDirectory, ServiceBrowser};

const WAIT: Duration = Duration::from_secs(2);

fn echo_config() -> ServerConfig {
    let config = ServerConfig::default();
    config.handlers.register("echo", |text: String| Ok(text));
    config
}

fn fast_discovery_options() -> ConnectOptions {
    ConnectOptions {
        discovery_timeout: WAIT,
        ..ConnectOptions::default()
    }
}

#[test]
fn loopback_port_file_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let discovery = PortDiscovery::new(dir.path());
    let server = Server::loopback_discoverable("test", &discovery, echo_config())
        .expect("loopback server should bind");

    let client = connect_loopback_discovered("test", &discovery, &fast_discovery_options())
        .expect("client should find the port file");
    let reply: String = client.call("echo", "hello").expect("echo should reply");
    assert_eq!(reply, "hello");

    let path = discovery.path_for("test").expect("identifier is valid");
    assert!(path.exists());
    server.stop();
    assert!(!path.exists(), "port file should be removed on stop");
}

#[test]
fn tcp_server_accepts_again_after_peer_leaves() {
    let server = Server::direct_tcp(0, echo_config()).expect("server should bind");
    assert_eq!(server.state(), ServerState::Listening);

    let first = connect_tcp("127.0.0.1", server.port(), &ConnectOptions::default())
        .expect("first client should connect");
    server.wait_for_peer(WAIT).expect("first peer attaches");
    assert_eq!(server.state(), ServerState::Accepted);
    let reply: String = first.call("echo", "one").expect("first echo");
    assert_eq!(reply, "one");

    first.stop();
    let deadline = std::time::Instant::now() + WAIT;
    while server.state() != ServerState::Listening {
        assert!(std::time::Instant::now() < deadline, "server never re-listened");
        std::thread::sleep(Duration::from_millis(10));
    }

    let second = connect_tcp("127.0.0.1", server.port(), &ConnectOptions::default())
        .expect("second client should connect");
    let reply: String = second.call("echo", "two").expect("second echo");
    assert_eq!(reply, "two");

    server.stop();
    assert_eq!(server.state(), ServerState::Stopped);
}

#[test]
fn server_can_call_the_attached_peer() {
    let server = Server::direct_tcp(0, ServerConfig::default()).expect("server should bind");
    let options = ConnectOptions::default();
    options
        .handlers
        .register("greet", |name: String| Ok(format!("hi {name}")));
    let _client = connect_tcp("127.0.0.1", server.port(), &options).expect("client connects");

    server.wait_for_peer(WAIT).expect("peer attaches");
    let reply: String = server.call("greet", "server").expect("client answers");
    assert_eq!(reply, "hi server");
}

#[test]
fn server_without_peer_is_not_connected() {
    let server = Server::direct_tcp(0, ServerConfig::default()).expect("server should bind");
    assert!(matches!(server.send("echo", "x"), Err(PeerError::NotConnected)));
    assert!(matches!(
        server.call::<_, String>("echo", "x"),
        Err(PeerError::NotConnected)
    ));
    assert!(matches!(
        server.wait_for_peer(Duration::from_millis(100)),
        Err(PeerError::Timeout(_))
    ));
}

#[test]
fn advertised_service_is_found_by_name() {
    let directory = Arc::new(InMemoryServiceDirectory::new());
    let server = Server::advertised("inspector-host", directory.clone(), echo_config())
        .expect("advertised server should start");

    let record = directory
        .resolve("inspector-host", WAIT)
        .expect("service should resolve");
    assert_eq!(record.port, server.port());

    // Resolve through the record rather than the guessed interface address.
    let client = connect_tcp("127.0.0.1", record.port, &ConnectOptions::default())
        .expect("client connects");
    let reply: String = client.call("echo", "found").expect("echo");
    assert_eq!(reply, "found");

    server.stop();
    assert!(directory.browse().is_empty(), "advertisement is withdrawn");
    let err = connect_discovered(directory.as_ref(), "inspector-host", &ConnectOptions {
        discovery_timeout: Duration::from_millis(100),
        ..ConnectOptions::default()
    })
    .expect_err("service is gone");
    assert!(matches!(err, PeerError::Transport(_)));
}

fn local_socket_pair(rendezvous: Rendezvous, identifier: &str) {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let communicator = Communicator::new()
        .with_discovery(PortDiscovery::new(dir.path()))
        .with_rendezvous(rendezvous)
        .with_discovery_timeout(WAIT);

    let inspector = communicator
        .connect(
            &RuntimeSource::LocalSocketClient {
                name: "viewer".into(),
                identifier: identifier.into(),
            },
            |_| {},
        )
        .expect("inspector side listens");
    let inspected = communicator
        .connect(
            &RuntimeSource::LocalSocketServer {
                name: "app".into(),
                identifier: identifier.into(),
            },
            |handlers| {
                handlers.register("echo", |text: String| Ok(text));
            },
        )
        .expect("inspected side connects");

    let server = match &inspector {
        Session::Server(server) => server,
        other => panic!("inspector side should listen, got {other:?}"),
    };
    server.wait_for_peer(WAIT).expect("inspected side attaches");
    let reply: String = inspector.call("echo", "ping").expect("inspected side answers");
    assert_eq!(reply, "ping");

    inspected.stop();
    inspector.stop();
}

#[test]
fn local_socket_session_over_port_file() {
    local_socket_pair(Rendezvous::PortFile, "com.example.portfile");
}

#[test]
fn local_socket_session_over_computed_port() {
    local_socket_pair(
        Rendezvous::Computed,
        &format!("com.example.computed.{}", std::process::id()),
    );
}

#[test]
fn child_pipe_echoes_envelope_back_as_reply() {
    let mut command = Command::new("cat");
    let (connection, mut child) =
        connect_child(&mut command, &ConnectOptions::default()).expect("cat should spawn");

    let reply: String = connection.call("echo", "through cat").expect("cat echoes frames");
    assert_eq!(reply, "through cat");

    connection.stop();
    let _ = child.kill();
    let _ = child.wait();
}
