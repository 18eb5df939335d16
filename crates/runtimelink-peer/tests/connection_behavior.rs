#![cfg(unix)]

//! Connection behavior over in-process socket pairs.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use runtimelink_frame::{encode, Envelope, FrameCodec, Inbound};
use runtimelink_peer::{
    Connection, ConnectionConfig, ConnectionState, PeerError, PingRequest, VoidResponse,
};
use runtimelink_transport::{StreamTransport, Transport};

/// Reader that never returns more than `max` bytes per call.
struct Chunked<R> {
    inner: R,
    max: usize,
}

impl<R: Read> Read for Chunked<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let len = buf.len().min(self.max);
        self.inner.read(&mut buf[..len])
    }
}

fn socket_transport(name: &str, stream: UnixStream, max_read: usize) -> Arc<dyn Transport> {
    let writer = stream.try_clone().expect("stream should clone");
    let closer = stream.try_clone().expect("stream should clone");
    Arc::new(StreamTransport::new(
        name,
        Box::new(Chunked {
            inner: stream,
            max: max_read,
        }),
        Box::new(writer),
        Some(Box::new(move || {
            let _ = closer.shutdown(Shutdown::Both);
        })),
    ))
}

fn pair_with(config: ConnectionConfig, client_max_read: usize) -> (Connection, Connection) {
    let (a, b) = UnixStream::pair().expect("socket pair should open");
    let client = Connection::new(socket_transport("client", a, client_max_read), config.clone());
    let server = Connection::new(socket_transport("server", b, 64 * 1024), config);
    (client, server)
}

fn started_pair() -> (Connection, Connection) {
    let (client, server) = pair_with(ConnectionConfig::default(), 64 * 1024);
    server.start().expect("server should start");
    client.start().expect("client should start");
    (client, server)
}

/// Slot a handler uses to reach its own connection without the registry
/// owning a handle to it. Emptied at the end of each test.
type ConnectionSlot = Arc<Mutex<Option<Connection>>>;

fn slot_for(connection: &Connection) -> ConnectionSlot {
    Arc::new(Mutex::new(Some(connection.clone())))
}

fn from_slot(slot: &ConnectionSlot) -> Connection {
    slot.lock()
        .expect("slot lock")
        .clone()
        .expect("slot should hold the connection")
}

/// Read from a hand-driven peer socket until one whole envelope arrives.
fn next_envelope(stream: &mut TcpStream, codec: &mut FrameCodec) -> Envelope {
    let mut buf = [0u8; 4096];
    let mut fresh = Vec::new();
    loop {
        if let Some(item) = codec.feed(&fresh).next() {
            match item.expect("peer should decode") {
                Inbound::Envelope(envelope) => return envelope,
                other => panic!("unexpected {other:?}"),
            }
        }
        let n = stream.read(&mut buf).expect("peer should read");
        assert!(n > 0, "client closed early");
        fresh = buf[..n].to_vec();
    }
}

fn write_envelope(stream: &mut TcpStream, identifier: &str, json: &str) {
    let envelope = Envelope::new(identifier, json.as_bytes().to_vec()).expect("envelope");
    stream
        .write_all(&encode(&envelope).expect("encode"))
        .expect("peer should write");
}

fn connect_to(listener: &TcpListener) -> Connection {
    let port = listener.local_addr().expect("listener address").port();
    runtimelink_peer::connect_tcp("127.0.0.1", port, &runtimelink_peer::ConnectOptions::default())
        .expect("client should connect")
}

#[test]
fn request_reply_round_trip() {
    let (client, server) = started_pair();
    server
        .handlers()
        .register("echo", |text: String| Ok(text));

    let reply: String = client.call("echo", "hello").expect("echo should reply");
    assert_eq!(reply, "hello");
}

#[test]
fn handler_invoked_once_with_decoded_request() {
    let (client, server) = started_pair();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    server.handlers().register("sum", move |values: Vec<i64>| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(values.iter().sum::<i64>())
    });

    let total: i64 = client.call("sum", &[1, 2, 3, 4]).unwrap();
    assert_eq!(total, 10);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn void_handler_runs_without_reply() {
    let (client, server) = started_pair();
    let (tx, rx) = mpsc::channel();
    server.handlers().register_void("log", move |line: String| {
        let _ = tx.send(line);
        Ok(())
    });
    server.handlers().register("echo", |n: u32| Ok(n));

    client.send("log", "first").unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "first");
    // Nothing was sent back for "log", so the next reply belongs to "echo".
    let n: u32 = client.call("echo", &7).unwrap();
    assert_eq!(n, 7);
}

#[test]
fn unknown_identifier_is_dropped() {
    let (client, server) = started_pair();
    server.handlers().register("echo", |s: String| Ok(s));

    client.send("nobody-home", &1).unwrap();
    client.notify("also-nobody").unwrap();
    let reply: String = client.call("echo", "still here").unwrap();
    assert_eq!(reply, "still here");
    assert_eq!(server.state(), ConnectionState::Running);
}

#[test]
fn handler_error_relayed_as_remote_error() {
    let (client, server) = started_pair();
    server
        .handlers()
        .register("lookup", |name: String| -> runtimelink_peer::HandlerResult<String> {
            Err(format!("class {name} not found").into())
        });

    let err = client
        .call::<_, String>("lookup", "NSFoo")
        .expect_err("handler fails");
    match err {
        PeerError::Remote(message) => assert_eq!(message, "class NSFoo not found"),
        other => panic!("expected remote error, got {other:?}"),
    }

    // The connection survives the failure.
    server.handlers().register("echo", |s: String| Ok(s));
    let reply: String = client.call("echo", "ok").unwrap();
    assert_eq!(reply, "ok");
}

#[test]
fn handler_panic_relayed_as_remote_error() {
    let (client, server) = started_pair();
    server
        .handlers()
        .register("explode", |_: u8| -> runtimelink_peer::HandlerResult<u8> {
            panic!("kaboom")
        });

    let err = client.call::<_, u8>("explode", &1).expect_err("handler panics");
    assert!(matches!(err, PeerError::Remote(message) if message.contains("kaboom")));
}

#[test]
fn requests_flow_both_directions() {
    let (client, server) = started_pair();
    client.handlers().register("whoami", |_: runtimelink_peer::Null| Ok("client".to_string()));
    server.handlers().register("whoami", |_: runtimelink_peer::Null| Ok("server".to_string()));

    let from_server: String = server.call("whoami", &runtimelink_peer::Null {}).unwrap();
    let from_client: String = client.call("whoami", &runtimelink_peer::Null {}).unwrap();
    assert_eq!(from_server, "client");
    assert_eq!(from_client, "server");
}

#[test]
fn typed_ping_request() {
    let (client, server) = started_pair();
    server
        .handlers()
        .register_request(|_: PingRequest| Ok(VoidResponse {}));
    assert_eq!(client.request(&PingRequest {}).unwrap(), VoidResponse {});
}

#[test]
fn chunked_reads_reassemble_large_payload() {
    let (client, server) = pair_with(ConnectionConfig::default(), 37);
    server.start().unwrap();
    client.start().unwrap();
    server
        .handlers()
        .register_responder("big", || Ok("z".repeat(10_000)));

    let reply: String = client.call("big", &runtimelink_peer::Null {}).unwrap();
    assert_eq!(reply.len(), 10_000);
    assert!(reply.bytes().all(|b| b == b'z'));
}

#[test]
fn request_timeout_releases_guard() {
    let config = ConnectionConfig {
        request_timeout: Some(Duration::from_millis(100)),
        ..ConnectionConfig::default()
    };
    let (client, server) = pair_with(config, 64 * 1024);
    server.start().unwrap();
    client.start().unwrap();
    server.handlers().register("slow", |ms: u64| {
        thread::sleep(Duration::from_millis(ms));
        Ok(ms)
    });
    server.handlers().register("echo", |s: String| Ok(s));

    let start = Instant::now();
    let err = client.call::<_, u64>("slow", &400).expect_err("reply too late");
    assert!(matches!(err, PeerError::Timeout(_)));
    assert!(start.elapsed() < Duration::from_millis(400));

    let reply: String = client
        .call_with_timeout("echo", "after", Some(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(reply, "after");
}

#[test]
fn stop_fails_outstanding_request() {
    let (client, server) = started_pair();
    server.handlers().register("hang", |_: u8| {
        thread::sleep(Duration::from_secs(5));
        Ok(0u8)
    });

    let stopper = client.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        stopper.stop();
    });
    let err = client.call::<_, u8>("hang", &1).expect_err("stopped mid-flight");
    assert!(matches!(err, PeerError::Closed));
    handle.join().unwrap();

    assert_eq!(client.state(), ConnectionState::Stopped);
    assert!(matches!(client.send("x", &1), Err(PeerError::Closed)));
}

#[test]
fn peer_close_fires_stopped_once() {
    let (client, server) = started_pair();
    let stopped = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&stopped);
    client.on_stopped(move |_reason| {
        count.fetch_add(1, Ordering::SeqCst);
    });

    server.stop();
    assert!(client.wait_stopped(Duration::from_secs(2)));
    client.stop();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(stopped.load(Ordering::SeqCst), 1);
    assert_eq!(client.stop_reason().as_deref(), Some("peer closed"));
}

#[test]
fn state_observer_sees_lifecycle() {
    let (client, server) = pair_with(ConnectionConfig::default(), 64 * 1024);
    let (tx, rx) = mpsc::channel();
    client.on_state_change(move |state| {
        let _ = tx.send(state);
    });
    let ready = Arc::new(AtomicUsize::new(0));
    let ready_count = Arc::clone(&ready);
    client.on_ready(move || {
        ready_count.fetch_add(1, Ordering::SeqCst);
    });

    server.start().unwrap();
    client.start().unwrap();
    client.stop();

    let states: Vec<_> = rx.iter().take(3).collect();
    assert_eq!(
        states,
        vec![
            ConnectionState::Starting,
            ConnectionState::Running,
            ConnectionState::Stopped
        ]
    );
    assert_eq!(ready.load(Ordering::SeqCst), 1);
    assert!(client.start().is_err());
}

#[test]
fn calls_before_start_are_not_connected() {
    let (client, _server) = pair_with(ConnectionConfig::default(), 64 * 1024);
    assert!(matches!(
        client.call::<_, String>("echo", "x"),
        Err(PeerError::NotConnected)
    ));
}

#[test]
fn concurrent_requests_never_overlap_on_the_wire() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    // Hand-driven peer: answers each request only after checking that no
    // second request arrived while the first was outstanding.
    let peer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut codec = FrameCodec::new();
        let mut buf = [0u8; 4096];
        let mut answered = 0;
        let mut overlaps = 0;
        while answered < 2 {
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "client closed early");
            let requests: Vec<Envelope> = codec
                .feed(&buf[..n])
                .map(|item| match item.unwrap() {
                    Inbound::Envelope(envelope) => envelope,
                    other => panic!("unexpected {other:?}"),
                })
                .collect();
            if requests.len() > 1 {
                overlaps += 1;
            }
            for request in requests {
                // Give a second request time to show up if the guard leaked.
                stream
                    .set_read_timeout(Some(Duration::from_millis(150)))
                    .unwrap();
                match stream.read(&mut buf) {
                    Ok(0) => panic!("client closed early"),
                    Ok(_) => overlaps += 1,
                    Err(_) => {}
                }
                stream.set_read_timeout(None).unwrap();
                let reply = Envelope::new(request.identifier.clone(), request.payload.clone()).unwrap();
                stream.write_all(&encode(&reply).unwrap()).unwrap();
                answered += 1;
            }
        }
        overlaps
    });

    let connection = runtimelink_peer::connect_tcp(
        "127.0.0.1",
        port,
        &runtimelink_peer::ConnectOptions::default(),
    )
    .unwrap();
    let first = connection.clone();
    let second = connection.clone();
    let a = thread::spawn(move || first.call::<_, String>("work", "a").unwrap());
    let b = thread::spawn(move || second.call::<_, String>("work", "b").unwrap());

    let mut replies = vec![a.join().unwrap(), b.join().unwrap()];
    replies.sort();
    assert_eq!(replies, vec!["a", "b"]);
    assert_eq!(peer.join().unwrap(), 0);
}

#[test]
fn other_identifier_dispatched_while_call_outstanding() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let peer = thread::spawn({
        let listener = listener.try_clone().expect("listener clone");
        move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut codec = FrameCodec::new();
            let request = next_envelope(&mut stream, &mut codec);
            assert_eq!(request.identifier, "whoami");
            write_envelope(&mut stream, "note", r#""between""#);
            write_envelope(&mut stream, "whoami", r#""server""#);
            stream
        }
    });

    let client = connect_to(&listener);
    let (tx, rx) = mpsc::channel();
    client.handlers().register_void("note", move |text: String| {
        let _ = tx.send(text);
        Ok(())
    });

    let reply: String = client
        .call_with_timeout("whoami", "client", Some(Duration::from_secs(2)))
        .expect("call should get the real reply");
    assert_eq!(reply, "server");
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).expect("note handler should run"),
        "between"
    );
    drop(peer.join().expect("peer thread"));
}

#[test]
fn same_identifier_from_peer_is_taken_as_the_reply() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let peer = thread::spawn({
        let listener = listener.try_clone().expect("listener clone");
        move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut codec = FrameCodec::new();
            let request = next_envelope(&mut stream, &mut codec);
            assert_eq!(request.identifier, "whoami");
            // The peer's own request, then the answer to the client's.
            write_envelope(&mut stream, "whoami", r#""peer-asks""#);
            write_envelope(&mut stream, "whoami", r#""server""#);
            // With the call already completed, the second one reaches the
            // client's handler, whose answer comes back here.
            let answer = next_envelope(&mut stream, &mut codec);
            (stream, answer)
        }
    });

    let client = connect_to(&listener);
    let handled = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&handled);
    client.handlers().register("whoami", move |_: String| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok("client")
    });

    let reply: String = client
        .call_with_timeout("whoami", "client", Some(Duration::from_secs(2)))
        .expect("call should complete");
    assert_eq!(reply, "peer-asks");

    let (_stream, answer) = peer.join().expect("peer thread");
    assert_eq!(answer.identifier, "whoami");
    assert_eq!(answer.payload.as_ref(), br#""client""#);
    assert_eq!(handled.load(Ordering::SeqCst), 1);
}

#[test]
fn handler_may_notify_while_call_outstanding() {
    let (client, server) = started_pair();
    let client_slot = slot_for(&client);
    let server_slot = slot_for(&server);

    let from_server = Arc::clone(&server_slot);
    server.handlers().register("slow", move |_: String| {
        from_slot(&from_server).send("note", "mid-call")?;
        Ok("done")
    });
    let from_client = Arc::clone(&client_slot);
    client.handlers().register_void("note", move |_: String| {
        from_slot(&from_client).notify("ack")?;
        Ok(())
    });
    let (tx, rx) = mpsc::channel();
    server.handlers().register_action("ack", move || {
        let _ = tx.send(());
        Ok(())
    });

    let reply: String = client
        .call_with_timeout("slow", "go", Some(Duration::from_secs(2)))
        .expect("call should finish while its handler traffic flows");
    assert_eq!(reply, "done");
    rx.recv_timeout(Duration::from_secs(2))
        .expect("ack sent from a handler should arrive");

    client_slot.lock().expect("slot lock").take();
    server_slot.lock().expect("slot lock").take();
}

#[test]
fn call_from_handler_is_refused() {
    let (client, server) = started_pair();
    let server_slot = slot_for(&server);
    let from_server = Arc::clone(&server_slot);
    server.handlers().register("outer", move |_: String| {
        let nested = from_slot(&from_server).call::<_, String>("inner", "x");
        Ok(match nested {
            Err(PeerError::Unsupported(_)) => "refused".to_string(),
            other => format!("{other:?}"),
        })
    });

    let reply: String = client
        .call_with_timeout("outer", "go", Some(Duration::from_secs(2)))
        .expect("outer should reply");
    assert_eq!(reply, "refused");
    assert_eq!(server.state(), ConnectionState::Running);
    server_slot.lock().expect("slot lock").take();
}

#[test]
fn error_shaped_reply_payload_is_remote_error_for_any_type() {
    let (client, server) = started_pair();
    server
        .handlers()
        .register_responder("odd", || Ok(serde_json::json!({ "message": "boom" })));
    server
        .handlers()
        .register_responder("rich", || Ok(serde_json::json!({ "message": "hi", "count": 2 })));

    let odd = client.call::<_, serde_json::Value>("odd", &runtimelink_peer::Null {});
    assert!(matches!(odd, Err(PeerError::Remote(ref message)) if message == "boom"));

    let rich: serde_json::Value = client
        .call("rich", &runtimelink_peer::Null {})
        .expect("extra fields make it plain data");
    assert_eq!(rich["count"], 2);
}
