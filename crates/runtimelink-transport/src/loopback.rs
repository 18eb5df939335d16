//! Loopback socket transport.
//!
//! Sockets are created with raw `socket`/`bind`/`listen`/`connect` calls
//! rather than `std::net` constructors so that every failure reports the
//! exact call and errno, and so the code path matches what works inside
//! sandboxed or injected processes where only `connect()` is permitted.

use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{Result, SocketOp, TransportError};
use crate::tcp::{setsockopt_int, wrap_stream, Acceptor, TcpAcceptor, TcpOptions};
use crate::transport::StreamTransport;

const LISTEN_BACKLOG: libc::c_int = 5;
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

fn loopback_options() -> TcpOptions {
    TcpOptions {
        keepalive: false,
        ..TcpOptions::default()
    }
}

fn sockaddr(port: u16) -> libc::sockaddr_in {
    // SAFETY: `sockaddr_in` is plain data; all-zero is a valid value.
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr = libc::in_addr {
        s_addr: u32::from(Ipv4Addr::LOCALHOST).to_be(),
    };
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    {
        addr.sin_len = std::mem::size_of::<libc::sockaddr_in>() as u8;
    }
    addr
}

fn new_socket(port: u16) -> Result<OwnedFd> {
    // SAFETY: plain syscall; the returned descriptor is checked before use.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(TransportError::socket(SocketOp::Create, port));
    }
    // SAFETY: `fd` was just returned by `socket` and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Server side of the loopback transport, bound to `127.0.0.1`.
pub struct LoopbackAcceptor {
    inner: TcpAcceptor,
}

impl LoopbackAcceptor {
    /// Bind to `127.0.0.1:port`; `0` picks an ephemeral port.
    pub fn bind(port: u16) -> Result<Self> {
        let fd = new_socket(port)?;
        let raw = fd.as_raw_fd();

        // SAFETY: `raw` stays open for the lifetime of `fd`; the address
        // pointer refers to a fully initialized `sockaddr_in`.
        unsafe {
            if setsockopt_int(raw, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1) != 0 {
                return Err(TransportError::socket(SocketOp::Configure, port));
            }
            let addr = sockaddr(port);
            if libc::bind(
                raw,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            ) != 0
            {
                return Err(TransportError::socket(SocketOp::Bind, port));
            }
            if libc::listen(raw, LISTEN_BACKLOG) != 0 {
                return Err(TransportError::socket(SocketOp::Listen, port));
            }
        }

        let listener = TcpListener::from(fd);
        let inner = TcpAcceptor::from_listener("loopback", listener, loopback_options())?;
        info!(port = inner.port(), "loopback socket listening");
        Ok(Self { inner })
    }
}

impl Acceptor for LoopbackAcceptor {
    fn port(&self) -> u16 {
        self.inner.port()
    }

    fn accept_timeout(&self, timeout: Duration) -> Result<Option<StreamTransport>> {
        self.inner.accept_timeout(timeout)
    }
}

/// Connect once to `127.0.0.1:port`.
pub fn connect(port: u16) -> Result<StreamTransport> {
    let fd = new_socket(port)?;
    let addr = sockaddr(port);
    loop {
        // SAFETY: `fd` is an open socket; `addr` is a valid `sockaddr_in`.
        let rc = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            break;
        }
        let err = TransportError::socket(SocketOp::Connect, port);
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
    debug!(port, "loopback socket connected");
    wrap_stream("loopback", TcpStream::from(fd), &loopback_options())
}

/// Connect to `127.0.0.1:port`, retrying every 100ms until the listener
/// appears or `timeout` elapses. Returns the last connect error on expiry.
pub fn connect_with_retry(port: u16, timeout: Duration) -> Result<StreamTransport> {
    let deadline = Instant::now() + timeout;
    loop {
        match connect(port) {
            Ok(transport) => return Ok(transport),
            Err(err) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(err);
                }
                debug!(port, error = %err, "loopback connect failed, retrying");
                std::thread::sleep(CONNECT_RETRY_INTERVAL.min(deadline - now));
            }
        }
    }
}
