use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{Result, SocketOp, TransportError};
use crate::transport::StreamTransport;

/// Socket options applied to every TCP stream this crate opens or accepts.
#[derive(Debug, Clone)]
pub struct TcpOptions {
    pub connect_timeout: Duration,
    pub keepalive: bool,
    /// Idle time before the first keep-alive packet.
    pub keepalive_idle: Duration,
    pub nodelay: bool,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive: true,
            keepalive_idle: Duration::from_secs(2),
            nodelay: true,
        }
    }
}

/// Open a TCP connection to `host:port` and wrap it as a transport.
///
/// Every resolved address is tried in turn within the overall connect timeout.
pub fn connect(host: &str, port: u16, options: &TcpOptions) -> Result<StreamTransport> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| TransportError::Resolve {
            host: host.to_string(),
            port,
        })?
        .collect();
    if addrs.is_empty() {
        return Err(TransportError::Resolve {
            host: host.to_string(),
            port,
        });
    }

    let deadline = Instant::now() + options.connect_timeout;
    let mut last_err = None;
    for addr in addrs {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        debug!(%addr, "connecting");
        match TcpStream::connect_timeout(&addr, remaining) {
            Ok(stream) => return from_stream(stream, options),
            Err(err) if err.kind() == ErrorKind::TimedOut => {
                last_err = Some(TransportError::Timeout(options.connect_timeout));
            }
            Err(source) => last_err = Some(TransportError::Connect { addr, source }),
        }
    }
    Err(last_err.unwrap_or(TransportError::Timeout(options.connect_timeout)))
}

/// Apply `options` to a connected stream and wrap it as a transport.
pub fn from_stream(stream: TcpStream, options: &TcpOptions) -> Result<StreamTransport> {
    wrap_stream("tcp", stream, options)
}

pub(crate) fn wrap_stream(
    kind: &str,
    stream: TcpStream,
    options: &TcpOptions,
) -> Result<StreamTransport> {
    configure(&stream, options)?;
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let writer = stream.try_clone()?;
    let closer = stream.try_clone()?;
    info!(kind, %peer, "stream connected");
    Ok(StreamTransport::new(
        format!("{kind}:{peer}"),
        Box::new(stream),
        Box::new(writer),
        Some(Box::new(move || {
            let _ = closer.shutdown(Shutdown::Both);
        })),
    ))
}

fn configure(stream: &TcpStream, options: &TcpOptions) -> Result<()> {
    stream.set_nodelay(options.nodelay)?;
    if options.keepalive {
        #[cfg(unix)]
        set_keepalive(stream, options.keepalive_idle)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_keepalive(stream: &TcpStream, idle: Duration) -> Result<()> {
    use std::os::fd::AsRawFd;

    let fd = stream.as_raw_fd();
    let port = stream.local_addr().map(|addr| addr.port()).unwrap_or(0);

    // SAFETY: `fd` is a live socket owned by `stream`.
    if unsafe { setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1) } != 0 {
        return Err(TransportError::socket(SocketOp::Configure, port));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let idle_opt = Some(libc::TCP_KEEPIDLE);
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    let idle_opt = Some(libc::TCP_KEEPALIVE);
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios"
    )))]
    let idle_opt: Option<libc::c_int> = None;

    if let Some(opt) = idle_opt {
        let secs = idle.as_secs().clamp(1, libc::c_int::MAX as u64) as libc::c_int;
        // SAFETY: as above.
        if unsafe { setsockopt_int(fd, libc::IPPROTO_TCP, opt, secs) } != 0 {
            return Err(TransportError::socket(SocketOp::Configure, port));
        }
    }
    Ok(())
}

/// # Safety
/// `fd` must be an open socket.
#[cfg(unix)]
pub(crate) unsafe fn setsockopt_int(
    fd: libc::c_int,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> libc::c_int {
    libc::setsockopt(
        fd,
        level,
        name,
        &value as *const libc::c_int as *const libc::c_void,
        std::mem::size_of::<libc::c_int>() as libc::socklen_t,
    )
}

/// A listening socket that hands out one connected transport per peer.
pub trait Acceptor: Send + Sync {
    /// The bound port, resolved when an ephemeral port was requested.
    fn port(&self) -> u16;

    /// Wait up to `timeout` for the next peer. `Ok(None)` means no peer
    /// arrived in time.
    fn accept_timeout(&self, timeout: Duration) -> Result<Option<StreamTransport>>;
}

/// Direct TCP server socket bound on all interfaces.
pub struct TcpAcceptor {
    listener: TcpListener,
    port: u16,
    options: TcpOptions,
    kind: &'static str,
}

impl TcpAcceptor {
    /// Bind to `port` (0 for an ephemeral port) on all IPv4 interfaces.
    pub fn bind(port: u16, options: TcpOptions) -> Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let listener = TcpListener::bind(addr).map_err(|source| TransportError::Socket {
            op: SocketOp::Bind,
            port,
            source,
        })?;
        Self::from_listener("tcp", listener, options)
    }

    pub(crate) fn from_listener(
        kind: &'static str,
        listener: TcpListener,
        options: TcpOptions,
    ) -> Result<Self> {
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        info!(kind, port, "listener bound");
        Ok(Self {
            listener,
            port,
            options,
            kind,
        })
    }

    /// Best-guess address a remote peer can use to reach this listener.
    pub fn host(&self) -> Option<Ipv4Addr> {
        crate::netif::local_ipv4()
    }
}

impl Acceptor for TcpAcceptor {
    fn port(&self) -> u16 {
        self.port
    }

    fn accept_timeout(&self, timeout: Duration) -> Result<Option<StreamTransport>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    debug!(%addr, port = self.port, "accepted peer");
                    stream.set_nonblocking(false)?;
                    return wrap_stream(self.kind, stream, &self.options).map(Some);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    std::thread::sleep(ACCEPT_POLL.min(deadline - now));
                }
                Err(source) => {
                    return Err(TransportError::Socket {
                        op: SocketOp::Accept,
                        port: self.port,
                        source,
                    })
                }
            }
        }
    }
}

const ACCEPT_POLL: Duration = Duration::from_millis(10);
