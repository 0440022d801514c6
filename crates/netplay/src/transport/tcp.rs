//! Non-blocking TCP transport.
//!
//! Sockets are configured through `socket2` (TCP_NODELAY, keepalive,
//! SO_REUSEADDR, dual-stack IPv6) and then polled in non-blocking mode. Each
//! connection keeps an outbox for bytes the kernel did not accept yet.
//!
//! Outbound connects never wait for the handshake: [`TcpTransport::connect`]
//! takes a literal `ip:port` and returns at once, and the outcome shows up on
//! the next [`Transport::is_connected`], `receive` or `flush`. Host names must
//! be resolved by the caller.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};

use super::{ConnectionHandle, Transport, TransportError};
use crate::codec::MAX_MSG_SIZE;

const READ_CHUNK: usize = 8192;

/// Bytes a connection may hold back before its peer counts as stalled.
pub const MAX_OUTBOX: usize = 64 * MAX_MSG_SIZE;

/// Raw `EINPROGRESS`; Windows reports a pending connect as `WouldBlock`.
#[cfg(any(target_os = "linux", target_os = "android"))]
const EINPROGRESS: i32 = 115;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const EINPROGRESS: i32 = 36;

/// Socket options applied to every connection.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm. Default: true.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive. Default: true.
    pub keepalive_enabled: bool,
    /// Idle time before the first keepalive probe. Default: 60s.
    pub keepalive_idle: Duration,
    /// Keepalive probe interval. Default: 10s.
    pub keepalive_interval: Duration,
    /// `SO_REUSEADDR` on the listening socket. Default: true except on Windows.
    pub reuse_addr: bool,
    /// How long an outbound connect may stay pending. Default: 5s.
    pub connect_timeout: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(10),
            reuse_addr: !cfg!(target_os = "windows"),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Apply per-connection options and switch the stream to non-blocking mode.
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;
    if config.keepalive_enabled {
        let keepalive = TcpKeepalive::new()
            .with_time(config.keepalive_idle)
            .with_interval(config.keepalive_interval);
        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }
    stream.set_nonblocking(true)
}

/// Create a non-blocking listening socket bound to `addr`.
///
/// IPv6 addresses are bound dual-stack so IPv4 peers can connect too.
pub fn create_listener(addr: SocketAddr, config: &SocketConfig) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    Ok(socket.into())
}

/// Start a non-blocking connect to `addr` without waiting for the handshake.
fn start_connect(addr: SocketAddr, config: &SocketConfig) -> std::io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.raw_os_error() == Some(EINPROGRESS) => {}
        Err(e) => return Err(e),
    }
    let stream: TcpStream = socket.into();
    configure_stream(&stream, config)?;
    Ok(stream)
}

struct TcpConnection {
    stream: TcpStream,
    peer: SocketAddr,
    outbox: Vec<u8>,
    /// Set while an outbound connect is pending; the handshake must finish by then.
    connect_deadline: Option<Instant>,
}

impl TcpConnection {
    /// Whether the handshake has finished. Errors once the connect failed.
    fn poll_connect(&mut self) -> std::io::Result<bool> {
        let Some(deadline) = self.connect_deadline else {
            return Ok(true);
        };
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.connect_deadline = None;
                tracing::debug!("Connected to {}", self.peer);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotConnected => {
                if Instant::now() >= deadline {
                    Err(ErrorKind::TimedOut.into())
                } else {
                    Ok(false)
                }
            }
            Err(e) => Err(e),
        }
    }

    fn connect_failed(&self, e: std::io::Error) -> TransportError {
        TransportError::ConnectionFailed {
            address: self.peer.to_string(),
            reason: e.to_string(),
        }
    }

    /// Write as much of the outbox as the kernel takes.
    fn drain_outbox(&mut self) -> std::io::Result<()> {
        if !self.poll_connect()? {
            return Ok(());
        }
        while !self.outbox.is_empty() {
            match self.stream.write(&self.outbox) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outbox.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// TCP implementation of [`Transport`].
pub struct TcpTransport {
    config: SocketConfig,
    listener: Option<TcpListener>,
    connections: HashMap<ConnectionHandle, TcpConnection>,
    next_id: u64,
}

impl TcpTransport {
    /// Create a transport with the given socket options.
    pub fn new(config: SocketConfig) -> Self {
        Self {
            config,
            listener: None,
            connections: HashMap::new(),
            next_id: 1,
        }
    }

    /// Listen on an explicit address.
    pub fn listen_on(&mut self, addr: SocketAddr) -> Result<(), TransportError> {
        let listener = create_listener(addr, &self.config)?;
        tracing::info!("Listening on {}", listener.local_addr()?);
        self.listener = Some(listener);
        Ok(())
    }

    /// Port the listener is bound to, if listening.
    pub fn local_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|a| a.port())
    }

    fn register(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        connect_deadline: Option<Instant>,
    ) -> ConnectionHandle {
        let handle = ConnectionHandle(self.next_id);
        self.next_id += 1;
        self.connections.insert(
            handle,
            TcpConnection {
                stream,
                peer,
                outbox: Vec::new(),
                connect_deadline,
            },
        );
        handle
    }

    fn connection(&mut self, handle: ConnectionHandle) -> Result<&mut TcpConnection, TransportError> {
        self.connections
            .get_mut(&handle)
            .ok_or(TransportError::UnknownHandle(handle))
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(SocketConfig::default())
    }
}

impl Transport for TcpTransport {
    fn listen(&mut self, port: u16) -> Result<(), TransportError> {
        let dual = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
        match self.listen_on(dual) {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::debug!("Dual-stack listen failed ({e}), falling back to IPv4");
                self.listen_on(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
            }
        }
    }

    fn connect(&mut self, address: &str) -> Result<ConnectionHandle, TransportError> {
        let failed = |reason: String| TransportError::ConnectionFailed {
            address: address.to_string(),
            reason,
        };
        let addr: SocketAddr = address
            .parse()
            .map_err(|_| failed("expected a literal ip:port address".to_string()))?;
        let stream = start_connect(addr, &self.config).map_err(|e| failed(e.to_string()))?;
        tracing::debug!("Connecting to {addr}");
        let deadline = Instant::now() + self.config.connect_timeout;
        Ok(self.register(stream, addr, Some(deadline)))
    }

    fn is_connected(&mut self, handle: ConnectionHandle) -> Result<bool, TransportError> {
        let conn = self.connection(handle)?;
        conn.poll_connect().map_err(|e| conn.connect_failed(e))
    }

    fn accept(&mut self) -> Result<Option<ConnectionHandle>, TransportError> {
        let Some(listener) = &self.listener else {
            return Ok(None);
        };
        match listener.accept() {
            Ok((stream, peer)) => {
                configure_stream(&stream, &self.config)?;
                tracing::debug!("Accepted connection from {peer}");
                Ok(Some(self.register(stream, peer, None)))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn send(&mut self, handle: ConnectionHandle, bytes: &[u8]) -> Result<(), TransportError> {
        let conn = self.connection(handle)?;
        conn.drain_outbox()
            .map_err(|_| TransportError::ConnectionLost(handle))?;
        if conn.outbox.len() + bytes.len() > MAX_OUTBOX {
            tracing::warn!(
                "Peer {} stopped reading ({} bytes held back)",
                conn.peer,
                conn.outbox.len()
            );
            return Err(TransportError::ConnectionLost(handle));
        }
        conn.outbox.extend_from_slice(bytes);
        conn.drain_outbox()
            .map_err(|_| TransportError::ConnectionLost(handle))
    }

    fn receive(&mut self, handle: ConnectionHandle) -> Result<Vec<u8>, TransportError> {
        let conn = self.connection(handle)?;
        match conn.poll_connect() {
            Ok(true) => {}
            Ok(false) => return Err(TransportError::WouldBlock),
            Err(e) => return Err(conn.connect_failed(e)),
        }
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match conn.stream.read(&mut buf) {
                Ok(0) => return Err(TransportError::ConnectionLost(handle)),
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    return Err(TransportError::WouldBlock);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => return Err(TransportError::ConnectionLost(handle)),
            }
        }
    }

    fn flush(&mut self, handle: ConnectionHandle) -> Result<(), TransportError> {
        let conn = self.connection(handle)?;
        if conn.connect_deadline.is_some() {
            conn.poll_connect().map_err(|e| conn.connect_failed(e))?;
        }
        conn.drain_outbox()
            .map_err(|_| TransportError::ConnectionLost(handle))
    }

    fn backlog(&self, handle: ConnectionHandle) -> usize {
        self.connections.get(&handle).map_or(0, |c| c.outbox.len())
    }

    fn close(&mut self, handle: ConnectionHandle) {
        if let Some(mut conn) = self.connections.remove(&handle) {
            let _ = conn.drain_outbox();
            let _ = conn.stream.shutdown(std::net::Shutdown::Both);
        }
    }

    fn peer_address(&self, handle: ConnectionHandle) -> Option<String> {
        self.connections.get(&handle).map(|c| c.peer.ip().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn wait_for<T>(mut f: impl FnMut() -> Option<T>) -> T {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(v) = f() {
                return v;
            }
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn wait_connected(client: &mut TcpTransport, c: ConnectionHandle) {
        wait_for(|| client.is_connected(c).unwrap().then_some(()));
    }

    #[test]
    fn test_loopback_exchange() {
        let mut server = TcpTransport::default();
        server.listen_on("127.0.0.1:0".parse().unwrap()).unwrap();
        let port = server.local_port().unwrap();

        let mut client = TcpTransport::default();
        let c = client.connect(&format!("127.0.0.1:{port}")).unwrap();
        let s = wait_for(|| server.accept().unwrap());
        wait_connected(&mut client, c);

        client.send(c, b"ping").unwrap();
        let got = wait_for(|| server.receive(s).ok());
        assert_eq!(got, b"ping");
        assert_eq!(server.peer_address(s).as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn test_receive_without_data_would_block() {
        let mut server = TcpTransport::default();
        server.listen_on("127.0.0.1:0".parse().unwrap()).unwrap();
        let port = server.local_port().unwrap();
        let mut client = TcpTransport::default();
        let c = client.connect(&format!("127.0.0.1:{port}")).unwrap();
        assert!(matches!(client.receive(c), Err(TransportError::WouldBlock)));
    }

    #[test]
    fn test_peer_close_is_connection_lost() {
        let mut server = TcpTransport::default();
        server.listen_on("127.0.0.1:0".parse().unwrap()).unwrap();
        let port = server.local_port().unwrap();
        let mut client = TcpTransport::default();
        let c = client.connect(&format!("127.0.0.1:{port}")).unwrap();
        let s = wait_for(|| server.accept().unwrap());
        client.close(c);

        let err = wait_for(|| match server.receive(s) {
            Err(TransportError::WouldBlock) => None,
            other => Some(other),
        });
        assert!(matches!(err, Err(TransportError::ConnectionLost(_))));
    }

    #[test]
    fn test_send_before_handshake_is_held() {
        let mut server = TcpTransport::default();
        server.listen_on("127.0.0.1:0".parse().unwrap()).unwrap();
        let port = server.local_port().unwrap();

        let mut client = TcpTransport::default();
        let c = client.connect(&format!("127.0.0.1:{port}")).unwrap();
        client.send(c, b"early").unwrap();
        let s = wait_for(|| server.accept().unwrap());

        let got = wait_for(|| {
            client.flush(c).unwrap();
            server.receive(s).ok()
        });
        assert_eq!(got, b"early");
        assert_eq!(client.backlog(c), 0);
    }

    #[test]
    fn test_connect_refused() {
        let mut client = TcpTransport::new(SocketConfig {
            connect_timeout: Duration::from_millis(500),
            ..SocketConfig::default()
        });
        // Bind then drop to find a port nobody listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        // Loopback may refuse at once or only once the handshake is polled.
        let outcome = match client.connect(&format!("127.0.0.1:{port}")) {
            Err(e) => Err(e),
            Ok(c) => wait_for(|| match client.is_connected(c) {
                Ok(false) => None,
                Ok(true) => Some(Ok(())),
                Err(e) => Some(Err(e)),
            }),
        };
        assert!(matches!(outcome, Err(TransportError::ConnectionFailed { .. })));
    }

    #[test]
    fn test_host_names_are_not_resolved() {
        let mut client = TcpTransport::default();
        assert!(matches!(
            client.connect("example.invalid:2100"),
            Err(TransportError::ConnectionFailed { .. })
        ));
    }

    #[test]
    fn test_stalled_peer_is_dropped() {
        let mut server = TcpTransport::default();
        server.listen_on("127.0.0.1:0".parse().unwrap()).unwrap();
        let port = server.local_port().unwrap();
        let mut client = TcpTransport::default();
        let c = client.connect(&format!("127.0.0.1:{port}")).unwrap();
        let _s = wait_for(|| server.accept().unwrap());
        wait_connected(&mut client, c);

        // The server never reads, so kernel buffers fill and the outbox grows.
        let chunk = vec![0u8; 64 * 1024];
        let mut outcome = Ok(());
        for _ in 0..512 {
            outcome = client.send(c, &chunk);
            assert!(client.backlog(c) <= MAX_OUTBOX);
            if outcome.is_err() {
                break;
            }
        }
        assert!(matches!(outcome, Err(TransportError::ConnectionLost(_))));
    }

    #[test]
    fn test_unknown_handle() {
        let mut t = TcpTransport::default();
        assert!(matches!(
            t.send(ConnectionHandle(7), b"x"),
            Err(TransportError::UnknownHandle(_))
        ));
    }
}
