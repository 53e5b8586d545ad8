//! Source-bound TCP transport for PiMMS
//!
//! PiMMS identifies the sending role (trigger, controller N) by the source IP
//! of each connection and expects a fresh connection per message. Every
//! connection is bound to a local interface IP and the next port of a
//! rotating range, so a port is not reused while it may still sit in
//! TIME_WAIT from the previous close.
//!
//! Short-lived processes keep their place in the rotation through a small
//! JSON state file, so consecutive runs do not start over at the first port.

use std::fs;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{NetworkConfig, ServerEndpoint};
use crate::error::{Error, Result};

/// Rotating range of local source ports.
///
/// `next_port` hands out `start..=end` in ascending order and then wraps.
/// The counter is atomic, so concurrent callers never receive the same port
/// from one step of the rotation.
#[derive(Debug)]
pub struct LocalPortPool {
    start: u16,
    end: u16,
    current: AtomicU16,
}

impl LocalPortPool {
    /// Create a pool over the inclusive range `start..=end`
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start == 0 {
            return Err(Error::address("local port range must not start at 0"));
        }
        if start > end {
            return Err(Error::address(format!(
                "local port range {}..={} is empty",
                start, end
            )));
        }
        Ok(Self {
            start,
            end,
            current: AtomicU16::new(start),
        })
    }

    /// Create a pool that resumes at `current`.
    ///
    /// A `current` outside the range (the range changed since it was saved)
    /// restarts the rotation at `start`.
    pub fn with_current(start: u16, end: u16, current: u16) -> Result<Self> {
        let pool = Self::new(start, end)?;
        if (start..=end).contains(&current) {
            pool.current.store(current, Ordering::Release);
        }
        Ok(pool)
    }

    /// Resume the rotation saved at `path`.
    ///
    /// A missing file starts at `start`. An unreadable or corrupt one is
    /// logged and also starts at `start`.
    pub fn restore(start: u16, end: u16, path: &Path) -> Result<Self> {
        let current = match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<PortState>(&text) {
                Ok(state) => state.next_port,
                Err(e) => {
                    warn!("Ignoring port state {}: {}", path.display(), e);
                    start
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => start,
            Err(e) => {
                warn!("Ignoring port state {}: {}", path.display(), e);
                start
            }
        };
        debug!("Port rotation resumes at {}", current);
        Self::with_current(start, end, current)
    }

    /// Save the port the next call to `next_port` will return
    pub fn persist(&self, path: &Path) -> Result<()> {
        let state = PortState {
            next_port: self.current(),
        };
        let text = serde_json::to_string(&state)
            .map_err(|e| Error::Other(format!("encoding port state: {}", e)))?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Return the current port and advance, wrapping after `end`
    pub fn next_port(&self) -> u16 {
        let advanced = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |port| {
                Some(if port >= self.end { self.start } else { port + 1 })
            });
        match advanced {
            Ok(port) | Err(port) => port,
        }
    }

    /// Port the next call to `next_port` will return
    pub fn current(&self) -> u16 {
        self.current.load(Ordering::Acquire)
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    /// Number of ports in the rotation
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }
}

/// Saved position of a [`LocalPortPool`]
#[derive(Debug, Serialize, Deserialize)]
struct PortState {
    next_port: u16,
}

/// Opens short-lived connections to the PiMMS server
#[derive(Debug)]
pub struct ConnectionManager {
    endpoint: ServerEndpoint,
    ports: LocalPortPool,
    port_state: Option<PathBuf>,
    connect_timeout: Duration,
    write_timeout: Duration,
}

impl ConnectionManager {
    /// Create a manager for the given server and port rotation
    pub fn new(
        endpoint: ServerEndpoint,
        ports: LocalPortPool,
        connect_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            ports,
            port_state: None,
            connect_timeout,
            write_timeout,
        }
    }

    /// Save the rotation to `path` every time a port is taken
    pub fn with_port_state(mut self, path: impl Into<PathBuf>) -> Self {
        self.port_state = Some(path.into());
        self
    }

    /// Build a manager from network configuration.
    ///
    /// With `port_state_file` set, the rotation resumes where the last
    /// process sharing that file left it.
    pub fn from_config(network: &NetworkConfig) -> Result<Self> {
        network.validate()?;
        let (start, end) = (network.local_port_start, network.local_port_end);
        let ports = match &network.port_state_file {
            Some(path) => LocalPortPool::restore(start, end, path)?,
            None => LocalPortPool::new(start, end)?,
        };

        let manager = Self::new(
            network.server_endpoint()?,
            ports,
            network.connect_timeout(),
            network.write_timeout(),
        );
        Ok(match &network.port_state_file {
            Some(path) => manager.with_port_state(path.clone()),
            None => manager,
        })
    }

    pub fn endpoint(&self) -> ServerEndpoint {
        self.endpoint
    }

    pub fn ports(&self) -> &LocalPortPool {
        &self.ports
    }

    /// Bind to `(local_ip, next port)` and connect to the server.
    ///
    /// On failure the socket is dropped before returning, so no bound but
    /// unconnected socket outlives the call.
    pub async fn acquire(&self, local_ip: &str) -> Result<Connection> {
        let ip: Ipv4Addr = local_ip.trim().parse().map_err(|_| {
            Error::connection(
                local_ip,
                io::Error::new(io::ErrorKind::InvalidInput, "invalid local interface address"),
            )
        })?;
        let local = SocketAddr::V4(SocketAddrV4::new(ip, self.ports.next_port()));
        if let Some(path) = &self.port_state {
            // The port counts as used even if the connect below fails
            if let Err(e) = self.ports.persist(path) {
                warn!("Could not save port state to {}: {}", path.display(), e);
            }
        }
        let route = format!("{} -> {}", local, self.endpoint);

        debug!("Creating socket bound to {}", local);
        let socket = TcpSocket::new_v4().map_err(|e| Error::connection(&route, e))?;
        socket
            .bind(local)
            .map_err(|e| Error::connection(&route, e))?;

        info!("Connecting {}", route);
        let stream = match timeout(self.connect_timeout, socket.connect(self.endpoint.socket_addr()))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::connection(&route, e)),
            Err(_) => {
                return Err(Error::connection(
                    &route,
                    io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                ))
            }
        };

        Ok(Connection::new(
            stream,
            local,
            self.endpoint.socket_addr(),
            self.write_timeout,
        ))
    }
}

/// A single-use connection to the PiMMS server.
///
/// `release` shuts the stream down gracefully and may be called any number
/// of times. Dropping an unreleased connection closes the socket as well.
#[derive(Debug)]
pub struct Connection<S = TcpStream> {
    stream: Option<S>,
    local: SocketAddr,
    peer: SocketAddr,
    write_timeout: Duration,
}

impl<S> Connection<S>
where
    S: AsyncWrite + Unpin,
{
    /// Wrap an already connected stream
    pub fn new(stream: S, local: SocketAddr, peer: SocketAddr, write_timeout: Duration) -> Self {
        Self {
            stream: Some(stream),
            local,
            peer,
            write_timeout,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Write one frame and flush it
    pub async fn send(&mut self, frame: &[u8]) -> Result<()> {
        let peer = self.peer;
        let write_timeout = self.write_timeout;
        let stream = self.stream.as_mut().ok_or_else(|| Error::Send {
            addr: peer,
            source: io::Error::new(io::ErrorKind::NotConnected, "connection already released"),
        })?;

        let write = async {
            stream.write_all(frame).await?;
            stream.flush().await
        };

        match timeout(write_timeout, write).await {
            Ok(Ok(())) => {
                debug!("Sent {} bytes to {}", frame.len(), peer);
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Send { addr: peer, source: e }),
            Err(_) => Err(Error::Send {
                addr: peer,
                source: io::Error::new(io::ErrorKind::TimedOut, "write timed out"),
            }),
        }
    }

    /// Close the connection
    pub async fn release(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            info!("Closing connection {} -> {}", self.local, self.peer);
            if let Err(e) = stream.shutdown().await {
                debug!("Shutdown of {} reported: {}", self.peer, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// A currently free loopback port for use as a one-port local range
    fn free_local_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_port_pool_rotation() {
        let pool = LocalPortPool::new(12345, 12349).unwrap();
        let ports: Vec<u16> = (0..pool.len()).map(|_| pool.next_port()).collect();
        assert_eq!(ports, vec![12345, 12346, 12347, 12348, 12349]);
        assert_eq!(pool.next_port(), 12345);
        assert_eq!(pool.current(), 12346);
    }

    #[test]
    fn test_single_port_pool_repeats() {
        let pool = LocalPortPool::new(40000, 40000).unwrap();
        assert_eq!(pool.next_port(), 40000);
        assert_eq!(pool.next_port(), 40000);
    }

    #[test]
    fn test_port_pool_at_top_of_range() {
        let pool = LocalPortPool::new(u16::MAX - 1, u16::MAX).unwrap();
        assert_eq!(pool.next_port(), u16::MAX - 1);
        assert_eq!(pool.next_port(), u16::MAX);
        assert_eq!(pool.next_port(), u16::MAX - 1);
    }

    #[test]
    fn test_port_pool_rejects_bad_ranges() {
        assert!(matches!(
            LocalPortPool::new(200, 100),
            Err(Error::AddressConfig(_))
        ));
        assert!(matches!(
            LocalPortPool::new(0, 100),
            Err(Error::AddressConfig(_))
        ));
    }

    #[test]
    fn test_port_pool_shared_between_threads() {
        let pool = std::sync::Arc::new(LocalPortPool::new(30000, 30099).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || (0..25).map(|_| pool.next_port()).collect::<Vec<_>>())
            })
            .collect();

        let mut ports: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 100);
    }

    #[test]
    fn test_port_pool_resumes_at_current() {
        let pool = LocalPortPool::with_current(12345, 12349, 12348).unwrap();
        assert_eq!(pool.next_port(), 12348);
        assert_eq!(pool.next_port(), 12349);
        assert_eq!(pool.next_port(), 12345);

        let out_of_range = LocalPortPool::with_current(12345, 12349, 20000).unwrap();
        assert_eq!(out_of_range.next_port(), 12345);
    }

    #[test]
    fn test_port_state_carries_rotation_between_pools() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ports.json");

        let first = LocalPortPool::restore(12345, 12349, &path).unwrap();
        assert_eq!(first.next_port(), 12345);
        first.persist(&path).unwrap();

        let second = LocalPortPool::restore(12345, 12349, &path).unwrap();
        assert_eq!(second.next_port(), 12346);
    }

    #[test]
    fn test_corrupt_port_state_restarts_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ports.json");
        std::fs::write(&path, "not json").unwrap();

        let pool = LocalPortPool::restore(12345, 12349, &path).unwrap();
        assert_eq!(pool.current(), 12345);
    }

    #[tokio::test]
    async fn test_managers_sharing_port_state_take_successive_ports() {
        let dir = tempfile::tempdir().unwrap();
        // Nobody listens on the server port; the port is used up either way
        let (closed, local) = {
            let a = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let b = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            (a.local_addr().unwrap().port(), b.local_addr().unwrap().port())
        };
        let start = local.min(u16::MAX - 9);
        let network = NetworkConfig {
            server_address: "127.0.0.1".to_string(),
            server_port: closed,
            local_port_start: start,
            local_port_end: start + 9,
            connect_timeout_ms: 1_000,
            port_state_file: Some(dir.path().join("ports.json")),
            ..Default::default()
        };

        let first = ConnectionManager::from_config(&network).unwrap();
        let _ = first.acquire("127.0.0.1").await;

        let second = ConnectionManager::from_config(&network).unwrap();
        assert_eq!(second.ports().current(), start + 1);
    }

    #[test]
    fn test_from_config_rejects_zero_timeouts() {
        let network = NetworkConfig {
            write_timeout_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            ConnectionManager::from_config(&network),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_acquire_binds_source_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let port = free_local_port();

        let manager = ConnectionManager::new(
            ServerEndpoint::parse("127.0.0.1", server_addr.port()).unwrap(),
            LocalPortPool::new(port, port).unwrap(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );

        let server = tokio::spawn(async move {
            let (mut stream, peer) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            (peer, buf)
        });

        let mut conn = manager.acquire("127.0.0.1").await.unwrap();
        assert_eq!(conn.local_addr().port(), port);
        conn.send(b"#!ping").await.unwrap();
        conn.release().await;
        conn.release().await;
        assert!(!conn.is_open());

        let (peer, received) = server.await.unwrap();
        assert_eq!(peer.port(), port);
        assert_eq!(received, b"#!ping");
    }

    #[tokio::test]
    async fn test_acquire_rejects_invalid_interface() {
        let manager = ConnectionManager::new(
            ServerEndpoint::parse("127.0.0.1", 57343).unwrap(),
            LocalPortPool::new(12345, 12350).unwrap(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let err = manager.acquire("not-an-ip").await.unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
    }

    #[tokio::test]
    async fn test_acquire_refused_is_connection_error() {
        // Two distinct ports, nobody listening on either
        let (closed, local) = {
            let a = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let b = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            (a.local_addr().unwrap().port(), b.local_addr().unwrap().port())
        };
        let manager = ConnectionManager::new(
            ServerEndpoint::parse("127.0.0.1", closed).unwrap(),
            LocalPortPool::new(local, local).unwrap(),
            Duration::from_secs(2),
            Duration::from_secs(2),
        );
        let err = manager.acquire("127.0.0.1").await.unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
    }

    #[tokio::test]
    async fn test_send_after_release_fails() {
        let mock = tokio_test::io::Builder::new().build();
        let mut conn = Connection::new(
            mock,
            "127.0.0.1:12345".parse().unwrap(),
            "127.0.0.1:57343".parse().unwrap(),
            Duration::from_secs(1),
        );
        conn.release().await;
        let err = conn.send(b"#!").await.unwrap_err();
        assert!(matches!(err, Error::Send { .. }));
    }
}
