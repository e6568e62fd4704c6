//! TCP transport: name resolution, connect, and non-blocking byte I/O.
//!
//! Knows nothing about TLS or WebSocket framing. After a successful connect
//! the socket is switched to non-blocking mode so the read loop can poll
//! [`Transport::recv`] without stalling its thread.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::TransportError;
use crate::stream::{is_disconnect, ByteStream, Recv};

/// Back-off between retries when the kernel send buffer is full.
const SEND_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Address family filter for [`resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Unspecified,
    V4,
    V6,
}

/// A resolved IP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    ip: IpAddr,
}

impl Address {
    pub fn new(ip: IpAddr) -> Self {
        Self { ip }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn family(&self) -> Family {
        match self.ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    fn matches(&self, family: Family) -> bool {
        family == Family::Unspecified || self.family() == family
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.ip.fmt(f)
    }
}

/// Where to connect: the original host name, a port and one resolved address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
    address: Address,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, address: Address) -> Self {
        Self {
            host: host.into(),
            port,
            address,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address.ip, self.port)
    }
}

/// Resolve `host` through the system resolver.
///
/// Results keep resolver order, are deduplicated by textual address and
/// filtered by `family`. An empty result is reported as
/// [`TransportError::ResolutionFailed`].
pub fn resolve(host: &str, family: Family) -> Result<Vec<Address>, TransportError> {
    let resolved = (host, 0u16)
        .to_socket_addrs()
        .map_err(|e| TransportError::ResolutionFailed {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

    let addresses = dedup_addresses(resolved.map(|sa| Address::new(sa.ip())), family);
    if addresses.is_empty() {
        return Err(TransportError::ResolutionFailed {
            host: host.to_string(),
            reason: format!("no {:?} addresses", family),
        });
    }
    debug!(host, count = addresses.len(), "resolved host");
    Ok(addresses)
}

fn dedup_addresses(all: impl Iterator<Item = Address>, family: Family) -> Vec<Address> {
    let mut seen: Vec<String> = Vec::new();
    let mut out = Vec::new();
    for address in all.filter(|a| a.matches(family)) {
        let text = address.to_string();
        if !seen.contains(&text) {
            seen.push(text);
            out.push(address);
        }
    }
    out
}

/// A connected, non-blocking TCP stream socket.
pub struct Transport {
    socket: TcpStream,
    peer: SocketAddr,
    closed: bool,
}

impl Transport {
    /// Open a TCP stream socket to `endpoint` and connect it.
    pub fn connect(endpoint: &Endpoint) -> Result<Self, TransportError> {
        let addr = endpoint.socket_addr();
        let socket =
            TcpStream::connect(addr).map_err(|source| TransportError::ConnectFailed { addr, source })?;
        Self::from_connected(socket)
    }

    /// Try each address in order and keep the first that connects.
    pub fn connect_any(
        host: &str,
        port: u16,
        addresses: &[Address],
    ) -> Result<Self, TransportError> {
        let mut last_err = None;
        for address in addresses {
            let endpoint = Endpoint::new(host, port, *address);
            match Self::connect(&endpoint) {
                Ok(transport) => return Ok(transport),
                Err(e) => {
                    debug!(%address, port, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| TransportError::ResolutionFailed {
            host: host.to_string(),
            reason: "no addresses to connect to".to_string(),
        }))
    }

    /// Adopt an already-connected socket, switching it to non-blocking mode.
    pub fn from_connected(socket: TcpStream) -> Result<Self, TransportError> {
        let peer = socket.peer_addr()?;
        socket
            .set_nonblocking(true)
            .and_then(|()| socket.set_nodelay(true))
            .map_err(|source| TransportError::SocketOpenFailed { addr: peer, source })?;
        debug!(%peer, "transport connected");
        Ok(Self {
            socket,
            peer,
            closed: false,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn socket_mut(&mut self) -> &mut TcpStream {
        &mut self.socket
    }
}

impl ByteStream for Transport {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let mut remaining = data;
        while !remaining.is_empty() {
            match self.socket.write(remaining) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => remaining = &remaining[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(SEND_RETRY_DELAY)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn recv(&mut self, max: usize) -> Recv {
        let mut out = Vec::new();
        let mut chunk = vec![0u8; max.max(1)];
        loop {
            match self.socket.read(&mut chunk) {
                Ok(0) if out.is_empty() => return Recv::Disconnected,
                Ok(0) => break,
                Ok(n) => {
                    out.extend_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if out.is_empty() {
                        return Recv::Waiting;
                    }
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if is_disconnect(&e) => return Recv::Disconnected,
                Err(e) => return Recv::Error(e),
            }
        }
        trace!(peer = %self.peer, len = out.len(), "transport recv");
        Recv::Data(out)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.socket.shutdown(Shutdown::Both);
            debug!(peer = %self.peer, "transport closed");
        }
    }
}
