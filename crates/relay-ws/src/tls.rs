//! TLS secure channel over a [`Transport`], using rustls.
//!
//! Exposes the same [`ByteStream`] contract as the plain transport, so the
//! connection layer is transport-agnostic. The rustls client configuration
//! (webpki root store) is process-wide and built exactly once.

use std::io::{self, Read, Write};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rustls::{ClientConfig, ClientConnection, RootCertStore};
use rustls_pki_types::ServerName;
use tracing::{debug, trace, warn};

use crate::error::TlsError;
use crate::stream::{is_disconnect, ByteStream, Recv};
use crate::transport::Transport;

/// Sleep between handshake / flush attempts while the socket would block.
const IO_RETRY_DELAY: Duration = Duration::from_millis(1);

static CLIENT_CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

/// Shared rustls client configuration, initialized on first use.
pub fn client_config() -> Arc<ClientConfig> {
    CLIENT_CONFIG
        .get_or_init(|| {
            let root_store =
                RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();
            debug!("TLS client configuration initialized");
            Arc::new(config)
        })
        .clone()
}

/// A TLS session layered on a connected [`Transport`].
pub struct SecureChannel {
    transport: Transport,
    session: ClientConnection,
    closed: bool,
}

impl SecureChannel {
    /// Create a client session for `server_name` on top of `transport`.
    pub fn open(transport: Transport, server_name: &str) -> Result<Self, TlsError> {
        Self::open_with_config(transport, server_name, client_config())
    }

    /// Like [`open`](Self::open) with a caller-supplied rustls config.
    pub fn open_with_config(
        transport: Transport,
        server_name: &str,
        config: Arc<ClientConfig>,
    ) -> Result<Self, TlsError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::SetupFailed(format!("invalid server name: {server_name}")))?;
        let session =
            ClientConnection::new(config, name).map_err(|e| TlsError::SetupFailed(e.to_string()))?;
        Ok(Self {
            transport,
            session,
            closed: false,
        })
    }

    /// Drive the TLS handshake to completion.
    ///
    /// The socket is already non-blocking, so would-block results are
    /// retried until the handshake finishes or fails.
    pub fn connect(&mut self) -> Result<(), TlsError> {
        while self.session.is_handshaking() {
            match self.session.complete_io(self.transport.socket_mut()) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(IO_RETRY_DELAY)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(TlsError::HandshakeFailed(e.to_string())),
            }
        }
        self.flush_tls()
            .map_err(|e| TlsError::HandshakeFailed(e.to_string()))?;
        debug!(
            peer = %self.transport.peer_addr(),
            version = ?self.session.protocol_version(),
            "TLS handshake complete"
        );
        Ok(())
    }

    /// Push all pending TLS records to the socket.
    fn flush_tls(&mut self) -> io::Result<()> {
        while self.session.wants_write() {
            match self.session.write_tls(self.transport.socket_mut()) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(IO_RETRY_DELAY)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Move decrypted bytes from the session into `out`.
    ///
    /// Returns `Ok(true)` once the peer's close_notify has been consumed.
    fn drain_plaintext(&mut self, out: &mut Vec<u8>, chunk: &mut [u8]) -> io::Result<bool> {
        loop {
            match self.session.reader().read(chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
    }
}

impl ByteStream for SecureChannel {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.session.writer().write_all(data)?;
        self.flush_tls()
    }

    fn recv(&mut self, max: usize) -> Recv {
        let mut out = Vec::new();
        let mut chunk = vec![0u8; max.max(1)];
        let mut peer_closed = false;

        loop {
            match self.session.read_tls(self.transport.socket_mut()) {
                Ok(0) => peer_closed = true,
                Ok(_) => {
                    if let Err(e) = self.session.process_new_packets() {
                        warn!(error = %e, "TLS record processing failed");
                        // Best effort: let the peer see our alert.
                        let _ = self.flush_tls();
                        return Recv::Error(io::Error::new(io::ErrorKind::InvalidData, e));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_disconnect(&e) => return Recv::Disconnected,
                Err(e) => return Recv::Error(e),
            }

            let before = out.len();
            match self.drain_plaintext(&mut out, &mut chunk) {
                Ok(true) => peer_closed = true,
                Ok(false) => {}
                // Transport closed without close_notify.
                Err(e) if is_disconnect(&e) => peer_closed = true,
                Err(e) => return Recv::Error(e),
            }

            // Keep reading only while full chunks keep arriving.
            let got = out.len() - before;
            if peer_closed || got < chunk.len() {
                break;
            }
        }

        if !out.is_empty() {
            trace!(len = out.len(), "TLS recv");
            Recv::Data(out)
        } else if peer_closed {
            Recv::Disconnected
        } else {
            Recv::Waiting
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.session.send_close_notify();
            let _ = self.flush_tls();
            self.transport.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Address, Endpoint};
    use std::net::{IpAddr, Ipv4Addr, TcpListener};

    fn loopback_transport(listener: &TcpListener) -> Transport {
        let port = listener.local_addr().unwrap().port();
        let endpoint = Endpoint::new(
            "127.0.0.1",
            port,
            Address::new(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        );
        Transport::connect(&endpoint).unwrap()
    }

    #[test]
    fn test_client_config_is_initialized_once() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(client_config))
            .collect();
        let configs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for config in &configs {
            assert!(Arc::ptr_eq(config, &configs[0]));
        }
        assert!(Arc::ptr_eq(&client_config(), &configs[0]));
    }

    #[test]
    fn test_invalid_server_name_is_setup_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let transport = loopback_transport(&listener);
        let err = SecureChannel::open(transport, "not a host name").err().unwrap();
        assert!(matches!(err, TlsError::SetupFailed(_)));
    }

    #[test]
    fn test_handshake_fails_when_peer_hangs_up() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let transport = loopback_transport(&listener);
        let server = std::thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            drop(socket);
        });

        let mut channel = SecureChannel::open(transport, "localhost").unwrap();
        let err = channel.connect().unwrap_err();
        assert!(matches!(err, TlsError::HandshakeFailed(_)));
        server.join().unwrap();
    }

    #[test]
    fn test_handshake_fails_on_plaintext_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let transport = loopback_transport(&listener);
        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let _ = socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n");
            std::thread::sleep(Duration::from_millis(100));
        });

        let mut channel = SecureChannel::open(transport, "localhost").unwrap();
        assert!(matches!(
            channel.connect(),
            Err(TlsError::HandshakeFailed(_))
        ));
        server.join().unwrap();
    }
}
