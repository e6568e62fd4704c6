//! Error types for the WebSocket client stack.
//!
//! Each layer owns its own enum so callers can tell a DNS failure from a TLS
//! failure from a malformed frame:
//!
//! | Layer | Type |
//! |-------|------|
//! | TCP / DNS | [`TransportError`] |
//! | TLS | [`TlsError`] |
//! | Framing | [`ProtocolError`] |
//! | Connection API | [`enum@Error`] |
//!
//! [`ProtocolError`] comes out of [`FrameDecoder`](crate::FrameDecoder) only;
//! a connection that hits one reports it through `on_disconnect`.
//!
//! `Waiting` and `Disconnected` are not errors; they are [`Recv`](crate::Recv)
//! outcomes that drive state transitions.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::connection::ConnectionState;

/// Result alias used by the connection-level API.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures while resolving, opening or connecting the TCP socket.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Name resolution failed or produced no usable address.
    #[error("failed to resolve {host}: {reason}")]
    ResolutionFailed {
        /// Host that was looked up.
        host: String,
        /// Resolver message, or why the result set was empty.
        reason: String,
    },

    /// The connected descriptor could not be prepared for non-blocking use.
    #[error("failed to open socket to {addr}: {source}")]
    SocketOpenFailed {
        /// Peer address of the socket.
        addr: SocketAddr,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// `connect()` was refused, unreachable or otherwise failed.
    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        /// Address the connect was attempted against.
        addr: SocketAddr,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A send could not complete.
    #[error("socket I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Failures while establishing the TLS session.
#[derive(Debug, Error)]
pub enum TlsError {
    /// The session object could not be created (bad server name, config).
    #[error("TLS setup failed: {0}")]
    SetupFailed(String),

    /// The TLS handshake with the peer failed.
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),
}

/// Malformed WebSocket frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Opcode is one of the reserved values.
    #[error("invalid frame: unknown opcode 0x{0:X}")]
    UnknownOpcode(u8),

    /// 64-bit payload length with the most significant bit set.
    #[error("invalid frame: most significant bit of 64-bit length is set")]
    LengthOverflow,

    /// Declared payload larger than the configured maximum.
    #[error("invalid frame: payload length {len} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Declared payload length.
        len: u64,
        /// Configured limit.
        max: u64,
    },
}

/// Errors surfaced synchronously by [`Connection`](crate::Connection).
#[derive(Debug, Error)]
pub enum Error {
    /// The connection URL could not be parsed.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Scheme other than `ws`, `wss`, `http` or `https`.
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    /// URL without a host component.
    #[error("URL has no host")]
    MissingHost,

    /// TCP / DNS failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// TLS failure.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// A write was attempted outside the `Open` state.
    #[error("connection is not open (state: {state:?})")]
    NotOpen {
        /// State at the time of the write.
        state: ConnectionState,
    },

    /// Writing to an established stream failed.
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
}
