//! WebSocket connection: upgrade handshake, state machine, read loop and
//! the serialized write path.
//!
//! ## Threading
//!
//! One reader thread per connection polls the stream, feeds the handshake
//! buffer or the frame decoder and invokes the [`ConnectionHandler`]. Every
//! writer (the reader replying to pings, the application, a heartbeat task)
//! goes through the same mutex around the stream, so frames never
//! interleave. The reader holds that mutex only for one non-blocking read,
//! and callbacks run with it released.
//!
//! ## States
//!
//! `Connecting -> Open -> Closing -> Closed`, advanced with `fetch_max` so a
//! connection never moves backwards. `Closed` is terminal.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::codec::{self, CloseStatus, Decoded, FrameDecoder, Opcode, DEFAULT_MAX_PAYLOAD};
use crate::error::{Error, Result};
use crate::handshake::{HandshakeBuffer, HandshakeProgress, UpgradeRequest};
use crate::stream::{ByteStream, Recv};
use crate::target::Target;
use crate::task::{CancelToken, Task};
use crate::tls::SecureChannel;
use crate::transport::{resolve, Family, Transport};

/// Lifecycle of a [`Connection`]. Ordered: later states compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> ConnectionState {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Tuning knobs for a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bytes requested per non-blocking read.
    pub recv_chunk: usize,
    /// Sleep between polls when nothing was available.
    pub idle_poll: Duration,
    /// Largest frame payload accepted from the peer.
    pub max_payload: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            recv_chunk: 1024,
            idle_poll: Duration::from_millis(1),
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// An application message received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(bytes) => bytes,
        }
    }
}

/// Connection lifecycle callbacks, all invoked on the reader thread.
///
/// Every method has an empty default, so handlers only implement what they
/// care about. The `&Connection` argument can be used to write back.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// The upgrade request has been sent. First callback on the reader
    /// thread, before any response bytes are read.
    fn on_connect(&self, _conn: &Connection) {}

    /// The server accepted the upgrade.
    fn on_open(&self, _conn: &Connection) {}

    fn on_message(&self, _conn: &Connection, _message: Message) {}

    /// The peer started the closing handshake.
    fn on_close(&self, _conn: &Connection, _status: CloseStatus, _reason: &str) {}

    /// The stream is gone: peer disconnect, read error or a fatal protocol
    /// error. Fired at most once.
    fn on_disconnect(&self, _conn: &Connection) {}
}

impl<T: ConnectionHandler + ?Sized> ConnectionHandler for Arc<T> {
    fn on_connect(&self, conn: &Connection) {
        (**self).on_connect(conn)
    }

    fn on_open(&self, conn: &Connection) {
        (**self).on_open(conn)
    }

    fn on_message(&self, conn: &Connection, message: Message) {
        (**self).on_message(conn, message)
    }

    fn on_close(&self, conn: &Connection, status: CloseStatus, reason: &str) {
        (**self).on_close(conn, status, reason)
    }

    fn on_disconnect(&self, conn: &Connection) {
        (**self).on_disconnect(conn)
    }
}

struct Inner {
    state: AtomicU8,
    stream: Mutex<Box<dyn ByteStream>>,
    config: ConnectionConfig,
    reader: Mutex<Option<Arc<Task>>>,
}

/// Handle to a WebSocket connection. Clones share the same socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Connect to `url` with the default [`ConnectionConfig`].
    pub fn connect<H: ConnectionHandler>(url: &str, handler: H) -> Result<Connection> {
        Self::connect_with(url, handler, ConnectionConfig::default())
    }

    /// Resolve, connect, wrap in TLS for `wss`/`https`, send the upgrade
    /// request and start the reader thread.
    pub fn connect_with<H: ConnectionHandler>(
        url: &str,
        handler: H,
        config: ConnectionConfig,
    ) -> Result<Connection> {
        let target = Target::parse(url)?;
        let addresses = resolve(target.host(), Family::Unspecified)?;
        let transport = Transport::connect_any(target.host(), target.port(), &addresses)?;

        let stream: Box<dyn ByteStream> = if target.is_secure() {
            let mut channel = SecureChannel::open(transport, target.host())?;
            channel.connect()?;
            Box::new(channel)
        } else {
            Box::new(transport)
        };

        let request = UpgradeRequest::new(&target);
        info!(target = %target, "connecting");
        Self::start_boxed(stream, &request, Arc::new(handler), config)
    }

    /// Run the handshake and reader over an already-connected stream.
    pub fn start<S, H>(
        stream: S,
        request: &UpgradeRequest,
        handler: H,
        config: ConnectionConfig,
    ) -> Result<Connection>
    where
        S: ByteStream + 'static,
        H: ConnectionHandler,
    {
        Self::start_boxed(Box::new(stream), request, Arc::new(handler), config)
    }

    fn start_boxed(
        stream: Box<dyn ByteStream>,
        request: &UpgradeRequest,
        handler: Arc<dyn ConnectionHandler>,
        config: ConnectionConfig,
    ) -> Result<Connection> {
        let conn = Connection::new(stream, config);
        conn.send_raw(request.render().as_bytes())?;
        debug!("upgrade request sent");

        let reader = ReadLoop::new(conn.clone(), handler);
        let task = Task::spawn("relay-ws-reader", move |token| reader.run(token))?;
        *conn.inner.reader.lock() = Some(Arc::new(task));
        Ok(conn)
    }

    pub(crate) fn new(stream: Box<dyn ByteStream>, config: ConnectionConfig) -> Connection {
        Connection {
            inner: Arc::new(Inner {
                state: AtomicU8::new(ConnectionState::Connecting as u8),
                stream: Mutex::new(stream),
                config,
                reader: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Move forward to `to` (never backwards). Returns the previous state.
    fn advance(&self, to: ConnectionState) -> ConnectionState {
        let prev = ConnectionState::from_u8(self.inner.state.fetch_max(to as u8, Ordering::SeqCst));
        if prev < to {
            debug!(from = ?prev, to = ?to, "connection state changed");
        }
        prev
    }

    /// Send a masked Text frame. Fails with [`Error::NotOpen`] outside `Open`.
    pub fn write(&self, text: &str) -> Result<()> {
        self.write_frame(Opcode::Text, text.as_bytes())
    }

    /// Send a masked Binary frame.
    pub fn write_binary(&self, bytes: &[u8]) -> Result<()> {
        self.write_frame(Opcode::Binary, bytes)
    }

    fn write_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(Error::NotOpen { state });
        }
        self.send_frame(opcode, payload)
    }

    fn send_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        let frame = codec::encode(true, opcode, payload);
        trace!(?opcode, len = payload.len(), "sending frame");
        self.send_raw(&frame)
    }

    fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        self.inner.stream.lock().send(bytes)?;
        Ok(())
    }

    fn shutdown_stream(&self) {
        self.inner.stream.lock().close();
    }

    /// Close the connection. When `Open`, a Close frame with `status` is sent
    /// first (best effort). The reader exits on its next poll.
    pub fn close(&self, status: CloseStatus) {
        let prev = self.advance(ConnectionState::Closed);
        if prev == ConnectionState::Closed {
            return;
        }
        if prev == ConnectionState::Open {
            let payload = codec::build_close_payload(status, "");
            if let Err(e) = self.send_frame(Opcode::Close, &payload) {
                debug!(error = %e, "close frame not sent");
            }
        }
        self.shutdown_stream();
        if let Some(reader) = self.inner.reader.lock().as_ref() {
            reader.cancel();
        }
        info!(status = status.code(), "connection closed");
    }

    /// Block until the connection reaches `Closed`.
    pub fn wait_closed(&self, poll_interval: Duration) {
        while self.state() != ConnectionState::Closed {
            std::thread::sleep(poll_interval);
        }
    }

    /// Wait for the reader thread to exit. Returns immediately when called
    /// from a callback on the reader thread.
    pub fn join(&self) {
        let reader = self.inner.reader.lock().clone();
        if let Some(reader) = reader {
            reader.join();
        }
    }
}

/// What one poll of the reader accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Poll {
    Idle,
    Progress,
    Stop,
}

/// Reader-side state: handshake accumulation, frame decoding and dispatch.
pub(crate) struct ReadLoop {
    conn: Connection,
    handler: Arc<dyn ConnectionHandler>,
    handshake: HandshakeBuffer,
    decoder: FrameDecoder,
    events: Vec<Decoded>,
}

impl ReadLoop {
    pub(crate) fn new(conn: Connection, handler: Arc<dyn ConnectionHandler>) -> Self {
        let decoder = FrameDecoder::new(conn.config().max_payload);
        Self {
            conn,
            handler,
            handshake: HandshakeBuffer::new(),
            decoder,
            events: Vec::new(),
        }
    }

    fn run(mut self, token: CancelToken) {
        self.handler.on_connect(&self.conn);
        let idle = self.conn.config().idle_poll;
        loop {
            if token.is_cancelled() {
                break;
            }
            match self.poll_once() {
                Poll::Idle => std::thread::sleep(idle),
                Poll::Progress => {}
                Poll::Stop => break,
            }
        }
        debug!("read loop exited");
    }

    pub(crate) fn poll_once(&mut self) -> Poll {
        if self.conn.state() == ConnectionState::Closed {
            return Poll::Stop;
        }
        let chunk = self.conn.config().recv_chunk;
        let received = self.conn.inner.stream.lock().recv(chunk);

        match received {
            Recv::Waiting => Poll::Idle,
            Recv::Disconnected => {
                debug!("peer disconnected");
                self.disconnect();
                Poll::Stop
            }
            Recv::Error(e) => {
                warn!(error = %e, "read failed");
                self.disconnect();
                Poll::Stop
            }
            Recv::Data(bytes) => {
                self.on_bytes(&bytes);
                if self.conn.state() == ConnectionState::Closed {
                    Poll::Stop
                } else {
                    Poll::Progress
                }
            }
        }
    }

    fn disconnect(&mut self) {
        let prev = self.conn.advance(ConnectionState::Closed);
        self.conn.shutdown_stream();
        if prev != ConnectionState::Closed {
            info!("connection lost");
            self.handler.on_disconnect(&self.conn);
        }
    }

    fn on_bytes(&mut self, bytes: &[u8]) {
        match self.conn.state() {
            ConnectionState::Connecting => match self.handshake.feed(bytes) {
                HandshakeProgress::Pending => {}
                HandshakeProgress::Rejected { status_line } => {
                    warn!(%status_line, "unexpected upgrade response, still connecting");
                }
                HandshakeProgress::Accepted { accept, remainder } => {
                    // Known gap: the accept key is not checked against our key.
                    debug!(accept = accept.as_deref().unwrap_or("<none>"), "upgrade accepted");
                    self.conn.advance(ConnectionState::Open);
                    info!("connection open");
                    self.handler.on_open(&self.conn);
                    if !remainder.is_empty() {
                        self.on_frames(&remainder);
                    }
                }
            },
            ConnectionState::Open => self.on_frames(bytes),
            ConnectionState::Closing => trace!(len = bytes.len(), "draining after close"),
            ConnectionState::Closed => {}
        }
    }

    fn on_frames(&mut self, bytes: &[u8]) {
        if self.conn.state() != ConnectionState::Open {
            return;
        }
        let mut events = std::mem::take(&mut self.events);
        let result = self.decoder.decode(bytes, &mut events);

        for event in events.drain(..) {
            if self.conn.state() != ConnectionState::Open {
                break;
            }
            self.dispatch(event);
        }
        self.events = events;

        if let Err(e) = result {
            if self.conn.state() == ConnectionState::Open {
                warn!(error = %e, "protocol error, dropping connection");
                self.disconnect();
            }
        }
    }

    fn dispatch(&mut self, event: Decoded) {
        match event {
            Decoded::Data { opcode, payload } => {
                let message = match opcode {
                    Opcode::Binary => Message::Binary(payload),
                    _ => Message::Text(match String::from_utf8(payload) {
                        Ok(text) => text,
                        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
                    }),
                };
                self.handler.on_message(&self.conn, message);
            }
            Decoded::Close { status, reason } => {
                let prev = self.conn.advance(ConnectionState::Closing);
                info!(status = status.code(), %reason, "peer closed the connection");
                if prev == ConnectionState::Open {
                    // 1005 only means "no status" and is never put on the wire.
                    let payload = match status {
                        CloseStatus::NoStatus => Vec::new(),
                        status => codec::build_close_payload(status, ""),
                    };
                    if let Err(e) = self.conn.send_frame(Opcode::Close, &payload) {
                        debug!(error = %e, "close echo not sent");
                    }
                }
                self.handler.on_close(&self.conn, status, &reason);
            }
            Decoded::Ping(payload) => {
                debug!(len = payload.len(), "ping received");
                if let Err(e) = self.conn.send_frame(Opcode::Pong, &payload) {
                    warn!(error = %e, "pong not sent");
                }
            }
            Decoded::Pong(payload) => trace!(len = payload.len(), "pong received"),
        }
    }
}
