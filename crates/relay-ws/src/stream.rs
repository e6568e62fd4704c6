//! Byte-stream contract shared by the plain TCP and TLS layers.
//!
//! Higher layers only see [`ByteStream`], so a [`Connection`](crate::Connection)
//! does not care whether it runs over [`Transport`](crate::Transport),
//! [`SecureChannel`](crate::SecureChannel) or the in-memory [`MemoryStream`].

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

/// Outcome of a single non-blocking read.
#[derive(Debug)]
pub enum Recv {
    /// All bytes that were available right now.
    Data(Vec<u8>),
    /// Nothing to read yet; try again later.
    Waiting,
    /// The peer closed the connection.
    Disconnected,
    /// An unrecoverable read error.
    Error(io::Error),
}

/// Non-blocking, bidirectional byte pipe.
pub trait ByteStream: Send {
    /// Write every byte of `data`, retrying partial writes.
    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read whatever is currently available, in chunks of at most `max`.
    fn recv(&mut self, max: usize) -> Recv;

    /// Shut the stream down. Safe to call more than once.
    fn close(&mut self);
}

/// Returns true for I/O errors that mean the peer or the network went away.
pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

enum Scripted {
    Data(Vec<u8>),
    Disconnect,
}

#[derive(Default)]
struct MemoryInner {
    inbound: VecDeque<Scripted>,
    outbound: Vec<u8>,
    closed: bool,
}

/// In-memory [`ByteStream`] for driving a connection without a socket.
///
/// Clones share the same buffers: keep one clone to script inbound bytes
/// and inspect what the connection wrote.
#[derive(Clone, Default)]
pub struct MemoryStream {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes to be returned by the next `recv`.
    pub fn push_inbound(&self, bytes: impl Into<Vec<u8>>) {
        self.inner
            .lock()
            .inbound
            .push_back(Scripted::Data(bytes.into()));
    }

    /// Queue a peer disconnect after any pending inbound data.
    pub fn push_disconnect(&self) {
        self.inner.lock().inbound.push_back(Scripted::Disconnect);
    }

    /// Take everything written so far.
    pub fn take_outbound(&self) -> Vec<u8> {
        std::mem::take(&mut self.inner.lock().outbound)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl ByteStream for MemoryStream {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        inner.outbound.extend_from_slice(data);
        Ok(())
    }

    fn recv(&mut self, _max: usize) -> Recv {
        let mut inner = self.inner.lock();
        match inner.inbound.pop_front() {
            Some(Scripted::Data(bytes)) => Recv::Data(bytes),
            Some(Scripted::Disconnect) => Recv::Disconnected,
            None if inner.closed => Recv::Disconnected,
            None => Recv::Waiting,
        }
    }

    fn close(&mut self) {
        self.inner.lock().closed = true;
    }
}
