//! Client-side WebSocket (RFC 6455) over plain TCP or TLS.
//!
//! Layers, leaf first:
//!
//! - [`transport`]: DNS resolution, TCP connect, non-blocking byte I/O
//! - [`tls`]: rustls session over a transport, same [`ByteStream`] contract
//! - [`codec`]: frame encode/decode with masking and partial-frame reassembly
//! - [`handshake`]: upgrade request, handshake key, response parsing
//! - [`connection`]: state machine, reader thread, serialized writes
//!
//! ```no_run
//! use relay_ws::{CloseStatus, Connection, ConnectionHandler, Message};
//!
//! struct Echo;
//!
//! impl ConnectionHandler for Echo {
//!     fn on_message(&self, conn: &Connection, message: Message) {
//!         if let Message::Text(text) = message {
//!             let _ = conn.write(&text);
//!         }
//!     }
//! }
//!
//! let conn = Connection::connect("wss://echo.example.org/", Echo)?;
//! conn.close(CloseStatus::Normal);
//! # Ok::<(), relay_ws::Error>(())
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod stream;
pub mod target;
pub mod task;
pub mod tls;
pub mod transport;

pub use codec::{CloseStatus, Decoded, Frame, FrameDecoder, Opcode};
pub use connection::{Connection, ConnectionConfig, ConnectionHandler, ConnectionState, Message};
pub use error::{Error, ProtocolError, Result, TlsError, TransportError};
pub use handshake::{create_handshake_key, UpgradeRequest};
pub use stream::{ByteStream, MemoryStream, Recv};
pub use target::Target;
pub use task::{CancelToken, Task};
pub use tls::SecureChannel;
pub use transport::{resolve, Address, Endpoint, Family, Transport};
