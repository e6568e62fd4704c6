//! Client side of the HTTP/1.1 upgrade handshake (RFC 6455 Section 4.1).
//!
//! - [`create_handshake_key`]: random 12-character nonce hashed with the GUID
//! - [`UpgradeRequest`]: the `GET ... Upgrade: websocket` request
//! - [`HandshakeBuffer`]: accumulates the server's response until the status
//!   line and header block are complete
//!
//! The server's `Sec-WebSocket-Accept` value is recorded but not verified.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::distr::Alphanumeric;
use rand::Rng;
use sha1::{Digest, Sha1};

use crate::target::Target;

/// RFC 6455 magic GUID appended to the key before hashing.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const NONCE_LEN: usize = 12;

/// Upper bound on a response head before it is given up on.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Generate a fresh `Sec-WebSocket-Key`.
pub fn create_handshake_key() -> String {
    let nonce: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(NONCE_LEN)
        .map(char::from)
        .collect();
    handshake_key_from_nonce(&nonce)
}

/// `base64(sha1(nonce + GUID))`. Also the server-side accept computation
/// when given the client's key.
pub fn handshake_key_from_nonce(nonce: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// The upgrade request for one connection attempt.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    request_target: String,
    host: String,
    key: String,
}

impl UpgradeRequest {
    pub fn new(target: &Target) -> Self {
        Self::with_key(target, create_handshake_key())
    }

    pub fn with_key(target: &Target, key: impl Into<String>) -> Self {
        Self {
            request_target: target.request_target(),
            host: target.host_header(),
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn render(&self) -> String {
        format!(
            "GET {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             \r\n",
            self.request_target, self.host, self.key
        )
    }
}

/// True when `line` is an HTTP status line with code 101, whatever the
/// reason phrase or surrounding whitespace.
pub fn is_switching_protocols(line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let version_ok = parts.next().is_some_and(|v| v.starts_with("HTTP/"));
    version_ok && parts.next().and_then(|c| c.parse::<u16>().ok()) == Some(101)
}

/// Result of feeding response bytes to a [`HandshakeBuffer`].
#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeProgress {
    /// Need more bytes.
    Pending,
    /// The status line was not a 101; buffered bytes were dropped.
    Rejected { status_line: String },
    /// Header block complete. `remainder` already belongs to the frame stream.
    Accepted {
        accept: Option<String>,
        remainder: Vec<u8>,
    },
}

/// Accumulates the server's upgrade response.
#[derive(Debug, Default)]
pub struct HandshakeBuffer {
    buf: Vec<u8>,
    status_ok: bool,
}

impl HandshakeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> HandshakeProgress {
        self.buf.extend_from_slice(bytes);

        if !self.status_ok {
            let Some(line_end) = find(&self.buf, b"\r\n") else {
                return self.check_limit();
            };
            let line = String::from_utf8_lossy(&self.buf[..line_end]).into_owned();
            if !is_switching_protocols(&line) {
                self.buf.clear();
                return HandshakeProgress::Rejected {
                    status_line: line.trim().to_string(),
                };
            }
            self.status_ok = true;
        }

        let Some(head_end) = find(&self.buf, b"\r\n\r\n") else {
            return self.check_limit();
        };
        let head = String::from_utf8_lossy(&self.buf[..head_end]).into_owned();
        let remainder = self.buf.split_off(head_end + 4);
        self.buf.clear();
        HandshakeProgress::Accepted {
            accept: header_value(&head, "Sec-WebSocket-Accept"),
            remainder,
        }
    }

    fn check_limit(&mut self) -> HandshakeProgress {
        if self.buf.len() <= MAX_RESPONSE_HEAD {
            return HandshakeProgress::Pending;
        }
        let status_line = String::from_utf8_lossy(&self.buf[..64.min(self.buf.len())]).into_owned();
        self.buf.clear();
        self.status_ok = false;
        HandshakeProgress::Rejected { status_line }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn header_value(head: &str, name: &str) -> Option<String> {
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().to_string())
    })
}
