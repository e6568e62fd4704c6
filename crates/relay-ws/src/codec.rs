//! WebSocket frame codec (RFC 6455 Section 5.2-5.3), client side.
//!
//! - [`encode`]: build one FIN frame, masked with a fresh random key
//! - [`FrameDecoder`]: turn arbitrary read chunks into [`Decoded`] events,
//!   keeping the prefix of an incomplete frame between calls
//! - [`apply_mask`]: symmetric XOR masking per RFC 6455 Section 5.3
//!
//! Frames are never fragmented on the way out.

use tracing::trace;

use crate::error::ProtocolError;

/// Default cap on a single frame's declared payload (64 MiB).
pub const DEFAULT_MAX_PAYLOAD: u64 = 64 * 1024 * 1024;

/// WebSocket frame opcodes per RFC 6455 Section 5.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Parse the low nibble of the first header byte.
    pub fn from_u8(byte: u8) -> Result<Opcode, ProtocolError> {
        match byte {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

/// Close status codes per RFC 6455 Section 7.4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    Normal,
    GoingAway,
    ProtocolError,
    UnsupportedData,
    NoStatus,
    Abnormal,
    InvalidPayload,
    PolicyViolation,
    MessageTooBig,
    ExtensionRequired,
    InternalError,
    ServiceRestart,
    TryAgainLater,
    BadGateway,
    TlsHandshake,
    SubprotocolError,
    InvalidSubprotocolData,
    /// Any code without a name above, kept verbatim.
    Other(u16),
}

impl CloseStatus {
    pub fn from_code(code: u16) -> CloseStatus {
        match code {
            1000 => CloseStatus::Normal,
            1001 => CloseStatus::GoingAway,
            1002 => CloseStatus::ProtocolError,
            1003 => CloseStatus::UnsupportedData,
            1005 => CloseStatus::NoStatus,
            1006 => CloseStatus::Abnormal,
            1007 => CloseStatus::InvalidPayload,
            1008 => CloseStatus::PolicyViolation,
            1009 => CloseStatus::MessageTooBig,
            1010 => CloseStatus::ExtensionRequired,
            1011 => CloseStatus::InternalError,
            1012 => CloseStatus::ServiceRestart,
            1013 => CloseStatus::TryAgainLater,
            1014 => CloseStatus::BadGateway,
            1015 => CloseStatus::TlsHandshake,
            3000 => CloseStatus::SubprotocolError,
            3001 => CloseStatus::InvalidSubprotocolData,
            other => CloseStatus::Other(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            CloseStatus::Normal => 1000,
            CloseStatus::GoingAway => 1001,
            CloseStatus::ProtocolError => 1002,
            CloseStatus::UnsupportedData => 1003,
            CloseStatus::NoStatus => 1005,
            CloseStatus::Abnormal => 1006,
            CloseStatus::InvalidPayload => 1007,
            CloseStatus::PolicyViolation => 1008,
            CloseStatus::MessageTooBig => 1009,
            CloseStatus::ExtensionRequired => 1010,
            CloseStatus::InternalError => 1011,
            CloseStatus::ServiceRestart => 1012,
            CloseStatus::TryAgainLater => 1013,
            CloseStatus::BadGateway => 1014,
            CloseStatus::TlsHandshake => 1015,
            CloseStatus::SubprotocolError => 3000,
            CloseStatus::InvalidSubprotocolData => 3001,
            CloseStatus::Other(code) => code,
        }
    }
}

/// One parsed frame. Only lives for the duration of a decode call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub masked: bool,
    /// Unmasked payload bytes.
    pub payload: Vec<u8>,
    pub mask_key: Option<[u8; 4]>,
    /// Set for Close frames only.
    pub close_status: Option<CloseStatus>,
}

/// What the decoder hands to the connection for each complete frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Text, Binary or Continuation payload.
    Data { opcode: Opcode, payload: Vec<u8> },
    Close { status: CloseStatus, reason: String },
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

impl From<Frame> for Decoded {
    fn from(frame: Frame) -> Self {
        match frame.opcode {
            Opcode::Close => {
                let (status, reason) = parse_close_payload(&frame.payload);
                Decoded::Close { status, reason }
            }
            Opcode::Ping => Decoded::Ping(frame.payload),
            Opcode::Pong => Decoded::Pong(frame.payload),
            opcode => Decoded::Data {
                opcode,
                payload: frame.payload,
            },
        }
    }
}

/// XOR `payload` with `mask_key`. Applying it twice restores the input.
pub fn apply_mask(payload: &mut [u8], mask_key: &[u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

/// Split a Close payload into status and reason. Shorter than two bytes
/// means no status was sent (1005).
pub fn parse_close_payload(payload: &[u8]) -> (CloseStatus, String) {
    if payload.len() >= 2 {
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
        (CloseStatus::from_code(code), reason)
    } else {
        (CloseStatus::NoStatus, String::new())
    }
}

/// Close payload: 2-byte status, then the reason cut to fit a control frame.
pub fn build_close_payload(status: CloseStatus, reason: &str) -> Vec<u8> {
    let reason = reason.as_bytes();
    let reason = &reason[..reason.len().min(123)];
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&status.code().to_be_bytes());
    payload.extend_from_slice(reason);
    payload
}

/// Encode a single FIN frame. Masked frames get a fresh random key.
pub fn encode(masked: bool, opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let key = masked.then(rand::random::<[u8; 4]>);
    encode_with_key(opcode, payload, key)
}

/// Encode a single FIN frame, masking with `mask_key` when given.
pub fn encode_with_key(opcode: Opcode, payload: &[u8], mask_key: Option<[u8; 4]>) -> Vec<u8> {
    let mask_bit = if mask_key.is_some() { 0x80 } else { 0x00 };
    let len = payload.len();
    let mut out = Vec::with_capacity(14 + len);

    out.push(0x80 | opcode as u8);
    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= 0xFFFF {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask_key {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(payload);
            apply_mask(&mut out[start..], &key);
        }
        None => out.extend_from_slice(payload),
    }
    out
}

/// Try to parse one frame from the front of `buf`.
///
/// `Ok(None)` means the buffer holds only a prefix of a frame. On success
/// the number of bytes the frame occupied is returned with it.
fn parse_frame(buf: &[u8], max_payload: u64) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let fin = buf[0] & 0x80 != 0;
    let opcode = Opcode::from_u8(buf[0] & 0x0F)?;
    let masked = buf[1] & 0x80 != 0;

    let (payload_len, mut header) = match buf[1] & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(raw);
            if len >> 63 != 0 {
                return Err(ProtocolError::LengthOverflow);
            }
            (len, 10)
        }
        short => (u64::from(short), 2),
    };

    if payload_len > max_payload {
        return Err(ProtocolError::PayloadTooLarge {
            len: payload_len,
            max: max_payload,
        });
    }

    let mask_key = if masked {
        if buf.len() < header + 4 {
            return Ok(None);
        }
        let mut key = [0u8; 4];
        key.copy_from_slice(&buf[header..header + 4]);
        header += 4;
        Some(key)
    } else {
        None
    };

    // Bounded by max_payload above, so this fits in usize on 64-bit hosts.
    let payload_len = payload_len as usize;
    let total = header + payload_len;
    if buf.len() < total {
        return Ok(None);
    }

    let mut payload = buf[header..total].to_vec();
    if let Some(key) = mask_key {
        apply_mask(&mut payload, &key);
    }
    let close_status = (opcode == Opcode::Close).then(|| parse_close_payload(&payload).0);

    Ok(Some((
        Frame {
            fin,
            opcode,
            masked,
            payload,
            mask_key,
            close_status,
        },
        total,
    )))
}

/// Incremental decoder that reassembles frames split across reads.
#[derive(Debug)]
pub struct FrameDecoder {
    residual: Vec<u8>,
    max_payload: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl FrameDecoder {
    pub fn new(max_payload: u64) -> Self {
        Self {
            residual: Vec::new(),
            max_payload,
        }
    }

    /// Bytes of an incomplete frame carried over to the next call.
    pub fn residual(&self) -> &[u8] {
        &self.residual
    }

    /// Feed newly received bytes, pushing every complete frame onto `out`.
    ///
    /// Events decoded before an invalid frame stay in `out`; the error
    /// discards whatever was buffered.
    pub fn decode(&mut self, bytes: &[u8], out: &mut Vec<Decoded>) -> Result<(), ProtocolError> {
        let mut buf = std::mem::take(&mut self.residual);
        buf.extend_from_slice(bytes);

        let mut pos = 0;
        while let Some((frame, used)) = parse_frame(&buf[pos..], self.max_payload)? {
            trace!(opcode = ?frame.opcode, len = frame.payload.len(), "decoded frame");
            out.push(frame.into());
            pos += used;
        }

        buf.drain(..pos);
        self.residual = buf;
        Ok(())
    }
}
