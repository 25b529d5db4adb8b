// =============================================================================
// RFC 6455 frame codec.
//
//   - Decoding unmasks client frames; server frames are never masked
//   - A server-side codec rejects unmasked client frames (RFC 6455 5.1)
//   - Declared lengths are checked against the payload cap before any
//     allocation, so a hostile length prefix cannot reserve memory
//   - EOF in the middle of a frame is an I/O error, never a short frame
// =============================================================================

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder, FramedRead};

/// Default cap on a single frame payload.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

/// Control frames carry at most 125 bytes (RFC 6455 5.5).
pub const MAX_CONTROL_PAYLOAD: usize = 125;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
pub const CLOSE_ALREADY_AUTHENTICATED: u16 = 4005;
pub const CLOSE_SESSION_TIMED_OUT: u16 = 4009;

// ---------------------------------------------------------------------------
// Opcode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    pub fn is_control(self) -> bool {
        (self as u8) & 0x08 != 0
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub fin: bool,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            fin: true,
            payload: payload.into(),
        }
    }

    /// Payload as UTF-8, or `None` if it is not valid text.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Status code of a close frame. An empty close body has no code.
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode != Opcode::Close || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("reserved bits set in frame header: {0:#04x}")]
    ReservedBits(u8),
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),
    #[error("payload of {len} bytes exceeds limit of {max}")]
    PayloadTooLarge { len: u64, max: usize },
    #[error("fragmented control frame ({0:?})")]
    FragmentedControl(Opcode),
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlPayloadTooLarge(u64),
    #[error("client frame is not masked")]
    Unmasked,
}

impl FrameError {
    /// Close status to send the peer before dropping the connection.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::PayloadTooLarge { .. } => CLOSE_MESSAGE_TOO_BIG,
            _ => CLOSE_PROTOCOL_ERROR,
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding (server-to-client, unmasked)
// ---------------------------------------------------------------------------

fn put_header(buf: &mut BytesMut, opcode: Opcode, fin: bool, len: usize, masked: bool) {
    let fin_bit = if fin { 0x80 } else { 0x00 };
    let mask_bit = if masked { 0x80 } else { 0x00 };
    buf.put_u8(fin_bit | opcode as u8);
    if len < 126 {
        buf.put_u8(mask_bit | len as u8);
    } else if len < 65536 {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(len as u64);
    }
}

fn header_len(len: usize) -> usize {
    if len < 126 {
        2
    } else if len < 65536 {
        4
    } else {
        10
    }
}

/// Encode a complete final frame: header + payload.
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(header_len(payload.len()) + payload.len());
    put_header(&mut buf, opcode, true, payload.len(), false);
    buf.extend_from_slice(payload);
    buf.freeze()
}

pub fn encode_text_frame(text: &str) -> Bytes {
    encode_frame(Opcode::Text, text.as_bytes())
}

/// Close frame with a status code and no reason text.
pub fn encode_close_frame(code: u16) -> Bytes {
    encode_frame(Opcode::Close, &code.to_be_bytes())
}

/// Client-direction frame. The gateway never sends these; clients and tests do.
pub fn encode_masked_frame(opcode: Opcode, payload: &[u8], mask_key: [u8; 4]) -> Bytes {
    let mut buf = BytesMut::with_capacity(header_len(payload.len()) + 4 + payload.len());
    put_header(&mut buf, opcode, true, payload.len(), true);
    buf.put_slice(&mask_key);
    let start = buf.len();
    buf.extend_from_slice(payload);
    apply_mask(&mut buf[start..], mask_key);
    buf.freeze()
}

/// XOR `data` with the 4-byte key, cycling every 4 bytes.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= key[i & 3];
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: usize,
    require_mask: bool,
}

impl FrameCodec {
    /// Lenient codec: accepts masked and unmasked frames.
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            require_mask: false,
        }
    }

    /// Codec for the server side of a connection, where every inbound
    /// frame must be masked.
    pub fn server(max_payload: usize) -> Self {
        Self {
            max_payload,
            require_mask: true,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let b0 = src[0];
        let b1 = src[1];
        if b0 & 0x70 != 0 {
            return Err(FrameError::ReservedBits(b0 & 0x70));
        }
        let opcode = Opcode::from_u8(b0 & 0x0F).ok_or(FrameError::UnknownOpcode(b0 & 0x0F))?;
        let fin = b0 & 0x80 != 0;
        let masked = b1 & 0x80 != 0;
        if self.require_mask && !masked {
            return Err(FrameError::Unmasked);
        }

        let (len, mut offset) = match b1 & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([src[2], src[3]]) as u64, 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(raw), 10)
            }
            n => (n as u64, 2),
        };

        if opcode.is_control() {
            if !fin {
                return Err(FrameError::FragmentedControl(opcode));
            }
            if len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(FrameError::ControlPayloadTooLarge(len));
            }
        }
        if len > self.max_payload as u64 {
            return Err(FrameError::PayloadTooLarge {
                len,
                max: self.max_payload,
            });
        }

        let mask_key = if masked {
            if src.len() < offset + 4 {
                return Ok(None);
            }
            let key = [src[offset], src[offset + 1], src[offset + 2], src[offset + 3]];
            offset += 4;
            Some(key)
        } else {
            None
        };

        let total = offset + len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut payload = src.split_to(total);
        payload.advance(offset);
        if let Some(key) = mask_key {
            apply_mask(&mut payload, key);
        }
        Ok(Some(Frame {
            opcode,
            fin,
            payload: payload.freeze(),
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("connection closed with {} bytes of a partial frame", src.len()),
            )
            .into()),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let len = frame.payload.len();
        dst.reserve(header_len(len) + len);
        put_header(dst, frame.opcode, frame.fin, len, false);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Async read/write helpers
// ---------------------------------------------------------------------------

/// Reads whole frames from an async byte source.
pub struct FrameReader<R> {
    inner: FramedRead<R, FrameCodec>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, codec: FrameCodec) -> Self {
        Self {
            inner: FramedRead::new(reader, codec),
        }
    }

    /// Start with bytes that were already read past the upgrade request.
    pub fn with_leftover(reader: R, codec: FrameCodec, leftover: &[u8]) -> Self {
        let mut inner = FramedRead::new(reader, codec);
        inner.read_buffer_mut().extend_from_slice(leftover);
        Self { inner }
    }

    /// Resolves once one complete frame is available. `Ok(None)` means the
    /// peer closed cleanly on a frame boundary.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        // FramedRead polls the socket before decoding what is already
        // buffered, so frames seeded by `with_leftover` are drained here.
        if !self.inner.read_buffer().is_empty() {
            let mut codec = *self.inner.decoder();
            if let Some(frame) = codec.decode(self.inner.read_buffer_mut())? {
                return Ok(Some(frame));
            }
        }
        self.inner.next().await.transpose()
    }
}

pub async fn write_text_frame<W: AsyncWrite + Unpin>(writer: &mut W, text: &str) -> io::Result<()> {
    writer.write_all(&encode_text_frame(text)).await
}

pub async fn write_close_frame<W: AsyncWrite + Unpin>(writer: &mut W, code: u16) -> io::Result<()> {
    writer.write_all(&encode_close_frame(code)).await?;
    writer.flush().await
}
