//! HTTP/1.1 upgrade negotiation.
//!
//! Only the minimal exchange is supported: a `GET` request carrying
//! `Upgrade: websocket` and `Sec-WebSocket-Key`, answered with
//! `101 Switching Protocols`. Anything else gets a best-effort `400`.

use std::io;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("i/o error during handshake: {0}")]
    Io(#[from] io::Error),
    #[error("upgrade request exceeds {0} bytes")]
    RequestTooLarge(usize),
    #[error("malformed request line: {0:?}")]
    MalformedRequest(String),
    #[error("method {0} not allowed for upgrade")]
    MethodNotAllowed(String),
    #[error("request headers are not valid UTF-8")]
    NotUtf8,
    #[error("missing `Upgrade: websocket` header")]
    MissingUpgrade,
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
}

impl HandshakeError {
    /// Whether the peer is still worth answering with a 400.
    fn wants_bad_request(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

/// Parsed upgrade request head.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub method: String,
    pub path: String,
    headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    /// Case-insensitive header lookup; first occurrence wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade").is_some_and(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
        })
    }
}

/// Outcome of a successful upgrade.
#[derive(Debug)]
pub struct Handshake {
    pub path: String,
    /// Bytes the client sent after the header block (early frames).
    pub leftover: BytesMut,
}

pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

pub fn parse_request(head: &[u8]) -> Result<UpgradeRequest, HandshakeError> {
    let text = std::str::from_utf8(head).map_err(|_| HandshakeError::NotUtf8)?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(HandshakeError::MalformedRequest(request_line.to_string()));
    };
    if !version.starts_with("HTTP/") {
        return Err(HandshakeError::MalformedRequest(request_line.to_string()));
    }

    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    Ok(UpgradeRequest {
        method: method.to_string(),
        path: path.to_string(),
        headers,
    })
}

fn switching_protocols(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    )
}

fn find_terminator(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..]
        .windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
        .map(|pos| from + pos)
}

#[derive(Debug, Clone, Copy)]
pub struct HandshakeNegotiator {
    max_request_bytes: usize,
}

impl Default for HandshakeNegotiator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REQUEST_BYTES)
    }
}

impl HandshakeNegotiator {
    pub fn new(max_request_bytes: usize) -> Self {
        Self { max_request_bytes }
    }

    /// Read the request head, validate it and answer `101`.
    ///
    /// On a validation failure a `400` is written before the error is
    /// returned; the caller just drops the socket.
    pub async fn perform<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<Handshake, HandshakeError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (head, leftover) = match self.read_head(reader).await {
            Ok(parts) => parts,
            Err(e) => {
                if e.wants_bad_request() {
                    let _ = writer.write_all(BAD_REQUEST).await;
                }
                return Err(e);
            }
        };

        let (request, key) = match validate(&head) {
            Ok(parts) => parts,
            Err(e) => {
                let _ = writer.write_all(BAD_REQUEST).await;
                return Err(e);
            }
        };

        let response = switching_protocols(&compute_accept_key(&key));
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;

        Ok(Handshake {
            path: request.path,
            leftover,
        })
    }

    async fn read_head<R: AsyncRead + Unpin>(
        &self,
        reader: &mut R,
    ) -> Result<(BytesMut, BytesMut), HandshakeError> {
        let mut buf = BytesMut::with_capacity(1024);
        let mut scanned = 0;
        loop {
            if let Some(pos) = find_terminator(&buf, scanned) {
                let mut head = buf.split_to(pos + HEADER_TERMINATOR.len());
                head.truncate(pos);
                return Ok((head, buf));
            }
            if buf.len() > self.max_request_bytes {
                return Err(HandshakeError::RequestTooLarge(self.max_request_bytes));
            }
            // Re-scan the last few bytes so a terminator split across reads is found.
            scanned = buf.len().saturating_sub(HEADER_TERMINATOR.len() - 1);
            let n = reader.read_buf(&mut buf).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before end of upgrade request",
                )
                .into());
            }
        }
    }
}

fn validate(head: &[u8]) -> Result<(UpgradeRequest, String), HandshakeError> {
    let request = parse_request(head)?;
    if request.method != "GET" {
        return Err(HandshakeError::MethodNotAllowed(request.method));
    }
    if !request.is_websocket_upgrade() {
        return Err(HandshakeError::MissingUpgrade);
    }
    let key = request
        .header("sec-websocket-key")
        .filter(|k| !k.is_empty())
        .ok_or(HandshakeError::MissingKey)?
        .to_string();
    Ok((request, key))
}
