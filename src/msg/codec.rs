//! Wire framing for control messages.
//!
//! Format: `[type: 1 byte][length: 8 bytes big-endian][payload: length bytes]`
//! where the payload is the JSON encoding of the message fields.
//!
//! Two readers are provided:
//! - [`MsgCodec`] for `FramedRead`/`FramedWrite` on the long-lived control
//!   connection. A partial frame leaves the buffer untouched (`Ok(None)`).
//! - [`read_msg`] for the handshake on a work connection. It reads exactly one
//!   frame and never consumes bytes past it, so the connection can be handed to
//!   a byte splice afterwards.
//!
//! Declared lengths are checked against a maximum before any payload buffer is
//! reserved.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use super::Message;

/// Type byte + 8-byte length.
pub const HEADER_LEN: usize = 9;

/// Default cap on a frame payload (10 KiB).
pub const DEFAULT_MAX_MSG_LEN: u64 = 10 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown message type byte 0x{0:02x}")]
    UnknownTag(u8),

    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("frame length {len} exceeds maximum {max}")]
    Oversized { len: u64, max: u64 },

    #[error("malformed payload for message type 0x{tag:02x}: {source}")]
    Payload {
        tag: u8,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode {name}: {source}")]
    Encode {
        name: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// True when the peer closed the connection cleanly between frames.
    pub fn is_eof(&self) -> bool {
        matches!(self, CodecError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Encode a message into a complete frame.
pub fn encode(msg: &Message) -> Result<Vec<u8>, CodecError> {
    let payload = payload_of(msg)?;
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(msg.type_byte());
    buf.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode one complete frame from `buf`.
///
/// Bytes after the frame are ignored.
pub fn decode(buf: &[u8], max_len: u64) -> Result<Message, CodecError> {
    if buf.len() < HEADER_LEN {
        return Err(CodecError::Truncated {
            needed: HEADER_LEN,
            available: buf.len(),
        });
    }
    let (tag, len) = parse_header(&buf[..HEADER_LEN], max_len)?;
    let needed = HEADER_LEN + len;
    if buf.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    payload_to_message(tag, &buf[HEADER_LEN..needed])
}

/// Read exactly one frame from `reader`.
pub async fn read_msg<R>(reader: &mut R, max_len: u64) -> Result<Message, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let (tag, len) = parse_header(&header, max_len)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    payload_to_message(tag, &payload)
}

/// Write one frame to `writer` and flush it.
pub async fn write_msg<W>(writer: &mut W, msg: &Message) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

fn payload_of(msg: &Message) -> Result<Vec<u8>, CodecError> {
    msg.to_payload().map_err(|source| CodecError::Encode {
        name: msg.name(),
        source,
    })
}

/// Validate a header and return `(tag, payload_len)`.
fn parse_header(header: &[u8], max_len: u64) -> Result<(u8, usize), CodecError> {
    let tag = header[0];
    if !Message::is_known_tag(tag) {
        return Err(CodecError::UnknownTag(tag));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&header[1..HEADER_LEN]);
    let len = u64::from_be_bytes(len_bytes);
    if len > max_len {
        return Err(CodecError::Oversized { len, max: max_len });
    }
    let len = usize::try_from(len).map_err(|_| CodecError::Oversized { len, max: max_len })?;
    Ok((tag, len))
}

fn payload_to_message(tag: u8, payload: &[u8]) -> Result<Message, CodecError> {
    match Message::from_payload(tag, payload) {
        Some(Ok(msg)) => Ok(msg),
        Some(Err(source)) => Err(CodecError::Payload { tag, source }),
        None => Err(CodecError::UnknownTag(tag)),
    }
}

/// `tokio_util` codec for the control connection.
#[derive(Debug, Clone, Copy)]
pub struct MsgCodec {
    max_len: u64,
}

impl MsgCodec {
    pub fn new(max_len: u64) -> Self {
        Self { max_len }
    }
}

impl Default for MsgCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MSG_LEN)
    }
}

impl Decoder for MsgCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let (tag, len) = parse_header(&src[..HEADER_LEN], self.max_len)?;
        let frame_len = HEADER_LEN + len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(frame_len);
        frame.advance(HEADER_LEN);
        payload_to_message(tag, &frame).map(Some)
    }
}

impl Encoder<Message> for MsgCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = payload_of(&msg)?;
        let len = payload.len() as u64;
        if len > self.max_len {
            return Err(CodecError::Oversized {
                len,
                max: self.max_len,
            });
        }
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(msg.type_byte());
        dst.put_u64(len);
        dst.put_slice(&payload);
        Ok(())
    }
}
