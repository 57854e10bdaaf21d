//! Framing for the backup protocol.
//!
//! Every message is a 7-byte header followed by `payload_len` bytes:
//!
//! ```text
//! +---------+--------------+----------------+-------------------+
//! | version | message type | payload length | payload ...       |
//! |  1 byte | 2 bytes (BE) |  4 bytes (BE)  | payload_len bytes |
//! +---------+--------------+----------------+-------------------+
//! ```
//!
//! The header is written and parsed one field at a time. It is never the
//! size of an in-memory struct.

use bytes::{Buf, BufMut, BytesMut};
use log::debug;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{HEADER_SIZE, PROTOCOL_VERSION};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("stream closed after {0} of 7 header bytes")]
    TruncatedHeader(usize),

    #[error("stream closed after {received} of {expected} payload bytes")]
    TruncatedPayload { expected: usize, received: usize },

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message type {0}")]
    UnknownMessageType(u16),

    #[error("declared payload length {declared} exceeds maximum {max}")]
    PayloadTooLarge { declared: u32, max: u32 },

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    HandshakeRequest = 1025,
    Metadata = 1028,
    Chunk = 1029,
    VerifyRequest = 1030,
    HandshakeResponse = 1602,
    MetadataAck = 1603,
    ChunkAck = 1604,
    VerifyResult = 1605,
    Error = 1607,
}

impl MessageType {
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for MessageType {
    type Error = CodecError;

    fn try_from(code: u16) -> Result<Self, CodecError> {
        let kind = match code {
            1025 => MessageType::HandshakeRequest,
            1028 => MessageType::Metadata,
            1029 => MessageType::Chunk,
            1030 => MessageType::VerifyRequest,
            1602 => MessageType::HandshakeResponse,
            1603 => MessageType::MetadataAck,
            1604 => MessageType::ChunkAck,
            1605 => MessageType::VerifyResult,
            1607 => MessageType::Error,
            other => return Err(CodecError::UnknownMessageType(other)),
        };
        Ok(kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub message_type: MessageType,
    pub payload_len: u32,
}

impl Header {
    pub fn new(message_type: MessageType, payload_len: u32) -> Self {
        Header {
            version: PROTOCOL_VERSION,
            message_type,
            payload_len,
        }
    }

    pub fn write_to(&self, out: &mut BytesMut) {
        out.put_u8(self.version);
        out.put_u16(self.message_type.code());
        out.put_u32(self.payload_len);
    }

    /// Parse a header from exactly [`HEADER_SIZE`] bytes.
    ///
    /// Fields are checked in wire order, so a bad version is reported even
    /// when the message type is also garbage.
    pub fn parse(raw: &[u8; HEADER_SIZE]) -> Result<Self, CodecError> {
        let mut buf = &raw[..];
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let message_type = MessageType::try_from(buf.get_u16())?;
        let payload_len = buf.get_u32();
        Ok(Header {
            version,
            message_type,
            payload_len,
        })
    }
}

/// A framed message: header type plus raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(message_type: MessageType, payload: Vec<u8>) -> Self {
        Frame {
            message_type,
            payload,
        }
    }
}

pub fn encode(message_type: MessageType, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| CodecError::Malformed(format!("payload of {} bytes", payload.len())))?;
    let mut out = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    Header::new(message_type, payload_len).write_to(&mut out);
    out.put_slice(payload);
    Ok(out.to_vec())
}

/// Decode one complete message from an in-memory buffer.
///
/// Bytes beyond the declared payload are ignored; the caller gets the frame
/// and the number of bytes consumed.
pub fn decode(bytes: &[u8], max_payload_len: u32) -> Result<(Frame, usize), CodecError> {
    if bytes.len() < HEADER_SIZE {
        return Err(CodecError::TruncatedHeader(bytes.len()));
    }
    let mut raw = [0u8; HEADER_SIZE];
    raw.copy_from_slice(&bytes[..HEADER_SIZE]);
    let header = Header::parse(&raw)?;
    check_length(&header, max_payload_len)?;

    let expected = header.payload_len as usize;
    let available = bytes.len() - HEADER_SIZE;
    if available < expected {
        return Err(CodecError::TruncatedPayload {
            expected,
            received: available,
        });
    }
    let payload = bytes[HEADER_SIZE..HEADER_SIZE + expected].to_vec();
    Ok((
        Frame::new(header.message_type, payload),
        HEADER_SIZE + expected,
    ))
}

fn check_length(header: &Header, max_payload_len: u32) -> Result<(), CodecError> {
    if header.payload_len > max_payload_len {
        return Err(CodecError::PayloadTooLarge {
            declared: header.payload_len,
            max: max_payload_len,
        });
    }
    Ok(())
}

/// Read from `reader` until `buf` is full or the stream ends, returning the
/// number of bytes filled.
async fn fill<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize, CodecError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Read one message from the stream.
///
/// The header is validated before anything else is read, and the payload
/// buffer is only allocated once the declared length is known to be within
/// `max_payload_len`.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload_len: u32,
) -> Result<Frame, CodecError> {
    let mut raw = [0u8; HEADER_SIZE];
    let got = fill(reader, &mut raw).await?;
    if got < HEADER_SIZE {
        return Err(CodecError::TruncatedHeader(got));
    }
    let header = Header::parse(&raw)?;
    check_length(&header, max_payload_len)?;

    let expected = header.payload_len as usize;
    let mut payload = vec![0u8; expected];
    let received = fill(reader, &mut payload).await?;
    if received < expected {
        return Err(CodecError::TruncatedPayload { expected, received });
    }
    debug!(
        "Read {:?} message with {} byte payload",
        header.message_type, expected
    );
    Ok(Frame::new(header.message_type, payload))
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message_type: MessageType,
    payload: &[u8],
) -> Result<(), CodecError> {
    let bytes = encode(message_type, payload)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    debug!(
        "Wrote {:?} message with {} byte payload",
        message_type,
        payload.len()
    );
    Ok(())
}
