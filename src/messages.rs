//! Typed payloads for every message type, encoded field by field in network
//! byte order. Variable-length fields carry a `u16` length prefix, except the
//! chunk ciphertext which runs to the end of the payload.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::{CodecError, Frame, MessageType};

/// Verification state of a stored file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Unverified,
    Verified,
    Corrupt,
}

impl VerificationStatus {
    pub fn code(self) -> u8 {
        match self {
            VerificationStatus::Unverified => 0,
            VerificationStatus::Verified => 1,
            VerificationStatus::Corrupt => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(VerificationStatus::Unverified),
            1 => Some(VerificationStatus::Verified),
            2 => Some(VerificationStatus::Corrupt),
            _ => None,
        }
    }
}

/// Reason codes carried by ERROR messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Framing = 1,
    Protocol = 2,
    Crypto = 3,
    Integrity = 4,
    Persistence = 5,
    PayloadTooLarge = 6,
    ServerBusy = 7,
    Timeout = 8,
}

impl ErrorCode {
    pub fn from_code(code: u16) -> Option<Self> {
        let code = match code {
            1 => ErrorCode::Framing,
            2 => ErrorCode::Protocol,
            3 => ErrorCode::Crypto,
            4 => ErrorCode::Integrity,
            5 => ErrorCode::Persistence,
            6 => ErrorCode::PayloadTooLarge,
            7 => ErrorCode::ServerBusy,
            8 => ErrorCode::Timeout,
            _ => return None,
        };
        Some(code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub client_name: String,
    /// DER-encoded public key; empty for a returning client that relies on
    /// the key already on file.
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub client_id: u32,
    pub wrapped_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub file_name: String,
    pub total_size: u64,
    pub chunk_count: u32,
    pub modified: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataAck {
    pub file_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub sequence: u32,
    /// CRC-32 of the plaintext this chunk decrypts to.
    pub checksum: u32,
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Accepted,
    Resend,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAck {
    pub sequence: u32,
    pub status: AckStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyRequest {
    pub checksum: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyResult {
    pub file_id: u32,
    pub status: VerificationStatus,
    pub checksum: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub code: u16,
    pub message: String,
}

impl ErrorMessage {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ErrorMessage {
            code: code as u16,
            message: message.into(),
        }
    }
}

/// Any message of the protocol, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    HandshakeRequest(HandshakeRequest),
    HandshakeResponse(HandshakeResponse),
    Metadata(Metadata),
    MetadataAck(MetadataAck),
    Chunk(Chunk),
    ChunkAck(ChunkAck),
    VerifyRequest(VerifyRequest),
    VerifyResult(VerifyResult),
    Error(ErrorMessage),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::HandshakeRequest(_) => MessageType::HandshakeRequest,
            Message::HandshakeResponse(_) => MessageType::HandshakeResponse,
            Message::Metadata(_) => MessageType::Metadata,
            Message::MetadataAck(_) => MessageType::MetadataAck,
            Message::Chunk(_) => MessageType::Chunk,
            Message::ChunkAck(_) => MessageType::ChunkAck,
            Message::VerifyRequest(_) => MessageType::VerifyRequest,
            Message::VerifyResult(_) => MessageType::VerifyResult,
            Message::Error(_) => MessageType::Error,
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = BytesMut::new();
        match self {
            Message::HandshakeRequest(m) => {
                put_str(&mut out, &m.client_name)?;
                put_bytes(&mut out, &m.public_key)?;
            }
            Message::HandshakeResponse(m) => {
                out.put_u32(m.client_id);
                put_bytes(&mut out, &m.wrapped_key)?;
            }
            Message::Metadata(m) => {
                put_str(&mut out, &m.file_name)?;
                out.put_u64(m.total_size);
                out.put_u32(m.chunk_count);
                out.put_u64(m.modified);
            }
            Message::MetadataAck(m) => out.put_u32(m.file_id),
            Message::Chunk(m) => {
                out.put_u32(m.sequence);
                out.put_u32(m.checksum);
                out.put_slice(&m.ciphertext);
            }
            Message::ChunkAck(m) => {
                out.put_u32(m.sequence);
                out.put_u8(match m.status {
                    AckStatus::Accepted => 0,
                    AckStatus::Resend => 1,
                });
            }
            Message::VerifyRequest(m) => out.put_u32(m.checksum),
            Message::VerifyResult(m) => {
                out.put_u32(m.file_id);
                out.put_u8(m.status.code());
                out.put_u32(m.checksum);
            }
            Message::Error(m) => {
                out.put_u16(m.code);
                put_str(&mut out, &m.message)?;
            }
        }
        Ok(out.to_vec())
    }

    pub fn into_frame(self) -> Result<Frame, CodecError> {
        let payload = self.encode_payload()?;
        Ok(Frame::new(self.message_type(), payload))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, CodecError> {
        let mut buf = &frame.payload[..];
        let message = match frame.message_type {
            MessageType::HandshakeRequest => Message::HandshakeRequest(HandshakeRequest {
                client_name: get_str(&mut buf, "client name")?,
                public_key: get_bytes(&mut buf, "public key")?,
            }),
            MessageType::HandshakeResponse => Message::HandshakeResponse(HandshakeResponse {
                client_id: get_u32(&mut buf, "client id")?,
                wrapped_key: get_bytes(&mut buf, "wrapped key")?,
            }),
            MessageType::Metadata => Message::Metadata(Metadata {
                file_name: get_str(&mut buf, "file name")?,
                total_size: get_u64(&mut buf, "total size")?,
                chunk_count: get_u32(&mut buf, "chunk count")?,
                modified: get_u64(&mut buf, "modification time")?,
            }),
            MessageType::MetadataAck => Message::MetadataAck(MetadataAck {
                file_id: get_u32(&mut buf, "file id")?,
            }),
            MessageType::Chunk => {
                let sequence = get_u32(&mut buf, "sequence")?;
                let checksum = get_u32(&mut buf, "checksum")?;
                let ciphertext = buf.to_vec();
                buf = &[];
                Message::Chunk(Chunk {
                    sequence,
                    checksum,
                    ciphertext,
                })
            }
            MessageType::ChunkAck => {
                let sequence = get_u32(&mut buf, "sequence")?;
                let status = match get_u8(&mut buf, "ack status")? {
                    0 => AckStatus::Accepted,
                    1 => AckStatus::Resend,
                    other => {
                        return Err(CodecError::Malformed(format!("ack status {}", other)))
                    }
                };
                Message::ChunkAck(ChunkAck { sequence, status })
            }
            MessageType::VerifyRequest => Message::VerifyRequest(VerifyRequest {
                checksum: get_u32(&mut buf, "checksum")?,
            }),
            MessageType::VerifyResult => {
                let file_id = get_u32(&mut buf, "file id")?;
                let code = get_u8(&mut buf, "status")?;
                let status = VerificationStatus::from_code(code)
                    .ok_or_else(|| CodecError::Malformed(format!("verification status {}", code)))?;
                let checksum = get_u32(&mut buf, "checksum")?;
                Message::VerifyResult(VerifyResult {
                    file_id,
                    status,
                    checksum,
                })
            }
            MessageType::Error => Message::Error(ErrorMessage {
                code: get_u16(&mut buf, "error code")?,
                message: get_str(&mut buf, "error message")?,
            }),
        };

        if buf.has_remaining() {
            return Err(CodecError::Malformed(format!(
                "{} trailing bytes after {:?} payload",
                buf.remaining(),
                frame.message_type
            )));
        }
        Ok(message)
    }
}

fn put_bytes(out: &mut BytesMut, bytes: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(bytes.len())
        .map_err(|_| CodecError::Malformed(format!("field of {} bytes", bytes.len())))?;
    out.put_u16(len);
    out.put_slice(bytes);
    Ok(())
}

fn put_str(out: &mut BytesMut, value: &str) -> Result<(), CodecError> {
    put_bytes(out, value.as_bytes())
}

fn need(buf: &&[u8], len: usize, field: &str) -> Result<(), CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::Malformed(format!(
            "{}: need {} bytes, have {}",
            field,
            len,
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_u8(buf: &mut &[u8], field: &str) -> Result<u8, CodecError> {
    need(buf, 1, field)?;
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8], field: &str) -> Result<u16, CodecError> {
    need(buf, 2, field)?;
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut &[u8], field: &str) -> Result<u32, CodecError> {
    need(buf, 4, field)?;
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut &[u8], field: &str) -> Result<u64, CodecError> {
    need(buf, 8, field)?;
    Ok(buf.get_u64())
}

fn get_bytes(buf: &mut &[u8], field: &str) -> Result<Vec<u8>, CodecError> {
    let len = get_u16(buf, field)? as usize;
    need(buf, len, field)?;
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Ok(bytes)
}

fn get_str(buf: &mut &[u8], field: &str) -> Result<String, CodecError> {
    let bytes = get_bytes(buf, field)?;
    String::from_utf8(bytes).map_err(|_| CodecError::Malformed(format!("{}: not UTF-8", field)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_request_layout() {
        let message = Message::HandshakeRequest(HandshakeRequest {
            client_name: "alice".to_string(),
            public_key: vec![0x30, 0x82],
        });
        let payload = message.encode_payload().unwrap();
        assert_eq!(payload, vec![0, 5, b'a', b'l', b'i', b'c', b'e', 0, 2, 0x30, 0x82]);
    }

    #[test]
    fn test_chunk_ciphertext_runs_to_end() {
        let message = Message::Chunk(Chunk {
            sequence: 2,
            checksum: 0xDEADBEEF,
            ciphertext: vec![9u8; 48],
        });
        let frame = message.clone().into_frame().unwrap();
        assert_eq!(frame.payload.len(), 8 + 48);
        assert_eq!(Message::from_frame(&frame).unwrap(), message);
    }

    #[test]
    fn test_metadata_with_unicode_name() {
        let message = Message::Metadata(Metadata {
            file_name: "файл.txt".to_string(),
            total_size: 67_584,
            chunk_count: 2,
            modified: 1_700_000_000,
        });
        let frame = message.clone().into_frame().unwrap();
        assert_eq!(Message::from_frame(&frame).unwrap(), message);
    }

    #[test]
    fn test_short_payload_is_malformed() {
        let frame = Frame::new(MessageType::Metadata, vec![0, 3, b'a', b'b', b'c', 0, 0]);
        assert!(matches!(
            Message::from_frame(&frame),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let frame = Frame::new(MessageType::VerifyRequest, vec![0, 0, 0, 1, 0xFF]);
        assert!(matches!(
            Message::from_frame(&frame),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_bad_ack_status_is_malformed() {
        let frame = Frame::new(MessageType::ChunkAck, vec![0, 0, 0, 1, 4]);
        assert!(Message::from_frame(&frame).is_err());
    }

    #[test]
    fn test_verification_status_codes() {
        for status in [
            VerificationStatus::Unverified,
            VerificationStatus::Verified,
            VerificationStatus::Corrupt,
        ] {
            assert_eq!(VerificationStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(VerificationStatus::from_code(3), None);
    }

    #[test]
    fn test_verification_status_serializes_upper_case() {
        let json = serde_json::to_string(&VerificationStatus::Corrupt).unwrap();
        assert_eq!(json, "\"CORRUPT\"");
    }
}
