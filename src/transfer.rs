//! Server side of one backup session.
//!
//! `TransferSession` is driven one decoded message at a time and answers with
//! the message to send back. It holds no socket; the server loop owns I/O,
//! deadlines and shutdown.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::codec::{CodecError, MessageType};
use crate::cryptography::{
    encrypted_chunk_len, generate_session_key, verify_checksum, wrap_session_key,
    ChecksumAccumulator, ChunkOpener, CryptoError,
};
use crate::messages::{
    AckStatus, Chunk, ChunkAck, ErrorCode, HandshakeRequest, HandshakeResponse, Message,
    Metadata, MetadataAck, VerificationStatus, VerifyRequest, VerifyResult,
};
use crate::registry::{ClientId, FileId, Registry, RegistryError};
use crate::storage::{append_chunk, chunk_count, create_file_bufwriter, remove_stored_file, storage_path};
use crate::CHUNK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    AwaitingHandshake,
    KeyEstablished,
    AwaitingMetadata,
    ReceivingChunks,
    Verifying,
    Complete,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Complete | TransferState::Failed)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferState::AwaitingHandshake => "AWAITING_HANDSHAKE",
            TransferState::KeyEstablished => "KEY_ESTABLISHED",
            TransferState::AwaitingMetadata => "AWAITING_METADATA",
            TransferState::ReceivingChunks => "RECEIVING_CHUNKS",
            TransferState::Verifying => "VERIFYING",
            TransferState::Complete => "COMPLETE",
            TransferState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("framing error: {0}")]
    Framing(#[from] CodecError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("persistence error: {0}")]
    Persistence(#[from] RegistryError),

    #[error("storage error: {0}")]
    Storage(#[from] io::Error),

    #[error("unexpected {message_type:?} in state {state}")]
    UnexpectedMessage {
        state: TransferState,
        message_type: MessageType,
    },

    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("chunk sequence gap: expected {expected}, got {received}")]
    SequenceGap { expected: u32, received: u32 },

    #[error("chunk {sequence} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        sequence: u32,
        attempts: u32,
        last: CryptoError,
    },

    #[error("peer reported error {code}: {message}")]
    PeerError { code: u16, message: String },

    #[error("session timed out")]
    Timeout,

    #[error("worker failed: {0}")]
    Worker(String),
}

impl TransferError {
    /// Code sent to the peer in the ERROR message that closes the session.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            TransferError::Framing(CodecError::PayloadTooLarge { .. }) => ErrorCode::PayloadTooLarge,
            TransferError::Framing(_) => ErrorCode::Framing,
            TransferError::Crypto(_) | TransferError::RetriesExhausted { .. } => ErrorCode::Crypto,
            TransferError::InvalidHandshake(_) => ErrorCode::Crypto,
            TransferError::Persistence(RegistryError::MissingPublicKey(_)) => ErrorCode::Crypto,
            TransferError::Persistence(_) | TransferError::Storage(_) => ErrorCode::Persistence,
            TransferError::Timeout => ErrorCode::Timeout,
            TransferError::UnexpectedMessage { .. }
            | TransferError::InvalidMetadata(_)
            | TransferError::SequenceGap { .. }
            | TransferError::PeerError { .. }
            | TransferError::Worker(_) => ErrorCode::Protocol,
        }
    }
}

/// The file currently being received.
struct IncomingFile {
    id: FileId,
    path: PathBuf,
    writer: BufWriter<File>,
    declared_size: u64,
    chunk_count: u32,
    next_sequence: u32,
    attempts: u32,
    accumulator: ChecksumAccumulator,
}

impl IncomingFile {
    fn is_last(&self, sequence: u32) -> bool {
        sequence + 1 == self.chunk_count
    }

    /// Plaintext bytes chunk `sequence` must carry, given the declared size.
    fn plaintext_len(&self, sequence: u32) -> usize {
        if self.is_last(sequence) {
            (self.declared_size - u64::from(sequence) * CHUNK_SIZE as u64) as usize
        } else {
            CHUNK_SIZE
        }
    }
}

pub struct TransferSession {
    state: TransferState,
    registry: Arc<Registry>,
    storage_dir: PathBuf,
    max_retries: u32,
    client: Option<(ClientId, String)>,
    opener: Option<ChunkOpener>,
    file: Option<IncomingFile>,
}

impl TransferSession {
    pub fn new(registry: Arc<Registry>, storage_dir: PathBuf, max_retries: u32) -> Self {
        TransferSession {
            state: TransferState::AwaitingHandshake,
            registry,
            storage_dir,
            max_retries,
            client: None,
            opener: None,
            file: None,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client.as_ref().map(|(id, _)| *id)
    }

    pub fn file_id(&self) -> Option<FileId> {
        self.file.as_ref().map(|f| f.id)
    }

    /// Feed one message and get the reply.
    ///
    /// Any error moves the session to `Failed`; if a file record exists by
    /// then it is marked `CORRUPT` and its bytes are kept.
    pub fn handle(&mut self, message: Message) -> Result<Message, TransferError> {
        let result = self.dispatch(message);
        if let Err(e) = &result {
            self.fail(&e.to_string());
        }
        result
    }

    /// End the session from outside: timeout, disconnect or framing error.
    pub fn abort(&mut self, reason: &str) {
        if !self.state.is_terminal() {
            self.fail(reason);
        }
    }

    fn dispatch(&mut self, message: Message) -> Result<Message, TransferError> {
        match (self.state, message) {
            (_, Message::Error(e)) if !self.state.is_terminal() => Err(TransferError::PeerError {
                code: e.code,
                message: e.message,
            }),
            (TransferState::AwaitingHandshake, Message::HandshakeRequest(req)) => self.on_handshake(req),
            (TransferState::AwaitingMetadata, Message::Metadata(meta)) => self.on_metadata(meta),
            (TransferState::ReceivingChunks, Message::Chunk(chunk)) => self.on_chunk(chunk),
            (TransferState::Verifying, Message::VerifyRequest(req)) => self.on_verify(req),
            (state, other) => Err(TransferError::UnexpectedMessage {
                state,
                message_type: other.message_type(),
            }),
        }
    }

    fn on_handshake(&mut self, req: HandshakeRequest) -> Result<Message, TransferError> {
        let name = req.client_name.trim().to_string();
        if name.is_empty() {
            return Err(TransferError::InvalidHandshake("empty client name".to_string()));
        }

        // Wrap under the key being presented, or the one already on file.
        let public_key = if req.public_key.is_empty() {
            self.registry
                .find_client(&name)?
                .map(|c| c.public_key)
                .ok_or_else(|| RegistryError::MissingPublicKey(name.clone()))?
        } else {
            req.public_key.clone()
        };
        let session_key = generate_session_key();
        let wrapped_key = wrap_session_key(&public_key, &session_key)?;

        let client_id = self.registry.upsert_client(&name, &req.public_key)?;
        let wire_id = u32::try_from(client_id)
            .map_err(|_| TransferError::InvalidHandshake(format!("client id {} out of range", client_id)))?;

        self.opener = Some(ChunkOpener::new(session_key));
        self.client = Some((client_id, name.clone()));
        self.state = TransferState::KeyEstablished;
        info!("Session key established for client {} ({})", name, client_id);
        self.state = TransferState::AwaitingMetadata;

        Ok(Message::HandshakeResponse(HandshakeResponse {
            client_id: wire_id,
            wrapped_key,
        }))
    }

    fn on_metadata(&mut self, meta: Metadata) -> Result<Message, TransferError> {
        let (client_id, client_name) = self
            .client
            .clone()
            .ok_or_else(|| TransferError::InvalidMetadata("no client".to_string()))?;
        if meta.file_name.trim().is_empty() {
            return Err(TransferError::InvalidMetadata("empty file name".to_string()));
        }
        let expected_chunks = chunk_count(meta.total_size);
        if u64::from(meta.chunk_count) != expected_chunks {
            return Err(TransferError::InvalidMetadata(format!(
                "{} bytes must be sent in {} chunks, not {}",
                meta.total_size, expected_chunks, meta.chunk_count
            )));
        }

        let path = storage_path(&self.storage_dir, client_id, &meta.file_name);
        let writer = create_file_bufwriter(&path)?;
        let file_id = match self.registry.record_file(
            client_id,
            &meta.file_name,
            &path,
            meta.total_size,
            meta.modified,
        ) {
            Ok(id) => id,
            Err(e) => {
                drop(writer);
                let _ = remove_stored_file(&path);
                return Err(e.into());
            }
        };
        let wire_id = u32::try_from(file_id)
            .map_err(|_| TransferError::InvalidMetadata(format!("file id {} out of range", file_id)))?;

        info!(
            "Receiving {} from {}: {} bytes in {} chunks (file {})",
            meta.file_name, client_name, meta.total_size, meta.chunk_count, file_id
        );
        self.file = Some(IncomingFile {
            id: file_id,
            path,
            writer,
            declared_size: meta.total_size,
            chunk_count: meta.chunk_count,
            next_sequence: 0,
            attempts: 0,
            accumulator: ChecksumAccumulator::new(),
        });
        self.state = TransferState::ReceivingChunks;
        Ok(Message::MetadataAck(MetadataAck { file_id: wire_id }))
    }

    fn on_chunk(&mut self, chunk: Chunk) -> Result<Message, TransferError> {
        let opener = self
            .opener
            .as_mut()
            .ok_or_else(|| TransferError::InvalidHandshake("no session key".to_string()))?;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TransferError::InvalidMetadata("no file".to_string()))?;

        if chunk.sequence != file.next_sequence {
            return Err(TransferError::SequenceGap {
                expected: file.next_sequence,
                received: chunk.sequence,
            });
        }

        let is_last = file.is_last(chunk.sequence);
        let expected_len = encrypted_chunk_len(file.plaintext_len(chunk.sequence), is_last);
        let opened = if chunk.ciphertext.len() != expected_len {
            Err(CryptoError::DecryptionFailure(format!(
                "chunk {} has {} ciphertext bytes, expected {}",
                chunk.sequence,
                chunk.ciphertext.len(),
                expected_len
            )))
        } else {
            opener
                .open(&chunk.ciphertext, is_last)
                .and_then(|plain| verify_checksum(chunk.checksum, &plain).map(|_| plain))
        };

        let plaintext = match opened {
            Ok(plain) => plain,
            Err(e) => {
                file.attempts += 1;
                if file.attempts > self.max_retries {
                    error!("Chunk {} of file {} failed {} times", chunk.sequence, file.id, file.attempts);
                    return Err(TransferError::RetriesExhausted {
                        sequence: chunk.sequence,
                        attempts: file.attempts,
                        last: e,
                    });
                }
                warn!(
                    "Chunk {} of file {} rejected ({}), requesting resend {}/{}",
                    chunk.sequence, file.id, e, file.attempts, self.max_retries
                );
                return Ok(Message::ChunkAck(ChunkAck {
                    sequence: chunk.sequence,
                    status: AckStatus::Resend,
                }));
            }
        };

        append_chunk(&mut file.writer, &plaintext)?;
        file.accumulator.update(&plaintext);
        opener.accept(&chunk.ciphertext);
        file.next_sequence += 1;
        file.attempts = 0;
        debug!(
            "Accepted chunk {}/{} of file {} ({} bytes)",
            file.next_sequence,
            file.chunk_count,
            file.id,
            plaintext.len()
        );

        if file.next_sequence == file.chunk_count {
            debug!("All chunks of file {} received, verifying", file.id);
            self.state = TransferState::Verifying;
        }

        Ok(Message::ChunkAck(ChunkAck {
            sequence: chunk.sequence,
            status: AckStatus::Accepted,
        }))
    }

    fn on_verify(&mut self, req: VerifyRequest) -> Result<Message, TransferError> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| TransferError::InvalidMetadata("no file".to_string()))?;
        let computed = file.accumulator.value();
        let received = file.accumulator.bytes();
        let intact = computed == req.checksum && received == file.declared_size;

        let status = if intact {
            VerificationStatus::Verified
        } else {
            VerificationStatus::Corrupt
        };
        // Only a checksum the client confirmed is recorded.
        if intact {
            self.registry.finalize_file(file.id, received, computed)?;
        }
        self.registry.set_verification(file.id, status)?;

        let wire_id = u32::try_from(file.id).unwrap_or(u32::MAX);
        if intact {
            info!("File {} verified ({:#010x})", file.id, computed);
            self.state = TransferState::Complete;
        } else {
            warn!(
                "File {} is corrupt: declared {:#010x}/{} bytes, got {:#010x}/{} bytes; keeping {}",
                file.id,
                req.checksum,
                file.declared_size,
                computed,
                received,
                file.path.display()
            );
            self.state = TransferState::Failed;
        }

        Ok(Message::VerifyResult(VerifyResult {
            file_id: wire_id,
            status,
            checksum: computed,
        }))
    }

    fn fail(&mut self, reason: &str) {
        warn!("Session failed in state {}: {}", self.state, reason);
        self.state = TransferState::Failed;
        if let Some(file) = &self.file {
            if let Err(e) = self.registry.set_verification(file.id, VerificationStatus::Corrupt) {
                error!("Could not mark file {} corrupt: {}", file.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cryptography::{checksum, ChunkSealer, ClientKeyPair};
    use crate::storage::read_chunk;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::OnceLock;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn keys() -> &'static ClientKeyPair {
        static KEYS: OnceLock<ClientKeyPair> = OnceLock::new();
        KEYS.get_or_init(|| ClientKeyPair::generate(1024).unwrap())
    }

    fn new_session() -> (TransferSession, Arc<Registry>, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "test_bastion_transfer_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        let registry = Arc::new(Registry::open_in_memory().unwrap());
        let session = TransferSession::new(Arc::clone(&registry), dir.clone(), 3);
        (session, registry, dir)
    }

    fn handshake(session: &mut TransferSession) -> [u8; 32] {
        let reply = session
            .handle(Message::HandshakeRequest(HandshakeRequest {
                client_name: "alice".to_string(),
                public_key: keys().public_key_der().unwrap(),
            }))
            .unwrap();
        assert_eq!(session.state(), TransferState::AwaitingMetadata);
        match reply {
            Message::HandshakeResponse(resp) => keys().unwrap_session_key(&resp.wrapped_key).unwrap(),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    fn metadata(session: &mut TransferSession, size: u64) -> FileId {
        let reply = session
            .handle(Message::Metadata(Metadata {
                file_name: "data.bin".to_string(),
                total_size: size,
                chunk_count: chunk_count(size) as u32,
                modified: 1_700_000_000,
            }))
            .unwrap();
        match reply {
            Message::MetadataAck(ack) => ack.file_id as FileId,
            other => panic!("unexpected reply {:?}", other),
        }
    }

    /// Chunks of `data` as the client would send them: (checksum, ciphertext).
    fn seal_all(key: [u8; 32], data: &[u8]) -> Vec<(u32, Vec<u8>)> {
        let mut sealer = ChunkSealer::new(key);
        let count = chunk_count(data.len() as u64) as usize;
        let mut cursor = Cursor::new(data.to_vec());
        (0..count)
            .map(|i| {
                let plain = read_chunk(&mut cursor).unwrap();
                let sealed = sealer.seal(&plain, i + 1 == count).unwrap();
                (checksum(&plain), sealed)
            })
            .collect()
    }

    fn send_chunk(session: &mut TransferSession, sequence: u32, checksum: u32, ciphertext: Vec<u8>) -> Result<Message, TransferError> {
        session.handle(Message::Chunk(Chunk {
            sequence,
            checksum,
            ciphertext,
        }))
    }

    fn run_clean_transfer(data: &[u8]) -> (TransferSession, Arc<Registry>, FileId, Vec<usize>, PathBuf) {
        let (mut session, registry, dir) = new_session();
        let key = handshake(&mut session);
        let file_id = metadata(&mut session, data.len() as u64);
        let chunks = seal_all(key, data);
        let sizes = chunks.iter().map(|(_, c)| c.len()).collect();
        for (seq, (crc, ciphertext)) in chunks.into_iter().enumerate() {
            let reply = send_chunk(&mut session, seq as u32, crc, ciphertext).unwrap();
            assert_eq!(
                reply,
                Message::ChunkAck(ChunkAck {
                    sequence: seq as u32,
                    status: AckStatus::Accepted
                })
            );
        }
        assert_eq!(session.state(), TransferState::Verifying);
        (session, registry, file_id, sizes, dir)
    }

    #[test]
    fn test_clean_transfer_ends_verified() {
        let data: Vec<u8> = (0..150_000u32).map(|i| (i % 253) as u8).collect();
        let (mut session, registry, file_id, _, dir) = run_clean_transfer(&data);

        let reply = session
            .handle(Message::VerifyRequest(VerifyRequest {
                checksum: checksum(&data),
            }))
            .unwrap();
        assert!(matches!(
            reply,
            Message::VerifyResult(VerifyResult {
                status: VerificationStatus::Verified,
                ..
            })
        ));
        assert_eq!(session.state(), TransferState::Complete);

        let record = registry.get_file(file_id).unwrap().unwrap();
        assert_eq!(record.status, VerificationStatus::Verified);
        assert_eq!(record.checksum, Some(checksum(&data)));
        assert_eq!(record.file_size, data.len() as u64);
        assert_eq!(std::fs::read(&record.path_name).unwrap(), data);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_exact_buffer_file_is_one_padded_chunk() {
        let data = vec![0xEEu8; CHUNK_SIZE];
        let (_, _, _, sizes, dir) = run_clean_transfer(&data);
        assert_eq!(sizes, vec![CHUNK_SIZE + 16]);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_66k_file_is_two_chunks() {
        let data = vec![0x42u8; 66 * 1024];
        let (_, _, _, sizes, dir) = run_clean_transfer(&data);
        assert_eq!(sizes, vec![CHUNK_SIZE, 2064]);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_empty_file_transfers_as_padding_only() {
        let (mut session, registry, file_id, sizes, dir) = run_clean_transfer(&[]);
        assert_eq!(sizes, vec![16]);
        session
            .handle(Message::VerifyRequest(VerifyRequest { checksum: checksum(&[]) }))
            .unwrap();
        assert_eq!(session.state(), TransferState::Complete);
        assert_eq!(
            registry.get_file(file_id).unwrap().unwrap().status,
            VerificationStatus::Verified
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_flipped_byte_before_checksum_ends_corrupt() {
        let original: Vec<u8> = (0..70_000u32).map(|i| (i % 199) as u8).collect();
        let declared = checksum(&original);

        for position in [0usize, 1_000, CHUNK_SIZE - 1, CHUNK_SIZE, 69_999] {
            let mut tampered = original.clone();
            tampered[position] ^= 0x80;

            // Per-chunk checksums are taken over the tampered bytes, so only
            // the aggregate comparison can notice.
            let (mut session, registry, file_id, _, dir) = run_clean_transfer(&tampered);
            let reply = session
                .handle(Message::VerifyRequest(VerifyRequest { checksum: declared }))
                .unwrap();
            assert!(matches!(
                reply,
                Message::VerifyResult(VerifyResult {
                    status: VerificationStatus::Corrupt,
                    ..
                })
            ));
            assert_eq!(session.state(), TransferState::Failed);

            let record = registry.get_file(file_id).unwrap().unwrap();
            assert_eq!(record.status, VerificationStatus::Corrupt);
            assert_eq!(record.checksum, None, "unconfirmed checksum is not recorded");
            assert!(record.path_name.exists(), "corrupt bytes are retained");
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn test_corrupted_ciphertext_requests_resend_then_recovers() {
        let data = vec![7u8; 40_000];
        let (mut session, registry, dir) = new_session();
        let key = handshake(&mut session);
        let file_id = metadata(&mut session, data.len() as u64);
        let (crc, ciphertext) = seal_all(key, &data).remove(0);

        let mut damaged = ciphertext.clone();
        damaged[10] ^= 0xFF;
        let reply = send_chunk(&mut session, 0, crc, damaged).unwrap();
        assert_eq!(
            reply,
            Message::ChunkAck(ChunkAck {
                sequence: 0,
                status: AckStatus::Resend
            })
        );
        assert_eq!(session.state(), TransferState::ReceivingChunks);

        send_chunk(&mut session, 0, crc, ciphertext).unwrap();
        session
            .handle(Message::VerifyRequest(VerifyRequest { checksum: checksum(&data) }))
            .unwrap();
        assert_eq!(session.state(), TransferState::Complete);
        assert_eq!(
            registry.get_file(file_id).unwrap().unwrap().status,
            VerificationStatus::Verified
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_retries_exhausted_fails_session() {
        let data = vec![1u8; 100];
        let (mut session, registry, dir) = new_session();
        let key = handshake(&mut session);
        let file_id = metadata(&mut session, data.len() as u64);
        let (_, ciphertext) = seal_all(key, &data).remove(0);

        for _ in 0..3 {
            let reply = send_chunk(&mut session, 0, 0xBAD, ciphertext.clone()).unwrap();
            assert!(matches!(
                reply,
                Message::ChunkAck(ChunkAck {
                    status: AckStatus::Resend,
                    ..
                })
            ));
        }
        let err = send_chunk(&mut session, 0, 0xBAD, ciphertext).unwrap_err();
        assert!(matches!(err, TransferError::RetriesExhausted { attempts: 4, .. }));
        assert_eq!(err.error_code(), ErrorCode::Crypto);
        assert_eq!(session.state(), TransferState::Failed);
        assert_eq!(
            registry.get_file(file_id).unwrap().unwrap().status,
            VerificationStatus::Corrupt
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_sequence_gap_fails_session() {
        let data = vec![3u8; CHUNK_SIZE * 3];
        let (mut session, registry, dir) = new_session();
        let key = handshake(&mut session);
        let file_id = metadata(&mut session, data.len() as u64);
        let mut chunks = seal_all(key, &data);

        let (crc0, c0) = chunks.remove(0);
        send_chunk(&mut session, 0, crc0, c0).unwrap();
        let (_, _) = chunks.remove(0);
        let (crc2, c2) = chunks.remove(0);

        let err = send_chunk(&mut session, 2, crc2, c2).unwrap_err();
        assert!(matches!(err, TransferError::SequenceGap { expected: 1, received: 2 }));
        assert_eq!(session.state(), TransferState::Failed);
        let record = registry.get_file(file_id).unwrap().unwrap();
        assert_eq!(record.status, VerificationStatus::Corrupt);
        assert_eq!(std::fs::read(&record.path_name).unwrap().len(), CHUNK_SIZE);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_metadata_before_handshake_is_rejected() {
        let (mut session, _, _) = new_session();
        let err = session
            .handle(Message::Metadata(Metadata {
                file_name: "x".to_string(),
                total_size: 1,
                chunk_count: 1,
                modified: 0,
            }))
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::UnexpectedMessage {
                state: TransferState::AwaitingHandshake,
                message_type: MessageType::Metadata
            }
        ));
        assert_eq!(session.state(), TransferState::Failed);
    }

    #[test]
    fn test_inconsistent_chunk_count_rejected() {
        let (mut session, registry, _) = new_session();
        handshake(&mut session);
        let err = session
            .handle(Message::Metadata(Metadata {
                file_name: "x".to_string(),
                total_size: (CHUNK_SIZE * 2) as u64,
                chunk_count: 3,
                modified: 0,
            }))
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidMetadata(_)));
        assert!(registry.list_files(None).unwrap().is_empty());
    }

    #[test]
    fn test_handshake_with_garbage_key_fails() {
        let (mut session, registry, _) = new_session();
        let err = session
            .handle(Message::HandshakeRequest(HandshakeRequest {
                client_name: "mallory".to_string(),
                public_key: vec![0x30, 0x00, 0x01],
            }))
            .unwrap_err();
        assert!(matches!(err, TransferError::Crypto(CryptoError::InvalidPublicKey(_))));
        assert_eq!(session.state(), TransferState::Failed);
        assert!(registry.find_client("mallory").unwrap().is_none());
    }

    #[test]
    fn test_returning_client_handshake_without_key() {
        let (mut first, registry, dir) = new_session();
        handshake(&mut first);

        let mut second = TransferSession::new(Arc::clone(&registry), dir, 3);
        let reply = second
            .handle(Message::HandshakeRequest(HandshakeRequest {
                client_name: "alice".to_string(),
                public_key: Vec::new(),
            }))
            .unwrap();
        let Message::HandshakeResponse(resp) = reply else {
            panic!("expected handshake response");
        };
        assert!(keys().unwrap_session_key(&resp.wrapped_key).is_ok());
        assert_eq!(second.client_id(), first.client_id());
    }

    #[test]
    fn test_unknown_client_without_key_fails() {
        let (mut session, _, _) = new_session();
        let err = session
            .handle(Message::HandshakeRequest(HandshakeRequest {
                client_name: "stranger".to_string(),
                public_key: Vec::new(),
            }))
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Persistence(RegistryError::MissingPublicKey(_))
        ));
    }

    #[test]
    fn test_abort_mid_transfer_marks_corrupt() {
        let (mut session, registry, dir) = new_session();
        handshake(&mut session);
        let file_id = metadata(&mut session, 500_000);
        session.abort("connection closed");
        assert_eq!(session.state(), TransferState::Failed);
        assert_eq!(
            registry.get_file(file_id).unwrap().unwrap().status,
            VerificationStatus::Corrupt
        );
        let _ = std::fs::remove_dir_all(dir);
    }
}
