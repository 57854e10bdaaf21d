use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;

use crate::codec::{read_message, write_message, CodecError, MessageType};
use crate::config::ClientConfig;
use crate::cryptography::{checksum, ChecksumAccumulator, ChunkSealer, ClientKeyPair, CryptoError};
use crate::messages::{
    AckStatus, Chunk, HandshakeRequest, Message, Metadata, VerificationStatus, VerifyRequest,
};
use crate::networking::connect;
use crate::storage::{chunk_count, modified_unix, read_chunk};
use crate::DEFAULT_MAX_PAYLOAD_LEN;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("framing error: {0}")]
    Codec(#[from] CodecError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("server rejected the session (code {code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("expected {expected:?}, server sent {received:?}")]
    UnexpectedMessage {
        expected: MessageType,
        received: MessageType,
    },

    #[error("server did not answer in time")]
    Timeout,

    #[error("chunk {0} was rejected too many times")]
    RetriesExhausted(u32),

    #[error("{0}")]
    InvalidInput(String),
}

/// What the server reported at the end of a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupOutcome {
    pub client_id: u32,
    pub file_id: u32,
    pub status: VerificationStatus,
    pub checksum: u32,
    pub bytes_sent: u64,
    pub chunks: u32,
}

/// Path of the private key file for `identity`.
pub fn key_path(key_dir: &Path, identity: &str) -> PathBuf {
    key_dir.join(format!("{}.der", identity))
}

/// Load the identity's key pair, generating and saving one on first use.
pub fn load_or_create_identity(
    key_dir: &Path,
    identity: &str,
    bits: usize,
) -> Result<ClientKeyPair, ClientError> {
    if identity.trim().is_empty() || identity.contains(['/', '\\']) {
        return Err(ClientError::InvalidInput(format!("invalid identity {:?}", identity)));
    }
    let path = key_path(key_dir, identity);
    if path.exists() {
        debug!("Loading key for {} from {}", identity, path.display());
        return Ok(ClientKeyPair::from_pkcs8_der(&fs::read(&path)?)?);
    }

    info!("Generating {}-bit key for {}", bits, identity);
    let keys = ClientKeyPair::generate(bits)?;
    fs::create_dir_all(key_dir)?;
    fs::write(&path, keys.to_pkcs8_der()?)?;
    Ok(keys)
}

/// The sending side of the protocol for one identity.
pub struct BackupClient {
    config: ClientConfig,
    identity: String,
    keys: ClientKeyPair,
    send_public_key: bool,
    show_progress: bool,
}

impl BackupClient {
    pub fn new(config: ClientConfig, identity: impl Into<String>, keys: ClientKeyPair) -> Self {
        BackupClient {
            config,
            identity: identity.into(),
            keys,
            send_public_key: true,
            show_progress: false,
        }
    }

    /// Omit the public key from the handshake and rely on the one the server
    /// already has on file.
    pub fn returning(mut self) -> Self {
        self.send_public_key = false;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Connect to the configured server and back up one file.
    pub async fn backup_file(&self, path: &Path) -> Result<BackupOutcome, ClientError> {
        let mut stream = connect(&self.config.server_address, self.config.timeout()).await?;
        self.run_session(&mut stream, path).await
    }

    /// Run a whole session over an already connected stream.
    pub async fn run_session<S>(&self, stream: &mut S, path: &Path) -> Result<BackupOutcome, ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let metadata = fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(ClientError::InvalidInput(format!("not a file: {}", path.display())));
        }
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ClientError::InvalidInput(format!("bad file name: {}", path.display())))?
            .to_string();
        let total_size = metadata.len();
        let chunks = u32::try_from(chunk_count(total_size))
            .map_err(|_| ClientError::InvalidInput(format!("{} is too large", path.display())))?;

        // Handshake
        let public_key = if self.send_public_key {
            self.keys.public_key_der()?
        } else {
            Vec::new()
        };
        self.send(
            stream,
            Message::HandshakeRequest(HandshakeRequest {
                client_name: self.identity.clone(),
                public_key,
            }),
        )
        .await?;
        let response = match self.receive(stream).await? {
            Message::HandshakeResponse(r) => r,
            other => return Err(unexpected(MessageType::HandshakeResponse, &other)),
        };
        let session_key = self.keys.unwrap_session_key(&response.wrapped_key)?;
        debug!("Session key received, client id {}", response.client_id);

        // Metadata
        self.send(
            stream,
            Message::Metadata(Metadata {
                file_name: file_name.clone(),
                total_size,
                chunk_count: chunks,
                modified: modified_unix(&metadata),
            }),
        )
        .await?;
        let file_id = match self.receive(stream).await? {
            Message::MetadataAck(ack) => ack.file_id,
            other => return Err(unexpected(MessageType::MetadataAck, &other)),
        };
        info!("Backing up {} ({} bytes) as file {}", file_name, total_size, file_id);

        // Chunks
        let bar = self.progress_bar(total_size);
        let mut source = File::open(path)?;
        let mut sealer = ChunkSealer::new(session_key);
        let mut aggregate = ChecksumAccumulator::new();
        for sequence in 0..chunks {
            let plaintext = read_chunk(&mut source)?;
            let is_last = sequence + 1 == chunks;
            if !is_last && plaintext.len() != crate::CHUNK_SIZE {
                return Err(ClientError::InvalidInput(format!(
                    "{} changed while it was being read",
                    path.display()
                )));
            }
            let ciphertext = sealer.seal(&plaintext, is_last)?;
            let chunk = Chunk {
                sequence,
                checksum: checksum(&plaintext),
                ciphertext,
            };
            self.send_chunk(stream, chunk).await?;
            aggregate.update(&plaintext);
            bar.inc(plaintext.len() as u64);
        }
        if aggregate.bytes() != total_size {
            warn!(
                "{} changed during backup: sent {} of {} bytes",
                file_name,
                aggregate.bytes(),
                total_size
            );
        }
        bar.finish_with_message("Upload complete");

        // Verification
        self.send(
            stream,
            Message::VerifyRequest(VerifyRequest {
                checksum: aggregate.value(),
            }),
        )
        .await?;
        let result = match self.receive(stream).await? {
            Message::VerifyResult(r) => r,
            other => return Err(unexpected(MessageType::VerifyResult, &other)),
        };
        info!("Server reports file {} as {:?}", result.file_id, result.status);

        Ok(BackupOutcome {
            client_id: response.client_id,
            file_id: result.file_id,
            status: result.status,
            checksum: result.checksum,
            bytes_sent: aggregate.bytes(),
            chunks,
        })
    }

    /// Send a chunk and wait for its ack, resending while the server asks.
    async fn send_chunk<S>(&self, stream: &mut S, chunk: Chunk) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let sequence = chunk.sequence;
        let message = Message::Chunk(chunk);
        for attempt in 0..=self.config.max_chunk_retries {
            if attempt > 0 {
                warn!("Resending chunk {} (attempt {})", sequence, attempt + 1);
            }
            self.send(stream, message.clone()).await?;
            match self.receive(stream).await? {
                Message::ChunkAck(ack) if ack.sequence == sequence => match ack.status {
                    AckStatus::Accepted => {
                        debug!("Chunk {} accepted", sequence);
                        return Ok(());
                    }
                    AckStatus::Resend => continue,
                },
                other => return Err(unexpected(MessageType::ChunkAck, &other)),
            }
        }
        Err(ClientError::RetriesExhausted(sequence))
    }

    async fn send<W: AsyncWrite + Unpin>(&self, stream: &mut W, message: Message) -> Result<(), ClientError> {
        let frame = message.into_frame()?;
        write_message(stream, frame.message_type, &frame.payload).await?;
        Ok(())
    }

    /// Read the next reply; an ERROR message from the server becomes
    /// `ClientError::Rejected`.
    async fn receive<R: AsyncRead + Unpin>(&self, stream: &mut R) -> Result<Message, ClientError> {
        let frame = timeout(self.config.timeout(), read_message(stream, DEFAULT_MAX_PAYLOAD_LEN))
            .await
            .map_err(|_| ClientError::Timeout)??;
        match Message::from_frame(&frame)? {
            Message::Error(e) => Err(ClientError::Rejected {
                code: e.code,
                message: e.message,
            }),
            message => Ok(message),
        }
    }

    fn progress_bar(&self, total_size: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(total_size);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({eta}) {msg}")
        {
            bar.set_style(style);
        }
        bar
    }
}

fn unexpected(expected: MessageType, received: &Message) -> ClientError {
    ClientError::UnexpectedMessage {
        expected,
        received: received.message_type(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_key_is_created_then_reused() {
        let key_dir = std::env::temp_dir().join(format!("test_bastion_keys_{}", std::process::id()));
        let _ = fs::remove_dir_all(&key_dir);

        let first = load_or_create_identity(&key_dir, "laptop", 1024).unwrap();
        assert!(key_path(&key_dir, "laptop").exists());
        let second = load_or_create_identity(&key_dir, "laptop", 1024).unwrap();
        assert_eq!(first.public_key_der().unwrap(), second.public_key_der().unwrap());

        let _ = fs::remove_dir_all(&key_dir);
    }

    #[test]
    fn test_identity_with_separator_rejected() {
        let key_dir = std::env::temp_dir();
        assert!(matches!(
            load_or_create_identity(&key_dir, "../evil", 1024),
            Err(ClientError::InvalidInput(_))
        ));
        assert!(load_or_create_identity(&key_dir, "  ", 1024).is_err());
    }
}
