use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::Rng;
use rand_core::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

use crate::{BLOCK_SIZE, KEY_SIZE, MIN_RSA_BITS};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub type SessionKey = [u8; KEY_SIZE];

const ZERO_IV: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("failed to wrap session key: {0}")]
    KeyWrapFailure(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("decryption failed: {0}")]
    DecryptionFailure(String),

    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

/// Fresh random AES-256 key for one session.
pub fn generate_session_key() -> SessionKey {
    let mut key = [0u8; KEY_SIZE];
    rand::rng().fill(&mut key);
    key
}

/// Parse a DER SubjectPublicKeyInfo RSA key, rejecting moduli below the
/// protocol minimum.
pub fn parse_public_key(der: &[u8]) -> Result<RsaPublicKey, CryptoError> {
    let key = RsaPublicKey::from_public_key_der(der)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    let bits = key.n().bits();
    if bits < MIN_RSA_BITS {
        return Err(CryptoError::InvalidPublicKey(format!(
            "{}-bit modulus is below the {}-bit minimum",
            bits, MIN_RSA_BITS
        )));
    }
    Ok(key)
}

/// Encrypt the session key under the client's public key with RSA-OAEP(SHA-256).
pub fn wrap_session_key(public_key_der: &[u8], key: &SessionKey) -> Result<Vec<u8>, CryptoError> {
    let public_key = parse_public_key(public_key_der)?;
    public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key)
        .map_err(|e| CryptoError::KeyWrapFailure(e.to_string()))
}

pub fn unwrap_session_key(
    private_key: &RsaPrivateKey,
    wrapped: &[u8],
) -> Result<SessionKey, CryptoError> {
    let raw = private_key
        .decrypt(Oaep::new::<Sha256>(), wrapped)
        .map_err(|e| CryptoError::KeyWrapFailure(e.to_string()))?;
    raw.as_slice().try_into().map_err(|_| {
        CryptoError::KeyWrapFailure(format!("unwrapped key is {} bytes", raw.len()))
    })
}

/// An RSA key pair held by a backup client.
pub struct ClientKeyPair {
    private_key: RsaPrivateKey,
}

impl ClientKeyPair {
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        if bits < MIN_RSA_BITS {
            return Err(CryptoError::InvalidPublicKey(format!(
                "refusing to generate a {}-bit key",
                bits
            )));
        }
        let private_key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| CryptoError::KeyWrapFailure(e.to_string()))?;
        Ok(ClientKeyPair { private_key })
    }

    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, CryptoError> {
        let private_key = RsaPrivateKey::from_pkcs8_der(der)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        Ok(ClientKeyPair { private_key })
    }

    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, CryptoError> {
        let doc = self
            .private_key
            .to_pkcs8_der()
            .map_err(|e| CryptoError::KeyWrapFailure(e.to_string()))?;
        Ok(doc.as_bytes().to_vec())
    }

    pub fn public_key_der(&self) -> Result<Vec<u8>, CryptoError> {
        let doc = RsaPublicKey::from(&self.private_key)
            .to_public_key_der()
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        Ok(doc.as_bytes().to_vec())
    }

    pub fn unwrap_session_key(&self, wrapped: &[u8]) -> Result<SessionKey, CryptoError> {
        unwrap_session_key(&self.private_key, wrapped)
    }
}

/// Ciphertext length of a final (padded) chunk with `plaintext_len` bytes.
///
/// A full block of padding is added when the plaintext is already aligned.
pub fn padded_len(plaintext_len: usize) -> usize {
    plaintext_len + (BLOCK_SIZE - plaintext_len % BLOCK_SIZE)
}

/// Ciphertext length of chunk `plaintext_len` bytes long, given whether it is
/// the last chunk of its file.
pub fn encrypted_chunk_len(plaintext_len: usize, is_last: bool) -> usize {
    if is_last {
        padded_len(plaintext_len)
    } else {
        plaintext_len
    }
}

/// Encrypt a standalone chunk with PKCS#7 padding and a zero IV.
pub fn encrypt_chunk(key: &SessionKey, chunk: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256CbcEnc::new_from_slices(key, &ZERO_IV)
        .map_err(|e| CryptoError::DecryptionFailure(e.to_string()))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(chunk))
}

/// Inverse of [`encrypt_chunk`]. Ciphertext whose length is not a multiple of
/// the block size, or whose padding is invalid, is a decryption failure.
pub fn decrypt_chunk(key: &SessionKey, encrypted_chunk: &[u8]) -> Result<Vec<u8>, CryptoError> {
    check_block_aligned(encrypted_chunk)?;
    let cipher = Aes256CbcDec::new_from_slices(key, &ZERO_IV)
        .map_err(|e| CryptoError::DecryptionFailure(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(encrypted_chunk)
        .map_err(|_| CryptoError::DecryptionFailure("invalid padding".to_string()))
}

fn check_block_aligned(ciphertext: &[u8]) -> Result<(), CryptoError> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::DecryptionFailure(format!(
            "ciphertext length {} is not a positive multiple of {}",
            ciphertext.len(),
            BLOCK_SIZE
        )));
    }
    Ok(())
}

fn last_block(ciphertext: &[u8]) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    block.copy_from_slice(&ciphertext[ciphertext.len() - BLOCK_SIZE..]);
    block
}

/// Sender half of a file's CBC stream.
///
/// Chunks chain from the last ciphertext block of the previous chunk, so the
/// whole file is one CBC stream and only the final chunk carries padding.
pub struct ChunkSealer {
    key: SessionKey,
    iv: [u8; BLOCK_SIZE],
}

impl ChunkSealer {
    pub fn new(key: SessionKey) -> Self {
        ChunkSealer { key, iv: ZERO_IV }
    }

    pub fn seal(&mut self, plaintext: &[u8], is_last: bool) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256CbcEnc::new_from_slices(&self.key, &self.iv)
            .map_err(|e| CryptoError::DecryptionFailure(e.to_string()))?;
        let ciphertext = if is_last {
            cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext)
        } else {
            if plaintext.is_empty() || plaintext.len() % BLOCK_SIZE != 0 {
                return Err(CryptoError::DecryptionFailure(format!(
                    "non-final chunk of {} bytes is not block aligned",
                    plaintext.len()
                )));
            }
            cipher.encrypt_padded_vec_mut::<NoPadding>(plaintext)
        };
        self.iv = last_block(&ciphertext);
        Ok(ciphertext)
    }
}

/// Receiver half of a file's CBC stream.
///
/// The chaining state only advances when a chunk is accepted, so a chunk
/// that fails its checksum can be resent and opened again.
pub struct ChunkOpener {
    key: SessionKey,
    iv: [u8; BLOCK_SIZE],
}

impl ChunkOpener {
    pub fn new(key: SessionKey) -> Self {
        ChunkOpener { key, iv: ZERO_IV }
    }

    /// Decrypt without touching the chaining state.
    pub fn open(&self, ciphertext: &[u8], is_last: bool) -> Result<Vec<u8>, CryptoError> {
        check_block_aligned(ciphertext)?;
        let cipher = Aes256CbcDec::new_from_slices(&self.key, &self.iv)
            .map_err(|e| CryptoError::DecryptionFailure(e.to_string()))?;
        if is_last {
            cipher
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| CryptoError::DecryptionFailure("invalid padding".to_string()))
        } else {
            cipher
                .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
                .map_err(|_| CryptoError::DecryptionFailure("unaligned ciphertext".to_string()))
        }
    }

    /// Advance the chain past an accepted chunk.
    pub fn accept(&mut self, ciphertext: &[u8]) {
        self.iv = last_block(ciphertext);
    }
}

pub fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Running CRC-32 over every accepted chunk of one file.
#[derive(Default, Clone)]
pub struct ChecksumAccumulator {
    hasher: crc32fast::Hasher,
    bytes: u64,
}

impl ChecksumAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, plaintext: &[u8]) {
        self.hasher.update(plaintext);
        self.bytes += plaintext.len() as u64;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn value(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

pub fn verify_checksum(expected: u32, data: &[u8]) -> Result<(), CryptoError> {
    let actual = checksum(data);
    if actual != expected {
        return Err(CryptoError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CHUNK_SIZE;

    #[test]
    fn test_padded_len_aligned_adds_full_block() {
        for blocks in [1usize, 2, 64, 4096] {
            let s = blocks * BLOCK_SIZE;
            assert_eq!(padded_len(s), s + 16);
        }
        assert_eq!(padded_len(0), 16);
    }

    #[test]
    fn test_padded_len_unaligned_rounds_up() {
        for s in [1usize, 15, 17, 100, 2047, 65_535] {
            assert_eq!(padded_len(s), s + (16 - s % 16));
        }
    }

    #[test]
    fn test_encrypt_chunk_lengths_match_padding_rule() {
        let key = generate_session_key();
        for s in [0usize, 1, 15, 16, 31, 32, 1000, 2048] {
            let encrypted = encrypt_chunk(&key, &vec![0x5A; s]).unwrap();
            assert_eq!(encrypted.len(), padded_len(s), "plaintext of {} bytes", s);
        }
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let key = generate_session_key();
        for s in [0usize, 1, 16, 33, 4096, 5000] {
            let chunk: Vec<u8> = (0..s).map(|i| (i * 7) as u8).collect();
            let encrypted = encrypt_chunk(&key, &chunk).unwrap();
            assert_eq!(decrypt_chunk(&key, &encrypted).unwrap(), chunk);
        }
    }

    #[test]
    fn test_decrypt_wrong_key_fails_or_differs() {
        let key = generate_session_key();
        let other = generate_session_key();
        let chunk = b"confidential payload".to_vec();
        let encrypted = encrypt_chunk(&key, &chunk).unwrap();

        match decrypt_chunk(&other, &encrypted) {
            Err(CryptoError::DecryptionFailure(_)) => {}
            Ok(plaintext) => assert_ne!(plaintext, chunk),
            Err(e) => panic!("unexpected error {}", e),
        }
    }

    #[test]
    fn test_decrypt_unaligned_length_is_decryption_failure() {
        let key = generate_session_key();
        let err = decrypt_chunk(&key, &[0u8; 33]).unwrap_err();
        assert!(matches!(err, CryptoError::DecryptionFailure(_)));
    }

    #[test]
    fn test_stream_only_final_chunk_is_padded() {
        let key = generate_session_key();
        let mut sealer = ChunkSealer::new(key);
        let first = vec![1u8; CHUNK_SIZE];
        let second = vec![2u8; 2048];

        let c1 = sealer.seal(&first, false).unwrap();
        let c2 = sealer.seal(&second, true).unwrap();
        assert_eq!(c1.len(), CHUNK_SIZE);
        assert_eq!(c2.len(), 2064);

        let mut opener = ChunkOpener::new(key);
        let p1 = opener.open(&c1, false).unwrap();
        opener.accept(&c1);
        let p2 = opener.open(&c2, true).unwrap();
        assert_eq!(p1, first);
        assert_eq!(p2, second);
    }

    #[test]
    fn test_stream_single_aligned_chunk_gets_extra_block() {
        let key = generate_session_key();
        let mut sealer = ChunkSealer::new(key);
        let c = sealer.seal(&vec![0u8; CHUNK_SIZE], true).unwrap();
        assert_eq!(c.len(), CHUNK_SIZE + 16);
    }

    #[test]
    fn test_stream_rejects_unaligned_middle_chunk() {
        let mut sealer = ChunkSealer::new(generate_session_key());
        assert!(sealer.seal(&[0u8; 100], false).is_err());
    }

    #[test]
    fn test_opener_does_not_advance_until_accept() {
        let key = generate_session_key();
        let mut sealer = ChunkSealer::new(key);
        let c1 = sealer.seal(&[9u8; 32], false).unwrap();

        let opener = ChunkOpener::new(key);
        let once = opener.open(&c1, false).unwrap();
        let twice = opener.open(&c1, false).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_key_wrap_round_trip() {
        let pair = ClientKeyPair::generate(1024).unwrap();
        let key = generate_session_key();
        let wrapped = wrap_session_key(&pair.public_key_der().unwrap(), &key).unwrap();
        assert_eq!(wrapped.len(), 128);
        assert_eq!(pair.unwrap_session_key(&wrapped).unwrap(), key);
    }

    #[test]
    fn test_wrap_rejects_garbage_key() {
        let err = wrap_session_key(b"not a key", &generate_session_key()).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidPublicKey(_)));
    }

    #[test]
    fn test_generate_rejects_small_modulus() {
        assert!(ClientKeyPair::generate(512).is_err());
    }

    #[test]
    fn test_private_key_der_round_trip() {
        let pair = ClientKeyPair::generate(1024).unwrap();
        let restored = ClientKeyPair::from_pkcs8_der(&pair.to_pkcs8_der().unwrap()).unwrap();
        assert_eq!(
            restored.public_key_der().unwrap(),
            pair.public_key_der().unwrap()
        );
    }

    #[test]
    fn test_accumulator_matches_one_shot_checksum() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut acc = ChecksumAccumulator::new();
        for piece in data.chunks(CHUNK_SIZE) {
            acc.update(piece);
        }
        assert_eq!(acc.value(), checksum(&data));
        assert_eq!(acc.bytes(), data.len() as u64);
    }

    #[test]
    fn test_verify_checksum_detects_flipped_byte() {
        let mut data = vec![0x11u8; 512];
        let expected = checksum(&data);
        data[100] ^= 0x01;
        assert!(matches!(
            verify_checksum(expected, &data),
            Err(CryptoError::ChecksumMismatch { .. })
        ));
    }
}
