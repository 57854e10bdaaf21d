pub mod client;
pub mod codec;
pub mod commands;
pub mod config;
pub mod cryptography;
pub mod messages;
pub mod networking;
pub mod registry;
pub mod server;
pub mod service;
pub mod storage;
pub mod transfer;

/// Wire protocol version carried in every header.
pub const PROTOCOL_VERSION: u8 = 3;
pub const HEADER_SIZE: usize = 7;

pub const CHUNK_SIZE: usize = 64 * 1024;
pub const BLOCK_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;

pub const DEFAULT_PORT: u16 = 1256;
/// Largest payload accepted by default: one chunk plus padding and a little framing room.
pub const DEFAULT_MAX_PAYLOAD_LEN: u32 = (CHUNK_SIZE + 1024) as u32;
pub const MAX_CHUNK_RETRIES: u32 = 3;
pub const MIN_RSA_BITS: usize = 1024;
