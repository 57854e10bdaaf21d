use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_MAX_PAYLOAD_LEN, DEFAULT_PORT, MAX_CHUNK_RETRIES};

/// Server settings. Every field has a default, so a config file only needs
/// the values it changes.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Root directory under which received files are stored.
    pub storage_dir: PathBuf,
    pub database_path: PathBuf,
    pub max_payload_len: u32,
    pub max_sessions: usize,
    pub session_timeout_secs: u64,
    pub max_chunk_retries: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            storage_dir: PathBuf::from("backups"),
            database_path: PathBuf::from("bastion.db"),
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            max_sessions: 64,
            session_timeout_secs: 30,
            max_chunk_retries: MAX_CHUNK_RETRIES,
        }
    }
}

impl ServerConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Settings for the backing-up side.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ClientConfig {
    pub server_address: String,
    /// Directory holding `<identity>.der` private keys.
    pub key_dir: PathBuf,
    pub key_bits: usize,
    pub timeout_secs: u64,
    pub max_chunk_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_address: format!("127.0.0.1:{}", DEFAULT_PORT),
            key_dir: PathBuf::from("keys"),
            key_bits: 1024,
            timeout_secs: 30,
            max_chunk_retries: MAX_CHUNK_RETRIES,
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Config file layout: both sections optional.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl Config {
    /// Load from a JSON file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, Box<dyn Error>> {
        match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .map_err(|e| format!("Failed to read config {}: {}", path.display(), e))?;
                let config = serde_json::from_str(&raw)
                    .map_err(|e| format!("Invalid config {}: {}", path.display(), e))?;
                Ok(config)
            }
            None => Ok(Config::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 1256);
        assert_eq!(config.server.max_chunk_retries, 3);
        assert_eq!(config.server.session_timeout(), Duration::from_secs(30));
        assert_eq!(config.client.server_address, "127.0.0.1:1256");
        assert_eq!(config.client.key_bits, 1024);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"server": {"port": 9000, "max_sessions": 2}}"#).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.max_sessions, 2);
        assert_eq!(config.server.max_payload_len, DEFAULT_MAX_PAYLOAD_LEN);
        assert_eq!(config.client.timeout_secs, 30);
        assert_eq!(config.server.listen_addr(), "0.0.0.0:9000");
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("test_bastion_config_{}.json", std::process::id()));
        fs::write(&path, r#"{"client": {"server_address": "10.0.0.5:1256"}}"#).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.client.server_address, "10.0.0.5:1256");
        assert_eq!(config.server.port, DEFAULT_PORT);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let missing = Path::new("/definitely/not/here.json");
        assert!(Config::load(Some(missing)).is_err());
    }
}
