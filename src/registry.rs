//! Durable bookkeeping of clients and their backed-up files.
//!
//! A single SQLite connection sits behind a mutex. That mutex is the one
//! write serialisation point for every session on the server: two sessions
//! recording files for the same client take turns and each gets its own id.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messages::VerificationStatus;
use crate::storage::{remove_stored_file, unix_now};

pub type ClientId = i64;
pub type FileId = i64;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("unknown client {0:?} sent no public key")]
    MissingPublicKey(String),

    #[error("client {0} not found")]
    ClientNotFound(ClientId),

    #[error("file {0} not found")]
    FileNotFound(FileId),

    #[error("registry lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub name: String,
    #[serde(skip)]
    pub public_key: Vec<u8>,
    pub last_seen: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub client_id: ClientId,
    pub client_name: String,
    pub file_name: String,
    pub path_name: PathBuf,
    pub file_size: u64,
    pub modification_date: u64,
    pub status: VerificationStatus,
    /// CRC-32 recorded when the transfer finished.
    pub checksum: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileDeleteOutcome {
    Deleted,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientDeleteOutcome {
    Deleted,
    HasDependentFiles(usize),
    NotFound,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS clients (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        name        TEXT NOT NULL UNIQUE,
        public_key  BLOB NOT NULL,
        last_seen   INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS files (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        client_id          INTEGER NOT NULL REFERENCES clients(id) ON DELETE RESTRICT,
        file_name          TEXT NOT NULL,
        path_name          TEXT NOT NULL,
        verified           INTEGER NOT NULL DEFAULT 0,
        file_size          INTEGER NOT NULL,
        modification_date  INTEGER NOT NULL,
        checksum           INTEGER
    );
    CREATE INDEX IF NOT EXISTS files_by_client ON files(client_id);
";

const FILE_COLUMNS: &str = "f.id, f.client_id, c.name, f.file_name, f.path_name, f.file_size,
     f.modification_date, f.verified, f.checksum";

pub struct Registry {
    conn: Mutex<Connection>,
}

impl Registry {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        info!("Opened registry at {}", path.display());
        Self::init(conn)
    }

    /// A private database for tests and the offline backend.
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, RegistryError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Registry {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, RegistryError> {
        self.conn.lock().map_err(|_| RegistryError::Poisoned)
    }

    /// Register a client or refresh an existing one.
    ///
    /// A supplied key replaces the stored one; an empty key keeps it. A
    /// client seen for the first time must supply a key.
    pub fn upsert_client(&self, name: &str, public_key: &[u8]) -> Result<ClientId, RegistryError> {
        let conn = self.lock()?;
        let now = unix_now() as i64;
        let existing: Option<ClientId> = conn
            .query_row(
                "SELECT id FROM clients WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                if public_key.is_empty() {
                    conn.execute(
                        "UPDATE clients SET last_seen = ?1 WHERE id = ?2",
                        params![now, id],
                    )?;
                } else {
                    conn.execute(
                        "UPDATE clients SET last_seen = ?1, public_key = ?2 WHERE id = ?3",
                        params![now, public_key, id],
                    )?;
                }
                debug!("Refreshed client {} ({})", name, id);
                Ok(id)
            }
            None => {
                if public_key.is_empty() {
                    return Err(RegistryError::MissingPublicKey(name.to_string()));
                }
                conn.execute(
                    "INSERT INTO clients (name, public_key, last_seen) VALUES (?1, ?2, ?3)",
                    params![name, public_key, now],
                )?;
                let id = conn.last_insert_rowid();
                info!("Registered new client {} ({})", name, id);
                Ok(id)
            }
        }
    }

    pub fn find_client(&self, name: &str) -> Result<Option<Client>, RegistryError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT id, name, public_key, last_seen FROM clients WHERE name = ?1",
                params![name],
                row_to_client,
            )
            .optional()?)
    }

    pub fn get_client(&self, id: ClientId) -> Result<Option<Client>, RegistryError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT id, name, public_key, last_seen FROM clients WHERE id = ?1",
                params![id],
                row_to_client,
            )
            .optional()?)
    }

    pub fn list_clients(&self) -> Result<Vec<Client>, RegistryError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT id, name, public_key, last_seen FROM clients ORDER BY id")?;
        let clients = stmt
            .query_map([], row_to_client)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(clients)
    }

    /// Insert a new, unverified file record.
    pub fn record_file(
        &self,
        client_id: ClientId,
        file_name: &str,
        path_name: &Path,
        file_size: u64,
        modification_date: u64,
    ) -> Result<FileId, RegistryError> {
        let conn = self.lock()?;
        let exists: Option<i64> = conn
            .query_row(
                "SELECT id FROM clients WHERE id = ?1",
                params![client_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(RegistryError::ClientNotFound(client_id));
        }

        conn.execute(
            "INSERT INTO files (client_id, file_name, path_name, verified, file_size, modification_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                client_id,
                file_name,
                path_name.to_string_lossy().into_owned(),
                VerificationStatus::Unverified.code(),
                file_size as i64,
                modification_date as i64,
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!("Recorded file {} ({}) for client {}", file_name, id, client_id);
        Ok(id)
    }

    /// Store the received size and checksum once the client has confirmed them.
    pub fn finalize_file(&self, file_id: FileId, file_size: u64, checksum: u32) -> Result<(), RegistryError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE files SET file_size = ?1, checksum = ?2 WHERE id = ?3",
            params![file_size as i64, checksum as i64, file_id],
        )?;
        if changed == 0 {
            return Err(RegistryError::FileNotFound(file_id));
        }
        Ok(())
    }

    pub fn set_verification(&self, file_id: FileId, status: VerificationStatus) -> Result<(), RegistryError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE files SET verified = ?1 WHERE id = ?2",
            params![status.code(), file_id],
        )?;
        if changed == 0 {
            return Err(RegistryError::FileNotFound(file_id));
        }
        debug!("File {} is now {:?}", file_id, status);
        Ok(())
    }

    pub fn get_file(&self, file_id: FileId) -> Result<Option<FileRecord>, RegistryError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM files f JOIN clients c ON c.id = f.client_id WHERE f.id = ?1",
            FILE_COLUMNS
        );
        Ok(conn.query_row(&sql, params![file_id], row_to_file).optional()?)
    }

    /// All files, or only those of one client, oldest first.
    pub fn list_files(&self, client_id: Option<ClientId>) -> Result<Vec<FileRecord>, RegistryError> {
        let conn = self.lock()?;
        let files = match client_id {
            Some(id) => {
                let sql = format!(
                    "SELECT {} FROM files f JOIN clients c ON c.id = f.client_id
                     WHERE f.client_id = ?1 ORDER BY f.id",
                    FILE_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![id], row_to_file)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM files f JOIN clients c ON c.id = f.client_id ORDER BY f.id",
                    FILE_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], row_to_file)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(files)
    }

    /// Delete a file record together with its stored bytes.
    pub fn delete_file(&self, file_id: FileId) -> Result<FileDeleteOutcome, RegistryError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let path: Option<String> = tx
            .query_row(
                "SELECT path_name FROM files WHERE id = ?1",
                params![file_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(path) = path else {
            return Ok(FileDeleteOutcome::NotFound);
        };

        tx.execute("DELETE FROM files WHERE id = ?1", params![file_id])?;
        // The row delete only commits once the bytes are gone.
        remove_stored_file(Path::new(&path))?;
        tx.commit()?;
        info!("Deleted file {} ({})", file_id, path);
        Ok(FileDeleteOutcome::Deleted)
    }

    /// Delete a client that owns no files.
    pub fn delete_client(&self, client_id: ClientId) -> Result<ClientDeleteOutcome, RegistryError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let exists: Option<i64> = tx
            .query_row(
                "SELECT id FROM clients WHERE id = ?1",
                params![client_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Ok(ClientDeleteOutcome::NotFound);
        }

        let owned: i64 = tx.query_row(
            "SELECT COUNT(*) FROM files WHERE client_id = ?1",
            params![client_id],
            |row| row.get(0),
        )?;
        if owned > 0 {
            return Ok(ClientDeleteOutcome::HasDependentFiles(owned as usize));
        }

        tx.execute("DELETE FROM clients WHERE id = ?1", params![client_id])?;
        tx.commit()?;
        info!("Deleted client {}", client_id);
        Ok(ClientDeleteOutcome::Deleted)
    }
}

fn row_to_client(row: &rusqlite::Row<'_>) -> rusqlite::Result<Client> {
    Ok(Client {
        id: row.get(0)?,
        name: row.get(1)?,
        public_key: row.get(2)?,
        last_seen: row.get::<_, i64>(3)? as u64,
    })
}

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    let code: u8 = row.get(7)?;
    let status = VerificationStatus::from_code(code).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Integer,
            format!("unknown verification status {}", code).into(),
        )
    })?;
    Ok(FileRecord {
        id: row.get(0)?,
        client_id: row.get(1)?,
        client_name: row.get(2)?,
        file_name: row.get(3)?,
        path_name: PathBuf::from(row.get::<_, String>(4)?),
        file_size: row.get::<_, i64>(5)? as u64,
        modification_date: row.get::<_, i64>(6)? as u64,
        status,
        checksum: row.get::<_, Option<i64>>(8)?.map(|c| c as u32),
    })
}
