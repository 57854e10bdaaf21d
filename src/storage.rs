use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;
use uuid::Uuid;

use crate::CHUNK_SIZE;

/// Read up to one chunk from a data source, filling the buffer unless the
/// source ends first.
///
/// Short reads from the underlying source are retried, so every chunk except
/// the last is exactly `CHUNK_SIZE` bytes and stays block aligned.
///
/// Returns the buffer truncated to the bytes read; an empty buffer means end
/// of data.
pub fn read_chunk<R: Read>(data_source: &mut R) -> Result<Vec<u8>, io::Error> {
    let mut buffer = vec![0; CHUNK_SIZE];
    let mut filled = 0;
    while filled < CHUNK_SIZE {
        let n = data_source.read(&mut buffer[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buffer.truncate(filled);
    Ok(buffer)
}

/// Number of chunks a file of `size` bytes is sent in.
///
/// An empty file still sends one chunk, which carries only padding.
pub fn chunk_count(size: u64) -> u64 {
    if size == 0 {
        1
    } else {
        size.div_ceil(CHUNK_SIZE as u64)
    }
}

/// Only the final path component, with separators and parent references
/// stripped so a client cannot escape its storage directory.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() || c == ':' { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "unnamed".to_string(),
        _ => cleaned,
    }
}

/// A fresh, unique storage path for one upload of `file_name` by a client.
///
/// Two concurrent uploads of the same name never share a path.
pub fn storage_path(storage_dir: &Path, client_id: i64, file_name: &str) -> PathBuf {
    storage_dir
        .join(client_id.to_string())
        .join(format!("{}-{}", Uuid::new_v4(), sanitize_file_name(file_name)))
}

/// Create (or truncate) the file at `path`, creating parent directories.
pub fn create_file_bufwriter(path: &Path) -> Result<BufWriter<File>, io::Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    debug!("Created storage file {}", path.display());
    Ok(BufWriter::new(file))
}

/// Append bytes to a stored file and flush them to disk.
pub fn append_chunk(writer: &mut BufWriter<File>, chunk: &[u8]) -> Result<(), io::Error> {
    writer.write_all(chunk)?;
    writer.flush()?;
    Ok(())
}

/// CRC-32 and length of a file on disk, streamed in chunk-sized pieces.
pub fn file_checksum(path: &Path) -> Result<(u32, u64), io::Error> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = crc32fast::Hasher::new();
    let mut total = 0u64;
    loop {
        let chunk = read_chunk(&mut reader)?;
        if chunk.is_empty() {
            break;
        }
        total += chunk.len() as u64;
        hasher.update(&chunk);
    }
    Ok((hasher.finalize(), total))
}

/// Remove a stored file; a file that is already gone is not an error.
pub fn remove_stored_file(path: &Path) -> Result<(), io::Error> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn modified_unix(metadata: &fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
