use std::error::Error;
use std::path::Path;

use log::debug;

use crate::client::{load_or_create_identity, BackupClient};
use crate::config::ClientConfig;
use crate::messages::VerificationStatus;

/// Back up a single file to the configured server.
///
/// The identity's key pair lives in `config.key_dir`; the first backup for a
/// new identity generates it. With `returning` set, the handshake carries no
/// public key and the server uses the one already registered.
pub async fn run(
    config: ClientConfig,
    identity: &str,
    file_path: &str,
    returning: bool,
) -> Result<(), Box<dyn Error>> {
    let path = Path::new(file_path);
    if !path.is_file() {
        return Err(format!("Path is not a file: {}", file_path).into());
    }

    let keys = load_or_create_identity(&config.key_dir, identity, config.key_bits)?;
    debug!("Connecting to {} as {}", config.server_address, identity);

    let mut client = BackupClient::new(config, identity, keys).with_progress(true);
    if returning {
        client = client.returning();
    }
    let outcome = client.backup_file(path).await?;

    match outcome.status {
        VerificationStatus::Verified => println!(
            "Backed up {} as file {} ({} bytes, checksum {:#010x}): VERIFIED",
            file_path, outcome.file_id, outcome.bytes_sent, outcome.checksum
        ),
        status => {
            return Err(format!(
                "Backup of {} finished as {:?}: server checksum {:#010x} does not match",
                file_path, status, outcome.checksum
            )
            .into())
        }
    }
    Ok(())
}
