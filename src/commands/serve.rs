use std::error::Error;

use log::{debug, info};

use crate::config::ServerConfig;
use crate::server::{Server, ServerContext};

/// Run the backup server until the listener fails.
///
/// # Process Flow
/// 1. Create the storage directory and open the registry database
/// 2. Bind the listener (address and port from `config`)
/// 3. Hand every accepted connection to its own session task
///
/// # Arguments
/// * `config` - Server settings, already merged with command-line overrides
pub async fn run(config: ServerConfig) -> Result<(), Box<dyn Error>> {
    debug!(
        "Opening registry {} with storage in {}",
        config.database_path.display(),
        config.storage_dir.display()
    );
    let context = ServerContext::open(config)?;
    let server = Server::bind(context).await?;

    let addr = server.local_addr()?;
    println!("Server listening on {}", addr);
    info!("Backup server started on {}", addr);

    server.run().await?;
    Ok(())
}
