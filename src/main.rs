use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use bastion::commands::admin::AdminCommand;
use bastion::config::Config;
use bastion::service::BackendMode;

#[derive(Parser)]
#[command(name = "bastion")]
#[command(about = "Encrypted, integrity-checked file backup", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON config file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the backup server
    Serve {
        /// Port to bind to (default: 1256)
        #[arg(short, long)]
        port: Option<u16>,
        /// Directory for stored files
        #[arg(long)]
        storage_dir: Option<PathBuf>,
        /// Path of the registry database
        #[arg(long)]
        database: Option<PathBuf>,
    },
    /// Back up a file to the server
    Backup {
        /// Client identity to back up as
        identity: String,
        /// Path to the file to back up
        file_path: String,
        /// Server address (host:port)
        #[arg(short, long)]
        server: Option<String>,
        /// Reuse the public key already registered with the server
        #[arg(long)]
        returning: bool,
    },
    /// List stored files
    Files {
        /// Only list files of this client
        #[arg(long)]
        client_id: Option<i64>,
        /// Use the offline mock backend
        #[arg(long)]
        mock: bool,
    },
    /// Re-check a stored file against its recorded checksum
    Verify {
        file_id: i64,
        /// Use the offline mock backend
        #[arg(long)]
        mock: bool,
    },
    /// Delete a stored file and its record
    Delete {
        file_id: i64,
        /// Use the offline mock backend
        #[arg(long)]
        mock: bool,
    },
    /// Delete a client that owns no files
    DeleteClient {
        client_id: i64,
        /// Use the offline mock backend
        #[arg(long)]
        mock: bool,
    },
}

fn backend_mode(mock: bool) -> BackendMode {
    if mock {
        BackendMode::Mock
    } else {
        BackendMode::Live
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            port,
            storage_dir,
            database,
        } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(dir) = storage_dir {
                config.server.storage_dir = dir;
            }
            if let Some(path) = database {
                config.server.database_path = path;
            }
            bastion::commands::serve::run(config.server).await?;
        }
        Commands::Backup {
            identity,
            file_path,
            server,
            returning,
        } => {
            if let Some(addr) = server {
                config.client.server_address = addr;
            }
            bastion::commands::backup::run(config.client, &identity, &file_path, returning).await?;
        }
        Commands::Files { client_id, mock } => {
            bastion::commands::admin::run(&config, backend_mode(mock), AdminCommand::Files(client_id)).await?;
        }
        Commands::Verify { file_id, mock } => {
            bastion::commands::admin::run(&config, backend_mode(mock), AdminCommand::Verify(file_id)).await?;
        }
        Commands::Delete { file_id, mock } => {
            bastion::commands::admin::run(&config, backend_mode(mock), AdminCommand::Delete(file_id)).await?;
        }
        Commands::DeleteClient { client_id, mock } => {
            bastion::commands::admin::run(&config, backend_mode(mock), AdminCommand::DeleteClient(client_id))
                .await?;
        }
    }

    Ok(())
}
