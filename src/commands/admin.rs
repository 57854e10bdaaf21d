use std::error::Error;

use serde::Serialize;

use crate::config::Config;
use crate::registry::{ClientId, FileId};
use crate::service::{backend_for, BackendMode, BackupService, CommandResult};

/// A management verb, run against whichever backend was selected.
#[derive(Debug, Clone, Copy)]
pub enum AdminCommand {
    Files(Option<ClientId>),
    Verify(FileId),
    Delete(FileId),
    DeleteClient(ClientId),
}

pub async fn run(config: &Config, mode: BackendMode, command: AdminCommand) -> Result<(), Box<dyn Error>> {
    let backend = backend_for(mode, config)?;
    let success = dispatch(backend.as_ref(), command).await?;
    if !success {
        return Err("command failed".into());
    }
    Ok(())
}

/// Run `command` and print its envelope; returns the envelope's `success`.
pub async fn dispatch(backend: &dyn BackupService, command: AdminCommand) -> Result<bool, Box<dyn Error>> {
    match command {
        AdminCommand::Files(client_id) => print_result(backend.get_files(client_id).await),
        AdminCommand::Verify(file_id) => print_result(backend.verify_file(file_id).await),
        AdminCommand::Delete(file_id) => print_result(backend.delete_file(file_id).await),
        AdminCommand::DeleteClient(client_id) => print_result(backend.delete_client(client_id).await),
    }
}

fn print_result<T: Serialize>(result: CommandResult<T>) -> Result<bool, Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.success)
}
