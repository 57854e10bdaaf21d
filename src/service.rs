//! The narrow command interface offered to presentation layers.
//!
//! Callers hold a `Box<dyn BackupService>` picked once by [`backend_for`].
//! The live and mock backends answer with the same [`CommandResult`]
//! envelope; only its `mode` field tells them apart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::client::{load_or_create_identity, BackupClient};
use crate::config::{ClientConfig, Config};
use crate::messages::VerificationStatus;
use crate::registry::{
    ClientDeleteOutcome, ClientId, FileDeleteOutcome, FileId, FileRecord, Registry, RegistryError,
};
use crate::storage::{file_checksum, unix_now};

pub type JobId = Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    Live,
    Mock,
}

/// Uniform result envelope for every command.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommandResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: String,
    pub mode: BackendMode,
}

impl<T> CommandResult<T> {
    pub fn ok(mode: BackendMode, data: T, message: impl Into<String>) -> Self {
        CommandResult {
            success: true,
            data: Some(data),
            message: message.into(),
            mode,
        }
    }

    pub fn fail(mode: BackendMode, message: impl Into<String>) -> Self {
        CommandResult {
            success: false,
            data: None,
            message: message.into(),
            mode,
        }
    }
}

/// A file as shown to presentation layers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileSummary {
    pub id: FileId,
    pub client_id: ClientId,
    pub client_name: String,
    pub file_name: String,
    pub file_size: u64,
    pub modification_date: u64,
    pub status: VerificationStatus,
}

impl From<FileRecord> for FileSummary {
    fn from(record: FileRecord) -> Self {
        FileSummary {
            id: record.id,
            client_id: record.client_id,
            client_name: record.client_name,
            file_name: record.file_name,
            file_size: record.file_size,
            modification_date: record.modification_date,
            status: record.status,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Finished {
        file_id: u32,
        status: VerificationStatus,
    },
    Failed {
        reason: String,
    },
}

#[async_trait]
pub trait BackupService: Send + Sync {
    fn mode(&self) -> BackendMode;

    async fn start_backup(&self, client_identity: &str, file_path: &Path) -> CommandResult<JobId>;

    async fn job_status(&self, job_id: JobId) -> CommandResult<JobStatus>;

    async fn get_files(&self, client_id: Option<ClientId>) -> CommandResult<Vec<FileSummary>>;

    async fn verify_file(&self, file_id: FileId) -> CommandResult<VerificationStatus>;

    async fn delete_file(&self, file_id: FileId) -> CommandResult<()>;

    async fn delete_client(&self, client_id: ClientId) -> CommandResult<()>;
}

/// Choose the backend once, at construction.
pub fn backend_for(mode: BackendMode, config: &Config) -> Result<Box<dyn BackupService>, RegistryError> {
    match mode {
        BackendMode::Live => {
            let registry = Arc::new(Registry::open(&config.server.database_path)?);
            Ok(Box::new(LiveBackend::new(registry, config.client.clone())))
        }
        BackendMode::Mock => Ok(Box::new(MockBackend::new())),
    }
}

type JobTable = Arc<Mutex<HashMap<JobId, JobStatus>>>;

/// Backend over the real registry, running backups against the real server.
pub struct LiveBackend {
    registry: Arc<Registry>,
    client_config: ClientConfig,
    jobs: JobTable,
}

impl LiveBackend {
    pub fn new(registry: Arc<Registry>, client_config: ClientConfig) -> Self {
        LiveBackend {
            registry,
            client_config,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run a registry call on the blocking pool; SQLite and file removal
    /// must not hold up the runtime's worker threads.
    async fn with_registry<T, F>(&self, f: F) -> Result<T, String>
    where
        F: FnOnce(&Registry) -> Result<T, RegistryError> + Send + 'static,
        T: Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        match tokio::task::spawn_blocking(move || f(&registry)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("Persistence error: {}", e)),
            Err(e) => Err(format!("Registry worker failed: {}", e)),
        }
    }
}

const LIVE: BackendMode = BackendMode::Live;

async fn run_backup_job(
    config: ClientConfig,
    identity: String,
    path: PathBuf,
) -> JobStatus {
    let key_dir = config.key_dir.clone();
    let bits = config.key_bits;
    let key_identity = identity.clone();
    let keys = match tokio::task::spawn_blocking(move || {
        load_or_create_identity(&key_dir, &key_identity, bits)
    })
    .await
    {
        Ok(Ok(keys)) => keys,
        Ok(Err(e)) => return JobStatus::Failed { reason: e.to_string() },
        Err(e) => return JobStatus::Failed { reason: e.to_string() },
    };

    match BackupClient::new(config, identity, keys).backup_file(&path).await {
        Ok(outcome) => JobStatus::Finished {
            file_id: outcome.file_id,
            status: outcome.status,
        },
        Err(e) => JobStatus::Failed { reason: e.to_string() },
    }
}

#[async_trait]
impl BackupService for LiveBackend {
    fn mode(&self) -> BackendMode {
        LIVE
    }

    async fn start_backup(&self, client_identity: &str, file_path: &Path) -> CommandResult<JobId> {
        if client_identity.trim().is_empty() {
            return CommandResult::fail(LIVE, "Client identity must not be empty");
        }
        if !file_path.is_file() {
            return CommandResult::fail(LIVE, format!("Path is not a file: {}", file_path.display()));
        }

        let job_id = Uuid::new_v4();
        self.jobs.lock().await.insert(job_id, JobStatus::Running);

        let jobs = Arc::clone(&self.jobs);
        let config = self.client_config.clone();
        let identity = client_identity.to_string();
        let path = file_path.to_path_buf();
        tokio::spawn(async move {
            let status = run_backup_job(config, identity, path).await;
            match &status {
                JobStatus::Failed { reason } => warn!("Backup job {} failed: {}", job_id, reason),
                _ => info!("Backup job {} finished: {:?}", job_id, status),
            }
            jobs.lock().await.insert(job_id, status);
        });

        CommandResult::ok(LIVE, job_id, format!("Backup of {} started", file_path.display()))
    }

    /// A finished or failed job is reported once and then forgotten.
    async fn job_status(&self, job_id: JobId) -> CommandResult<JobStatus> {
        let mut jobs = self.jobs.lock().await;
        if matches!(jobs.get(&job_id), Some(JobStatus::Running)) {
            return CommandResult::ok(LIVE, JobStatus::Running, "Job running");
        }
        match jobs.remove(&job_id) {
            Some(status) => CommandResult::ok(LIVE, status, "Job done"),
            None => CommandResult::fail(LIVE, format!("Unknown job {}", job_id)),
        }
    }

    async fn get_files(&self, client_id: Option<ClientId>) -> CommandResult<Vec<FileSummary>> {
        match self.with_registry(move |registry| registry.list_files(client_id)).await {
            Ok(files) => {
                let count = files.len();
                let summaries = files.into_iter().map(FileSummary::from).collect();
                CommandResult::ok(LIVE, summaries, format!("{} file(s)", count))
            }
            Err(message) => {
                error!("Listing files failed: {}", message);
                CommandResult::fail(LIVE, message)
            }
        }
    }

    /// Re-read the stored bytes and compare them with the checksum the
    /// client confirmed at the end of its transfer.
    async fn verify_file(&self, file_id: FileId) -> CommandResult<VerificationStatus> {
        let record = match self.with_registry(move |registry| registry.get_file(file_id)).await {
            Ok(Some(record)) => record,
            Ok(None) => return CommandResult::fail(LIVE, format!("File {} not found", file_id)),
            Err(message) => return CommandResult::fail(LIVE, message),
        };
        // Uploads that failed their end-of-transfer check have no checksum
        // and stay as they are.
        let Some(expected) = record.checksum else {
            return CommandResult::fail(
                LIVE,
                format!(
                    "File {} has no recorded checksum; its transfer was never verified ({:?})",
                    file_id, record.status
                ),
            );
        };

        let path = record.path_name.clone();
        let computed = tokio::task::spawn_blocking(move || file_checksum(&path)).await;
        let (status, message) = match computed {
            Ok(Ok((crc, size))) if crc == expected && size == record.file_size => {
                (VerificationStatus::Verified, "Stored bytes match the recorded checksum".to_string())
            }
            Ok(Ok((crc, size))) => (
                VerificationStatus::Corrupt,
                format!(
                    "Stored bytes differ: checksum {:#010x} over {} bytes, recorded {:#010x} over {} bytes",
                    crc, size, expected, record.file_size
                ),
            ),
            Ok(Err(e)) => (
                VerificationStatus::Corrupt,
                format!("Stored bytes unreadable: {}", e),
            ),
            Err(e) => return CommandResult::fail(LIVE, format!("Verification worker failed: {}", e)),
        };

        if let Err(message) = self
            .with_registry(move |registry| registry.set_verification(file_id, status))
            .await
        {
            return CommandResult::fail(LIVE, message);
        }
        CommandResult::ok(LIVE, status, message)
    }

    async fn delete_file(&self, file_id: FileId) -> CommandResult<()> {
        match self.with_registry(move |registry| registry.delete_file(file_id)).await {
            Ok(FileDeleteOutcome::Deleted) => CommandResult::ok(LIVE, (), format!("File {} deleted", file_id)),
            Ok(FileDeleteOutcome::NotFound) => CommandResult::fail(LIVE, format!("File {} not found", file_id)),
            Err(message) => CommandResult::fail(LIVE, message),
        }
    }

    async fn delete_client(&self, client_id: ClientId) -> CommandResult<()> {
        match self.with_registry(move |registry| registry.delete_client(client_id)).await {
            Ok(ClientDeleteOutcome::Deleted) => {
                CommandResult::ok(LIVE, (), format!("Client {} deleted", client_id))
            }
            Ok(ClientDeleteOutcome::HasDependentFiles(n)) => CommandResult::fail(
                LIVE,
                format!("Client {} still owns {} file(s); delete them first", client_id, n),
            ),
            Ok(ClientDeleteOutcome::NotFound) => {
                CommandResult::fail(LIVE, format!("Client {} not found", client_id))
            }
            Err(message) => CommandResult::fail(LIVE, message),
        }
    }
}

const MOCK: BackendMode = BackendMode::Mock;

struct MockState {
    files: Vec<FileSummary>,
    clients: HashMap<ClientId, String>,
    jobs: HashMap<JobId, JobStatus>,
    next_file_id: FileId,
}

/// Offline backend with canned data and no network or disk access.
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        let now = unix_now();
        let files = vec![
            FileSummary {
                id: 1,
                client_id: 1,
                client_name: "workstation".to_string(),
                file_name: "report.pdf".to_string(),
                file_size: 245_760,
                modification_date: now - 86_400,
                status: VerificationStatus::Verified,
            },
            FileSummary {
                id: 2,
                client_id: 1,
                client_name: "workstation".to_string(),
                file_name: "photos.tar".to_string(),
                file_size: 67_584,
                modification_date: now - 3_600,
                status: VerificationStatus::Corrupt,
            },
            FileSummary {
                id: 3,
                client_id: 2,
                client_name: "laptop".to_string(),
                file_name: "notes.txt".to_string(),
                file_size: 1_024,
                modification_date: now,
                status: VerificationStatus::Unverified,
            },
        ];
        let clients = HashMap::from([(1, "workstation".to_string()), (2, "laptop".to_string())]);
        MockBackend {
            state: Mutex::new(MockState {
                files,
                clients,
                jobs: HashMap::new(),
                next_file_id: 4,
            }),
        }
    }
}

#[async_trait]
impl BackupService for MockBackend {
    fn mode(&self) -> BackendMode {
        MOCK
    }

    async fn start_backup(&self, client_identity: &str, file_path: &Path) -> CommandResult<JobId> {
        if client_identity.trim().is_empty() {
            return CommandResult::fail(MOCK, "Client identity must not be empty");
        }
        let mut state = self.state.lock().await;
        let client_id = match state.clients.iter().find(|(_, name)| *name == client_identity) {
            Some((id, _)) => *id,
            None => {
                let id = state.clients.keys().max().copied().unwrap_or(0) + 1;
                state.clients.insert(id, client_identity.to_string());
                id
            }
        };
        let file_id = state.next_file_id;
        state.next_file_id += 1;
        state.files.push(FileSummary {
            id: file_id,
            client_id,
            client_name: client_identity.to_string(),
            file_name: file_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file_path.display().to_string()),
            file_size: 4_096,
            modification_date: unix_now(),
            status: VerificationStatus::Verified,
        });

        let job_id = Uuid::new_v4();
        state.jobs.insert(
            job_id,
            JobStatus::Finished {
                file_id: file_id as u32,
                status: VerificationStatus::Verified,
            },
        );
        CommandResult::ok(MOCK, job_id, format!("Backup of {} started", file_path.display()))
    }

    async fn job_status(&self, job_id: JobId) -> CommandResult<JobStatus> {
        match self.state.lock().await.jobs.remove(&job_id) {
            Some(status) => CommandResult::ok(MOCK, status, "Job done"),
            None => CommandResult::fail(MOCK, format!("Unknown job {}", job_id)),
        }
    }

    async fn get_files(&self, client_id: Option<ClientId>) -> CommandResult<Vec<FileSummary>> {
        let state = self.state.lock().await;
        let files: Vec<FileSummary> = state
            .files
            .iter()
            .filter(|f| client_id.map_or(true, |id| f.client_id == id))
            .cloned()
            .collect();
        let count = files.len();
        CommandResult::ok(MOCK, files, format!("{} file(s)", count))
    }

    async fn verify_file(&self, file_id: FileId) -> CommandResult<VerificationStatus> {
        let state = self.state.lock().await;
        match state.files.iter().find(|f| f.id == file_id) {
            Some(file) => CommandResult::ok(MOCK, file.status, "Stored bytes match the recorded checksum"),
            None => CommandResult::fail(MOCK, format!("File {} not found", file_id)),
        }
    }

    async fn delete_file(&self, file_id: FileId) -> CommandResult<()> {
        let mut state = self.state.lock().await;
        let before = state.files.len();
        state.files.retain(|f| f.id != file_id);
        if state.files.len() < before {
            CommandResult::ok(MOCK, (), format!("File {} deleted", file_id))
        } else {
            CommandResult::fail(MOCK, format!("File {} not found", file_id))
        }
    }

    async fn delete_client(&self, client_id: ClientId) -> CommandResult<()> {
        let mut state = self.state.lock().await;
        if !state.clients.contains_key(&client_id) {
            return CommandResult::fail(MOCK, format!("Client {} not found", client_id));
        }
        let owned = state.files.iter().filter(|f| f.client_id == client_id).count();
        if owned > 0 {
            return CommandResult::fail(
                MOCK,
                format!("Client {} still owns {} file(s); delete them first", client_id, owned),
            );
        }
        state.clients.remove(&client_id);
        CommandResult::ok(MOCK, (), format!("Client {} deleted", client_id))
    }
}
