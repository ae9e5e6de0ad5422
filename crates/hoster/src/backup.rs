//! Point-in-time ZIP backups of an instance workspace.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use hoster_files::workspace::get_relative_path;
use hoster_files::{STAGING_PREFIX, Workspace};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info};
use walkdir::WalkDir;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("A backup is already in progress.")]
    AlreadyInProgress,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Backup {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub file_name: String,
    pub archive_path: PathBuf,
    pub status: BackupStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Serialized per-instance backups with an append-only record list.
///
/// Each backup runs on its own task that owns the in-progress slot and the
/// workspace snapshot lock until the archive is finished, so a caller that
/// stops waiting cannot release either early.
#[derive(Debug)]
pub struct BackupService {
    instance: String,
    workspace: Arc<Workspace>,
    backups_dir: PathBuf,
    running: Arc<Mutex<()>>,
    records: Arc<RwLock<Vec<Backup>>>,
}

impl BackupService {
    pub fn new(
        instance: impl Into<String>,
        workspace: Arc<Workspace>,
        backups_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            instance: instance.into(),
            workspace,
            backups_dir: backups_dir.into(),
            running: Arc::new(Mutex::new(())),
            records: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Archive the workspace. Uploads are held off while the tree is read.
    pub async fn create(&self) -> Result<Backup, BackupError> {
        let running = self
            .running
            .clone()
            .try_lock_owned()
            .map_err(|_| BackupError::AlreadyInProgress)?;

        let created_at = Utc::now();
        let file_name = format!(
            "backup-{}-{}.zip",
            self.instance,
            created_at.format("%Y%m%d-%H%M%S-%3f")
        );
        let archive_path = self.backups_dir.join(&file_name);

        let id = {
            let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
            let id = records.len() as u64 + 1;
            records.push(Backup {
                id,
                created_at,
                file_name,
                archive_path: archive_path.clone(),
                status: BackupStatus::Pending,
                size: None,
                error: None,
            });
            id
        };

        let job = BackupJob {
            id,
            instance: self.instance.clone(),
            workspace: self.workspace.clone(),
            backups_dir: self.backups_dir.clone(),
            archive_path,
            records: self.records.clone(),
        };
        tokio::spawn(async move {
            let _running = running;
            job.run().await
        })
        .await
        .map_err(|e| BackupError::Io(io::Error::other(e.to_string())))?
    }

    /// All backup records, oldest first.
    pub fn list(&self) -> Vec<Backup> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// One backup in flight.
struct BackupJob {
    id: u64,
    instance: String,
    workspace: Arc<Workspace>,
    backups_dir: PathBuf,
    archive_path: PathBuf,
    records: Arc<RwLock<Vec<Backup>>>,
}

impl BackupJob {
    async fn run(self) -> Result<Backup, BackupError> {
        let result = self.write_archive().await;
        let record = self.finish(&result);
        match result {
            Ok(size) => {
                info!(
                    "[{}] Backup {} complete ({} bytes)",
                    self.instance, record.file_name, size
                );
                Ok(record)
            }
            Err(e) => {
                error!("[{}] Backup {} failed: {}", self.instance, record.file_name, e);
                Err(e)
            }
        }
    }

    fn finish(&self, result: &Result<u64, BackupError>) -> Backup {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let index = records
            .iter()
            .position(|r| r.id == self.id)
            .unwrap_or(records.len() - 1);
        let record = &mut records[index];
        match result {
            Ok(size) => {
                record.status = BackupStatus::Complete;
                record.size = Some(*size);
            }
            Err(e) => {
                record.status = BackupStatus::Failed;
                record.error = Some(e.to_string());
            }
        }
        record.clone()
    }

    async fn write_archive(&self) -> Result<u64, BackupError> {
        let root = self.workspace.root().to_path_buf();
        if !tokio::fs::metadata(&root).await.is_ok_and(|m| m.is_dir()) {
            return Err(BackupError::NotFound(format!(
                "workspace {} does not exist",
                root.display()
            )));
        }
        tokio::fs::create_dir_all(&self.backups_dir).await?;

        let snapshot = self.workspace.lock_for_snapshot().await;
        let instance = self.instance.clone();
        let backups_dir = self.backups_dir.clone();
        let archive_path = self.archive_path.clone();

        tokio::task::spawn_blocking(move || {
            // Uploads stay blocked until the archive is complete.
            let _snapshot = snapshot;
            write_archive_blocking(&root, &instance, &backups_dir, &archive_path)
        })
        .await
        .map_err(|e| BackupError::Io(io::Error::other(e.to_string())))?
    }
}

/// Zip `root` into a temp file under `backups_dir` and persist it as
/// `archive_path` once finished. Entries are rooted at `{instance}/`.
fn write_archive_blocking(
    root: &Path,
    instance: &str,
    backups_dir: &Path,
    archive_path: &Path,
) -> Result<u64, BackupError> {
    let temp = tempfile::Builder::new()
        .prefix(".backup-")
        .suffix(".zip.tmp")
        .tempfile_in(backups_dir)?;

    let mut zip = ZipWriter::new(temp);
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    zip.add_directory(format!("{}/", instance), options)?;

    let walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX));

    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        let name = format!("{}/{}", instance, get_relative_path(root, entry.path()));

        if entry.file_type().is_dir() {
            zip.add_directory(format!("{}/", name), options)?;
        } else if entry.file_type().is_file() {
            let size = entry.metadata().map_err(io::Error::from)?.len();
            zip.start_file(name, options.large_file(size >= u64::from(u32::MAX)))?;
            let mut input = std::fs::File::open(entry.path())?;
            io::copy(&mut input, &mut zip)?;
        }
    }

    let mut temp = zip.finish()?;
    temp.flush()?;
    temp.as_file().sync_all()?;
    let size = temp.as_file().metadata()?.len();

    temp.persist(archive_path).map_err(|e| e.error)?;
    Ok(size)
}
