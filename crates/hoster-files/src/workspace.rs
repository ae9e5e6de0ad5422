use std::path::{Component, Path, PathBuf};
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::STAGING_PREFIX;
use crate::error::WorkspaceError;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Immediate children of one workspace directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryListing {
    pub files: Vec<String>,
    pub directories: Vec<String>,
    /// Canonical path of the listed directory relative to the root, `/`-separated.
    pub current_path: String,
}

/// Result of a committed upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedFile {
    /// Sanitized file name as stored on disk.
    pub filename: String,
    /// Path relative to the workspace root.
    pub path: String,
    pub size: u64,
}

/// An open file ready to be streamed to a client.
#[derive(Debug)]
pub struct Download {
    pub file: fs::File,
    pub size: u64,
    pub file_name: String,
}

/// Upload content written to a hidden staging file inside the workspace root.
///
/// The staging file is removed on drop unless the upload was committed.
#[derive(Debug)]
pub struct StagedUpload {
    temp_path: Option<PathBuf>,
    file_name: String,
    size: u64,
}

impl StagedUpload {
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for StagedUpload {
    fn drop(&mut self) {
        if let Some(path) = self.temp_path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to discard staged upload {:?}: {}", path, e);
                }
            }
        }
    }
}

/// A sandboxed directory tree owned by one server instance.
///
/// All paths handed to this type are relative to the root. Anything that
/// would resolve outside the root, whether through `..`, an absolute path or
/// a symbolic link, is rejected with [`WorkspaceError::PathEscapesRoot`].
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    max_upload_size: u64,
    /// Upload commits take the read side, backups the write side.
    write_lock: Arc<RwLock<()>>,
}

impl Workspace {
    /// Open (and create if missing) a workspace rooted at `root`.
    pub fn open(root: impl AsRef<Path>, max_upload_size: u64) -> Result<Self, WorkspaceError> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        debug!("Workspace opened at {}", root.display());
        Ok(Self {
            root,
            max_upload_size,
            write_lock: Arc::new(RwLock::new(())),
        })
    }

    /// Canonical absolute path of the workspace root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_upload_size(&self) -> u64 {
        self.max_upload_size
    }

    /// List the immediate children of `relative`.
    ///
    /// Entries that cannot be inspected, staging files and symbolic links
    /// pointing outside the root are left out of the listing.
    pub async fn list(&self, relative: &str) -> Result<DirectoryListing, WorkspaceError> {
        let dir = resolve_and_verify_path(&self.root, relative)?;

        let metadata = match fs::metadata(&dir).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WorkspaceError::NotFound(relative.to_string()));
            }
            Err(e) => return Err(WorkspaceError::Io(e)),
        };
        if !metadata.is_dir() {
            return Err(WorkspaceError::NotADirectory(relative.to_string()));
        }

        let mut files = Vec::new();
        let mut directories = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(STAGING_PREFIX) {
                continue;
            }

            let entry_path = entry.path();
            let file_type = match entry.file_type().await {
                Ok(file_type) => file_type,
                Err(e) => {
                    warn!("Skipping unreadable entry {:?}: {}", entry_path, e);
                    continue;
                }
            };

            let is_dir = if file_type.is_symlink() {
                match entry_path.canonicalize() {
                    Ok(target) if target.starts_with(&self.root) => target.is_dir(),
                    Ok(target) => {
                        debug!("Hiding symlink {:?} -> {:?} outside root", entry_path, target);
                        continue;
                    }
                    Err(_) => {
                        debug!("Hiding dangling symlink {:?}", entry_path);
                        continue;
                    }
                }
            } else {
                file_type.is_dir()
            };

            if is_dir {
                directories.push(name);
            } else {
                files.push(name);
            }
        }

        files.sort();
        directories.sort();

        Ok(DirectoryListing {
            files,
            directories,
            current_path: get_relative_path(&self.root, &dir),
        })
    }

    /// Validate `subdir`, stage `reader` and commit it as `subdir/file_name`.
    pub async fn upload<R>(
        &self,
        subdir: &str,
        file_name: &str,
        reader: R,
    ) -> Result<UploadedFile, WorkspaceError>
    where
        R: AsyncRead + Send,
    {
        // Reject escaping destinations before any data touches the disk.
        resolve_path(&self.root, subdir)?;
        let staged = self.stage(file_name, reader).await?;
        self.commit(staged, subdir).await
    }

    /// Stream `reader` into a hidden staging file in the workspace root.
    ///
    /// Fails with [`WorkspaceError::FileTooLarge`] once more than
    /// `max_upload_size` bytes have been read; the partial data is discarded.
    pub async fn stage<R>(&self, file_name: &str, reader: R) -> Result<StagedUpload, WorkspaceError>
    where
        R: AsyncRead + Send,
    {
        let file_name = sanitize_filename(file_name).ok_or_else(|| {
            warn!("Rejected invalid filename: {:?}", file_name);
            WorkspaceError::InvalidFileName(file_name.to_string())
        })?;

        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let counter = STAGING_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_path = self
            .root
            .join(format!("{}{}-{}", STAGING_PREFIX, nonce, counter));

        let mut file = fs::File::create(&temp_path).await?;
        let mut staged = StagedUpload {
            temp_path: Some(temp_path),
            file_name,
            size: 0,
        };

        let mut reader = pin!(reader);
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let read = reader.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            staged.size = staged.size.saturating_add(read as u64);
            if staged.size > self.max_upload_size {
                return Err(WorkspaceError::FileTooLarge {
                    size: staged.size,
                    limit: self.max_upload_size,
                });
            }
            file.write_all(&buffer[..read]).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok(staged)
    }

    /// Atomically move a staged upload into `subdir`, creating it if needed.
    pub async fn commit(
        &self,
        mut staged: StagedUpload,
        subdir: &str,
    ) -> Result<UploadedFile, WorkspaceError> {
        let dir = self.ensure_directory(subdir).await?;
        let final_path = dir.join(&staged.file_name);

        let _guard = self.write_lock.read().await;

        if let Ok(metadata) = fs::symlink_metadata(&final_path).await {
            if metadata.file_type().is_symlink() {
                warn!("Refusing to overwrite symlink: {:?}", final_path);
                return Err(WorkspaceError::PathEscapesRoot);
            }
            if metadata.is_dir() {
                return Err(WorkspaceError::IsADirectory(get_relative_path(
                    &self.root,
                    &final_path,
                )));
            }
        }

        let Some(temp_path) = staged.temp_path.as_deref() else {
            return Err(WorkspaceError::NotFound(staged.file_name.clone()));
        };
        fs::rename(temp_path, &final_path).await?;
        staged.temp_path = None;

        let path = get_relative_path(&self.root, &final_path);
        info!("Stored upload {} ({} bytes)", path, staged.size);

        Ok(UploadedFile {
            filename: staged.file_name.clone(),
            path,
            size: staged.size,
        })
    }

    /// Open a regular file for streaming.
    pub async fn download(&self, relative: &str) -> Result<Download, WorkspaceError> {
        if relative.trim().is_empty() {
            return Err(WorkspaceError::NotFound(relative.to_string()));
        }

        let path = resolve_and_verify_path(&self.root, relative)?;
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WorkspaceError::NotFound(relative.to_string()));
            }
            Err(e) => return Err(WorkspaceError::Io(e)),
        };
        if !metadata.is_file() {
            return Err(WorkspaceError::NotFound(relative.to_string()));
        }

        let file = fs::File::open(&path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "download".to_string());

        debug!("Downloading file: {}", path.display());

        Ok(Download {
            file,
            size: metadata.len(),
            file_name,
        })
    }

    /// Block upload commits until the returned guard is dropped.
    ///
    /// The guard is owned so it can move into the blocking task that reads
    /// the tree.
    pub async fn lock_for_snapshot(&self) -> OwnedRwLockWriteGuard<()> {
        self.write_lock.clone().write_owned().await
    }

    /// Resolve `relative` as a directory inside the root, creating missing
    /// components. The deepest existing ancestor must itself resolve inside
    /// the root, so a symlinked parent can never redirect the creation.
    async fn ensure_directory(&self, relative: &str) -> Result<PathBuf, WorkspaceError> {
        let target = resolve_path(&self.root, relative)?;

        let mut existing = target.as_path();
        while fs::symlink_metadata(existing).await.is_err() {
            existing = existing.parent().ok_or(WorkspaceError::PathEscapesRoot)?;
        }

        let canonical = existing.canonicalize()?;
        if !canonical.starts_with(&self.root) {
            warn!(
                "Upload directory escape: {:?} resolved to {:?}",
                existing, canonical
            );
            return Err(WorkspaceError::PathEscapesRoot);
        }
        if !canonical.is_dir() {
            return Err(WorkspaceError::NotADirectory(relative.to_string()));
        }

        let remainder = target.strip_prefix(existing).unwrap_or(Path::new(""));
        let dir = canonical.join(remainder);
        if dir != canonical {
            fs::create_dir_all(&dir).await?;
        }

        let dir = dir.canonicalize()?;
        if !dir.starts_with(&self.root) {
            error!("Created directory resolved outside root: {:?}", dir);
            return Err(WorkspaceError::PathEscapesRoot);
        }
        Ok(dir)
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Make a client-supplied file name safe to store.
///
/// Path separators and characters that are invalid on common filesystems
/// become `_`, control characters are dropped, and leading or trailing dots
/// and spaces are trimmed so uploads cannot become hidden files. Reserved
/// device names and names that collide with upload staging files are
/// refused. The result is capped at 255 bytes on a character boundary.
///
/// Returns `None` when nothing usable remains.
pub fn sanitize_filename(filename: &str) -> Option<String> {
    if filename.is_empty() {
        return None;
    }

    let sanitized: String = filename
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect();

    // Leading/trailing dots and spaces (Windows compatibility + hidden files)
    let sanitized = sanitized.trim_matches(|c| c == '.' || c == ' ');
    if sanitized.is_empty() || sanitized.starts_with(STAGING_PREFIX.trim_start_matches('.')) {
        return None;
    }

    let upper = sanitized.to_uppercase();
    let reserved = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
        "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    if reserved
        .iter()
        .any(|r| upper == *r || upper.starts_with(&format!("{}.", r)))
    {
        return None;
    }

    let mut end = sanitized.len().min(255);
    while !sanitized.is_char_boundary(end) {
        end -= 1;
    }

    Some(sanitized[..end].to_string())
}

/// Build `root/relative` component by component without touching the
/// filesystem.
///
/// This is the lexical half of the sandbox check. Parent references,
/// absolute paths (including a leading `/` or `\`, which `Path::join` would
/// otherwise treat as a new root) and NUL bytes are rejected with
/// [`WorkspaceError::PathEscapesRoot`]. `.` components are ignored, so an
/// empty or `.` path resolves to the root. Symlinks are not inspected here;
/// see [`resolve_and_verify_path`].
fn resolve_path(root: &Path, relative: &str) -> Result<PathBuf, WorkspaceError> {
    if relative.starts_with('/') || relative.starts_with('\\') {
        warn!("Absolute path rejected: {:?}", relative);
        return Err(WorkspaceError::PathEscapesRoot);
    }

    let mut result = root.to_path_buf();

    for component in Path::new(relative).components() {
        match component {
            Component::Normal(name) => {
                if name.to_string_lossy().contains('\0') {
                    warn!("Path component contains null byte: {:?}", name);
                    return Err(WorkspaceError::PathEscapesRoot);
                }
                result.push(name);
            }
            Component::ParentDir => {
                warn!("Path traversal attempt detected: parent directory (..) in path");
                return Err(WorkspaceError::PathEscapesRoot);
            }
            Component::CurDir => continue,
            Component::RootDir | Component::Prefix(_) => {
                warn!("Absolute path component in relative path");
                return Err(WorkspaceError::PathEscapesRoot);
            }
        }
    }

    if !result.starts_with(root) {
        error!("Path resolution resulted in path outside root: {:?}", result);
        return Err(WorkspaceError::PathEscapesRoot);
    }

    Ok(result)
}

/// Resolve `relative` and check it against symlink escapes.
///
/// The deepest ancestor that exists on disk is canonicalized and must stay
/// inside `root`, so an escaping symlinked ancestor yields `PathEscapesRoot`
/// whether or not the rest of the path exists behind it. Dangling symlinks
/// along the way are rejected as well.
///
/// Returns the canonical path when the target exists, otherwise the
/// lexically built path.
fn resolve_and_verify_path(root: &Path, relative: &str) -> Result<PathBuf, WorkspaceError> {
    let built_path = resolve_path(root, relative)?;

    let mut existing = built_path.as_path();
    while existing != root && !existing.exists() {
        if existing.symlink_metadata().is_ok() {
            warn!("Dangling symlink in path: {:?}", existing);
            return Err(WorkspaceError::PathEscapesRoot);
        }
        match existing.parent() {
            Some(parent) => existing = parent,
            None => break,
        }
    }

    let canonical = existing.canonicalize()?;
    if !canonical.starts_with(root) {
        warn!(
            "Symlink escape attempt: {:?} resolved to {:?} which is outside {:?}",
            built_path, canonical, root
        );
        return Err(WorkspaceError::PathEscapesRoot);
    }

    if existing == built_path {
        Ok(canonical)
    } else {
        Ok(built_path)
    }
}

/// Workspace-relative form of `full_path`, joined with `/` whatever the
/// platform separator, as used in API responses and archive entry names.
/// Paths outside `root` map to the empty string (the root itself).
pub fn get_relative_path(root: &Path, full_path: &Path) -> String {
    full_path
        .strip_prefix(root)
        .map(|relative| {
            relative
                .components()
                .filter_map(|component| match component {
                    Component::Normal(part) => Some(part.to_string_lossy()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default()
}
