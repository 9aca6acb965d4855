use crate::archive::{Archive, IgnoreMatcher, RestoreFile};
use crate::config::BackupConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{error, info_span, Span};

pub mod local;
#[cfg(feature = "s3")]
pub mod s3;

pub use local::LocalBackup;
#[cfg(feature = "s3")]
pub use s3::S3Backup;

/// Extra fields attached to every log line emitted for a backup
pub type LogContext = BTreeMap<String, serde_json::Value>;

/// Called for every file while restoring an archive.
///
/// Returning an error stops the restore and that error is handed back to
/// the caller unchanged.
pub type RestoreCallback = Box<dyn FnMut(&str, RestoreFile<'_>) -> Result<()> + Send>;

/// Box a closure as a [`RestoreCallback`]
pub fn restore_callback<F>(callback: F) -> RestoreCallback
where
    F: FnMut(&str, RestoreFile<'_>) -> Result<()> + Send + 'static,
{
    Box::new(callback)
}

/// Inbound archive bytes for adapters that receive content as a stream
pub type RestoreSource = Box<dyn Read + Send>;

/// Checksum algorithm used for archive details
pub const CHECKSUM_TYPE: &str = "sha256";

/// Storage adapter a backup is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterType {
    Local,
    S3,
}

impl fmt::Display for AdapterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterType::Local => f.write_str("local"),
            AdapterType::S3 => f.write_str("s3"),
        }
    }
}

/// Summary of a stored archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveDetails {
    pub checksum: String,
    pub checksum_type: String,
    pub size: u64,
    pub is_successful: bool,
}

impl ArchiveDetails {
    /// Payload reported back to the panel once a backup finishes
    pub fn to_request(&self, successful: bool) -> BackupRequest {
        BackupRequest {
            checksum: self.checksum.clone(),
            checksum_type: self.checksum_type.clone(),
            size: self.size,
            successful: successful && self.is_successful,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRequest {
    pub checksum: String,
    pub checksum_type: String,
    pub size: u64,
    pub successful: bool,
}

/// File metadata information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    pub is_dir: bool,
    pub permissions: u32,
    pub mtime: u32,
    pub atime: u32,
    pub uid: u32,
    pub gid: u32,
}

impl FileInfo {
    /// Create FileInfo for a regular file with specific mtime
    pub fn file_with_mtime(size: u64, mtime: u32) -> Self {
        Self {
            size,
            is_dir: false,
            permissions: 0o644,
            mtime,
            atime: mtime,
            uid: 0,
            gid: 0,
        }
    }

    /// Convert filesystem metadata to FileInfo
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        let atime = metadata
            .accessed()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as u32)
            .unwrap_or(mtime);

        #[cfg(unix)]
        let (permissions, uid, gid) = {
            use std::os::unix::fs::MetadataExt;
            (metadata.mode(), metadata.uid(), metadata.gid())
        };

        #[cfg(not(unix))]
        let (permissions, uid, gid) = {
            if metadata.is_dir() {
                (0o755, 0, 0)
            } else {
                (0o644, 0, 0)
            }
        };

        FileInfo {
            size: metadata.len(),
            is_dir: metadata.is_dir(),
            permissions,
            mtime,
            atime,
            uid,
            gid,
        }
    }
}

/// Capabilities every storage adapter provides.
///
/// Callers hold a `dyn BackupAdapter` and never branch on the concrete
/// backend. Operations on the same identity must be serialized by the
/// caller; nothing here locks across a whole operation.
#[async_trait]
pub trait BackupAdapter: Send + Sync {
    fn adapter_type(&self) -> AdapterType;

    fn identifier(&self) -> &str;

    /// Local archive location. Remote adapters stage uploads here.
    fn path(&self) -> PathBuf;

    /// Merge extra fields into the log context of this backup
    fn with_log_context(&self, context: LogContext);

    /// Archive `base_path` and publish it under this backup's identity,
    /// replacing anything stored before.
    ///
    /// `ignore` overrides the ignore spec the backup was created with.
    async fn generate(&self, base_path: &Path, ignore: Option<&str>) -> Result<ArchiveDetails>;

    /// Walk the stored archive, calling `callback` for every file.
    async fn restore(&self, source: Option<RestoreSource>, callback: RestoreCallback)
        -> Result<()>;

    /// Delete the stored archive. Fails with [`Error::NotFound`] if there is none.
    async fn remove(&self) -> Result<()>;

    /// Re-derive size and checksum from what is stored
    async fn details(&self) -> ArchiveDetails;
}

/// Identity and state shared by all adapters
pub struct Backup {
    uuid: String,
    ignore: String,
    adapter: AdapterType,
    log_context: RwLock<LogContext>,
    config: Arc<BackupConfig>,
    cancel: CancellationToken,
}

impl Backup {
    pub fn new(
        config: Arc<BackupConfig>,
        uuid: impl Into<String>,
        ignore: impl Into<String>,
        adapter: AdapterType,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            ignore: ignore.into(),
            adapter,
            log_context: RwLock::new(LogContext::new()),
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.uuid
    }

    pub fn ignored(&self) -> &str {
        &self.ignore
    }

    pub fn adapter_type(&self) -> AdapterType {
        self.adapter
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn path(&self) -> PathBuf {
        self.config.archive_path(&self.uuid)
    }

    pub fn with_log_context(&self, context: LogContext) {
        self.log_context.write().extend(context);
    }

    pub fn log_context(&self) -> LogContext {
        self.log_context.read().clone()
    }

    pub(crate) fn set_cancellation(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Span carrying the identity and log context of this backup
    pub fn span(&self) -> Span {
        let context = serde_json::to_string(&*self.log_context.read()).unwrap_or_default();
        info_span!(
            "backup",
            backup = %self.uuid,
            adapter = %self.adapter,
            context = %context
        )
    }

    /// Archive `base_path` to [`Backup::path`] on the blocking pool.
    pub async fn archive(&self, base_path: &Path, ignore: Option<&str>) -> Result<()> {
        self.archive_to(base_path, ignore, self.path()).await
    }

    /// Archive `base_path` to `destination` on the blocking pool.
    pub async fn archive_to(
        &self,
        base_path: &Path,
        ignore: Option<&str>,
        destination: PathBuf,
    ) -> Result<()> {
        let matcher = IgnoreMatcher::parse(ignore.unwrap_or(&self.ignore))?;
        let archive = Archive::new(base_path)
            .ignore(matcher)
            .compression(self.config.compression_level)
            .cancel(self.cancel.clone());

        tokio::task::spawn_blocking(move || archive.create(&destination)).await?
    }

    /// Size in bytes of the local archive
    pub async fn size(&self) -> Result<u64> {
        self.size_at(&self.path()).await
    }

    async fn size_at(&self, path: &Path) -> Result<u64> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| self.map_io_error(path, e))?;
        Ok(metadata.len())
    }

    /// Hex encoded sha256 of the local archive
    pub async fn checksum(&self) -> Result<String> {
        self.checksum_at(&self.path()).await
    }

    async fn checksum_at(&self, path: &Path) -> Result<String> {
        let digest = {
            let path = path.to_path_buf();
            tokio::task::spawn_blocking(move || sha256_file(&path)).await?
        };
        digest.map_err(|e| self.map_io_error(path, e))
    }

    /// Details of the local archive. Failures are logged and reported
    /// through `is_successful`.
    pub async fn details(&self) -> ArchiveDetails {
        self.details_at(&self.path()).await
    }

    /// Details of an archive written somewhere other than [`Backup::path`]
    pub async fn details_at(&self, path: &Path) -> ArchiveDetails {
        let (checksum, size) = tokio::join!(self.checksum_at(path), self.size_at(path));

        let checksum = checksum.unwrap_or_else(|err| {
            error!(error = %err, "Failed to calculate checksum for backup");
            String::new()
        });
        let size = size.map_err(|err| {
            error!(error = %err, "Failed to determine size of backup");
        });

        ArchiveDetails {
            is_successful: !checksum.is_empty() && size.is_ok(),
            checksum,
            checksum_type: CHECKSUM_TYPE.to_string(),
            size: size.unwrap_or(0),
        }
    }

    pub(crate) fn map_io_error(&self, path: &Path, err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound(self.uuid.clone()),
            _ => Error::Filesystem {
                path: path.to_path_buf(),
                source: err,
            },
        }
    }
}

/// Hex encoded sha256 of a file
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Get current Unix timestamp
pub fn current_timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
