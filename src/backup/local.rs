use super::{
    AdapterType, ArchiveDetails, Backup, BackupAdapter, FileInfo, LogContext, RestoreCallback,
    RestoreSource,
};
use crate::archive::walk;
use crate::config::BackupConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

/// Backup stored as a single archive on the local filesystem
pub struct LocalBackup {
    backup: Backup,
}

impl LocalBackup {
    /// Bind an identity and ignore spec. Touches no storage.
    pub fn new(
        config: Arc<BackupConfig>,
        uuid: impl Into<String>,
        ignore: impl Into<String>,
    ) -> Self {
        Self {
            backup: Backup::new(config, uuid, ignore, AdapterType::Local),
        }
    }

    /// Find an existing archive for `uuid`.
    pub async fn locate(
        config: Arc<BackupConfig>,
        uuid: impl Into<String>,
    ) -> Result<(Self, FileInfo)> {
        let b = Self::new(config, uuid, "");
        let path = b.path();

        debug!(path = %path.display(), "Locating backup");

        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| b.backup.map_io_error(&path, e))?;
        if metadata.is_dir() {
            return Err(Error::InvalidArchive(path.display().to_string()));
        }

        Ok((b, FileInfo::from_metadata(&metadata)))
    }

    /// Abort archive walks when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.backup.set_cancellation(token);
        self
    }

    pub fn backup(&self) -> &Backup {
        &self.backup
    }
}

#[async_trait]
impl BackupAdapter for LocalBackup {
    fn adapter_type(&self) -> AdapterType {
        AdapterType::Local
    }

    fn identifier(&self) -> &str {
        self.backup.identifier()
    }

    fn path(&self) -> PathBuf {
        self.backup.path()
    }

    fn with_log_context(&self, context: LogContext) {
        self.backup.with_log_context(context);
    }

    async fn generate(&self, base_path: &Path, ignore: Option<&str>) -> Result<ArchiveDetails> {
        let span = self.backup.span();
        async {
            info!(base = %base_path.display(), "Creating backup for server");
            self.backup.archive(base_path, ignore).await?;
            info!("Created backup successfully");

            Ok::<_, Error>(self.backup.details().await)
        }
        .instrument(span)
        .await
    }

    async fn restore(
        &self,
        _source: Option<RestoreSource>,
        callback: RestoreCallback,
    ) -> Result<()> {
        let path = self.path();
        let span = self.backup.span();
        let cancel = self.backup.cancellation().clone();

        let file = fs::File::open(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::NotFound(self.identifier().to_string()),
                _ => Error::CorruptArchive(format!("{}: {}", path.display(), e)),
            })?
            .into_std()
            .await;

        tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            debug!(path = %path.display(), "Restoring from local archive");
            walk(BufReader::new(file), Some(&cancel), callback)
        })
        .await?
    }

    async fn remove(&self) -> Result<()> {
        let path = self.path();
        debug!(path = %path.display(), "Removing backup");

        fs::remove_file(&path)
            .await
            .map_err(|e| self.backup.map_io_error(&path, e))
    }

    async fn details(&self) -> ArchiveDetails {
        self.backup.details().instrument(self.backup.span()).await
    }
}
