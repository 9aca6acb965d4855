use super::{
    current_timestamp, AdapterType, ArchiveDetails, Backup, BackupAdapter, FileInfo, LogContext,
    RestoreCallback, RestoreSource, CHECKSUM_TYPE,
};
use crate::archive::walk;
use crate::config::{BackupConfig, S3Config};
use crate::error::{Error, Result};
use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::operation::head_object::HeadObjectOutput;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// User metadata key holding the archive checksum
const CHECKSUM_METADATA: &str = "sha256";

/// Content type some S3-compatible stores use for folder placeholders
const DIRECTORY_CONTENT_TYPE: &str = "application/x-directory";

/// Backup stored as a single object in an S3 bucket.
///
/// Archives are built in the local backup directory and uploaded in one
/// `PutObject`, so readers only ever see a complete object.
pub struct S3Backup {
    backup: Backup,
    client: Client,
    s3: S3Config,
}

impl S3Backup {
    /// Bind an identity and ignore spec. Touches no storage.
    ///
    /// Fails if `config` has no S3 settings.
    pub fn new(
        client: Client,
        config: Arc<BackupConfig>,
        uuid: impl Into<String>,
        ignore: impl Into<String>,
    ) -> Result<Self> {
        let s3 = config
            .s3
            .clone()
            .ok_or_else(|| Error::Config("the S3 adapter requires a bucket".into()))?;
        Ok(Self {
            backup: Backup::new(config, uuid, ignore, AdapterType::S3),
            client,
            s3,
        })
    }

    /// Create a client from the AWS config loaded from the environment
    pub async fn client_from_env() -> Client {
        let aws_config = aws_config::load_from_env().await;
        Client::new(&aws_config)
    }

    /// Create a client for an S3-compatible endpoint (path-style addressing)
    pub async fn client_with_endpoint(endpoint: &str, region: &str) -> Client {
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;
        let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
            .endpoint_url(endpoint)
            .force_path_style(true)
            .build();
        Client::from_conf(s3_config)
    }

    /// Find an existing object for `uuid`.
    pub async fn locate(
        client: Client,
        config: Arc<BackupConfig>,
        uuid: impl Into<String>,
    ) -> Result<(Self, FileInfo)> {
        let b = Self::new(client, config, uuid, "")?;
        let key = b.key();

        debug!(bucket = %b.s3.bucket, key = %key, "Locating backup");

        let head = match b.head().await {
            Ok(head) => head,
            Err(err) if err.is_not_found() => {
                if b.is_prefix().await? {
                    return Err(Error::InvalidArchive(key));
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        if head.content_type.as_deref() == Some(DIRECTORY_CONTENT_TYPE) {
            return Err(Error::InvalidArchive(key));
        }

        let size = head.content_length.unwrap_or(0) as u64;
        let mtime = head
            .last_modified
            .as_ref()
            .map(|dt| dt.secs() as u32)
            .unwrap_or_else(current_timestamp);
        Ok((b, FileInfo::file_with_mtime(size, mtime)))
    }

    /// Abort archive walks when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.backup.set_cancellation(token);
        self
    }

    pub fn backup(&self) -> &Backup {
        &self.backup
    }

    /// Object key for this backup
    pub fn key(&self) -> String {
        self.s3.object_key(self.backup.identifier())
    }

    async fn head(&self) -> Result<HeadObjectOutput> {
        self.client
            .head_object()
            .bucket(&self.s3.bucket)
            .key(self.key())
            .send()
            .await
            .map_err(|err| {
                if err.as_service_error().is_some_and(|e| e.is_not_found()) {
                    Error::NotFound(self.backup.identifier().to_string())
                } else {
                    storage_error(err)
                }
            })
    }

    /// Whether objects exist underneath the key, i.e. it is a "directory"
    async fn is_prefix(&self) -> Result<bool> {
        let result = self
            .client
            .list_objects_v2()
            .bucket(&self.s3.bucket)
            .prefix(format!("{}/", self.key()))
            .max_keys(1)
            .send()
            .await
            .map_err(storage_error)?;

        Ok(result.contents.map(|c| !c.is_empty()).unwrap_or(false))
    }

    async fn upload(&self, path: &Path, checksum: &str) -> Result<()> {
        let key = self.key();
        debug!(bucket = %self.s3.bucket, key = %key, "Uploading archive");

        let body = ByteStream::from_path(path).await.map_err(storage_error)?;
        self.client
            .put_object()
            .bucket(&self.s3.bucket)
            .key(&key)
            .content_type("application/gzip")
            .metadata(CHECKSUM_METADATA, checksum)
            .body(body)
            .send()
            .await
            .map_err(storage_error)?;

        Ok(())
    }

    /// Empty staging file in the backup directory, removed on drop
    async fn staging_file(&self) -> Result<TempPath> {
        let dir = self.backup.config().backup_directory.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dir)
                .and_then(|_| {
                    tempfile::Builder::new()
                        .prefix(".s3-")
                        .suffix(".tar.gz")
                        .tempfile_in(&dir)
                })
                .map(|file| file.into_temp_path())
                .map_err(|source| Error::ArchiveWrite { path: dir, source })
        })
        .await?
    }

    /// Stream the object into a staging file
    async fn download(&self) -> Result<TempPath> {
        let key = self.key();
        debug!(bucket = %self.s3.bucket, key = %key, "Downloading archive");

        let result = self
            .client
            .get_object()
            .bucket(&self.s3.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|err| {
                if err.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                    Error::NotFound(self.backup.identifier().to_string())
                } else {
                    storage_error(err)
                }
            })?;

        let staging = self.staging_file().await?;
        let write_error = |source| Error::ArchiveWrite {
            path: staging.to_path_buf(),
            source,
        };
        let mut file = fs::File::create(&staging).await.map_err(write_error)?;
        let mut body = result.body.into_async_read();
        tokio::io::copy(&mut body, &mut file)
            .await
            .map_err(|e| Error::Storage(format!("downloading {key}: {e}")))?;
        file.flush().await.map_err(write_error)?;

        Ok(staging)
    }
}

#[async_trait]
impl BackupAdapter for S3Backup {
    fn adapter_type(&self) -> AdapterType {
        AdapterType::S3
    }

    fn identifier(&self) -> &str {
        self.backup.identifier()
    }

    /// The object key. Nothing for this backup persists on local disk.
    fn path(&self) -> PathBuf {
        PathBuf::from(self.key())
    }

    fn with_log_context(&self, context: LogContext) {
        self.backup.with_log_context(context);
    }

    async fn generate(&self, base_path: &Path, ignore: Option<&str>) -> Result<ArchiveDetails> {
        let span = self.backup.span();
        async {
            info!(base = %base_path.display(), "Creating backup for server");
            let staging = self.staging_file().await?;
            self.backup
                .archive_to(base_path, ignore, staging.to_path_buf())
                .await?;

            let details = self.backup.details_at(&staging).await;
            let uploaded = self.upload(&staging, &details.checksum).await;

            if let Err(err) = staging.close() {
                warn!(error = %err, "Failed to remove staged archive");
            }
            uploaded?;

            info!(key = %self.key(), "Uploaded backup successfully");
            Ok::<_, Error>(details)
        }
        .instrument(span)
        .await
    }

    async fn restore(
        &self,
        source: Option<RestoreSource>,
        callback: RestoreCallback,
    ) -> Result<()> {
        let span = self.backup.span();
        let cancel = self.backup.cancellation().clone();

        let (reader, staging): (RestoreSource, Option<TempPath>) = match source {
            Some(source) => (source, None),
            None => {
                let staging = self.download().instrument(span.clone()).await?;
                let file = fs::File::open(&staging)
                    .await
                    .map_err(|source| Error::Filesystem {
                        path: staging.to_path_buf(),
                        source,
                    })?
                    .into_std()
                    .await;
                (Box::new(BufReader::new(file)), Some(staging))
            }
        };

        tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let walked = walk(reader, Some(&cancel), callback);
            drop(staging);
            walked
        })
        .await?
    }

    async fn remove(&self) -> Result<()> {
        let key = self.key();
        debug!(bucket = %self.s3.bucket, key = %key, "Removing backup");

        // DeleteObject succeeds for missing keys, so check first
        self.head().await?;
        self.client
            .delete_object()
            .bucket(&self.s3.bucket)
            .key(&key)
            .send()
            .await
            .map_err(storage_error)?;

        Ok(())
    }

    async fn details(&self) -> ArchiveDetails {
        match self.head().instrument(self.backup.span()).await {
            Ok(head) => {
                let checksum = head
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get(CHECKSUM_METADATA))
                    .cloned()
                    .unwrap_or_default();
                ArchiveDetails {
                    is_successful: !checksum.is_empty(),
                    checksum,
                    checksum_type: CHECKSUM_TYPE.to_string(),
                    size: head.content_length.unwrap_or(0) as u64,
                }
            }
            Err(err) => {
                error!(key = %self.key(), error = %err, "Failed to read backup details");
                ArchiveDetails {
                    checksum: String::new(),
                    checksum_type: CHECKSUM_TYPE.to_string(),
                    size: 0,
                    is_successful: false,
                }
            }
        }
    }
}

fn storage_error<E: std::error::Error>(err: E) -> Error {
    Error::Storage(DisplayErrorContext(err).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::backup::restore_callback;
    use aws_sdk_s3::config::retry::RetryConfig;
    use aws_sdk_s3::config::{BehaviorVersion, Region};
    use parking_lot::Mutex;
    use std::io::Read;
    use tempfile::TempDir;

    fn offline_client() -> Client {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url("http://127.0.0.1:1")
            .retry_config(RetryConfig::disabled())
            .build();
        Client::from_conf(config)
    }

    fn s3_backup(backups: &Path, uuid: &str) -> S3Backup {
        let config = Arc::new(
            BackupConfig::new()
                .backup_directory(backups)
                .with_s3(S3Config::new("bucket")),
        );
        S3Backup::new(offline_client(), config, uuid, "").unwrap()
    }

    #[tokio::test]
    async fn test_staging_file_lives_in_backup_directory() {
        let backups = TempDir::new().unwrap();
        let backup = s3_backup(&backups.path().join("nested"), "abc");

        let staging = backup.staging_file().await.unwrap();
        assert!(staging.starts_with(backups.path().join("nested")));
        assert!(staging.exists());

        let path = staging.to_path_buf();
        drop(staging);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_local_archive_alone() {
        let source = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        std::fs::write(source.path().join("server.properties"), "motd=hi").unwrap();
        // A local backup with the same identity
        std::fs::write(backups.path().join("abc.tar.gz"), "local archive").unwrap();

        let backup = s3_backup(backups.path(), "abc");
        let err = backup.generate(source.path(), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);

        let files: Vec<_> = std::fs::read_dir(backups.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(files, vec![std::ffi::OsString::from("abc.tar.gz")]);
        assert_eq!(
            std::fs::read_to_string(backups.path().join("abc.tar.gz")).unwrap(),
            "local archive"
        );
    }

    #[tokio::test]
    async fn test_restore_from_inbound_stream() {
        let source = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        std::fs::write(source.path().join("eula.txt"), "eula=true").unwrap();

        let archive = backups.path().join("inbound.tar.gz");
        crate::archive::Archive::new(source.path())
            .create(&archive)
            .unwrap();
        let data = std::fs::read(&archive).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        s3_backup(backups.path(), "abc")
            .restore(
                Some(Box::new(std::io::Cursor::new(data))),
                restore_callback(move |name, mut file| {
                    let mut content = String::new();
                    file.read_to_string(&mut content).map_err(Error::callback)?;
                    sink.lock().push((name.to_string(), content));
                    Ok(())
                }),
            )
            .await
            .unwrap();

        assert_eq!(
            *seen.lock(),
            vec![("eula.txt".to_string(), "eula=true".to_string())]
        );
    }

    #[test]
    fn test_requires_bucket() {
        let config = Arc::new(BackupConfig::new());
        let err = S3Backup::new(offline_client(), config, "abc", "")
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_path_is_object_key() {
        let config = Arc::new(
            BackupConfig::new()
                .backup_directory("/tmp/staging")
                .with_s3(S3Config::new("bucket").with_prefix("nodes/one/")),
        );
        let backup = S3Backup::new(offline_client(), config, "abc", "*.log").unwrap();

        assert_eq!(backup.key(), "nodes/one/abc.tar.gz");
        assert_eq!(backup.path(), PathBuf::from("nodes/one/abc.tar.gz"));
        assert_eq!(backup.adapter_type(), AdapterType::S3);
        assert_eq!(backup.backup().ignored(), "*.log");
    }
}
