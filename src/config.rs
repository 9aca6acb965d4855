use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Default location for local archives
pub const DEFAULT_BACKUP_DIRECTORY: &str = "/var/lib/server-backup/backups";

/// Backup configuration shared by every adapter
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Directory holding local archives (and staging for remote uploads)
    pub backup_directory: PathBuf,
    /// Gzip compression level, 0-9
    pub compression_level: u32,
    /// Remote storage settings, if the S3 adapter is used
    pub s3: Option<S3Config>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_directory: PathBuf::from(DEFAULT_BACKUP_DIRECTORY),
            compression_level: 6,
            s3: None,
        }
    }
}

impl BackupConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backup_directory(mut self, dir: impl AsRef<Path>) -> Self {
        self.backup_directory = dir.as_ref().to_path_buf();
        self
    }

    pub fn compression_level(mut self, level: u32) -> Self {
        self.compression_level = level;
        self
    }

    pub fn with_s3(mut self, s3: S3Config) -> Self {
        self.s3 = Some(s3);
        self
    }

    /// Apply BACKUP_DIR, BACKUP_COMPRESSION, S3_BUCKET and S3_PREFIX
    /// environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("BACKUP_DIR") {
            config = config.backup_directory(dir);
        }
        if let Ok(level) = std::env::var("BACKUP_COMPRESSION") {
            let level = level
                .parse()
                .map_err(|_| Error::Config(format!("invalid BACKUP_COMPRESSION: {level}")))?;
            config = config.compression_level(level);
        }
        if let Ok(bucket) = std::env::var("S3_BUCKET") {
            let prefix = std::env::var("S3_PREFIX").unwrap_or_default();
            config = config.with_s3(S3Config::new(bucket).with_prefix(prefix));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.compression_level > 9 {
            return Err(Error::Config(format!(
                "compression level must be between 0 and 9, got {}",
                self.compression_level
            )));
        }
        if self.backup_directory.as_os_str().is_empty() {
            return Err(Error::Config("backup directory must not be empty".into()));
        }
        Ok(())
    }

    /// Local archive location for a backup identity
    pub fn archive_path(&self, uuid: &str) -> PathBuf {
        self.backup_directory.join(format!("{uuid}.tar.gz"))
    }
}

/// S3 storage configuration
#[derive(Debug, Clone)]
pub struct S3Config {
    /// S3 bucket name (required)
    pub bucket: String,
    /// Key prefix for all objects (optional, for multi-tenant setups)
    pub prefix: String,
}

impl S3Config {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: String::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Object key for a backup identity
    pub fn object_key(&self, uuid: &str) -> String {
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("{uuid}.tar.gz")
        } else {
            format!("{prefix}/{uuid}.tar.gz")
        }
    }
}
