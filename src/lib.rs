//! # server-backup
//!
//! Point-in-time archives of a managed server's files, stored locally or in
//! S3, plus the error kinds the panel API client and SFTP server branch on.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use server_backup::{BackupAdapter, BackupConfig, LocalBackup};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), server_backup::Error> {
//!     let config = Arc::new(BackupConfig::new().backup_directory("/srv/backups"));
//!     let backup = LocalBackup::new(config, "8d5c0bb6", "*.log\ncache/");
//!
//!     let details = backup.generate(Path::new("/srv/servers/8d5c0bb6"), None).await?;
//!     println!("{} bytes, sha256 {}", details.size, details.checksum);
//!     Ok(())
//! }
//! ```
//!
//! ## Restoring
//!
//! ```rust,ignore
//! use server_backup::backup::restore_callback;
//!
//! let (backup, _info) = LocalBackup::locate(config, "8d5c0bb6").await?;
//! backup
//!     .restore(None, restore_callback(|path, mut file| {
//!         // write `file` to `path` under the server root
//!         Ok(())
//!     }))
//!     .await?;
//! ```
//!
//! ## Error kinds
//!
//! Branch on errors with [`is_request_error`], [`is_invalid_credentials_error`]
//! or [`Error::kind`], never on the message text.

pub mod archive;
pub mod backup;
pub mod config;
pub mod error;
pub mod remote;
pub mod sftp;

// Re-exports for convenience
pub use archive::{Archive, IgnoreMatcher, RestoreFile};
pub use backup::{
    AdapterType, ArchiveDetails, Backup, BackupAdapter, BackupRequest, FileInfo, LocalBackup,
    LogContext, RestoreCallback,
};
#[cfg(feature = "s3")]
pub use backup::S3Backup;
pub use config::{BackupConfig, S3Config};
pub use error::{
    is_invalid_credentials_error, is_not_found_error, is_request_error, Error, ErrorKind, Result,
};
pub use remote::{InvalidCredentialsError, RequestError, RequestErrors};
