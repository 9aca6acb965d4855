//! Create, inspect and restore server backups from the command line

use clap::{Args, Parser, Subcommand, ValueEnum};
use server_backup::backup::restore_callback;
use server_backup::config::DEFAULT_BACKUP_DIRECTORY;
use server_backup::{BackupAdapter, BackupConfig, Error, FileInfo, LocalBackup, RestoreFile};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "server-backup")]
#[command(about = "Create, inspect and restore server backups", long_about = None)]
struct Cli {
    /// Directory holding local archives
    #[arg(long, env = "BACKUP_DIR", default_value = DEFAULT_BACKUP_DIRECTORY)]
    backup_dir: PathBuf,

    /// Gzip compression level (0-9)
    #[arg(long, env = "BACKUP_COMPRESSION", default_value = "6")]
    compression: u32,

    #[command(flatten)]
    storage: StorageArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Adapter {
    /// Archives in the local backup directory
    Local,
    /// Archives in an S3 bucket
    #[cfg(feature = "s3")]
    S3,
}

#[derive(Args)]
struct StorageArgs {
    /// Storage adapter to use
    #[arg(long, value_enum, default_value = "local")]
    adapter: Adapter,

    /// S3 bucket name
    #[cfg(feature = "s3")]
    #[arg(long, env = "S3_BUCKET")]
    bucket: Option<String>,

    /// S3 key prefix (optional)
    #[cfg(feature = "s3")]
    #[arg(long, env = "S3_PREFIX", default_value = "")]
    prefix: String,

    /// S3 endpoint URL (for S3-compatible services)
    #[cfg(feature = "s3")]
    #[arg(long, env = "S3_ENDPOINT")]
    endpoint: Option<String>,

    /// AWS region
    #[cfg(feature = "s3")]
    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    region: String,
}

#[derive(Subcommand)]
enum Command {
    /// Archive a directory
    Generate {
        /// Directory to archive
        base_path: PathBuf,

        /// Backup identifier (generated if omitted)
        #[arg(long)]
        uuid: Option<String>,

        /// File with ignore patterns, one per line
        #[arg(long)]
        ignore_file: Option<PathBuf>,

        /// Ignore pattern (can be repeated)
        #[arg(short, long = "ignore")]
        ignore: Vec<String>,
    },
    /// Extract a backup into a directory
    Restore {
        uuid: String,
        /// Directory to restore into
        target: PathBuf,
    },
    /// Delete a backup
    Remove { uuid: String },
    /// Print size and checksum of a backup
    Details { uuid: String },
    /// Check that a backup exists and print its metadata
    Locate { uuid: String },
}

impl StorageArgs {
    fn apply(&self, config: BackupConfig) -> BackupConfig {
        #[cfg(feature = "s3")]
        if let Some(ref bucket) = self.bucket {
            return config.with_s3(server_backup::S3Config::new(bucket).with_prefix(&self.prefix));
        }
        config
    }

    #[cfg(feature = "s3")]
    async fn s3_client(&self) -> aws_sdk_s3::Client {
        match self.endpoint {
            Some(ref endpoint) => {
                eprintln!("Using custom S3 endpoint: {}", endpoint);
                server_backup::S3Backup::client_with_endpoint(endpoint, &self.region).await
            }
            None => server_backup::S3Backup::client_from_env().await,
        }
    }

    /// Bind an identity to the selected adapter
    async fn open(
        &self,
        config: Arc<BackupConfig>,
        uuid: String,
        ignore: String,
        cancel: CancellationToken,
    ) -> Result<Box<dyn BackupAdapter>, Error> {
        match self.adapter {
            Adapter::Local => Ok(Box::new(
                LocalBackup::new(config, uuid, ignore).with_cancellation(cancel),
            )),
            #[cfg(feature = "s3")]
            Adapter::S3 => {
                let client = self.s3_client().await;
                let backup = server_backup::S3Backup::new(client, config, uuid, ignore)?;
                Ok(Box::new(backup.with_cancellation(cancel)))
            }
        }
    }

    async fn locate(
        &self,
        config: Arc<BackupConfig>,
        uuid: String,
    ) -> Result<(Box<dyn BackupAdapter>, FileInfo), Error> {
        match self.adapter {
            Adapter::Local => {
                let (backup, info) = LocalBackup::locate(config, uuid).await?;
                Ok((Box::new(backup), info))
            }
            #[cfg(feature = "s3")]
            Adapter::S3 => {
                let client = self.s3_client().await;
                let (backup, info) = server_backup::S3Backup::locate(client, config, uuid).await?;
                Ok((Box::new(backup), info))
            }
        }
    }
}

/// Build the ignore spec from a file and individual patterns
fn ignore_spec(file: Option<&PathBuf>, patterns: &[String]) -> io::Result<String> {
    let mut spec = match file {
        Some(path) => std::fs::read_to_string(path)?,
        None => String::new(),
    };
    for pattern in patterns {
        if !spec.is_empty() && !spec.ends_with('\n') {
            spec.push('\n');
        }
        spec.push_str(pattern);
    }
    Ok(spec)
}

/// Resolve `name` below `root` without passing through a symlink.
///
/// An earlier entry may have planted a link such as `data -> /etc`; a later
/// `data/passwd` must not be written through it.
fn restore_destination(root: &Path, name: &str) -> io::Result<PathBuf> {
    let mut dest = root.to_path_buf();
    let mut parts = Path::new(name).components().peekable();
    while let Some(part) = parts.next() {
        let Component::Normal(part) = part else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid entry name {name}"),
            ));
        };
        dest.push(part);
        if parts.peek().is_none() {
            break;
        }
        match std::fs::symlink_metadata(&dest) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("entry {name} passes through symlink {}", dest.display()),
                ));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(dest)
}

/// Write one archive entry below `root`
fn restore_entry(root: &Path, name: &str, mut file: RestoreFile<'_>) -> io::Result<()> {
    let dest = restore_destination(root, name)?;
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Replace, never follow, a link already at the destination
    if dest.symlink_metadata().is_ok_and(|m| m.file_type().is_symlink()) {
        std::fs::remove_file(&dest)?;
    }

    #[cfg(unix)]
    if let Some(target) = file.link_target() {
        if dest.symlink_metadata().is_ok() {
            std::fs::remove_file(&dest)?;
        }
        return std::os::unix::fs::symlink(target, &dest);
    }

    let mut out = std::fs::File::create(&dest)?;
    io::copy(&mut file, &mut out)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = file.info().permissions & 0o7777;
        std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode))?;
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(
    value: &T,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("server_backup=info".parse()?),
        )
        .init();

    let config = cli.storage.apply(
        BackupConfig::new()
            .backup_directory(&cli.backup_dir)
            .compression_level(cli.compression),
    );
    config.validate()?;
    let config = Arc::new(config);

    // Abort archive walks on Ctrl-C
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted, stopping after the current entry");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Command::Generate {
            base_path,
            uuid,
            ignore_file,
            ignore,
        } => {
            let uuid = uuid.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let spec = ignore_spec(ignore_file.as_ref(), &ignore)?;
            let backup = cli.storage.open(config, uuid, spec, cancel).await?;

            eprintln!("Creating backup {}", backup.identifier());
            let details = backup.generate(&base_path, None).await?;
            print_json(&serde_json::json!({
                "uuid": backup.identifier(),
                "adapter": backup.adapter_type(),
                "details": details,
            }))?;
        }
        Command::Restore { uuid, target } => {
            let backup = cli.storage.open(config, uuid, String::new(), cancel).await?;
            std::fs::create_dir_all(&target)?;

            let root = target.clone();
            backup
                .restore(
                    None,
                    restore_callback(move |name, file| {
                        restore_entry(&root, name, file).map_err(Error::callback)
                    }),
                )
                .await?;
            eprintln!("Restored {} into {}", backup.identifier(), target.display());
        }
        Command::Remove { uuid } => {
            let backup = cli.storage.open(config, uuid, String::new(), cancel).await?;
            backup.remove().await?;
            eprintln!("Removed backup {}", backup.identifier());
        }
        Command::Details { uuid } => {
            let backup = cli.storage.open(config, uuid, String::new(), cancel).await?;
            print_json(&backup.details().await)?;
        }
        Command::Locate { uuid } => {
            let (backup, info) = cli.storage.locate(config, uuid).await?;
            print_json(&serde_json::json!({
                "uuid": backup.identifier(),
                "adapter": backup.adapter_type(),
                "path": backup.path(),
                "size": info.size,
                "mtime": info.mtime,
            }))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ignore_spec_merges_file_and_flags() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join(".backupignore");
        std::fs::write(&file, "*.log").unwrap();

        let spec = ignore_spec(Some(&file), &["cache/".to_string()]).unwrap();
        assert_eq!(spec, "*.log\ncache/");
        assert_eq!(ignore_spec(None, &[]).unwrap(), "");
    }

    #[tokio::test]
    async fn test_restore_writes_tree() {
        let src = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        std::fs::create_dir(src.path().join("world")).unwrap();
        std::fs::write(src.path().join("world/level.dat"), "level").unwrap();

        let config = Arc::new(BackupConfig::new().backup_directory(backups.path()));
        let backup = LocalBackup::new(config, "cli", "");
        backup.generate(src.path(), None).await.unwrap();

        let root = target.path().to_path_buf();
        backup
            .restore(
                None,
                restore_callback(move |name, file| {
                    restore_entry(&root, name, file).map_err(Error::callback)
                }),
            )
            .await
            .unwrap();

        let restored = std::fs::read_to_string(target.path().join("world/level.dat")).unwrap();
        assert_eq!(restored, "level");
    }

    #[cfg(unix)]
    #[test]
    fn test_restore_refuses_to_write_through_symlink() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use server_backup::archive::walk;

        let outside = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();

        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
        let mut link = tar::Header::new_gnu();
        link.set_entry_type(tar::EntryType::Symlink);
        link.set_size(0);
        builder
            .append_link(&mut link, "evil", outside.path())
            .unwrap();
        let mut file = tar::Header::new_gnu();
        file.set_size(5);
        file.set_mode(0o644);
        builder
            .append_data(&mut file, "evil/pwned", &b"owned"[..])
            .unwrap();
        let data = builder.into_inner().unwrap().finish().unwrap();

        let root = target.path().to_path_buf();
        let err = walk(data.as_slice(), None, |name, file| {
            restore_entry(&root, name, file).map_err(Error::callback)
        })
        .unwrap_err();

        assert!(err.to_string().contains("symlink"));
        assert!(!outside.path().join("pwned").exists());
        assert_eq!(std::fs::read_dir(outside.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_restore_replaces_existing_symlink() {
        let outside = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let victim = outside.path().join("victim");
        std::fs::write(&victim, "keep").unwrap();
        std::os::unix::fs::symlink(&victim, target.path().join("config.yml")).unwrap();

        let mut content = &b"fresh"[..];
        let file = RestoreFile::new(FileInfo::file_with_mtime(5, 0), &mut content);
        restore_entry(target.path(), "config.yml", file).unwrap();

        assert_eq!(std::fs::read_to_string(&victim).unwrap(), "keep");
        let restored = target.path().join("config.yml");
        assert!(!restored.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read_to_string(restored).unwrap(), "fresh");
    }
}
