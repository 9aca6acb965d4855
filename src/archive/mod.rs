use crate::error::{Error, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tar::{Builder, Header, HeaderMode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use walkdir::WalkDir;

pub mod ignore;
pub mod walker;

pub use ignore::IgnoreMatcher;
pub use walker::{walk, RestoreFile};

/// Suffix of the staging file written next to the final archive
const STAGING_SUFFIX: &str = ".tar.gz.part";

/// Gzip-compressed tar of a directory tree
pub struct Archive {
    base_path: PathBuf,
    ignore: IgnoreMatcher,
    compression: Compression,
    cancel: Option<CancellationToken>,
}

impl Archive {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            ignore: IgnoreMatcher::empty(),
            compression: Compression::default(),
            cancel: None,
        }
    }

    pub fn ignore(mut self, ignore: IgnoreMatcher) -> Self {
        self.ignore = ignore;
        self
    }

    pub fn compression(mut self, level: u32) -> Self {
        self.compression = Compression::new(level);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Write the archive to `destination`.
    ///
    /// The archive is built in a staging file in the destination directory
    /// and renamed over `destination` once complete. On any failure the
    /// staging file is removed and `destination` is left untouched.
    pub fn create(&self, destination: &Path) -> Result<()> {
        let metadata = fs::metadata(&self.base_path).map_err(fs_error(&self.base_path))?;
        if !metadata.is_dir() {
            return Err(Error::Filesystem {
                path: self.base_path.clone(),
                source: io::Error::new(io::ErrorKind::Other, "not a directory"),
            });
        }
        fs::read_dir(&self.base_path).map_err(fs_error(&self.base_path))?;

        let parent = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(write_error(destination))?;

        let mut staging = tempfile::Builder::new()
            .prefix(".")
            .suffix(STAGING_SUFFIX)
            .tempfile_in(parent)
            .map_err(write_error(destination))?;
        let staging_path = staging.path().to_path_buf();

        debug!(
            base = %self.base_path.display(),
            staging = %staging_path.display(),
            "Writing archive"
        );

        let entries = {
            let encoder = GzEncoder::new(BufWriter::new(staging.as_file_mut()), self.compression);
            let mut builder = Builder::new(encoder);
            builder.follow_symlinks(false);

            let entries = self.append_tree(&mut builder, &[destination, staging_path.as_path()])?;

            let mut writer = builder
                .into_inner()
                .and_then(|encoder| encoder.finish())
                .map_err(write_error(destination))?;
            writer.flush().map_err(write_error(destination))?;
            entries
        };

        staging
            .as_file()
            .sync_all()
            .map_err(write_error(destination))?;
        staging
            .persist(destination)
            .map_err(|e| write_error(destination)(e.error))?;

        info!(path = %destination.display(), entries, "Archive written");
        Ok(())
    }

    fn append_tree<W: Write>(&self, builder: &mut Builder<W>, skip: &[&Path]) -> Result<usize> {
        let mut entries = 0;
        let mut walker = WalkDir::new(&self.base_path)
            .follow_links(false)
            .sort_by_file_name()
            .min_depth(1)
            .into_iter();

        while let Some(entry) = walker.next() {
            if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                return Err(Error::Cancelled);
            }

            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&self.base_path).to_path_buf();
                Error::Filesystem {
                    path,
                    source: io::Error::from(e),
                }
            })?;
            let path = entry.path();
            if skip.iter().any(|s| *s == path) {
                continue;
            }

            let relative = path.strip_prefix(&self.base_path).unwrap_or(path);
            let name = slash_path(relative);
            let file_type = entry.file_type();

            if self.ignore.is_ignored(&name, file_type.is_dir()) {
                debug!(path = %name, "Skipping ignored path");
                if file_type.is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }

            let metadata = fs::symlink_metadata(path).map_err(fs_error(path))?;
            let mut header = Header::new_gnu();
            header.set_metadata_in_mode(&metadata, HeaderMode::Complete);

            if file_type.is_dir() {
                builder
                    .append_data(&mut header, relative, io::empty())
                    .map_err(write_error(path))?;
            } else if file_type.is_symlink() {
                let target = fs::read_link(path).map_err(fs_error(path))?;
                builder
                    .append_link(&mut header, relative, &target)
                    .map_err(write_error(path))?;
            } else if file_type.is_file() {
                let file = File::open(path).map_err(fs_error(path))?;
                builder
                    .append_data(&mut header, relative, sized_reader(file, metadata.len()))
                    .map_err(write_error(path))?;
            } else {
                debug!(path = %name, "Skipping special file");
                continue;
            }
            entries += 1;
        }

        Ok(entries)
    }
}

/// Read exactly `len` bytes from `file`.
///
/// Files of a running server change while they are archived. Bytes appended
/// after the header was written are dropped and a truncated file is padded
/// with zeros, so the entry always matches its header.
fn sized_reader(file: impl Read, len: u64) -> impl Read {
    file.take(len).chain(io::repeat(0)).take(len)
}

/// Render a relative path with `/` separators
pub(crate) fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn fs_error(path: &Path) -> impl FnOnce(io::Error) -> Error + '_ {
    move |source| Error::Filesystem {
        path: path.to_path_buf(),
        source,
    }
}

fn write_error(path: &Path) -> impl FnOnce(io::Error) -> Error + '_ {
    move |source| Error::ArchiveWrite {
        path: path.to_path_buf(),
        source,
    }
}
