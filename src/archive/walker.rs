use crate::backup::FileInfo;
use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A file inside an archive being restored
pub struct RestoreFile<'a> {
    info: FileInfo,
    link: Option<PathBuf>,
    reader: &'a mut dyn Read,
}

impl<'a> RestoreFile<'a> {
    pub fn new(info: FileInfo, reader: &'a mut dyn Read) -> Self {
        Self {
            info,
            link: None,
            reader,
        }
    }

    pub fn with_link(mut self, target: PathBuf) -> Self {
        self.link = Some(target);
        self
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    /// Target of a symlink entry
    pub fn link_target(&self) -> Option<&Path> {
        self.link.as_deref()
    }
}

impl Read for RestoreFile<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

/// Walk a gzip-compressed tar, calling `callback` for every non-directory
/// entry in archive order.
///
/// The first error returned by `callback` stops the walk and is returned
/// as-is. Faults reading the archive itself are reported as
/// [`Error::CorruptArchive`].
pub fn walk<R, F>(reader: R, cancel: Option<&CancellationToken>, mut callback: F) -> Result<()>
where
    R: Read,
    F: FnMut(&str, RestoreFile<'_>) -> Result<()>,
{
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    let entries = archive.entries().map_err(corrupt)?;

    for entry in entries {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(Error::Cancelled);
        }

        let mut entry = entry.map_err(corrupt)?;
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() || entry_type.is_pax_global_extensions() {
            continue;
        }

        let name = normalize_entry_name(&entry.path().map_err(corrupt)?)?;
        if name.is_empty() {
            continue;
        }

        let header = entry.header();
        let info = FileInfo {
            size: header.size().unwrap_or(0),
            is_dir: false,
            permissions: header.mode().unwrap_or(0o644),
            mtime: header.mtime().unwrap_or(0) as u32,
            atime: header.mtime().unwrap_or(0) as u32,
            uid: header.uid().unwrap_or(0) as u32,
            gid: header.gid().unwrap_or(0) as u32,
        };

        let link = if entry_type.is_symlink() {
            entry.link_name().map_err(corrupt)?.map(|l| l.into_owned())
        } else {
            None
        };

        debug!(path = %name, size = info.size, "Restoring archive entry");
        let mut file = RestoreFile::new(info, &mut entry);
        if let Some(target) = link {
            file = file.with_link(target);
        }
        callback(&name, file)?;
    }

    Ok(())
}

/// Normalize an entry name to a relative `/`-separated path.
///
/// Leading `/` and `.` segments are dropped. Names that climb out of the
/// archive root are rejected.
pub fn normalize_entry_name(path: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy()),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                return Err(Error::CorruptArchive(format!(
                    "entry {} escapes the archive root",
                    path.display()
                )))
            }
        }
    }
    Ok(parts.join("/"))
}

fn corrupt(err: io::Error) -> Error {
    Error::CorruptArchive(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use proptest::prelude::*;
    use std::cell::Cell;

    /// Build an archive in memory with the given (name, content) entries.
    /// Names ending in `/` become directory entries.
    fn archive(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            if name.ends_with('/') {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                header.set_mode(0o755);
            } else {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(content.len() as u64);
                header.set_mode(0o644);
            }
            // Write the raw name so entries like "./a" survive as-is
            header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name.as_bytes());
            header.set_cksum();
            builder.append(&header, content.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_visits_every_file_in_order() {
        let data = archive(&[
            ("./", ""),
            ("./a.txt", "a"),
            ("sub/", ""),
            ("sub/c.txt", "c"),
            ("/abs/b.txt", "b"),
        ]);

        let mut seen = Vec::new();
        walk(data.as_slice(), None, |name, mut file| {
            let mut content = String::new();
            file.read_to_string(&mut content).unwrap();
            seen.push((name.to_string(), content));
            Ok(())
        })
        .unwrap();

        assert_eq!(
            seen,
            vec![
                ("a.txt".to_string(), "a".to_string()),
                ("sub/c.txt".to_string(), "c".to_string()),
                ("abs/b.txt".to_string(), "b".to_string()),
            ]
        );
    }

    #[test]
    fn test_callback_error_halts_walk() {
        let data = archive(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let calls = Cell::new(0);

        let err = walk(data.as_slice(), None, |name, _| {
            calls.set(calls.get() + 1);
            if name == "b" {
                return Err(Error::callback("stop here"));
            }
            Ok(())
        })
        .unwrap_err();

        assert_eq!(calls.get(), 2);
        assert_eq!(err.kind(), ErrorKind::Callback);
        assert_eq!(err.to_string(), "stop here");
    }

    #[test]
    fn test_garbage_is_corrupt_archive() {
        let err = walk(&b"definitely not a tarball"[..], None, |_, _| Ok(())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptArchive);
    }

    #[test]
    fn test_parent_segments_are_rejected() {
        let data = archive(&[("../../etc/passwd", "x")]);
        let err = walk(data.as_slice(), None, |_, _| Ok(())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptArchive);
    }

    #[test]
    fn test_cancellation_between_entries() {
        let data = archive(&[("a", "1"), ("b", "2")]);
        let token = CancellationToken::new();
        let mut calls = 0;

        let err = walk(data.as_slice(), Some(&token), |_, _| {
            calls += 1;
            token.cancel();
            Ok(())
        })
        .unwrap_err();

        assert_eq!(calls, 1);
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    proptest! {
        #[test]
        fn prop_normalize_strips_prefixes(
            segments in prop::collection::vec("[a-z0-9_]{1,8}", 1..5),
            leading in prop::sample::select(vec!["", "/", "./", "/./"]),
        ) {
            let joined = segments.join("/");
            let raw = format!("{leading}{joined}");
            prop_assert_eq!(normalize_entry_name(Path::new(&raw)).unwrap(), joined);
        }
    }
}
