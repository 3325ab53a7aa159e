//! Deterministic tar.gz extraction.
//!
//! The archive is consumed as a finite, non-restartable stream of entries;
//! re-extracting requires a fresh stream. Extraction is single-pass and
//! sequential, and the first unrecoverable error aborts with the
//! destination partially populated — callers extract into a scratch
//! directory per run.

use std::fs::{self, File, Permissions};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, Entry, EntryType};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unable to open archive {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        source: io::Error,
    },

    #[error("unable to read archive entry: {0}")]
    Entry(#[source] io::Error),

    #[error("unable to extract file '{name}': {source}")]
    File { name: String, source: io::Error },

    #[error("unable to make directory '{name}': {source}")]
    Dir { name: String, source: io::Error },

    #[error("unable to link '{name}' -> '{target}': {source}")]
    Link {
        name: String,
        target: String,
        source: io::Error,
    },
}

/// Strip the first path segment up to and including the first `/`.
///
/// Names with no separator, or with a leading one, pass through unchanged.
pub(crate) fn strip_leading_dir(name: &str) -> &str {
    match name.find('/') {
        Some(idx) if idx > 0 => &name[idx + 1..],
        _ => name,
    }
}

/// Unpack a gzip-tar stream into `dest`.
///
/// Entry kinds are dispatched over a closed set: regular files are created
/// with the entry's mode and exactly its declared size; directories
/// tolerate already existing; hard and symbolic links resolve their target
/// relative to the link's own containing directory and tolerate a missing
/// source (benign tar-ordering races). Global headers are skipped, any
/// other kind is logged and skipped.
pub fn extract<R: Read>(reader: R, dest: &Path, strip_leading: bool) -> Result<(), ExtractError> {
    let mut archive = Archive::new(GzDecoder::new(reader));
    for entry in archive.entries().map_err(ExtractError::Entry)? {
        let mut entry = entry.map_err(ExtractError::Entry)?;

        let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let name = if strip_leading {
            strip_leading_dir(&raw).to_owned()
        } else {
            raw
        };

        match entry.header().entry_type() {
            EntryType::Regular => make_file(&mut entry, &name, dest)?,
            EntryType::Directory => make_dir(&entry, &name, dest)?,
            EntryType::Link => make_link(&entry, &name, dest, false)?,
            EntryType::Symlink => make_link(&entry, &name, dest, true)?,
            EntryType::XGlobalHeader => continue,
            other => warn!("skipping archive entry '{name}' of unsupported type {other:?}"),
        }
    }
    Ok(())
}

/// Open `path` and unpack it as a gzip-tar archive into `dest`.
pub fn extract_file(path: &Path, dest: &Path, strip_leading: bool) -> Result<(), ExtractError> {
    let file = File::open(path).map_err(|source| ExtractError::Open {
        path: path.to_owned(),
        source,
    })?;
    extract(file, dest, strip_leading)
}

fn entry_mode<R: Read>(entry: &Entry<R>, name: &str) -> Result<u32, ExtractError> {
    entry.header().mode().map_err(|source| ExtractError::File {
        name: name.to_owned(),
        source,
    })
}

fn make_file<R: Read>(entry: &mut Entry<R>, name: &str, dest: &Path) -> Result<(), ExtractError> {
    let mode = entry_mode(entry, name)?;
    let size = entry.header().size().map_err(|source| ExtractError::File {
        name: name.to_owned(),
        source,
    })?;

    let err = |source| ExtractError::File {
        name: name.to_owned(),
        source,
    };

    let path = dest.join(name);
    let mut file = File::create(&path).map_err(err)?;
    file.set_permissions(Permissions::from_mode(mode)).map_err(err)?;

    // Copy exactly the declared size; the entry reader ends there.
    let copied = io::copy(entry, &mut file).map_err(err)?;
    if copied != size {
        return Err(err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("entry declared {size} bytes, read {copied}"),
        )));
    }
    Ok(())
}

fn make_dir<R: Read>(entry: &Entry<R>, name: &str, dest: &Path) -> Result<(), ExtractError> {
    let mode = entry_mode(entry, name)?;
    let path = dest.join(name);
    match fs::create_dir(&path) {
        Ok(()) => fs::set_permissions(&path, Permissions::from_mode(mode)).map_err(|source| {
            ExtractError::Dir {
                name: name.to_owned(),
                source,
            }
        }),
        // The only tolerated outcome; anything else aborts extraction.
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(source) => Err(ExtractError::Dir {
            name: name.to_owned(),
            source,
        }),
    }
}

fn make_link<R: Read>(
    entry: &Entry<R>,
    name: &str,
    dest: &Path,
    symbolic: bool,
) -> Result<(), ExtractError> {
    let target = entry
        .link_name_bytes()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default();

    let to = dest.join(name);
    // The link target is resolved relative to the link's own containing
    // directory.
    let from = to.parent().unwrap_or(dest).join(&target);

    let result = if symbolic {
        std::os::unix::fs::symlink(&from, &to)
    } else {
        fs::hard_link(&from, &to)
    };
    match result {
        Ok(()) => Ok(()),
        // The source may simply not be extracted yet.
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ExtractError::Link {
            name: name.to_owned(),
            target,
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn tgz(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let gz = GzEncoder::new(Cursor::new(&mut buf), Compression::default());
            let mut builder = tar::Builder::new(gz);
            for (name, content) in entries {
                let mut header = tar::Header::new_gnu();
                header.set_size(content.len() as u64);
                header.set_mode(0o600);
                header.set_cksum();
                builder
                    .append_data(&mut header, name, content.as_bytes())
                    .unwrap();
            }
            builder.into_inner().unwrap().finish().unwrap();
        }
        buf
    }

    #[test]
    fn strip_leading_dir_rules() {
        assert_eq!(strip_leading_dir("foo/blah"), "blah");
        assert_eq!(strip_leading_dir("foo/bar/blah"), "bar/blah");
        assert_eq!(strip_leading_dir("blah"), "blah");
        assert_eq!(strip_leading_dir("/blah"), "/blah");
    }

    #[test]
    fn extract_round_trips_files() {
        let data = tgz(&[("a.txt", "alpha"), ("b.txt", "beta")]);
        let dir = tempdir().unwrap();

        extract(Cursor::new(&data), dir.path(), false).unwrap();

        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"alpha");
        assert_eq!(fs::read(dir.path().join("b.txt")).unwrap(), b"beta");
    }

    #[test]
    fn extract_strips_leading_directory() {
        let data = tgz(&[("foo/blah", "{}")]);
        let dir = tempdir().unwrap();

        extract(Cursor::new(&data), dir.path(), true).unwrap();

        assert_eq!(fs::read(dir.path().join("blah")).unwrap(), b"{}");
        assert!(!dir.path().join("foo").exists());
    }

    #[test]
    fn extract_creates_directories_and_nested_files() {
        let mut buf = Vec::new();
        {
            let gz = GzEncoder::new(Cursor::new(&mut buf), Compression::default());
            let mut builder = tar::Builder::new(gz);

            let mut header = tar::Header::new_gnu();
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, "sub/", &mut io::empty()).unwrap();

            let mut header = tar::Header::new_gnu();
            header.set_size(4);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "sub/file.txt", &b"data"[..])
                .unwrap();

            builder.into_inner().unwrap().finish().unwrap();
        }

        let dir = tempdir().unwrap();
        extract(Cursor::new(&buf), dir.path(), false).unwrap();

        assert!(dir.path().join("sub").is_dir());
        assert_eq!(fs::read(dir.path().join("sub/file.txt")).unwrap(), b"data");
    }

    #[test]
    fn extract_tolerates_existing_directory() {
        let mut buf = Vec::new();
        {
            let gz = GzEncoder::new(Cursor::new(&mut buf), Compression::default());
            let mut builder = tar::Builder::new(gz);
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, "sub/", &mut io::empty()).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        extract(Cursor::new(&buf), dir.path(), false).unwrap();
    }

    #[test]
    fn extract_resolves_links_within_archive() {
        let mut buf = Vec::new();
        {
            let gz = GzEncoder::new(Cursor::new(&mut buf), Compression::default());
            let mut builder = tar::Builder::new(gz);

            let mut header = tar::Header::new_gnu();
            header.set_size(5);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "file.txt", &b"hello"[..])
                .unwrap();

            let mut header = tar::Header::new_gnu();
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            header.set_cksum();
            builder
                .append_link(&mut header, "link.txt", "file.txt")
                .unwrap();

            builder.into_inner().unwrap().finish().unwrap();
        }

        let dir = tempdir().unwrap();
        extract(Cursor::new(&buf), dir.path(), false).unwrap();

        let link = dir.path().join("link.txt");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(fs::read(&link).unwrap(), b"hello");
    }

    #[test]
    fn extract_preserves_file_mode() {
        let data = tgz(&[("script.sh", "#!/bin/sh\n")]);
        let dir = tempdir().unwrap();

        extract(Cursor::new(&data), dir.path(), false).unwrap();

        let mode = fs::metadata(dir.path().join("script.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn extract_file_reports_missing_archive() {
        let dir = tempdir().unwrap();
        let err =
            extract_file(&dir.path().join("nope.tgz"), dir.path(), false).unwrap_err();
        assert!(matches!(err, ExtractError::Open { .. }));
    }
}
