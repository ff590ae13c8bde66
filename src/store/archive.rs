//! Extracting zip archives into the process cache area.
//!
//! Archive sources are never read in place. They are unpacked into a
//! deterministic destination under the extraction directory and served
//! from there as a plain directory tree.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use log::debug;
use tempfile::NamedTempFile;

use crate::error::IoError;
use crate::store::driver::SourceError;
use crate::store::reader::ZipReader;

lazy_static! {
    // One lock per destination, so concurrent inits of the same archive
    // serialize instead of racing half-written trees.
    static ref EXTRACT_LOCKS: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>> = Mutex::new(HashMap::new());
}

//------------ EntryPredicate ------------------------------------------------

/// Selects which archive entries get extracted.
#[derive(Clone, Debug)]
pub enum EntryPredicate {
    /// Every entry.
    All,

    /// Only entries under the given first-level directory.
    Prefix(String),
}

impl EntryPredicate {
    fn accepts(&self, rel_path: &Path) -> bool {
        match self {
            EntryPredicate::All => true,
            EntryPredicate::Prefix(prefix) => rel_path.starts_with(prefix),
        }
    }
}

//------------ extract_archive -----------------------------------------------

/// Unpacks an archive into the extraction directory and returns the
/// destination root.
///
/// The destination is derived from the archive's file name alone, so the
/// same archive always lands in the same place. With `cache` set, an
/// existing destination is reused as-is; without it, any existing
/// destination is removed first so stale entries from earlier archive
/// versions cannot linger.
///
/// Entries are taken relative to `archive_root` when one is given; entries
/// outside it, directory markers, and names that would escape the
/// destination are skipped. Each entry is written to a temporary file and
/// atomically moved into place.
pub fn extract_archive(
    archive: &Path,
    archive_root: Option<&str>,
    predicate: &EntryPredicate,
    extract_dir: &Path,
    cache: bool,
) -> Result<PathBuf, SourceError> {
    let dest = extract_dir.join(destination_name(archive));
    let lock = extraction_lock(&dest);
    let _guard = lock.lock().unwrap();

    if dest.exists() {
        // A file squatting on the destination name is never ours to
        // delete; it may even be the archive itself.
        if !dest.is_dir() {
            return Err(SourceError::Extraction(IoError::new(
                format!(
                    "extraction destination '{}' exists and is not a directory",
                    dest.display()
                ),
                io::Error::other("not a directory"),
            )));
        }
        if cache {
            debug!("reusing extracted archive at '{}'", dest.display());
            return Ok(dest);
        }
        fs::remove_dir_all(&dest).map_err(|e| {
            SourceError::Extraction(IoError::new(
                format!("cannot clear extraction dir '{}'", dest.display()),
                e,
            ))
        })?;
    }

    fs::create_dir_all(&dest).map_err(|e| {
        SourceError::Extraction(IoError::new(
            format!("cannot create extraction dir '{}'", dest.display()),
            e,
        ))
    })?;

    let reader = ZipReader::open(archive, archive_root).map_err(SourceError::Extraction)?;
    for entry in reader.entries() {
        let rel_path = entry.rel_path();
        if !predicate.accepts(rel_path) {
            continue;
        }

        let target = dest.join(rel_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                SourceError::Extraction(IoError::new(
                    format!("cannot create '{}'", parent.display()),
                    e,
                ))
            })?;
        }
        let mut tmp = NamedTempFile::new_in(&dest).map_err(|e| {
            SourceError::Extraction(IoError::new(
                format!("cannot create temp file under '{}'", dest.display()),
                e,
            ))
        })?;
        tmp.write_all(&entry.bytes().map_err(SourceError::Extraction)?)
            .map_err(|e| {
                SourceError::Extraction(IoError::new(
                    format!("cannot write entry '{}'", rel_path.display()),
                    e,
                ))
            })?;
        tmp.persist(&target).map_err(|e| {
            SourceError::Extraction(IoError::new(
                format!("cannot persist '{}'", target.display()),
                e.error,
            ))
        })?;
    }

    debug!("extracted '{}' to '{}'", archive.display(), dest.display());
    Ok(dest)
}

/// The deterministic destination directory name for an archive.
///
/// The archive file name with every character outside `[A-Za-z0-9._-]`
/// replaced by an underscore.
pub fn destination_name(archive: &Path) -> String {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_owned());
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn extraction_lock(dest: &Path) -> Arc<Mutex<()>> {
    let mut locks = EXTRACT_LOCKS.lock().unwrap();
    locks.entry(dest.to_path_buf()).or_default().clone()
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::write_zip;

    #[test]
    fn extracts_entries_to_deterministic_destination() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pack v1.zip");
        write_zip(&archive, &[("a.json", b"{}"), ("sub/b.json", b"{}")]);

        let extract_dir = dir.path().join("out");
        let dest = extract_archive(&archive, None, &EntryPredicate::All, &extract_dir, false).unwrap();
        assert_eq!(dest, extract_dir.join("pack_v1.zip"));
        assert!(dest.join("a.json").is_file());
        assert!(dest.join("sub/b.json").is_file());
    }

    #[test]
    fn archive_root_strips_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("rooted.zip");
        write_zip(&archive, &[("pack/inner.json", b"{}"), ("outside.json", b"{}")]);

        let dest = extract_archive(
            &archive,
            Some("pack"),
            &EntryPredicate::All,
            &dir.path().join("out"),
            false,
        )
        .unwrap();
        assert!(dest.join("inner.json").is_file());
        assert!(!dest.join("outside.json").exists());
        assert!(!dest.join("pack").exists());
    }

    #[test]
    fn prefix_predicate_limits_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("mixed.zip");
        write_zip(
            &archive,
            &[("entities/e.json", b"{}"), ("resources/r.bin", b"x")],
        );

        let dest = extract_archive(
            &archive,
            None,
            &EntryPredicate::Prefix("entities".to_owned()),
            &dir.path().join("out"),
            false,
        )
        .unwrap();
        assert!(dest.join("entities/e.json").is_file());
        assert!(!dest.join("resources").exists());
    }

    #[test]
    fn cache_on_reuses_existing_tree() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("cached.zip");
        write_zip(&archive, &[("a.json", b"original")]);
        let extract_dir = dir.path().join("out");

        let dest = extract_archive(&archive, None, &EntryPredicate::All, &extract_dir, true).unwrap();
        fs::write(dest.join("a.json"), b"locally changed").unwrap();

        let again = extract_archive(&archive, None, &EntryPredicate::All, &extract_dir, true).unwrap();
        assert_eq!(again, dest);
        assert_eq!(fs::read(dest.join("a.json")).unwrap(), b"locally changed");
    }

    #[test]
    fn cache_off_removes_stray_files() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("fresh.zip");
        write_zip(&archive, &[("a.json", b"{}")]);
        let extract_dir = dir.path().join("out");

        let dest = extract_archive(&archive, None, &EntryPredicate::All, &extract_dir, false).unwrap();
        fs::write(dest.join("stray.json"), b"{}").unwrap();

        let again = extract_archive(&archive, None, &EntryPredicate::All, &extract_dir, false).unwrap();
        assert_eq!(again, dest);
        assert!(dest.join("a.json").is_file());
        assert!(!dest.join("stray.json").exists());
    }

    #[test]
    fn traversal_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("../evil.txt", b"no"), ("ok.txt", b"yes")]);

        let extract_dir = dir.path().join("out");
        fs::create_dir_all(&extract_dir).unwrap();
        let dest =
            extract_archive(&archive, None, &EntryPredicate::All, &extract_dir, false).unwrap();
        assert!(dest.join("ok.txt").is_file());
        assert!(!dir.path().join("evil.txt").exists());
        assert!(!extract_dir.join("evil.txt").exists());
    }

    #[test]
    fn file_on_destination_name_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pack.zip");
        write_zip(&archive, &[("a.json", b"{}")]);

        // Extracting into the archive's own directory lands the
        // destination name on the archive file itself.
        let result = extract_archive(&archive, None, &EntryPredicate::All, dir.path(), false);
        assert!(matches!(result, Err(SourceError::Extraction(_))));
        assert!(archive.is_file());

        // Same with caching: a file is never a reusable destination.
        let cached = extract_archive(&archive, None, &EntryPredicate::All, dir.path(), true);
        assert!(matches!(cached, Err(SourceError::Extraction(_))));
        assert!(archive.is_file());
    }

    #[test]
    fn destination_name_normalizes() {
        assert_eq!(destination_name(Path::new("/tmp/a b@c.zip")), "a_b_c.zip");
        assert_eq!(destination_name(Path::new("plain.zip")), "plain.zip");
    }

    #[test]
    fn missing_archive_is_an_extraction_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = extract_archive(
            &dir.path().join("absent.zip"),
            None,
            &EntryPredicate::All,
            dir.path(),
            false,
        );
        assert!(matches!(result, Err(SourceError::Extraction(_))));
    }
}
