//! Walking the entries of a resolved source.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::error::IoError;
use crate::store::driver::PathFilter;

//------------ SourceEntry ---------------------------------------------------

/// One file found in a source, addressed by its path relative to the
/// source root.
#[derive(Clone, Debug)]
pub struct SourceEntry {
    rel_path: PathBuf,
    supplier: EntrySupplier,
}

/// Where an entry's bytes come from.
///
/// Directory entries stay on disk and are read on demand; archive entries
/// are already materialized, since the archive stream may be gone by the
/// time the bytes are needed.
#[derive(Clone, Debug)]
enum EntrySupplier {
    File(PathBuf),
    Loaded(Bytes),
}

impl SourceEntry {
    pub fn file(rel_path: PathBuf, abs_path: PathBuf) -> Self {
        SourceEntry {
            rel_path,
            supplier: EntrySupplier::File(abs_path),
        }
    }

    pub fn loaded(rel_path: PathBuf, bytes: Bytes) -> Self {
        SourceEntry {
            rel_path,
            supplier: EntrySupplier::Loaded(bytes),
        }
    }

    /// The path relative to the source root.
    pub fn rel_path(&self) -> &Path {
        &self.rel_path
    }

    /// The entry's content.
    pub fn bytes(&self) -> Result<Bytes, IoError> {
        match &self.supplier {
            EntrySupplier::File(path) => {
                let bytes = std::fs::read(path)
                    .map_err(|e| IoError::new(format!("cannot read '{}'", path.display()), e))?;
                Ok(Bytes::from(bytes))
            }
            EntrySupplier::Loaded(bytes) => Ok(bytes.clone()),
        }
    }
}

//------------ DirectoryReader -----------------------------------------------

/// A restartable walk over the files under a source root.
///
/// Each call to [`entries`][Self::entries] starts a fresh traversal, so
/// files created between walks show up on the next one. Entries are
/// yielded in sorted path order and filtered through the source's
/// include/exclude patterns.
#[derive(Clone, Debug)]
pub struct DirectoryReader {
    root: PathBuf,
    filter: PathFilter,
}

impl DirectoryReader {
    /// Trees deeper than this are considered malformed and cut off.
    const MAX_DEPTH: usize = 64;

    pub fn new(root: PathBuf, filter: PathFilter) -> Self {
        DirectoryReader { root, filter }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walks the tree, yielding one entry per matching file.
    ///
    /// A missing root is an empty source, not an error.
    pub fn entries(&self) -> impl Iterator<Item = Result<SourceEntry, IoError>> + '_ {
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(Self::MAX_DEPTH)
            .sort_by_file_name()
            .into_iter();

        walker.filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    // The whole root being absent just means no entries.
                    if e.io_error().map(|io| io.kind() == io::ErrorKind::NotFound).unwrap_or(false)
                        && e.path() == Some(self.root.as_path())
                    {
                        return None;
                    }
                    let cause = e
                        .into_io_error()
                        .unwrap_or_else(|| io::Error::other("walk failed"));
                    return Some(Err(IoError::new(
                        format!("cannot walk '{}'", self.root.display()),
                        cause,
                    )));
                }
            };
            if !entry.file_type().is_file() {
                return None;
            }
            let rel_path = match entry.path().strip_prefix(&self.root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => return None,
            };
            if !self.filter.matches(&rel_path) {
                return None;
            }
            Some(Ok(SourceEntry::file(rel_path, entry.into_path())))
        })
    }
}

//------------ ZipReader -----------------------------------------------------

/// A restartable sequence over the file entries of a zip archive.
///
/// All entry bytes are read while the archive is open, so the returned
/// entries stay usable after the underlying file is closed or replaced.
/// Directory markers, entries outside `archive_root`, and names that would
/// escape the root are dropped.
pub struct ZipReader {
    entries: Vec<SourceEntry>,
}

impl ZipReader {
    pub fn open(archive: &Path, archive_root: Option<&str>) -> Result<Self, IoError> {
        let file = File::open(archive)
            .map_err(|e| IoError::new(format!("cannot open archive '{}'", archive.display()), e))?;
        let mut zip = ZipArchive::new(file).map_err(|e| {
            IoError::new(
                format!("cannot read archive '{}'", archive.display()),
                io::Error::other(e),
            )
        })?;

        let mut entries = Vec::new();
        for index in 0..zip.len() {
            let mut entry = zip.by_index(index).map_err(|e| {
                IoError::new(
                    format!("cannot read entry {} of '{}'", index, archive.display()),
                    io::Error::other(e),
                )
            })?;
            if entry.is_dir() {
                continue;
            }
            // enclosed_name refuses absolute names and parent traversal.
            let Some(name) = entry.enclosed_name() else {
                continue;
            };
            let rel_path = match archive_root {
                Some(root) => match name.strip_prefix(root) {
                    Ok(rel) => rel.to_path_buf(),
                    Err(_) => continue,
                },
                None => name,
            };
            if rel_path.as_os_str().is_empty() {
                continue;
            }

            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes).map_err(|e| {
                IoError::new(format!("cannot read entry '{}'", rel_path.display()), e)
            })?;
            entries.push(SourceEntry::loaded(rel_path, Bytes::from(bytes)));
        }

        Ok(ZipReader { entries })
    }

    /// The entries in archive order. Restartable; every call yields the
    /// full sequence again.
    pub fn entries(&self) -> impl Iterator<Item = &SourceEntry> + '_ {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test::write_zip;

    fn rel_paths(reader: &DirectoryReader) -> Vec<String> {
        reader
            .entries()
            .map(|e| e.unwrap().rel_path().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn walks_files_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("b/two.json"), b"{}").unwrap();
        fs::write(dir.path().join("a.json"), b"{}").unwrap();
        fs::write(dir.path().join("c.json"), b"{}").unwrap();

        let reader = DirectoryReader::new(dir.path().to_path_buf(), PathFilter::accept_all());
        assert_eq!(rel_paths(&reader), ["a.json", "b/two.json", "c.json"]);
    }

    #[test]
    fn restarting_sees_new_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("first.json"), b"{}").unwrap();

        let reader = DirectoryReader::new(dir.path().to_path_buf(), PathFilter::accept_all());
        assert_eq!(rel_paths(&reader).len(), 1);

        fs::write(dir.path().join("second.json"), b"{}").unwrap();
        assert_eq!(rel_paths(&reader).len(), 2);
    }

    #[test]
    fn applies_source_filters() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("keep.json"), b"{}").unwrap();
        fs::write(dir.path().join("skip.bak"), b"").unwrap();

        let filter = PathFilter::new(&["*.json".to_owned()], &[]).unwrap();
        let reader = DirectoryReader::new(dir.path().to_path_buf(), filter);
        assert_eq!(rel_paths(&reader), ["keep.json"]);
    }

    #[test]
    fn missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let reader = DirectoryReader::new(dir.path().join("nope"), PathFilter::accept_all());
        assert!(reader.entries().next().is_none());
    }

    #[test]
    fn entry_reads_its_bytes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("data.bin"), b"payload").unwrap();

        let reader = DirectoryReader::new(dir.path().to_path_buf(), PathFilter::accept_all());
        let entry = reader.entries().next().unwrap().unwrap();
        assert_eq!(entry.bytes().unwrap().as_ref(), b"payload");
    }

    #[test]
    fn zip_entries_survive_the_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pack.zip");
        write_zip(&archive, &[("a.json", b"alpha"), ("sub/b.json", b"beta")]);

        let reader = ZipReader::open(&archive, None).unwrap();
        fs::remove_file(&archive).unwrap();

        // Entries were materialized while the archive was open.
        let contents: Vec<Bytes> = reader.entries().map(|e| e.bytes().unwrap()).collect();
        assert_eq!(contents, [Bytes::from_static(b"alpha"), Bytes::from_static(b"beta")]);

        // The sequence restarts.
        assert_eq!(reader.entries().count(), 2);
    }

    #[test]
    fn zip_reader_strips_archive_root() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("rooted.zip");
        write_zip(&archive, &[("pack/inner.json", b"{}"), ("outside.json", b"{}")]);

        let reader = ZipReader::open(&archive, Some("pack")).unwrap();
        let paths: Vec<&Path> = reader.entries().map(|e| e.rel_path()).collect();
        assert_eq!(paths, [Path::new("inner.json")]);
    }

    #[test]
    fn zip_reader_fails_on_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ZipReader::open(&dir.path().join("absent.zip"), None).is_err());
    }
}
