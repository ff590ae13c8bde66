//! The filesystem source driver.
//!
//! Serves plain directory trees and local zip archives. Relative `src`
//! paths are resolved against the configured data directory; archives are
//! unpacked into the extraction directory first and served from there.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::store::archive::{extract_archive, EntryPredicate};
use crate::store::driver::{BlobSource, PathFilter, SourceDriver, SourceError};
use crate::store::{ContentKind, SourceType, StoreSource};

//------------ FsDriver ------------------------------------------------------

pub struct FsDriver {
    data_dir: PathBuf,
    extract_dir: PathBuf,
    auto_create: bool,
}

impl FsDriver {
    pub fn new(data_dir: PathBuf, extract_dir: PathBuf, auto_create: bool) -> Self {
        FsDriver {
            data_dir,
            extract_dir,
            auto_create,
        }
    }

    /// Resolves a source's `src` against the data dir, unless absolute.
    fn resolve(&self, src: &str) -> PathBuf {
        let path = Path::new(src);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    /// Creates a missing directory if auto-creation is on. Returns whether
    /// the directory exists afterwards; a failed creation is logged and
    /// just leaves the source unavailable.
    fn ensure_dir(&self, path: &Path) -> bool {
        if path.is_dir() {
            return true;
        }
        if !self.auto_create {
            return false;
        }
        match fs::create_dir_all(path) {
            Ok(()) => {
                info!("created source dir '{}'", path.display());
                true
            }
            Err(e) => {
                warn!("cannot create source dir '{}': {}", path.display(), e);
                false
            }
        }
    }

    fn init_plain(&self, source: &StoreSource, root: PathBuf) -> Result<BlobSource, SourceError> {
        if !self.ensure_dir(&root) {
            return Err(SourceError::Unavailable(source.to_string()));
        }
        Ok(BlobSource::rooted(root, PathFilter::for_source(source)?))
    }

    fn init_archive(
        &self,
        source: &StoreSource,
        archive: PathBuf,
        content: ContentKind,
    ) -> Result<BlobSource, SourceError> {
        let dest = extract_archive(
            &archive,
            source.archive_root.as_deref(),
            &entry_predicate(source, content),
            &self.extract_dir,
            source.archive_cache,
        )?;
        Ok(BlobSource::rooted(
            content_root(source, dest, content),
            PathFilter::for_source(source)?,
        ))
    }
}

impl SourceDriver for FsDriver {
    fn source_type(&self) -> SourceType {
        SourceType::Fs
    }

    fn is_available(&self, source: &StoreSource) -> bool {
        let path = self.resolve(&source.src);
        if source.archive {
            path.is_file()
        } else {
            self.ensure_dir(&path)
        }
    }

    fn init(&self, source: &StoreSource, content: ContentKind) -> Result<BlobSource, SourceError> {
        let path = self.resolve(&source.src);
        if source.archive {
            self.init_archive(source, path, content)
        } else {
            self.init_plain(source, content_root(source, path, content))
        }
    }
}

/// Which archive entries to unpack for a request.
///
/// Single-content sources hold the requested kind at their root, so
/// everything is taken. A source holding everything is subdivided by
/// content-kind directories and only the requested one needs unpacking.
pub(crate) fn entry_predicate(source: &StoreSource, content: ContentKind) -> EntryPredicate {
    if source.is_single_content() || content == ContentKind::All {
        EntryPredicate::All
    } else {
        EntryPredicate::Prefix(content.as_str().to_owned())
    }
}

/// Where the requested content kind lives within a resolved source tree.
pub(crate) fn content_root(source: &StoreSource, base: PathBuf, content: ContentKind) -> PathBuf {
    if source.is_single_content() || content == ContentKind::All {
        base
    } else {
        base.join(content.as_str())
    }
}

//------------ Tests ---------------------------------------------------------
