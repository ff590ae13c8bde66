//! Source drivers: from declarative descriptors to byte-readable trees.
//!
//! A driver translates a [`StoreSource`] into a [`BlobSource`], the
//! resolved read-ready view the rest of the crate works with. Drivers are
//! looked up through the [`DriverRegistry`], an explicit in-process
//! registry assembled by the composition root at startup.

use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::IoError;
use crate::store::reader::DirectoryReader;
use crate::store::{ContentKind, SourceType, StoreSource};

//------------ SourceDriver --------------------------------------------------

/// Translates a source descriptor into byte access.
pub trait SourceDriver: Send + Sync {
    /// The source type this driver serves.
    fn source_type(&self) -> SourceType;

    /// Whether the source can currently be reached and opened.
    fn is_available(&self, source: &StoreSource) -> bool;

    /// Resolves the source into a read-ready blob source for the given
    /// content kind.
    fn init(&self, source: &StoreSource, content: ContentKind) -> Result<BlobSource, SourceError>;
}

//------------ RegistryObserver ----------------------------------------------

/// Notified synchronously when the set of registered drivers changes.
pub trait RegistryObserver: Send + Sync {
    fn driver_registered(&self, source_type: SourceType);
    fn driver_unregistered(&self, source_type: SourceType);
}

//------------ DriverRegistry ------------------------------------------------

/// The set of named drivers, keyed by source type.
///
/// Registering a driver for a type that already has one replaces the
/// earlier registration.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: RwLock<Vec<Arc<dyn SourceDriver>>>,
    observers: RwLock<Vec<Arc<dyn RegistryObserver>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a driver and notifies observers.
    pub fn register(&self, driver: Arc<dyn SourceDriver>) {
        let source_type = driver.source_type();
        {
            let mut drivers = self.drivers.write().unwrap();
            drivers.retain(|d| d.source_type() != source_type);
            drivers.push(driver);
        }
        for observer in self.observers.read().unwrap().iter() {
            observer.driver_registered(source_type);
        }
    }

    /// Removes the driver for a type, notifying observers if one was
    /// present.
    pub fn unregister(&self, source_type: SourceType) -> Option<Arc<dyn SourceDriver>> {
        let removed = {
            let mut drivers = self.drivers.write().unwrap();
            let index = drivers.iter().position(|d| d.source_type() == source_type)?;
            drivers.remove(index)
        };
        for observer in self.observers.read().unwrap().iter() {
            observer.driver_unregistered(source_type);
        }
        Some(removed)
    }

    /// Returns the driver for a source type.
    pub fn find(&self, source_type: SourceType) -> Option<Arc<dyn SourceDriver>> {
        self.drivers
            .read()
            .unwrap()
            .iter()
            .find(|d| d.source_type() == source_type)
            .cloned()
    }

    /// Adds an observer for registry changes.
    pub fn observe(&self, observer: Arc<dyn RegistryObserver>) {
        self.observers.write().unwrap().push(observer);
    }
}

//------------ PathFilter ----------------------------------------------------

/// Include/exclude glob filters applied to relative paths.
///
/// An empty include list accepts everything; excludes are applied after
/// includes.
#[derive(Clone, Debug, Default)]
pub struct PathFilter {
    includes: Option<GlobSet>,
    excludes: Option<GlobSet>,
}

impl PathFilter {
    /// Builds a filter from glob pattern lists.
    pub fn new(includes: &[String], excludes: &[String]) -> Result<Self, SourceError> {
        Ok(PathFilter {
            includes: Self::build(includes)?,
            excludes: Self::build(excludes)?,
        })
    }

    /// A filter accepting every path.
    pub fn accept_all() -> Self {
        Self::default()
    }

    /// Builds the filter declared on a source.
    pub fn for_source(source: &StoreSource) -> Result<Self, SourceError> {
        Self::new(&source.includes, &source.excludes)
    }

    fn build(patterns: &[String]) -> Result<Option<GlobSet>, SourceError> {
        if patterns.is_empty() {
            return Ok(None);
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern).map_err(|e| SourceError::Pattern(pattern.clone(), e.to_string()))?);
        }
        Ok(Some(builder.build().map_err(|e| {
            SourceError::Pattern(patterns.join(","), e.to_string())
        })?))
    }

    /// Whether the relative path passes the filter.
    pub fn matches(&self, rel_path: &Path) -> bool {
        if let Some(includes) = &self.includes {
            if !includes.is_match(rel_path) {
                return false;
            }
        }
        if let Some(excludes) = &self.excludes {
            if excludes.is_match(rel_path) {
                return false;
            }
        }
        true
    }
}

//------------ BlobSource ----------------------------------------------------

/// A resolved, read-ready view over one source's content.
///
/// Either rooted at a directory, with the source's include/exclude filters
/// applied to every access, or the empty source standing in for an
/// unreachable one.
#[derive(Clone, Debug)]
pub struct BlobSource {
    root: Option<PathBuf>,
    filter: PathFilter,
}

impl BlobSource {
    /// Creates a blob source rooted at a directory.
    pub fn rooted(root: PathBuf, filter: PathFilter) -> Self {
        BlobSource {
            root: Some(root),
            filter,
        }
    }

    /// The empty blob source: no root, no entries.
    pub fn empty() -> Self {
        BlobSource {
            root: None,
            filter: PathFilter::accept_all(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// The directory this source is rooted at, if any.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Whether a relative path exists in this source and passes its
    /// filters.
    pub fn contains(&self, rel_path: &str) -> bool {
        self.resolve(rel_path).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Reads the bytes at a relative path.
    ///
    /// Returns `None` for paths that are absent, filtered out, or try to
    /// escape the root.
    pub fn read(&self, rel_path: &str) -> Result<Option<Bytes>, IoError> {
        let Some(path) = self.resolve(rel_path) else {
            return Ok(None);
        };
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(|e| IoError::new(format!("cannot read '{}'", path.display()), e))?;
        Ok(Some(Bytes::from(bytes)))
    }

    /// A restartable reader over all entries of this source.
    pub fn reader(&self) -> Option<DirectoryReader> {
        self.root
            .clone()
            .map(|root| DirectoryReader::new(root, self.filter.clone()))
    }

    fn resolve(&self, rel_path: &str) -> Option<PathBuf> {
        let root = self.root.as_ref()?;
        let rel = Path::new(rel_path);

        // Only plain relative components; no escaping the root.
        if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return None;
        }
        if !self.filter.matches(rel) {
            return None;
        }
        Some(root.join(rel))
    }
}

//------------ SourceError ---------------------------------------------------

/// This type defines possible errors for source resolution.
#[derive(Debug)]
pub enum SourceError {
    /// The source cannot be reached or opened.
    Unavailable(String),

    /// Extracting an archive failed; the source is treated as unavailable.
    Extraction(IoError),

    /// Some other I/O problem.
    Io(IoError),

    /// An include/exclude pattern did not compile.
    Pattern(String, String),
}

impl From<IoError> for SourceError {
    fn from(e: IoError) -> Self {
        SourceError::Io(e)
    }
}

impl Display for SourceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Unavailable(source) => write!(f, "source unavailable: {}", source),
            SourceError::Extraction(e) => write!(f, "archive extraction failed: {}", e),
            SourceError::Io(e) => e.fmt(f),
            SourceError::Pattern(pattern, e) => write!(f, "invalid glob pattern '{}': {}", pattern, e),
        }
    }
}

impl std::error::Error for SourceError {}

//------------ Tests ---------------------------------------------------------
