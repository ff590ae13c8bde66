//! The resource store: raw binary content served through the source list.
//!
//! Resources are never decoded or cached in memory; every read goes to the
//! resolved sources. Declaration order encodes priority, so lookups scan
//! the resolved list back to front and the last source holding a path
//! wins.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use log::{error, warn};
use tokio::sync::watch;

use crate::error::IoError;
use crate::store::driver::{BlobSource, DriverRegistry};
use crate::store::{ContentKind, Store, StoreSource};

//------------ ResourceStore -------------------------------------------------

pub struct ResourceStore {
    store: Store,
    registry: Arc<DriverRegistry>,
    resolved: RwLock<Vec<ResolvedSource>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

struct ResolvedSource {
    prefix: Option<String>,
    blob: BlobSource,
}

impl ResourceStore {
    pub fn new(store: Store, registry: Arc<DriverRegistry>) -> Arc<Self> {
        let (ready_tx, ready_rx) = watch::channel(false);
        Arc::new(ResourceStore {
            store,
            registry,
            resolved: RwLock::new(Vec::new()),
            ready_tx,
            ready_rx,
        })
    }

    /// Resolves every resource-serving source and marks the store ready.
    ///
    /// A source without a registered driver, an unreachable source, or one
    /// whose resolution fails is logged and skipped; the store serves
    /// whatever did resolve. This issues blocking I/O and possibly network
    /// fetches, so call it from a blocking context.
    pub fn initialize(&self) {
        let mut resolved = Vec::new();
        for source in self.store.sources_for(ContentKind::Resources) {
            match self.resolve(source) {
                Some(blob) => resolved.push(ResolvedSource {
                    prefix: source.prefix.clone(),
                    blob,
                }),
                None => continue,
            }
        }
        *self.resolved.write().unwrap() = resolved;
        let _ = self.ready_tx.send(true);
    }

    /// Runs [`initialize`][Self::initialize] on the blocking thread pool.
    pub fn spawn_initialize(self: &Arc<Self>) {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.initialize());
    }

    /// Completes once the initial resolution pass has finished.
    pub async fn ready(&self) {
        let mut rx = self.ready_rx.clone();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    fn resolve(&self, source: &StoreSource) -> Option<BlobSource> {
        let Some(driver) = self.registry.find(source.source_type) else {
            error!("no driver registered for source {}", source);
            return None;
        };
        if !driver.is_available(source) {
            warn!("source {} unavailable, skipping", source);
            return None;
        }
        match driver.init(source, ContentKind::Resources) {
            Ok(blob) => Some(blob),
            Err(e) => {
                error!("cannot resolve source {}: {}", source, e);
                None
            }
        }
    }

    /// Reads a resource by its relative path.
    ///
    /// Later sources override earlier ones.
    pub fn read(&self, rel_path: &str) -> Result<Option<Bytes>, IoError> {
        let resolved = self.resolved.read().unwrap();
        for entry in resolved.iter().rev() {
            let Some(local) = entry.local_path(rel_path) else {
                continue;
            };
            if let Some(bytes) = entry.blob.read(&local)? {
                return Ok(Some(bytes));
            }
        }
        Ok(None)
    }

    /// Whether any source holds the given resource.
    pub fn contains(&self, rel_path: &str) -> bool {
        let resolved = self.resolved.read().unwrap();
        resolved.iter().any(|entry| {
            entry
                .local_path(rel_path)
                .map(|local| entry.blob.contains(&local))
                .unwrap_or(false)
        })
    }

    /// All resource paths across the sources, sorted and deduplicated,
    /// with mount prefixes applied.
    pub fn paths(&self) -> Result<Vec<PathBuf>, IoError> {
        let resolved = self.resolved.read().unwrap();
        let mut paths = BTreeSet::new();
        for entry in resolved.iter() {
            let Some(reader) = entry.blob.reader() else {
                continue;
            };
            for found in reader.entries() {
                let found = found?;
                let path = match &entry.prefix {
                    Some(prefix) => Path::new(prefix).join(found.rel_path()),
                    None => found.rel_path().to_path_buf(),
                };
                paths.insert(path);
            }
        }
        Ok(paths.into_iter().collect())
    }
}

impl ResolvedSource {
    /// Maps a store-wide path to this source's local path, honouring the
    /// mount prefix.
    fn local_path(&self, rel_path: &str) -> Option<String> {
        match &self.prefix {
            None => Some(rel_path.to_owned()),
            Some(prefix) => Path::new(rel_path)
                .strip_prefix(prefix)
                .ok()
                .map(|rest| rest.to_string_lossy().into_owned())
                .filter(|rest| !rest.is_empty()),
        }
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::store::fs::FsDriver;
    use crate::store::{SourceType, StoreSource};

    fn registry(dir: &Path) -> Arc<DriverRegistry> {
        let registry = Arc::new(DriverRegistry::new());
        registry.register(Arc::new(FsDriver::new(
            dir.to_path_buf(),
            dir.join("extract"),
            false,
        )));
        registry
    }

    fn seed(dir: &Path, rel: &str, content: &[u8]) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn resource_source(src: &str) -> StoreSource {
        StoreSource::new(SourceType::Fs, src).with_content(ContentKind::Resources)
    }

    #[test]
    fn later_sources_override_earlier_ones() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "base/logo.png", b"base");
        seed(dir.path(), "base/only-base.txt", b"base");
        seed(dir.path(), "override/logo.png", b"override");

        let store = Store::new(
            vec![resource_source("base"), resource_source("override")],
            false,
            false,
        );
        let resources = ResourceStore::new(store, registry(dir.path()));
        resources.initialize();

        assert_eq!(
            resources.read("logo.png").unwrap().as_deref(),
            Some(b"override".as_ref())
        );
        assert_eq!(
            resources.read("only-base.txt").unwrap().as_deref(),
            Some(b"base".as_ref())
        );
        assert!(resources.read("absent.txt").unwrap().is_none());
    }

    #[test]
    fn prefix_mounts_source_under_subtree() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "icons/home.svg", b"<svg/>");

        let mut source = resource_source("icons");
        source.prefix = Some("icons".to_owned());
        let store = Store::new(vec![source], false, false);
        let resources = ResourceStore::new(store, registry(dir.path()));
        resources.initialize();

        assert!(resources.read("icons/home.svg").unwrap().is_some());
        assert!(resources.read("home.svg").unwrap().is_none());
        assert!(resources.contains("icons/home.svg"));
    }

    #[test]
    fn unavailable_source_is_skipped() {
        crate::test::init_logging();
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "present/a.txt", b"a");

        let store = Store::new(
            vec![resource_source("missing"), resource_source("present")],
            false,
            false,
        );
        let resources = ResourceStore::new(store, registry(dir.path()));
        resources.initialize();

        assert!(resources.read("a.txt").unwrap().is_some());
    }

    #[test]
    fn paths_merge_sources_with_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "base/shared.txt", b"1");
        seed(dir.path(), "mounted/extra.txt", b"2");

        let mut mounted = resource_source("mounted");
        mounted.prefix = Some("extra".to_owned());
        let store = Store::new(vec![resource_source("base"), mounted], false, false);
        let resources = ResourceStore::new(store, registry(dir.path()));
        resources.initialize();

        let paths = resources.paths().unwrap();
        assert_eq!(
            paths,
            [PathBuf::from("extra/extra.txt"), PathBuf::from("shared.txt")]
        );
    }

    #[tokio::test]
    async fn ready_completes_after_initialization() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "base/a.txt", b"a");

        let store = Store::new(vec![resource_source("base")], false, false);
        let resources = ResourceStore::new(store, registry(dir.path()));

        resources.spawn_initialize();
        resources.ready().await;
        assert!(resources.contains("a.txt"));
    }
}
