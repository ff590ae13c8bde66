//! The HTTP source driver.
//!
//! HTTP sources are always archives: the zip is fetched into the local
//! fetch directory, unpacked like any local archive, and served from the
//! extracted tree. A failed fetch leaves the source empty for this run
//! rather than failing the store.

use std::fmt::{Display, Formatter};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, error, warn};
use tempfile::NamedTempFile;
use url::Url;

use crate::error::IoError;
use crate::store::archive::{destination_name, extract_archive};
use crate::store::driver::{BlobSource, PathFilter, SourceDriver, SourceError};
use crate::store::fs::{content_root, entry_predicate};
use crate::store::{ContentKind, SourceType, StoreSource};

const HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(120);

//------------ HttpDriver ----------------------------------------------------

pub struct HttpDriver {
    client: reqwest::blocking::Client,
    fetch_dir: PathBuf,
    extract_dir: PathBuf,
}

impl HttpDriver {
    pub fn new(fetch_dir: PathBuf, extract_dir: PathBuf) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_CLIENT_TIMEOUT)
            .build()
            .map_err(|e| FetchError::request("(client setup)", e))?;
        Ok(HttpDriver {
            client,
            fetch_dir,
            extract_dir,
        })
    }

    /// The local file a source's archive is fetched to.
    fn fetch_target(&self, url: &Url) -> PathBuf {
        let name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .unwrap_or("download.zip");
        self.fetch_dir.join(destination_name(name.as_ref()))
    }

    /// Downloads the archive, returning the local path it was stored at.
    fn fetch(&self, url: &Url, target: &std::path::Path) -> Result<(), FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|e| FetchError::request(url.as_str(), e))?;
        if !response.status().is_success() {
            return Err(FetchError::Status(
                url.to_string(),
                response.status().as_u16(),
            ));
        }
        let body = response
            .bytes()
            .map_err(|e| FetchError::request(url.as_str(), e))?;

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FetchError::Io(IoError::new(format!("cannot create '{}'", parent.display()), e))
            })?;
        }
        let mut tmp = NamedTempFile::new_in(&self.fetch_dir).map_err(|e| {
            FetchError::Io(IoError::new(
                format!("cannot create temp file under '{}'", self.fetch_dir.display()),
                e,
            ))
        })?;
        tmp.write_all(&body).map_err(|e| {
            FetchError::Io(IoError::new(format!("cannot write '{}'", target.display()), e))
        })?;
        tmp.persist(target).map_err(|e| {
            FetchError::Io(IoError::new(format!("cannot persist '{}'", target.display()), e.error))
        })?;
        debug!("fetched '{}' to '{}'", url, target.display());
        Ok(())
    }
}

impl SourceDriver for HttpDriver {
    fn source_type(&self) -> SourceType {
        SourceType::Http
    }

    fn is_available(&self, source: &StoreSource) -> bool {
        let Ok(url) = Url::parse(&source.src) else {
            return false;
        };
        match self.client.head(url).send() {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    fn init(&self, source: &StoreSource, content: ContentKind) -> Result<BlobSource, SourceError> {
        if !source.archive {
            return Err(SourceError::Unavailable(format!(
                "{} (http sources must be archives)",
                source
            )));
        }
        let url = Url::parse(&source.src)
            .map_err(|e| SourceError::Unavailable(format!("{} ({})", source, e)))?;
        let target = self.fetch_target(&url);

        if source.archive_cache && target.is_file() {
            debug!("reusing fetched archive at '{}'", target.display());
        } else if let Err(e) = self.fetch(&url, &target) {
            if target.is_file() {
                warn!("fetch of '{}' failed, using earlier copy: {}", url, e);
            } else {
                error!("fetch of '{}' failed: {}", url, e);
                return Ok(BlobSource::empty());
            }
        }

        let dest = extract_archive(
            &target,
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

//------------ FetchError ----------------------------------------------------

/// This type defines possible errors when fetching an archive.
#[derive(Debug)]
pub enum FetchError {
    /// The request could not be executed.
    Request(String, reqwest::Error),

    /// The server answered with a non-success status.
    Status(String, u16),

    /// Storing the fetched archive failed.
    Io(IoError),
}

impl FetchError {
    fn request(uri: &str, e: reqwest::Error) -> Self {
        FetchError::Request(uri.to_string(), e)
    }
}

impl Display for FetchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Request(uri, e) => write!(f, "request to '{}' failed: {}", uri, e),
            FetchError::Status(uri, status) => {
                write!(f, "request to '{}' answered with status {}", uri, status)
            }
            FetchError::Io(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for FetchError {}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::write_zip;

    fn driver(dir: &std::path::Path) -> HttpDriver {
        HttpDriver::new(dir.join("fetch"), dir.join("extract")).unwrap()
    }

    #[test]
    fn non_archive_source_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = StoreSource::new(SourceType::Http, "http://example.org/tree");
        let result = driver(dir.path()).init(&source, ContentKind::All);
        assert!(matches!(result, Err(SourceError::Unavailable(_))));
    }

    #[test]
    fn fetch_target_derives_from_url_path() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        let url = Url::parse("http://example.org/packs/pack%20v1.zip").unwrap();
        assert_eq!(
            driver.fetch_target(&url),
            dir.path().join("fetch/pack_20v1.zip")
        );
        let bare = Url::parse("http://example.org/").unwrap();
        assert_eq!(driver.fetch_target(&bare), dir.path().join("fetch/download.zip"));
    }

    #[test]
    fn unreachable_host_yields_empty_source() {
        let dir = tempfile::tempdir().unwrap();
        // Nothing listens on port 1; the connection is refused immediately.
        let source = StoreSource::new(SourceType::Http, "http://127.0.0.1:1/pack.zip")
            .with_archive(None, false);
        let blob = driver(dir.path()).init(&source, ContentKind::All).unwrap();
        assert!(blob.is_empty());
    }

    #[test]
    fn cached_fetch_skips_the_network() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());

        write_zip(&dir.path().join("fetch/pack.zip"), &[("a.json", b"{}")]);

        let source = StoreSource::new(SourceType::Http, "http://127.0.0.1:1/pack.zip")
            .with_archive(None, true);
        let blob = driver.init(&source, ContentKind::All).unwrap();
        assert!(blob.read("a.json").unwrap().is_some());
    }
}
