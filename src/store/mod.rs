//! Store sources: the places data can be read from and written to.
//!
//! A [`Store`] holds an ordered, immutable list of [`StoreSource`]
//! descriptors. Declaration order encodes priority: later entries override
//! earlier ones for reads, and the last read-write entry of a type is the
//! write target. The topology is fixed for the process lifetime.

pub mod archive;
pub mod driver;
pub mod fs;
pub mod http;
pub mod reader;

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::Deserialize;

//------------ SourceType ----------------------------------------------------

/// The kind of backend a source is served by.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// A local filesystem tree or archive file.
    Fs,

    /// A zip archive fetched over HTTP.
    Http,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Fs => "fs",
            SourceType::Http => "http",
        }
    }
}

impl Display for SourceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_str().fmt(f)
    }
}

impl FromStr for SourceType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fs" => Ok(SourceType::Fs),
            "http" => Ok(SourceType::Http),
            other => Err(UnknownVariant("source type", other.to_owned())),
        }
    }
}

//------------ ContentKind ---------------------------------------------------

/// What a source holds, or what a consumer asks for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// Structured entity values.
    Entities,

    /// The mutation event stream that produces entities.
    Events,

    /// Arbitrary binary resources.
    Resources,

    /// Everything; matches any request.
    All,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Entities => "entities",
            ContentKind::Events => "events",
            ContentKind::Resources => "resources",
            ContentKind::All => "all",
        }
    }

    /// Whether a source declaring `declared` can satisfy a request for
    /// `self`.
    ///
    /// A declaration matches exactly or through the universal `All`
    /// marker. As a special case a request for events is satisfiable by a
    /// source declaring plain entity content, since events are the append
    /// log that produces entities.
    pub fn satisfied_by(self, declared: ContentKind) -> bool {
        declared == self
            || declared == ContentKind::All
            || (self == ContentKind::Events && declared == ContentKind::Entities)
    }
}

impl Display for ContentKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_str().fmt(f)
    }
}

//------------ SourceMode ----------------------------------------------------

/// Whether a source may be written to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
pub enum SourceMode {
    #[serde(rename = "rw")]
    ReadWrite,

    #[serde(rename = "ro")]
    ReadOnly,
}

impl Display for SourceMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceMode::ReadWrite => "rw",
            SourceMode::ReadOnly => "ro",
        }
        .fmt(f)
    }
}

//------------ StoreSource ---------------------------------------------------

/// A declarative descriptor of one place data can be read from or written
/// to.
///
/// Produced by configuration loading and treated as read-only input after
/// that.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSource {
    /// The backend kind serving this source.
    #[serde(rename = "type")]
    pub source_type: SourceType,

    /// What the source holds.
    #[serde(default = "StoreSource::default_content")]
    pub content: ContentKind,

    /// Whether the source may be written to.
    #[serde(default = "StoreSource::default_mode")]
    pub mode: SourceMode,

    /// Directory, archive path, or URL, depending on type and flags.
    pub src: String,

    /// Whether `src` refers to a zip archive instead of a directory.
    #[serde(default)]
    pub archive: bool,

    /// Path within the archive that entries are taken relative to.
    #[serde(default)]
    pub archive_root: Option<String>,

    /// Keep the extracted tree between runs instead of re-extracting.
    #[serde(default)]
    pub archive_cache: bool,

    /// Path prefix this source's content is mounted under.
    #[serde(default)]
    pub prefix: Option<String>,

    /// Glob patterns selecting entries; empty means everything.
    #[serde(default)]
    pub includes: Vec<String>,

    /// Glob patterns excluding entries; applied after includes.
    #[serde(default)]
    pub excludes: Vec<String>,
}

impl StoreSource {
    fn default_content() -> ContentKind {
        ContentKind::All
    }

    fn default_mode() -> SourceMode {
        SourceMode::ReadOnly
    }

    /// Creates a read-only source of the given type with defaults.
    pub fn new(source_type: SourceType, src: impl Into<String>) -> Self {
        StoreSource {
            source_type,
            content: Self::default_content(),
            mode: Self::default_mode(),
            src: src.into(),
            archive: false,
            archive_root: None,
            archive_cache: false,
            prefix: None,
            includes: Vec::new(),
            excludes: Vec::new(),
        }
    }

    pub fn with_content(mut self, content: ContentKind) -> Self {
        self.content = content;
        self
    }

    pub fn with_mode(mut self, mode: SourceMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_archive(mut self, archive_root: Option<&str>, archive_cache: bool) -> Self {
        self.archive = true;
        self.archive_root = archive_root.map(|s| s.to_owned());
        self.archive_cache = archive_cache;
        self
    }

    pub fn with_filters(mut self, includes: &[&str], excludes: &[&str]) -> Self {
        self.includes = includes.iter().map(|s| s.to_string()).collect();
        self.excludes = excludes.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Whether this source may be written to.
    pub fn is_writable(&self) -> bool {
        self.mode == SourceMode::ReadWrite
    }

    /// Whether this source serves the requested content kind.
    pub fn serves(&self, content: ContentKind) -> bool {
        content.satisfied_by(self.content)
    }

    /// Whether the source holds a single content kind rather than a tree
    /// subdivided by content-kind prefix.
    pub fn is_single_content(&self) -> bool {
        self.content != ContentKind::All
    }
}

impl Display for StoreSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} ({}, {})", self.source_type, self.src, self.content, self.mode)
    }
}

//------------ Store ---------------------------------------------------------

/// An ordered, immutable list of store sources.
#[derive(Clone, Debug)]
pub struct Store {
    sources: Vec<StoreSource>,
    writable: bool,
    watchable: bool,
}

impl Store {
    pub fn new(sources: Vec<StoreSource>, writable: bool, watchable: bool) -> Self {
        Store {
            sources,
            writable,
            watchable,
        }
    }

    /// All sources in declaration order.
    pub fn sources(&self) -> &[StoreSource] {
        &self.sources
    }

    /// All sources of the given type, preserving declaration order.
    pub fn sources_of_type(&self, source_type: SourceType) -> Vec<&StoreSource> {
        self.sources.iter().filter(|s| s.source_type == source_type).collect()
    }

    /// All sources serving the given content kind, preserving declaration
    /// order.
    pub fn sources_for(&self, content: ContentKind) -> Vec<&StoreSource> {
        self.sources.iter().filter(|s| s.serves(content)).collect()
    }

    /// The write target for the given type: the last declared read-write
    /// source of that type, so later sources act as overrides.
    pub fn writable_source(&self, source_type: SourceType) -> Option<&StoreSource> {
        self.sources
            .iter()
            .rev()
            .find(|s| s.source_type == source_type && s.is_writable())
    }

    /// Whether the store as a whole accepts writes.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Whether sources should be watched for external changes.
    pub fn is_watchable(&self) -> bool {
        self.watchable
    }
}

//------------ UnknownVariant ------------------------------------------------

/// A string did not name a known enum variant.
#[derive(Clone, Debug)]
pub struct UnknownVariant(&'static str, String);

impl Display for UnknownVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown {}: '{}'", self.0, self.1)
    }
}

impl std::error::Error for UnknownVariant {}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_matching() {
        assert!(ContentKind::Resources.satisfied_by(ContentKind::Resources));
        assert!(ContentKind::Resources.satisfied_by(ContentKind::All));
        assert!(!ContentKind::Resources.satisfied_by(ContentKind::Entities));

        // Events are the append log that produces entities.
        assert!(ContentKind::Events.satisfied_by(ContentKind::Entities));
        assert!(!ContentKind::Entities.satisfied_by(ContentKind::Events));
    }

    #[test]
    fn sources_for_preserves_declaration_order() {
        let store = Store::new(
            vec![
                StoreSource::new(SourceType::Fs, "a").with_content(ContentKind::Resources),
                StoreSource::new(SourceType::Fs, "b").with_content(ContentKind::Entities),
                StoreSource::new(SourceType::Http, "c").with_content(ContentKind::All),
                StoreSource::new(SourceType::Fs, "d").with_content(ContentKind::Resources),
            ],
            true,
            false,
        );

        let resources: Vec<&str> = store
            .sources_for(ContentKind::Resources)
            .iter()
            .map(|s| s.src.as_str())
            .collect();
        assert_eq!(resources, ["a", "c", "d"]);
    }

    #[test]
    fn writable_source_scans_in_reverse() {
        let store = Store::new(
            vec![
                StoreSource::new(SourceType::Fs, "first"),
                StoreSource::new(SourceType::Fs, "middle").with_mode(SourceMode::ReadWrite),
                StoreSource::new(SourceType::Fs, "last"),
            ],
            true,
            false,
        );

        let target = store.writable_source(SourceType::Fs).unwrap();
        assert_eq!(target.src, "middle");
        assert!(store.writable_source(SourceType::Http).is_none());
    }

    #[test]
    fn last_writable_of_type_wins() {
        let store = Store::new(
            vec![
                StoreSource::new(SourceType::Fs, "early").with_mode(SourceMode::ReadWrite),
                StoreSource::new(SourceType::Fs, "late").with_mode(SourceMode::ReadWrite),
            ],
            true,
            false,
        );

        assert_eq!(store.writable_source(SourceType::Fs).unwrap().src, "late");
    }

    #[test]
    fn descriptor_deserializes_with_defaults() {
        let source: StoreSource = toml::from_str(
            r#"
            type = "fs"
            src = "entities"
            "#,
        )
        .unwrap();

        assert_eq!(source.source_type, SourceType::Fs);
        assert_eq!(source.content, ContentKind::All);
        assert_eq!(source.mode, SourceMode::ReadOnly);
        assert!(!source.archive);
        assert!(source.includes.is_empty());

        let source: StoreSource = toml::from_str(
            r#"
            type = "http"
            content = "resources"
            mode = "rw"
            src = "https://example.org/pack.zip"
            archive = true
            archive_root = "pack"
            archive_cache = true
            includes = ["**/*.json"]
            "#,
        )
        .unwrap();

        assert_eq!(source.source_type, SourceType::Http);
        assert_eq!(source.content, ContentKind::Resources);
        assert_eq!(source.mode, SourceMode::ReadWrite);
        assert!(source.archive);
        assert_eq!(source.archive_root.as_deref(), Some("pack"));
        assert!(source.archive_cache);
        assert_eq!(source.includes, ["**/*.json"]);
    }

    #[test]
    fn descriptor_rejects_unknown_fields() {
        let result: Result<StoreSource, _> = toml::from_str(
            r#"
            type = "fs"
            src = "entities"
            archiveRoot = "pack"
            "#,
        );
        assert!(result.is_err());
    }
}
