//! Configuration of the store process.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::Arc;
use std::{env, fs};

use log::info;
use serde::Deserialize;

use crate::error::IoError;
use crate::store::driver::DriverRegistry;
use crate::store::fs::FsDriver;
use crate::store::http::{FetchError, HttpDriver};
use crate::store::{ContentKind, SourceMode, SourceType, Store, StoreSource};

/// Overrides the configured data directory when set.
pub const DATA_DIR_ENV: &str = "STRATA_DATA_DIR";

//------------ ConfigDefaults ------------------------------------------------

struct ConfigDefaults;

impl ConfigDefaults {
    fn data_dir() -> PathBuf {
        PathBuf::from("./data")
    }

    fn cache_dir() -> Option<PathBuf> {
        None
    }

    fn read_only() -> bool {
        false
    }

    fn watch() -> bool {
        false
    }

    fn auto_create() -> bool {
        true
    }

    fn sources() -> Vec<StoreSource> {
        vec![
            StoreSource::new(SourceType::Fs, "entities")
                .with_content(ContentKind::Entities)
                .with_mode(SourceMode::ReadWrite),
            StoreSource::new(SourceType::Fs, "resources")
                .with_content(ContentKind::Resources)
                .with_mode(SourceMode::ReadWrite),
        ]
    }
}

//------------ Config --------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Base directory relative source paths resolve against.
    #[serde(default = "ConfigDefaults::data_dir")]
    pub data_dir: PathBuf,

    /// Where fetched and extracted archives live. Defaults to `cache`
    /// under the data dir.
    #[serde(default = "ConfigDefaults::cache_dir")]
    cache_dir: Option<PathBuf>,

    /// Refuse all writes regardless of per-source modes.
    #[serde(default = "ConfigDefaults::read_only")]
    pub read_only: bool,

    /// Watch sources for external changes.
    #[serde(default = "ConfigDefaults::watch")]
    pub watch: bool,

    /// Create missing writable source directories on first use.
    #[serde(default = "ConfigDefaults::auto_create")]
    pub auto_create: bool,

    /// The ordered source list. Later entries override earlier ones.
    #[serde(default = "ConfigDefaults::sources")]
    pub sources: Vec<StoreSource>,
}

impl Config {
    /// Reads the configuration from a TOML file.
    ///
    /// The `STRATA_DATA_DIR` environment variable overrides the data dir
    /// from the file.
    pub fn read(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(IoError::new(format!("cannot read '{}'", path.display()), e)))?;
        let config = Self::parse_str(&text)?;
        info!("read configuration from '{}'", path.display());
        Ok(config)
    }

    pub fn parse_str(text: &str) -> Result<Self, ConfigError> {
        let mut config: Config =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if let Ok(dir) = env::var(DATA_DIR_ENV) {
            config.data_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    /// A configuration with defaults only, rooted at the given data dir.
    pub fn test_config(data_dir: PathBuf) -> Self {
        Config {
            data_dir,
            cache_dir: ConfigDefaults::cache_dir(),
            read_only: ConfigDefaults::read_only(),
            watch: ConfigDefaults::watch(),
            auto_create: ConfigDefaults::auto_create(),
            sources: ConfigDefaults::sources(),
        }
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("cache"))
    }

    /// The immutable source topology this configuration describes.
    pub fn store(&self) -> Store {
        Store::new(self.sources.clone(), !self.read_only, self.watch)
    }

    /// A driver registry covering the source types this crate ships.
    pub fn registry(&self) -> Result<Arc<DriverRegistry>, FetchError> {
        let cache_dir = self.cache_dir();
        let registry = Arc::new(DriverRegistry::new());
        registry.register(Arc::new(FsDriver::new(
            self.data_dir.clone(),
            cache_dir.join("extract"),
            self.auto_create && !self.read_only,
        )));
        registry.register(Arc::new(HttpDriver::new(
            cache_dir.join("fetch"),
            cache_dir.join("extract"),
        )?));
        Ok(registry)
    }
}

//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(IoError),
    Parse(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => e.fmt(f),
            ConfigError::Parse(e) => write!(f, "invalid configuration: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    // Tests touching the data dir serialize around the env override.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn empty_config_uses_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let config = Config::parse_str("").unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.cache_dir(), PathBuf::from("./data/cache"));
        assert!(!config.read_only);
        assert!(!config.watch);
        assert!(config.auto_create);
        assert_eq!(config.sources.len(), 2);
        assert!(config.sources.iter().all(|s| s.is_writable()));
    }

    #[test]
    fn full_config_parses() {
        let _lock = ENV_LOCK.lock().unwrap();
        let config = Config::parse_str(
            r#"
            data_dir = "/var/lib/strata"
            cache_dir = "/var/cache/strata"
            read_only = true
            watch = true

            [[sources]]
            type = "fs"
            content = "entities"
            mode = "rw"
            src = "entities"

            [[sources]]
            type = "http"
            content = "resources"
            src = "https://example.org/pack.zip"
            archive = true
            archive_cache = true
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/strata"));
        assert_eq!(config.cache_dir(), PathBuf::from("/var/cache/strata"));
        assert!(config.read_only);
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[1].source_type, SourceType::Http);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(Config::parse_str("dataDir = \"/tmp\"").is_err());
    }

    #[test]
    fn store_reflects_read_only_and_watch() {
        let mut config = Config::test_config(PathBuf::from("/tmp/d"));
        config.read_only = true;
        config.watch = true;

        let store = config.store();
        assert!(!store.is_writable());
        assert!(store.is_watchable());
        assert_eq!(store.sources().len(), 2);
    }

    #[test]
    fn env_var_overrides_data_dir() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::set_var(DATA_DIR_ENV, "/env/override");
        let config = Config::parse_str("data_dir = \"/from/file\"").unwrap();
        env::remove_var(DATA_DIR_ENV);
        assert_eq!(config.data_dir, PathBuf::from("/env/override"));
    }
}
