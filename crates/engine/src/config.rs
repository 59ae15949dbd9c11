use std::path::Path;

use pool::{DEFAULT_DOC_ROOT, InstallLayout, PoolConfig, config::is_truthy};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "phpw.json";
pub const DEFAULT_ENTRY: &str = "index.php";
pub const DEFAULT_IMAGE: &str = "php";
pub const DEFAULT_ARCHIVE: &str = "www.zip";

/// Runtime settings. Every field is optional so layers can be merged:
/// `phpw.json`, then environment, then command-line flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub units: Option<usize>,
    pub debug: Option<bool>,
    pub doc_root: Option<String>,
    pub entry: Option<String>,
    pub image: Option<String>,
    pub archive: Option<String>,
    pub warm_up: Option<String>,
}

impl RuntimeConfig {
    /// Read `phpw.json` from `directory`, falling back to defaults when it
    /// is missing or unreadable.
    pub fn load(directory: &Path) -> Self {
        let path = directory.join(CONFIG_FILE);
        if !path.exists() {
            return Self::default();
        }
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) => {
                tracing::warn!("Failed to read {}: {}", path.display(), err);
                return Self::default();
            }
        };
        match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("Failed to parse {}: {}", path.display(), err);
                Self::default()
            }
        }
    }

    /// Settings taken from environment variables:
    /// - PHPW_UNITS, PHPW_DEBUG, PHPW_WARM_UP
    /// - PHPW_DOC_ROOT, PHPW_ENTRY, PHPW_IMAGE, PHPW_ARCHIVE
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| get(key).filter(|value| !value.trim().is_empty());
        Self {
            units: var("PHPW_UNITS").and_then(|value| value.parse().ok()),
            debug: var("PHPW_DEBUG").map(|value| is_truthy(&value)),
            doc_root: var("PHPW_DOC_ROOT"),
            entry: var("PHPW_ENTRY"),
            image: var("PHPW_IMAGE"),
            archive: var("PHPW_ARCHIVE"),
            warm_up: var("PHPW_WARM_UP"),
        }
    }

    /// Fields set in `overrides` win.
    pub fn merge(self, overrides: RuntimeConfig) -> Self {
        Self {
            units: overrides.units.or(self.units),
            debug: overrides.debug.or(self.debug),
            doc_root: overrides.doc_root.or(self.doc_root),
            entry: overrides.entry.or(self.entry),
            image: overrides.image.or(self.image),
            archive: overrides.archive.or(self.archive),
            warm_up: overrides.warm_up.or(self.warm_up),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        let defaults = PoolConfig::default();
        PoolConfig {
            num_units: self
                .units
                .filter(|units| *units > 0)
                .unwrap_or(defaults.num_units),
            debug: self.debug.unwrap_or(defaults.debug),
            warm_up_script: self
                .warm_up
                .clone()
                .filter(|script| !script.trim().is_empty()),
        }
    }

    pub fn layout(&self) -> InstallLayout {
        InstallLayout::new(
            self.doc_root.as_deref().unwrap_or(DEFAULT_DOC_ROOT),
            self.archive.as_deref().unwrap_or(DEFAULT_ARCHIVE),
        )
    }

    pub fn image_url(&self) -> &str {
        self.image.as_deref().unwrap_or(DEFAULT_IMAGE)
    }

    pub fn entry(&self) -> &str {
        self.entry.as_deref().unwrap_or(DEFAULT_ENTRY)
    }
}
