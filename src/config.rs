//! Configuration file
//!
//! Stored as JSON, by default in ~/.config/vtrie/config.json. Every field has
//! a default, so a partial file (or none) is valid.

use crate::gc::{GcOptions, GcStrategyKind, RetentionPolicy};
use crate::model::HashAlgorithm;
use crate::store::keys::validate_namespace;
use crate::store::{CommitConfig, Durability};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrieConfig {
    /// Keyspace prefix; several tries can share one backend
    pub namespace: String,
    pub hash: HashAlgorithm,
    pub durability: Durability,
    pub batch_size_hint: usize,
    /// Decoded nodes kept in memory; 0 disables the cache
    pub node_cache_capacity: usize,
    pub sqlite_table_prefix: String,
    pub gc: GcConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub strategy: GcStrategyKind,
    pub retention: RetentionPolicy,
    pub batch_size: usize,
}

impl Default for TrieConfig {
    fn default() -> Self {
        TrieConfig {
            namespace: "default".into(),
            hash: HashAlgorithm::default(),
            durability: Durability::default(),
            batch_size_hint: CommitConfig::default().batch_size_hint,
            node_cache_capacity: 4096,
            sqlite_table_prefix: "vtrie_".into(),
            gc: GcConfig::default(),
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            strategy: GcStrategyKind::default(),
            retention: RetentionPolicy::default(),
            batch_size: GcOptions::default().batch_size,
        }
    }
}

impl TrieConfig {
    /// ~/.config/vtrie/config.json
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not find config directory".into()))?;
        Ok(dir.join("vtrie").join("config.json"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config: TrieConfig = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else the default file if it exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Ok(default) if default.exists() => Self::load(&default),
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::Config(format!("Failed to create config dir: {}", e)))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        validate_namespace(&self.namespace)?;
        if self.sqlite_table_prefix.is_empty()
            || !self
                .sqlite_table_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::Config(format!(
                "sqlite_table_prefix '{}' must be ASCII letters, digits or '_'",
                self.sqlite_table_prefix
            )));
        }
        if self.gc.batch_size == 0 {
            return Err(Error::Config("gc.batch_size must be positive".into()));
        }
        Ok(())
    }

    pub fn commit_config(&self) -> CommitConfig {
        CommitConfig {
            durability: self.durability,
            batch_size_hint: self.batch_size_hint,
        }
    }

    pub fn gc_options(&self) -> GcOptions {
        GcOptions {
            batch_size: self.gc.batch_size,
            durability: self.durability,
            ..GcOptions::default()
        }
    }
}
