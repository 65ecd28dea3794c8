//! Configuration du worker : fichier JSON, surchargé par les variables `AETHER_SYNC_*`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::index::DEFAULT_FILE_TYPES;
use crate::remote::S3StoreConfig;

pub const ENV_DATA_DIR: &str = "AETHER_SYNC_DATA_DIR";
pub const ENV_IDENTITY_FILE: &str = "AETHER_SYNC_IDENTITY_FILE";
pub const ENV_FILE_TYPES: &str = "AETHER_SYNC_FILE_TYPES";
pub const ENV_REMOTE_DIR: &str = "AETHER_SYNC_REMOTE_DIR";

const CACHE_DB_FILE: &str = "cached-indexes.db";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Hub distant utilisé par la session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RemoteConfig {
    /// Hub émulé sur un répertoire local.
    Directory { root: PathBuf },
    S3(S3StoreConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub data_dir: PathBuf,
    pub identity_file: PathBuf,
    #[serde(default = "default_file_types")]
    pub file_types: Vec<String>,
    pub remote: RemoteConfig,
}

fn default_file_types() -> Vec<String> {
    DEFAULT_FILE_TYPES.iter().map(|t| t.to_string()).collect()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from(".aether-sync");
        Self {
            identity_file: data_dir.join("identity.json"),
            remote: RemoteConfig::Directory {
                root: data_dir.join("hub"),
            },
            data_dir,
            file_types: default_file_types(),
        }
    }
}

impl WorkerConfig {
    /// Charge `path` (ou les valeurs par défaut) puis applique l'environnement.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_overrides<F: Fn(&str) -> Option<String>>(&mut self, var: F) {
        if let Some(dir) = var(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(file) = var(ENV_IDENTITY_FILE) {
            self.identity_file = PathBuf::from(file);
        }
        if let Some(types) = var(ENV_FILE_TYPES) {
            self.file_types = types
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(root) = var(ENV_REMOTE_DIR) {
            self.remote = RemoteConfig::Directory {
                root: PathBuf::from(root),
            };
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.file_types.is_empty() {
            return Err(ConfigError::Invalid("file_types must not be empty".to_string()));
        }
        if let Some(bad) = self
            .file_types
            .iter()
            .find(|t| t.contains('/') || t.trim() != t.as_str())
        {
            return Err(ConfigError::Invalid(format!("invalid file type: {bad:?}")));
        }
        Ok(())
    }

    /// Base SQLCipher du cache local.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(CACHE_DB_FILE)
    }
}
