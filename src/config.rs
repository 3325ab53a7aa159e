//! Device configuration and its on-disk form.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::fs::{ensure_exists, safe_write_all};

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("device is not initialized, run 'initialize' first")]
    NotInitialized,

    #[error("unable to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("unable to write {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("invalid configuration in {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Connection details for one catalog collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionConfig {
    /// Catalog server base URL.
    pub server: String,
    /// Collection name to list targets from.
    pub collection: String,
    /// Additional root CA for talking to the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,
}

/// Persistent device configuration, stored as `config.json` in the
/// config dir.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    #[serde(default)]
    pub hardware_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<CollectionConfig>,

    /// Absent when the device carries no personality.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personality: Option<CollectionConfig>,

    /// Registry prefix whose images require content-trust pulls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted_registry: Option<String>,
}

impl DeviceConfig {
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ConfigError::NotInitialized)
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn store(&self, config_dir: &Path) -> Result<(), ConfigError> {
        ensure_exists(config_dir).map_err(|source| ConfigError::Write {
            path: config_dir.to_owned(),
            source,
        })?;

        let path = config_dir.join(CONFIG_FILE);
        let data = serde_json::to_vec_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        safe_write_all(&path, data).map_err(|source| ConfigError::Write { path, source })
    }
}
