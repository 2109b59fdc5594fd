//! Persisted storage configuration: the sync root and one record per paired storage.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::atomic::write_atomic;

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed configuration in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub storage_type: String,
    pub display_name: String,
    /// Inode of the storage folder below the sync root, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_unique_id: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_root: Option<PathBuf>,
    #[serde(default)]
    pub csps: Vec<StorageRecord>,
}

/// What the directory watcher needs from configuration management.
pub trait StorageDirectoryConfig: Send + Sync {
    fn sync_root(&self) -> PathBuf;
    fn storages(&self) -> Vec<StorageRecord>;
    /// Records the folder identity of a storage; returns false for an unknown storage id.
    fn set_local_unique_id(&self, storage_id: &str, local_unique_id: u64) -> bool;
    fn write_config(&self) -> Result<(), ConfigError>;
}

/// JSON configuration file, rewritten atomically on every save.
#[derive(Debug)]
pub struct ConfigFile {
    path: PathBuf,
    fallback_root: PathBuf,
    inner: Mutex<ClientConfig>,
}

impl ConfigFile {
    /// Loads `path`; a missing file yields an empty configuration.
    pub fn load(path: impl Into<PathBuf>, fallback_root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data).map_err(|source| ConfigError::Json {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no configuration file, starting empty");
                ClientConfig::default()
            }
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        Ok(Self::with_config(path, fallback_root, config))
    }

    pub fn with_config(
        path: impl Into<PathBuf>,
        fallback_root: impl Into<PathBuf>,
        config: ClientConfig,
    ) -> Self {
        Self {
            path: path.into(),
            fallback_root: fallback_root.into(),
            inner: Mutex::new(config),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn config(&self) -> MutexGuard<'_, ClientConfig> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> ClientConfig {
        self.config().clone()
    }

    pub fn add_storage(&self, record: StorageRecord) {
        let mut config = self.config();
        config.csps.retain(|existing| existing.id != record.id);
        config.csps.push(record);
    }

    /// Applies a folder rename seen on disk and saves. Returns whether a record matched.
    pub fn rename_storage(&self, local_unique_id: u64, new_name: &str) -> Result<bool, ConfigError> {
        let renamed = {
            let mut config = self.config();
            match config
                .csps
                .iter_mut()
                .find(|record| record.local_unique_id == Some(local_unique_id))
            {
                Some(record) => {
                    info!(storage = %record.id, from = %record.display_name, to = new_name, "storage folder renamed");
                    record.display_name = new_name.to_string();
                    true
                }
                None => false,
            }
        };
        if renamed {
            self.write_config()?;
        }
        Ok(renamed)
    }

    /// Drops the record whose folder disappeared and saves.
    pub fn remove_storage(&self, local_unique_id: u64) -> Result<Option<StorageRecord>, ConfigError> {
        let removed = {
            let mut config = self.config();
            let position = config
                .csps
                .iter()
                .position(|record| record.local_unique_id == Some(local_unique_id));
            position.map(|index| config.csps.remove(index))
        };
        if let Some(record) = &removed {
            info!(storage = %record.id, name = %record.display_name, "storage folder removed");
            self.write_config()?;
        }
        Ok(removed)
    }
}

impl StorageDirectoryConfig for ConfigFile {
    fn sync_root(&self) -> PathBuf {
        self.config()
            .sync_root
            .clone()
            .unwrap_or_else(|| self.fallback_root.clone())
    }

    fn storages(&self) -> Vec<StorageRecord> {
        self.config().csps.clone()
    }

    fn set_local_unique_id(&self, storage_id: &str, local_unique_id: u64) -> bool {
        let mut config = self.config();
        match config.csps.iter_mut().find(|record| record.id == storage_id) {
            Some(record) => {
                record.local_unique_id = Some(local_unique_id);
                true
            }
            None => false,
        }
    }

    fn write_config(&self) -> Result<(), ConfigError> {
        let payload = {
            let config = self.config();
            serde_json::to_vec_pretty(&*config).map_err(|source| ConfigError::Json {
                path: self.path.clone(),
                source,
            })?
        };
        write_atomic(&self.path, &payload).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), "configuration written");
        Ok(())
    }
}
