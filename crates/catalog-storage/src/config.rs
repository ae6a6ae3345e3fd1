use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where stores live and how their connections are tuned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the store files. `None` keeps every store in memory.
    pub base_dir: Option<PathBuf>,
    pub catalog_file: String,
    pub covers_file: String,
    pub thumbnails_file: String,
    /// How long the engine retries a locked database file (default: 5s).
    pub busy_timeout_ms: u64,
    /// Compiled statements kept by each connection (default: 25).
    pub prepared_statement_capacity: usize,
    /// Table layouts cached per store for typed cursors (default: 32).
    pub table_info_capacity: usize,
    /// Give up waiting for a lock token after this long. `None` waits forever.
    pub lock_timeout_ms: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            catalog_file: "catalog.db".to_string(),
            covers_file: "covers.db".to_string(),
            thumbnails_file: "thumbnails.db".to_string(),
            busy_timeout_ms: 5_000,
            prepared_statement_capacity: 25,
            table_info_capacity: 32,
            lock_timeout_ms: None,
        }
    }
}

impl StorageConfig {
    /// Every store on disk under `base_dir`.
    pub fn in_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Location of `file_name`, or `None` for in-memory stores.
    pub fn store_path(&self, file_name: &str) -> Option<PathBuf> {
        self.base_dir.as_ref().map(|dir| dir.join(file_name))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    pub fn prepared_statement_capacity(&self) -> usize {
        self.prepared_statement_capacity.max(1)
    }

    pub fn table_info_capacity(&self) -> usize {
        self.table_info_capacity.max(1)
    }
}
