//! Configuration for [`MasterData`](crate::MasterData).

use std::path::PathBuf;
use std::time::Duration;

use masterdata_sync::SyncConfig;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterDataConfig {
    /// Replica database file. `None` keeps the replica in memory.
    pub database_path: Option<PathBuf>,
    /// How long the convenience write methods wait for the store.
    pub write_timeout: Duration,
    /// Synchronization configuration.
    pub sync: SyncConfig,
}

impl Default for MasterDataConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            write_timeout: Duration::from_secs(30),
            sync: SyncConfig::default(),
        }
    }
}

impl MasterDataConfig {
    /// Parse a JSON configuration; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }
}
