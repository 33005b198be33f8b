// file: src/config/store.rs
// version: 1.0.0
// guid: 0d3e6f7c-2f4a-4c1e-b7f0-5a8b9c3d2e11

//! Persisted install configuration with an in-memory cache

use super::InstallConfig;
use crate::Result;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

pub const CONFIG_FILE_NAME: &str = "config.json";

/// Reads and writes `<root>/<pool>/config/config.json`.
///
/// Readers get the cached copy once one has been loaded or successfully
/// persisted.
#[derive(Debug)]
pub struct ConfigStore {
    root: PathBuf,
    cached: RwLock<Option<Arc<InstallConfig>>>,
}

impl ConfigStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            cached: RwLock::new(None),
        }
    }

    pub fn config_path(&self, pool: &str) -> PathBuf {
        self.root.join(pool).join("config").join(CONFIG_FILE_NAME)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load the configuration of `pool`, from the cache when it holds that
    /// pool. A missing file means the node has not been installed yet and
    /// yields `None`.
    pub fn load(&self, pool: &str) -> Result<Option<Arc<InstallConfig>>> {
        if let Some(cached) = self.cached().filter(|c| c.pool_name == pool) {
            return Ok(Some(cached));
        }

        let path = self.config_path(pool);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no configuration at {}", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let config: InstallConfig = serde_json::from_slice(&data)?;
        let config = Arc::new(config);
        self.set_cached(Arc::clone(&config));
        info!("loaded configuration from {}", path.display());
        Ok(Some(config))
    }

    /// Write `config` to the pool it names, then cache it
    pub fn persist(&self, config: InstallConfig) -> Result<Arc<InstallConfig>> {
        let config = Arc::new(config);
        let path = self.config_path(&config.pool_name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(config.as_ref())?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;
        file.write_all(&json)?;
        info!("configuration written to {}", path.display());

        self.set_cached(Arc::clone(&config));
        Ok(config)
    }

    pub fn cached(&self) -> Option<Arc<InstallConfig>> {
        match self.cached.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_cached(&self, config: Arc<InstallConfig>) {
        let mut guard = match self.cached.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(config);
    }
}
