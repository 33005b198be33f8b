// file: src/system/modules.rs
// version: 1.0.0
// guid: 9c0d1e2f-3a4b-4c5d-8e6f-7a8b9c0d1e2f

//! Kernel module discovery through device modaliases

use super::executor::CommandExecutor;
use super::zfs::ZfsManager;
use crate::Result;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Upper bound on discovery passes; the loaded count is monotonic so the
/// loop normally ends well before this.
const MAX_PASSES: usize = 32;

pub struct ModuleLoader<'a> {
    exec: &'a dyn CommandExecutor,
    sys_root: PathBuf,
}

impl<'a> ModuleLoader<'a> {
    pub fn new<P: Into<PathBuf>>(exec: &'a dyn CommandExecutor, sys_root: P) -> Self {
        Self {
            exec,
            sys_root: sys_root.into(),
        }
    }

    /// Load drivers until no new module appears, then load zfs and import
    /// the pools it can see
    pub async fn load_all(&self) -> Result<()> {
        let passes = self.load_until_stable().await?;
        info!("module discovery settled after {} pass(es)", passes);

        self.exec.execute("modprobe", &["zfs"]).await?;
        let pools = ZfsManager::new(self.exec).import_all().await?;
        if !pools.is_empty() {
            info!("pools imported: {}", pools.join(", "));
        }
        Ok(())
    }

    /// Returns the number of passes run
    pub async fn load_until_stable(&self) -> Result<usize> {
        let mut loaded = self.loaded_count().await?;
        let mut passes = 0;

        while passes < MAX_PASSES {
            passes += 1;
            let aliases = scan_modaliases(&self.sys_root);
            debug!("pass {}: {} aliases, {} modules loaded", passes, aliases.len(), loaded);
            for alias in &aliases {
                self.load_alias(alias).await;
            }

            let now = self.loaded_count().await?;
            if now <= loaded {
                break;
            }
            loaded = now;
        }

        Ok(passes)
    }

    async fn loaded_count(&self) -> Result<usize> {
        let out = self.exec.execute_with_output("lsmod", &[]).await?;
        // First line is the column header
        Ok(out.lines().skip(1).filter(|l| !l.trim().is_empty()).count())
    }

    async fn load_alias(&self, alias: &str) {
        match self.exec.run("modprobe", &["-a", "-b", alias]).await {
            Ok(out) if !out.success() => debug!("no module for {}", alias),
            Ok(_) => {}
            Err(e) => warn!("modprobe {} failed: {}", alias, e),
        }
    }
}

/// Distinct aliases of every `modalias` file under `sys_root`
pub fn scan_modaliases(sys_root: &Path) -> BTreeSet<String> {
    WalkDir::new(sys_root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && entry.file_name() == "modalias")
        .filter_map(|entry| std::fs::read_to_string(entry.path()).ok())
        .map(|alias| alias.trim().to_string())
        .filter(|alias| !alias.is_empty())
        .collect()
}
