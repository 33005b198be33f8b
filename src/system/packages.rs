// file: src/system/packages.rs
// version: 1.0.0
// guid: 4a5b6c7d-8e9f-4a0b-9c1d-2e3f4a5b6c7d

//! Alpine package manager

use super::executor::{CommandExecutor, CommandOutput};
use crate::error::K8sInitError;
use crate::Result;
use std::path::PathBuf;
use tracing::info;

pub struct PackageManager<'a> {
    exec: &'a dyn CommandExecutor,
    root: PathBuf,
}

impl<'a> PackageManager<'a> {
    pub fn new<P: Into<PathBuf>>(exec: &'a dyn CommandExecutor, root: P) -> Self {
        Self {
            exec,
            root: root.into(),
        }
    }

    /// Initialise the package database and write the repository list
    pub async fn setup_default_repositories(&self, repositories: &[String]) -> Result<()> {
        self.exec.execute("apk", &["add", "--initdb"]).await?;

        let apk_dir = self.root.join("etc/apk");
        std::fs::create_dir_all(&apk_dir)?;
        let mut content = repositories.join("\n");
        content.push('\n');
        std::fs::write(apk_dir.join("repositories"), content)?;
        info!("apk repositories configured ({} entries)", repositories.len());
        Ok(())
    }

    /// Install `package`, returning apk's output for the caller to relay
    pub async fn install(&self, package: &str) -> Result<CommandOutput> {
        info!("Executing: Installing package -> apk add {}", package);
        let out = self.exec.run("apk", &["add", package]).await?;
        if !out.success() {
            return Err(K8sInitError::Process {
                command: format!("apk add {}", package),
                exit_code: out.status,
                stderr: out.combined(),
            });
        }
        Ok(out)
    }
}
