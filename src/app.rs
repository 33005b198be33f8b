// file: src/app.rs
// version: 1.0.0
// guid: 2b3c4d5e-6f7a-4b8c-9d0e-1f2a3b4c5d6e

//! Process-wide collaborators, built once in `main` and passed down

use crate::config::{ConfigStore, InitSettings};
use crate::installer::InstallPipeline;
use crate::management::ServiceRegistry;
use crate::system::executor::{CommandExecutor, LocalExecutor};
use crate::system::power::{KernelPowerControl, PowerControl, PowerStateMachine};
use crate::Result;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub struct AppContext {
    pub settings: Arc<InitSettings>,
    pub executor: Arc<dyn CommandExecutor>,
    pub store: Arc<ConfigStore>,
    pub power: Arc<PowerStateMachine>,
    pub installer: Arc<InstallPipeline>,
    pub services: ServiceRegistry,
    tftp_root: TempDir,
}

impl AppContext {
    pub fn new(
        settings: InitSettings,
        executor: Arc<dyn CommandExecutor>,
        control: Box<dyn PowerControl>,
    ) -> Result<Self> {
        let settings = Arc::new(settings);
        let store = Arc::new(ConfigStore::new(&settings.root_dir));
        let power = Arc::new(PowerStateMachine::new(
            Arc::clone(&executor),
            Arc::clone(&store),
            Arc::clone(&settings),
            control,
        ));
        let installer = Arc::new(InstallPipeline::new(
            Arc::clone(&executor),
            Arc::clone(&store),
            Arc::clone(&settings),
        ));
        let tftp_root = tempfile::Builder::new().prefix("tftproot").tempdir()?;

        Ok(Self {
            settings,
            executor,
            store,
            power,
            installer,
            services: ServiceRegistry::new(),
            tftp_root,
        })
    }

    /// Context acting on this machine
    pub fn local(settings: InitSettings) -> Result<Self> {
        Self::new(
            settings,
            Arc::new(LocalExecutor::new()),
            Box::new(KernelPowerControl),
        )
    }

    /// Scratch directory the network boot binary is downloaded into
    pub fn tftp_root(&self) -> &Path {
        self.tftp_root.path()
    }
}
