// file: src/installer/mod.rs
// version: 1.0.0
// guid: 6e7f8a9b-0c1d-4e2f-9a3b-5c6d7e8f9a0b

//! Disk provisioning pipeline
//!
//! Stages run in order and stop at the first failure. Nothing is rolled
//! back; a retry with `force` set replaces whatever a failed attempt left.

use crate::config::{ConfigStore, InitSettings, InstallConfig, Role};
use crate::error::K8sInitError;
use crate::system::disk::{partition_path, DiskManager};
use crate::system::entropy::EntropySeeder;
use crate::system::executor::{CommandExecutor, CommandOutput};
use crate::system::packages::PackageManager;
use crate::system::zfs::ZfsManager;
use crate::Result;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const BOOTLOADER_PACKAGE: &str = "grub-bios";
pub const PARTITION_SCRIPT: &str =
    "mklabel gpt mkpart grub 2048s 4095s set 1 bios_grub on mkpart zfs 4096s -2048s";
pub const POOL_PROPERTIES: [&str; 3] = ["dedup=on", "compress=on", "xattr=sa"];
pub const INSTALLER_FSTYPE: &str = "iso9660";
pub const BOOT_IMAGES: [&str; 2] = ["vmlinuz", "initramfs"];
pub const POOL_CONFLICT: &str = "pool exists with same name and force parameter not given";
/// Disks are installed from the installer medium, which only managers use.
/// Netbooted nodes get their role from the chainload script instead.
pub const INSTALLED_ROLE: Role = Role::Manager;

/// Ordered progress lines for one install attempt. Dropping the sink ends
/// the stream.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::Sender<String>,
}

impl ProgressSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn line(&self, line: impl Into<String>) {
        let line = line.into();
        debug!("install: {}", line);
        if self.tx.send(line).await.is_err() {
            debug!("install progress listener is gone");
        }
    }

    /// Relay a tool's output line by line
    pub async fn output(&self, output: &CommandOutput) {
        for line in output.combined().lines().filter(|l| !l.trim().is_empty()) {
            self.line(line).await;
        }
    }
}

pub struct InstallPipeline {
    executor: Arc<dyn CommandExecutor>,
    store: Arc<ConfigStore>,
    settings: Arc<InitSettings>,
    running: AtomicBool,
}

impl InstallPipeline {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        store: Arc<ConfigStore>,
        settings: Arc<InitSettings>,
    ) -> Self {
        Self {
            executor,
            store,
            settings,
            running: AtomicBool::new(false),
        }
    }

    /// Provision the disk named in `config`. Only one install runs at a
    /// time; a concurrent call is rejected.
    pub async fn run(&self, config: InstallConfig, sink: ProgressSink) -> Result<Arc<InstallConfig>> {
        if self.running.swap(true, Ordering::SeqCst) {
            sink.line("error: another installation is running").await;
            return Err(K8sInitError::installation("installation already running"));
        }

        info!("starting install on {}", config.disk);
        let result = self.run_stages(config, &sink).await;
        self.running.store(false, Ordering::SeqCst);

        match &result {
            Ok(_) => info!("installation ended"),
            Err(e) => error!("installation failed: {}", e),
        }
        result
    }

    async fn run_stages(&self, config: InstallConfig, sink: &ProgressSink) -> Result<Arc<InstallConfig>> {
        if let Err(e) = config.validate() {
            sink.line(format!("invalid configuration: {}", e)).await;
            return Err(e);
        }

        let exec = self.executor.as_ref();
        let zfs = ZfsManager::new(exec);
        let disks = DiskManager::new(exec);
        let pool = config.pool_name.as_str();

        sink.line("starting install").await;
        self.install_dependencies(sink).await?;
        self.resolve_pool_conflict(&zfs, &config, sink).await?;
        self.partition_disk(&disks, &config.disk, sink).await?;
        self.create_pool(&zfs, &partition_path(&config.disk, 2), pool, sink)
            .await?;
        self.copy_boot_images(&disks, pool, sink).await?;
        self.install_bootloader(&config.disk, pool, sink).await?;

        let persisted = self.persist(config, sink).await?;
        sink.line("installation ended").await;
        sink.line("eject cdrom and reboot").await;
        Ok(persisted)
    }

    async fn install_dependencies(&self, sink: &ProgressSink) -> Result<()> {
        let packages = PackageManager::new(self.executor.as_ref(), &self.settings.root_dir);
        match packages.install(BOOTLOADER_PACKAGE).await {
            Ok(out) => {
                sink.output(&out).await;
                sink.line("apk deps installed").await;
                Ok(())
            }
            Err(e) => {
                sink.line(format!("cannot install {}: {}", BOOTLOADER_PACKAGE, e)).await;
                Err(e)
            }
        }
    }

    async fn resolve_pool_conflict(
        &self,
        zfs: &ZfsManager<'_>,
        config: &InstallConfig,
        sink: &ProgressSink,
    ) -> Result<()> {
        let pools = match zfs.list_pools().await {
            Ok(pools) => pools,
            Err(e) => {
                sink.line(format!("cannot list zpools: {}", e)).await;
                return Err(e);
            }
        };
        if !pools.iter().any(|p| p.name == config.pool_name) {
            return Ok(());
        }

        sink.line("same zpool found").await;
        if !config.force {
            sink.line(POOL_CONFLICT).await;
            return Err(K8sInitError::installation(POOL_CONFLICT));
        }
        if let Err(e) = zfs.destroy_pool(&config.pool_name).await {
            sink.line(format!("cannot destroy zpool: {}", e)).await;
            return Err(e);
        }
        sink.line("zpool destroyed").await;
        Ok(())
    }

    async fn partition_disk(&self, disks: &DiskManager<'_>, disk: &str, sink: &ProgressSink) -> Result<()> {
        sink.line(format!("partitioning {}", disk)).await;
        match disks.partition(disk, PARTITION_SCRIPT).await {
            Ok(out) => {
                sink.output(&out).await;
                sink.line(format!("partitioning {} completed", disk)).await;
                Ok(())
            }
            Err(e) => {
                sink.line(format!("partitioning failed: {}", e)).await;
                Err(e)
            }
        }
    }

    async fn create_pool(
        &self,
        zfs: &ZfsManager<'_>,
        part: &str,
        pool: &str,
        sink: &ProgressSink,
    ) -> Result<()> {
        sink.line(format!("creating zfs on {} with name {}", part, pool)).await;

        let created = async {
            zfs.create_pool(pool, part).await?;
            for property in POOL_PROPERTIES {
                zfs.set_property(pool, property).await?;
            }
            zfs.create_dataset(&format!("{}/boot", pool)).await?;
            zfs.create_dataset(&format!("{}/config", pool)).await?;
            Ok::<(), K8sInitError>(())
        }
        .await;

        match created {
            Ok(()) => {
                sink.line(format!("creating zfs on {} with name {} succeed", part, pool))
                    .await;
                Ok(())
            }
            Err(e) => {
                sink.line(format!("zpool creation failed: {}", e)).await;
                Err(e)
            }
        }
    }

    async fn copy_boot_images(&self, disks: &DiskManager<'_>, pool: &str, sink: &ProgressSink) -> Result<()> {
        sink.line("start copying os files").await;

        let device = match disks.find_by_label(&self.settings.installer_label).await {
            Ok(device) => device,
            Err(e) => {
                sink.line("cannot find installer cdrom").await;
                return Err(e);
            }
        };

        let mount_point = self.settings.host_path(&self.settings.installer_mount);
        if let Err(e) = disks.mount(&device, &mount_point, INSTALLER_FSTYPE).await {
            sink.line("cannot mount cdrom").await;
            return Err(e);
        }

        let copied = self.copy_images(&mount_point, pool, sink).await;
        if let Err(e) = disks.umount(&mount_point).await {
            warn!("cannot unmount {}: {}", mount_point.display(), e);
        }
        copied?;

        sink.line("copying os files finished").await;
        Ok(())
    }

    async fn copy_images(&self, source: &Path, pool: &str, sink: &ProgressSink) -> Result<()> {
        let boot_dir = self.settings.pool_boot_dir(pool);
        tokio::fs::create_dir_all(&boot_dir).await?;
        for image in BOOT_IMAGES {
            if let Err(e) = tokio::fs::copy(source.join(image), boot_dir.join(image)).await {
                sink.line(format!("cannot copy {}", image)).await;
                return Err(e.into());
            }
        }
        Ok(())
    }

    async fn install_bootloader(&self, disk: &str, pool: &str, sink: &ProgressSink) -> Result<()> {
        let boot_dir = self.settings.pool_boot_dir(pool);
        let boot_arg = boot_dir.to_string_lossy();
        let out = self
            .executor
            .run("grub-install", &["--boot-directory", boot_arg.as_ref(), disk])
            .await?;
        sink.output(&out).await;
        if !out.success() {
            sink.line("cannot install grub").await;
            return Err(K8sInitError::Process {
                command: format!("grub-install --boot-directory {} {}", boot_arg, disk),
                exit_code: out.status,
                stderr: out.combined(),
            });
        }

        let grub_dir = boot_dir.join("grub");
        std::fs::create_dir_all(&grub_dir)?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(grub_dir.join("grub.cfg"))?;
        file.write_all(grub_config(INSTALLED_ROLE, pool).as_bytes())?;
        sink.line("grub installed").await;
        Ok(())
    }

    async fn persist(&self, config: InstallConfig, sink: &ProgressSink) -> Result<Arc<InstallConfig>> {
        let pool = config.pool_name.clone();
        let persisted = match self.store.persist(config) {
            Ok(persisted) => persisted,
            Err(e) => {
                sink.line(format!("config write failed: {}", e)).await;
                return Err(e);
            }
        };

        let seeder = EntropySeeder::new(&self.settings.root_dir, self.settings.seed_size);
        if let Err(e) = seeder.write_seed(&self.settings.seed_file(&pool)) {
            warn!("cannot write random seed: {}", e);
        }
        Ok(persisted)
    }
}

/// Boot menu for the installed pool
pub fn grub_config(role: Role, pool: &str) -> String {
    format!(
        "echo loading kernel...\n\
         linux /boot@/vmlinuz k8sinit.role={} k8sinit.pool={}\n\
         echo loading initramfs\n\
         initrd /boot@/initramfs\n\
         boot\n",
        role, pool
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::system::executor::scripted::ScriptedExecutor;
    use tempfile::TempDir;

    struct Fixture {
        root: TempDir,
        exec: Arc<ScriptedExecutor>,
        store: Arc<ConfigStore>,
        pipeline: InstallPipeline,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let mut settings = InitSettings::default();
        settings.root_dir = root.path().to_path_buf();
        settings.seed_size = 16;

        let media = root.path().join("mnt/cdrom");
        std::fs::create_dir_all(&media).unwrap();
        std::fs::write(media.join("vmlinuz"), b"kernel").unwrap();
        std::fs::write(media.join("initramfs"), b"initrd").unwrap();

        let exec = Arc::new(ScriptedExecutor::new());
        exec.on("blkid", "/dev/sr0\n");
        let store = Arc::new(ConfigStore::new(root.path()));
        let pipeline = InstallPipeline::new(exec.clone(), store.clone(), Arc::new(settings));
        Fixture {
            root,
            exec,
            store,
            pipeline,
        }
    }

    async fn run(fx: &Fixture, config: InstallConfig) -> (Result<Arc<InstallConfig>>, Vec<String>) {
        let (sink, mut rx) = ProgressSink::channel(256);
        let result = fx.pipeline.run(config, sink).await;
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        (result, lines)
    }

    #[tokio::test]
    async fn test_full_install() {
        // Arrange
        let fx = fixture();

        // Act
        let (result, lines) = run(&fx, sample_config()).await;

        // Assert
        let persisted = result.unwrap();
        assert!(Arc::ptr_eq(&persisted, &fx.store.cached().unwrap()));
        assert_eq!(lines.last().unwrap(), "eject cdrom and reboot");

        let boot = fx.root.path().join("zp_k8s/boot");
        assert_eq!(std::fs::read(boot.join("vmlinuz")).unwrap(), b"kernel");
        assert_eq!(std::fs::read(boot.join("initramfs")).unwrap(), b"initrd");
        let grub = std::fs::read_to_string(boot.join("grub/grub.cfg")).unwrap();
        assert!(grub.contains("k8sinit.role=manager k8sinit.pool=zp_k8s"));
        assert!(fx.root.path().join("zp_k8s/config/config.json").exists());
        assert!(fx.root.path().join("zp_k8s/config/rndfile").exists());

        let order = [
            "apk add grub-bios",
            "parted /dev/sda -a opt -s --",
            "zpool create -f -o ashift=12 zp_k8s /dev/sda2",
            "zfs set dedup=on zp_k8s",
            "zfs create zp_k8s/config",
            "mount -t iso9660 /dev/sr0",
            "umount",
            "grub-install --boot-directory",
        ];
        let positions: Vec<usize> = order.iter().map(|p| fx.exec.position(p).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:?}", fx.exec.calls());
    }

    #[tokio::test]
    async fn test_existing_pool_without_force_stops_before_partitioning() {
        let fx = fixture();
        fx.exec.on("zpool list", "zp_k8s\t100\t10\t90\tONLINE\n");

        let (result, lines) = run(&fx, sample_config()).await;

        assert!(result.is_err());
        assert_eq!(lines.last().unwrap(), POOL_CONFLICT);
        assert!(!fx.exec.called("parted"));
        assert!(!fx.exec.called("zpool destroy"));
    }

    #[tokio::test]
    async fn test_existing_pool_with_force_is_destroyed() {
        let fx = fixture();
        fx.exec.on("zpool list", "zp_k8s\t100\t10\t90\tONLINE\n");
        let mut config = sample_config();
        config.force = true;

        let (result, lines) = run(&fx, config).await;

        assert!(result.is_ok());
        assert!(lines.iter().any(|l| l == "zpool destroyed"));
        let destroy = fx.exec.position("zpool destroy -f zp_k8s").unwrap();
        let parted = fx.exec.position("parted").unwrap();
        assert!(destroy < parted);
    }

    #[tokio::test]
    async fn test_copy_failure_still_unmounts() {
        let fx = fixture();
        std::fs::remove_file(fx.root.path().join("mnt/cdrom/initramfs")).unwrap();

        let (result, lines) = run(&fx, sample_config()).await;

        assert!(result.is_err());
        assert_eq!(lines.last().unwrap(), "cannot copy initramfs");
        assert!(fx.exec.called("umount"));
        assert!(!fx.exec.called("grub-install"));
        assert!(fx.store.cached().is_none());
    }

    #[tokio::test]
    async fn test_invalid_config_touches_nothing() {
        let fx = fixture();
        let mut config = sample_config();
        config.disk = "sda".to_string();

        let (result, _) = run(&fx, config).await;

        assert!(result.is_err());
        assert!(fx.exec.calls().is_empty());
    }

    #[test]
    fn test_grub_config() {
        let cfg = grub_config(Role::Node, "tank");
        assert!(cfg.starts_with("echo loading kernel...\n"));
        assert!(cfg.contains("linux /boot@/vmlinuz k8sinit.role=node k8sinit.pool=tank\n"));
        assert!(cfg.contains("initrd /boot@/initramfs\n"));

        let installed = grub_config(INSTALLED_ROLE, "tank");
        assert!(installed.contains("k8sinit.role=manager k8sinit.pool=tank"));
    }
}
