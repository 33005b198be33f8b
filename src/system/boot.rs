// file: src/system/boot.rs
// version: 1.0.0
// guid: 4d5e6f7a-8b9c-4d0e-9f1a-2b3c4d5e6f7a

//! Ordered one-time bring-up
//!
//! The first four steps are fatal: the node cannot serve without a shell,
//! mounts, drivers and network. Later steps only degrade the node.

use super::entropy::EntropySeeder;
use super::modules::ModuleLoader;
use super::packages::PackageManager;
use super::vfs::VfsMounter;
use crate::app::AppContext;
use crate::config::{InstallConfig, KernelParams, Role};
use crate::error::K8sInitError;
use crate::logging::with_async_operation_span;
use crate::management::{ManagementServices, ServiceParams, StopAll};
use crate::network::http::ApiState;
use crate::network::NetworkBringUp;
use crate::Result;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const SEARCH_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
pub const INIT_PATH: &str = "/init";
pub const POWER_LINKS: [&str; 2] = ["/sbin/reboot", "/sbin/poweroff"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPolicy {
    /// Abort bring-up on failure
    Fatal,
    /// Log the failure and continue
    BestEffort,
}

/// What the node looks like once bring-up finished
pub struct BootOutcome {
    pub role: Role,
    pub config: Option<Arc<InstallConfig>>,
    pub services: Option<Arc<ManagementServices>>,
    /// Best effort steps that failed
    pub degraded: Vec<String>,
}

impl BootOutcome {
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

pub struct BootSequencer<'a> {
    ctx: &'a AppContext,
}

impl<'a> BootSequencer<'a> {
    pub fn new(ctx: &'a AppContext) -> Self {
        Self { ctx }
    }

    /// Run every step in order. A fatal failure is returned wrapped with the
    /// step name.
    pub async fn run(&self) -> Result<BootOutcome> {
        let ctx = self.ctx;
        let exec = ctx.executor.as_ref();
        let mut degraded = Vec::new();

        step("init", StepPolicy::Fatal, &mut degraded, || self.first_step()).await?;
        step("mount", StepPolicy::Fatal, &mut degraded, || async {
            VfsMounter::new(exec, &ctx.settings.root_dir).mount_all().await
        })
        .await?;
        step("modules", StepPolicy::Fatal, &mut degraded, || async {
            ModuleLoader::new(exec, ctx.settings.host_path("/sys"))
                .load_all()
                .await
        })
        .await?;
        let identity = step("network", StepPolicy::Fatal, &mut degraded, || self.network())
            .await?
            .ok_or_else(|| K8sInitError::system("network step produced no identity"))?;
        let (role, config) = identity;

        step("entropy", StepPolicy::BestEffort, &mut degraded, || async {
            let seed = config
                .as_ref()
                .map(|c| ctx.settings.seed_file(&c.pool_name));
            EntropySeeder::new(&ctx.settings.root_dir, ctx.settings.seed_size)
                .seed_from(seed.as_deref())
        })
        .await?;
        step("packages", StepPolicy::BestEffort, &mut degraded, || async {
            PackageManager::new(exec, &ctx.settings.root_dir)
                .setup_default_repositories(&ctx.settings.apk_repositories)
                .await
        })
        .await?;
        let services = step("services", StepPolicy::BestEffort, &mut degraded, || {
            self.start_services(role, config.as_deref())
        })
        .await?;

        info!("boot finished as {}", role);
        Ok(BootOutcome {
            role,
            config,
            services,
            degraded,
        })
    }

    async fn first_step(&self) -> Result<()> {
        let ctx = self.ctx;
        std::env::set_var("PATH", SEARCH_PATH);

        for link in POWER_LINKS {
            let path = ctx.settings.host_path(link);
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let _ = std::fs::remove_file(&path);
            if let Err(e) = std::os::unix::fs::symlink(INIT_PATH, &path) {
                debug!("cannot link {}: {}", path.display(), e);
            }
        }

        ctx.power.spawn_signal_listener()?;
        ctx.executor.execute("busybox", &["--install", "-s"]).await?;
        Ok(())
    }

    /// Read role and pool from the kernel command line, load the install
    /// configuration of that pool and address the links
    async fn network(&self) -> Result<(Role, Option<Arc<InstallConfig>>)> {
        let ctx = self.ctx;
        let params = KernelParams::load(ctx.settings.host_path(&ctx.settings.cmdline_path))?;
        let role = params.role();
        let config = ctx.store.load(params.pool_name())?;
        match &config {
            Some(c) => info!("installed on pool {} as {}", c.pool_name, role),
            None => info!("not installed, running as {}", role),
        }

        NetworkBringUp::new(ctx.executor.as_ref())
            .bring_up(config.as_deref())
            .await?;
        Ok((role, config))
    }

    async fn start_services(
        &self,
        role: Role,
        config: Option<&InstallConfig>,
    ) -> Result<Arc<ManagementServices>> {
        let ctx = self.ctx;
        let pool_name = config.map(|c| c.pool_name.clone()).unwrap_or_default();
        let params = ServiceParams {
            role,
            pool_name: pool_name.clone(),
            internal_ifname: config
                .map(|c| c.internal_network.clone())
                .unwrap_or_default(),
            tftp_root: ctx.tftp_root().to_path_buf(),
            htdocs_dir: ctx.settings.htdocs_dir.clone(),
            api: ApiState {
                executor: Arc::clone(&ctx.executor),
                settings: Arc::clone(&ctx.settings),
                installer: Arc::clone(&ctx.installer),
                power: Arc::clone(&ctx.power),
                pool_name,
            },
        };

        let services = ctx
            .services
            .acquire(params, &ctx.settings, ctx.executor.as_ref())
            .await?;
        ctx.power
            .set_stopper(Arc::clone(&services) as Arc<dyn StopAll>);

        services.start_http().await?;
        if role == Role::Manager {
            if let Some(config) = config {
                let internal = config.internal_address()?;
                services.start_tftp(internal.addr()).await?;
                services.start_dhcp();
            }
        }
        Ok(services)
    }
}

/// Run one named step inside its span. Fatal failures come back as
/// `BootStep` errors; best effort failures are recorded and yield `None`.
async fn step<F, Fut, T>(
    name: &str,
    policy: StepPolicy,
    degraded: &mut Vec<String>,
    f: F,
) -> Result<Option<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    info!("boot step {}", name);
    match with_async_operation_span(name, f).await {
        Ok(value) => Ok(Some(value)),
        Err(e) => match policy {
            StepPolicy::Fatal => {
                error!("boot step {} failed: {}", name, e);
                Err(K8sInitError::boot_step(name, e))
            }
            StepPolicy::BestEffort => {
                warn!("boot step {} failed, continuing: {}", name, e);
                degraded.push(name.to_string());
                Ok(None)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::config::InitSettings;
    use crate::system::executor::scripted::ScriptedExecutor;
    use crate::system::power::tests::RecordingControl;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    const LINKS: &str = r#"[
        {"ifindex":1,"ifname":"lo","address":"00:00:00:00:00:00","operstate":"UNKNOWN"},
        {"ifindex":2,"ifname":"eth0","address":"52:54:00:12:34:56","operstate":"UP"},
        {"ifindex":3,"ifname":"eth1","address":"52:54:00:12:34:57","operstate":"DOWN"}
    ]"#;

    fn context(root: &TempDir, exec: Arc<ScriptedExecutor>, cmdline: &str) -> AppContext {
        std::fs::create_dir_all(root.path().join("proc")).unwrap();
        std::fs::create_dir_all(root.path().join("sys")).unwrap();
        std::fs::create_dir_all(root.path().join("dev")).unwrap();
        std::fs::write(root.path().join("dev/random"), b"").unwrap();
        std::fs::write(root.path().join("dev/urandom"), b"").unwrap();
        std::fs::write(root.path().join("proc/cmdline"), cmdline).unwrap();

        let mut settings = InitSettings::default();
        settings.root_dir = root.path().to_path_buf();
        settings.htdocs_dir = root.path().join("htdocs");
        settings.http_address = Ipv4Addr::LOCALHOST;
        settings.http_port = 0;
        settings.tftp_port = 0;
        settings.dhcp_server_port = 0;
        // Unroutable so the download fails fast
        settings.undi_url = "http://127.0.0.1:9/undionly.kpxe".to_string();

        exec.on("ip -j link show", LINKS);
        exec.on("lsmod", "Module Size Used by\n");
        AppContext::new(settings, exec, Box::new(RecordingControl::default())).unwrap()
    }

    #[tokio::test]
    async fn test_unprovisioned_boot_is_http_only_node() {
        // Arrange
        let root = TempDir::new().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        let ctx = context(&root, exec.clone(), "quiet console=ttyS0\n");

        // Act
        let outcome = BootSequencer::new(&ctx).run().await.unwrap();

        // Assert
        assert_eq!(outcome.role, Role::Node);
        assert!(outcome.config.is_none());
        assert!(!outcome.is_degraded(), "{:?}", outcome.degraded);
        let services = outcome.services.unwrap();
        assert!(services.tftp().is_none());
        assert!(services.dhcp().is_none());
        assert!(services.http().is_started());
        assert!(exec.called("udhcpc -i eth0"));
        assert!(exec.called("udhcpc -i eth1"));
        assert_eq!(
            std::fs::read_link(root.path().join("sbin/reboot")).unwrap(),
            std::path::PathBuf::from("/init")
        );
        assert!(root.path().join("etc/apk/repositories").exists());

        services.stop_all().await;
    }

    #[tokio::test]
    async fn test_unprovisioned_manager_skips_pool_services() {
        let root = TempDir::new().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        let ctx = context(&root, exec.clone(), "k8sinit.role=manager");

        let outcome = BootSequencer::new(&ctx).run().await.unwrap();

        assert_eq!(outcome.role, Role::Manager);
        let services = outcome.services.unwrap();
        assert!(services.tftp().is_none());
        assert!(services.dhcp().is_none());
        services.stop_all().await;
    }

    #[tokio::test]
    async fn test_installed_manager_starts_everything() {
        let root = TempDir::new().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        exec.on(
            "ip -j -4 addr show dev eth1",
            r#"[{"ifname":"eth1","addr_info":[{"family":"inet","local":"127.0.0.1","prefixlen":8}]}]"#,
        );
        let ctx = context(&root, exec.clone(), "k8sinit.role=manager k8sinit.pool=zp_k8s");
        let mut config = sample_config();
        config.internal_network_ip_and_prefix = "127.0.0.1/8".to_string();
        ctx.store.persist(config).unwrap();

        let outcome = BootSequencer::new(&ctx).run().await.unwrap();

        let services = outcome.services.unwrap();
        assert!(exec.called("ip addr add 127.0.0.1/8 dev eth1"));
        assert!(services.tftp().unwrap().local_addr().is_some());
        assert!(services.dhcp().is_some());
        assert!(!exec.called("udhcpc -i eth1"));

        services.stop_all().await;
    }

    #[tokio::test]
    async fn test_fatal_step_aborts_bring_up() {
        let root = TempDir::new().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        let ctx = context(&root, exec.clone(), "");
        exec.fail("mount -t proc", "mount: permission denied");

        let err = BootSequencer::new(&ctx).run().await.err().unwrap();

        assert!(matches!(err, K8sInitError::BootStep { ref step, .. } if step == "mount"));
        assert!(!exec.called("lsmod"));
        assert!(ctx.services.get().is_none());
    }

    #[tokio::test]
    async fn test_best_effort_failure_degrades() {
        let root = TempDir::new().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        let ctx = context(&root, exec.clone(), "");
        exec.fail("apk add --initdb", "apk: no network");

        let outcome = BootSequencer::new(&ctx).run().await.unwrap();

        assert_eq!(outcome.degraded, vec!["packages".to_string()]);
        assert!(outcome.services.is_some());
        outcome.services.unwrap().stop_all().await;
    }
}
