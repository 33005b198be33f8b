// file: src/system/power.rs
// version: 1.0.0
// guid: 3f4a5b6c-7d8e-4f9a-0b1c-2d3e4f5a6b7c

//! Power state machine: the single shutdown path for reboot and poweroff

use super::entropy::EntropySeeder;
use super::executor::CommandExecutor;
use super::zfs::ZfsManager;
use crate::config::{ConfigStore, InitSettings};
use crate::error::K8sInitError;
use crate::management::StopAll;
use crate::Result;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerIntent {
    Reboot,
    Poweroff,
}

impl PowerIntent {
    /// Signal delivered to PID 1 for this intent
    pub fn signal(&self) -> libc::c_int {
        match self {
            PowerIntent::Reboot => libc::SIGUSR1,
            PowerIntent::Poweroff => libc::SIGUSR2,
        }
    }
}

impl fmt::Display for PowerIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerIntent::Reboot => f.write_str("reboot"),
            PowerIntent::Poweroff => f.write_str("poweroff"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Running,
    Stopping,
    Terminated,
}

/// Final OS level action
pub trait PowerControl: Send + Sync {
    fn terminate(&self, intent: PowerIntent) -> Result<()>;
}

/// Issues the reboot(2) syscall
#[derive(Debug, Default)]
pub struct KernelPowerControl;

impl PowerControl for KernelPowerControl {
    fn terminate(&self, intent: PowerIntent) -> Result<()> {
        let cmd = match intent {
            PowerIntent::Reboot => libc::RB_AUTOBOOT,
            PowerIntent::Poweroff => libc::RB_POWER_OFF,
        };
        // SAFETY: sync and reboot take no pointers
        let rc = unsafe {
            libc::sync();
            libc::reboot(cmd)
        };
        if rc != 0 {
            return Err(K8sInitError::system(format!(
                "{} failed: {}",
                intent,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

pub struct PowerStateMachine {
    state: Mutex<PowerState>,
    stopper: OnceLock<Arc<dyn StopAll>>,
    executor: Arc<dyn CommandExecutor>,
    store: Arc<ConfigStore>,
    settings: Arc<InitSettings>,
    control: Box<dyn PowerControl>,
}

impl PowerStateMachine {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        store: Arc<ConfigStore>,
        settings: Arc<InitSettings>,
        control: Box<dyn PowerControl>,
    ) -> Self {
        Self {
            state: Mutex::new(PowerState::Running),
            stopper: OnceLock::new(),
            executor,
            store,
            settings,
            control,
        }
    }

    /// Register what must be stopped before termination. Only the first
    /// registration is kept.
    pub fn set_stopper(&self, stopper: Arc<dyn StopAll>) {
        if self.stopper.set(stopper).is_err() {
            warn!("service stopper already registered");
        }
    }

    pub fn state(&self) -> PowerState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: PowerState) {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = next;
    }

    fn begin_stopping(&self) -> Result<()> {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *guard != PowerState::Running {
            return Err(K8sInitError::system("shutdown already in progress"));
        }
        *guard = PowerState::Stopping;
        Ok(())
    }

    /// Unwind services and storage, then ask the OS to terminate.
    ///
    /// Everything before the final OS call is best effort.
    pub async fn transition(&self, intent: PowerIntent) -> Result<()> {
        self.begin_stopping()?;
        info!("System will {}", intent);

        match self.stopper.get() {
            Some(stopper) => stopper.stop_all().await,
            None => debug!("no management services registered"),
        }

        if let Some(config) = self.store.cached() {
            let seeder = EntropySeeder::new(&self.settings.root_dir, self.settings.seed_size);
            if let Err(e) = seeder.write_seed(&self.settings.seed_file(&config.pool_name)) {
                warn!("cannot write random seed: {}", e);
            }
        }

        ZfsManager::new(self.executor.as_ref()).export_all().await;

        let reaped = reap_processes(&self.settings.host_path("/proc"));
        info!("System stopped ({} processes signalled)", reaped.len());

        self.set_state(PowerState::Terminated);
        self.control.terminate(intent)
    }

    /// Run the transition and exit the process. Never returns; a second
    /// caller parks until the first one terminates the system.
    pub async fn execute(&self, intent: PowerIntent) {
        if let Err(e) = self.transition(intent).await {
            if self.state() != PowerState::Terminated {
                warn!("{} ignored: {}", intent, e);
                std::future::pending::<()>().await;
            }
            error!("{} failed: {}", intent, e);
        }
        std::process::exit(0)
    }

    /// Map SIGUSR1 to reboot and SIGUSR2 to poweroff
    pub fn spawn_signal_listener(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut reboot = signal(SignalKind::user_defined1())?;
        let mut poweroff = signal(SignalKind::user_defined2())?;
        let machine = Arc::clone(self);

        Ok(tokio::spawn(async move {
            let intent = tokio::select! {
                _ = reboot.recv() => PowerIntent::Reboot,
                _ = poweroff.recv() => PowerIntent::Poweroff,
            };
            info!("received {} signal", intent);
            machine.execute(intent).await;
        }))
    }
}

/// Ask the running init to reboot or power off
pub fn send_intent_to_init(intent: PowerIntent) -> Result<()> {
    // SAFETY: plain kill(2) on PID 1
    let rc = unsafe { libc::kill(1, intent.signal()) };
    if rc != 0 {
        return Err(K8sInitError::system(format!(
            "cannot signal init: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// SIGKILL every process listed under `proc_root` except PID 1, ourselves
/// and kernel threads (empty cmdline). Returns the signalled pids.
pub fn reap_processes(proc_root: &Path) -> Vec<i32> {
    let own = std::process::id() as i32;
    let entries = match std::fs::read_dir(proc_root) {
        Ok(entries) => entries,
        Err(e) => {
            error!("cannot list {}: {}", proc_root.display(), e);
            return Vec::new();
        }
    };

    let mut pids: Vec<i32> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter(|pid| *pid != 1 && *pid != own)
        .filter(|pid| {
            let cmdline: PathBuf = proc_root.join(pid.to_string()).join("cmdline");
            std::fs::read(cmdline).map(|d| !d.is_empty()).unwrap_or(false)
        })
        .collect();
    pids.sort_unstable();

    for pid in &pids {
        // SAFETY: plain kill(2); a vanished pid only yields ESRCH
        unsafe {
            libc::kill(*pid, libc::SIGKILL);
        }
    }
    pids
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::system::executor::scripted::ScriptedExecutor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    // Far above the kernel's pid_max so no live process is touched
    const FAKE_PID: i32 = 4_194_400;

    #[derive(Default)]
    pub(crate) struct RecordingControl {
        pub(crate) intents: Arc<Mutex<Vec<PowerIntent>>>,
    }

    impl PowerControl for RecordingControl {
        fn terminate(&self, intent: PowerIntent) -> Result<()> {
            self.intents.lock().unwrap().push(intent);
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingStopper {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl StopAll for CountingStopper {
        async fn stop_all(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fake_root() -> TempDir {
        let dir = TempDir::new().unwrap();
        let fake = FAKE_PID.to_string();
        for (pid, cmdline) in [("1", "/init"), ("2", ""), (fake.as_str(), "sh")] {
            let proc_dir = dir.path().join("proc").join(pid);
            std::fs::create_dir_all(&proc_dir).unwrap();
            std::fs::write(proc_dir.join("cmdline"), cmdline).unwrap();
        }
        std::fs::create_dir_all(dir.path().join("proc/self")).unwrap();
        dir
    }

    #[test]
    fn test_reap_skips_init_and_kernel_threads() {
        let root = fake_root();
        let pids = reap_processes(&root.path().join("proc"));
        assert_eq!(pids, vec![FAKE_PID]);
    }

    #[tokio::test]
    async fn test_transition_unwinds_in_order() {
        // Arrange
        let root = fake_root();
        let mut settings = InitSettings::default();
        settings.root_dir = root.path().to_path_buf();
        settings.seed_size = 64;
        let store = Arc::new(ConfigStore::new(root.path()));
        store.persist(sample_config()).unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        let control = RecordingControl::default();
        let intents = Arc::clone(&control.intents);
        let machine = PowerStateMachine::new(
            exec.clone(),
            store,
            Arc::new(settings.clone()),
            Box::new(control),
        );
        let stopper = Arc::new(CountingStopper::default());
        machine.set_stopper(stopper.clone());

        // Act
        machine.transition(PowerIntent::Poweroff).await.unwrap();

        // Assert
        assert_eq!(stopper.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            std::fs::metadata(settings.seed_file("zp_k8s")).unwrap().len(),
            64
        );
        assert!(exec.called("zpool export -a"));
        assert_eq!(machine.state(), PowerState::Terminated);
        assert_eq!(*intents.lock().unwrap(), vec![PowerIntent::Poweroff]);
    }

    #[tokio::test]
    async fn test_second_transition_is_rejected() {
        let root = fake_root();
        let mut settings = InitSettings::default();
        settings.root_dir = root.path().to_path_buf();
        let machine = PowerStateMachine::new(
            Arc::new(ScriptedExecutor::new()),
            Arc::new(ConfigStore::new(root.path())),
            Arc::new(settings),
            Box::new(RecordingControl::default()),
        );

        machine.transition(PowerIntent::Reboot).await.unwrap();
        assert!(machine.transition(PowerIntent::Poweroff).await.is_err());
    }

    #[test]
    fn test_intent_signals() {
        assert_eq!(PowerIntent::Reboot.signal(), libc::SIGUSR1);
        assert_eq!(PowerIntent::Poweroff.signal(), libc::SIGUSR2);
        assert_eq!(PowerIntent::Poweroff.to_string(), "poweroff");
    }
}
