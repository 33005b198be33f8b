// file: src/system/vfs.rs
// version: 1.0.0
// guid: 1d2e3f4a-5b6c-4d7e-8f9a-0b1c2d3e4f5a

//! Virtual filesystem mounts

use super::executor::CommandExecutor;
use crate::Result;
use std::path::PathBuf;
use tracing::{debug, info};

/// A pseudo filesystem mounted at boot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VfsMount {
    pub source: &'static str,
    pub target: &'static str,
    pub fstype: &'static str,
    pub options: &'static str,
}

pub const VFS_MOUNTS: &[VfsMount] = &[
    VfsMount {
        source: "proc",
        target: "/proc",
        fstype: "proc",
        options: "nosuid,nodev,noexec",
    },
    VfsMount {
        source: "sysfs",
        target: "/sys",
        fstype: "sysfs",
        options: "nosuid,nodev,noexec",
    },
    VfsMount {
        source: "devtmpfs",
        target: "/dev",
        fstype: "devtmpfs",
        options: "nosuid,mode=0755",
    },
    VfsMount {
        source: "devpts",
        target: "/dev/pts",
        fstype: "devpts",
        options: "nosuid,noexec,gid=5,mode=0620",
    },
    VfsMount {
        source: "shm",
        target: "/dev/shm",
        fstype: "tmpfs",
        options: "nosuid,nodev,mode=1777",
    },
    VfsMount {
        source: "cgroup2",
        target: "/sys/fs/cgroup",
        fstype: "cgroup2",
        options: "nosuid,nodev,noexec",
    },
];

pub struct VfsMounter<'a> {
    exec: &'a dyn CommandExecutor,
    root: PathBuf,
}

impl<'a> VfsMounter<'a> {
    pub fn new<P: Into<PathBuf>>(exec: &'a dyn CommandExecutor, root: P) -> Self {
        Self {
            exec,
            root: root.into(),
        }
    }

    fn rooted(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    /// Mount every table entry in order, then point /etc/mtab at the
    /// kernel's mount list
    pub async fn mount_all(&self) -> Result<()> {
        for entry in VFS_MOUNTS {
            let target = self.rooted(entry.target);
            std::fs::create_dir_all(&target)?;
            let target = target.to_string_lossy();
            debug!("mounting {} on {}", entry.fstype, target);
            self.exec
                .execute(
                    "mount",
                    &["-t", entry.fstype, "-o", entry.options, entry.source, target.as_ref()],
                )
                .await?;
        }

        self.link_mtab()?;
        info!("virtual filesystems mounted");
        Ok(())
    }

    fn link_mtab(&self) -> Result<()> {
        let mtab = self.rooted("/etc/mtab");
        if let Some(parent) = mtab.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(&mtab) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::os::unix::fs::symlink("/proc/mounts", &mtab)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::executor::scripted::ScriptedExecutor;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_mount_all_in_table_order() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("etc")).unwrap();
        std::fs::write(root.path().join("etc/mtab"), "stale").unwrap();
        let exec = ScriptedExecutor::new();

        VfsMounter::new(&exec, root.path()).mount_all().await.unwrap();

        let calls = exec.calls();
        assert_eq!(calls.len(), VFS_MOUNTS.len());
        assert!(calls[0].starts_with("mount -t proc"));
        assert!(calls[5].contains("cgroup2"));
        assert!(root.path().join("sys/fs/cgroup").is_dir());
        let link = std::fs::read_link(root.path().join("etc/mtab")).unwrap();
        assert_eq!(link, PathBuf::from("/proc/mounts"));
    }

    #[tokio::test]
    async fn test_mount_failure_stops() {
        let root = TempDir::new().unwrap();
        let exec = ScriptedExecutor::new();
        exec.fail("mount -t sysfs", "busy");
        assert!(VfsMounter::new(&exec, root.path()).mount_all().await.is_err());
        assert_eq!(exec.calls().len(), 2);
    }
}
