// file: src/system/disk.rs
// version: 1.0.0
// guid: 5e7f8a9b-0c1d-4e2f-8a3b-4c5d6e7f8091

//! Block device discovery, partitioning and mounting

use super::executor::{CommandExecutor, CommandOutput};
use crate::error::K8sInitError;
use crate::Result;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Whole disk as reported by lsblk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(deserialize_with = "size_from_number_or_string", default)]
    pub size: u64,
    #[serde(rename = "type", default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub pttype: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<DiskInfo>,
}

// Older lsblk releases print sizes as strings even with -b
fn size_from_number_or_string<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Number(u64),
        Text(String),
        Missing(Option<()>),
    }

    match Size::deserialize(deserializer)? {
        Size::Number(n) => Ok(n),
        Size::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
        Size::Missing(_) => Ok(0),
    }
}

/// Device node of partition `number` on `disk`
pub fn partition_path(disk: &str, number: u32) -> String {
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{}p{}", disk, number)
    } else {
        format!("{}{}", disk, number)
    }
}

pub struct DiskManager<'a> {
    exec: &'a dyn CommandExecutor,
}

impl<'a> DiskManager<'a> {
    pub fn new(exec: &'a dyn CommandExecutor) -> Self {
        Self { exec }
    }

    /// Whole disks, excluding loop and ram devices
    pub async fn list_disks(&self) -> Result<Vec<DiskInfo>> {
        let out = self
            .exec
            .execute_with_output(
                "lsblk",
                &["-J", "-b", "-d", "-o", "NAME,PATH,SIZE,TYPE,PTTYPE"],
            )
            .await?;
        let parsed: LsblkOutput = serde_json::from_str(&out)?;
        Ok(parsed
            .blockdevices
            .into_iter()
            .filter(|d| d.device_type.as_deref().map_or(true, |t| t == "disk"))
            .collect())
    }

    /// Run a parted script against `disk` and print the resulting table
    pub async fn partition(&self, disk: &str, script: &str) -> Result<CommandOutput> {
        let mut args = vec![disk, "-a", "opt", "-s", "--"];
        args.extend(script.split_whitespace());
        info!("Executing: Partitioning disk -> parted {}", args.join(" "));
        let out = self.exec.run("parted", &args).await?;
        if !out.success() {
            return Err(K8sInitError::Process {
                command: format!("parted {}", args.join(" ")),
                exit_code: out.status,
                stderr: out.combined(),
            });
        }

        let table = self.exec.run("parted", &[disk, "p"]).await?;
        let mut combined = out;
        combined.stdout.push_str(&table.combined());
        Ok(combined)
    }

    /// Device carrying the filesystem label `label`
    pub async fn find_by_label(&self, label: &str) -> Result<String> {
        let selector = format!("LABEL={}", label);
        let out = self
            .exec
            .run("blkid", &["-t", &selector, "-o", "device"])
            .await?;
        let device = out.stdout.lines().next().unwrap_or("").trim().to_string();
        if !out.success() || device.is_empty() {
            return Err(K8sInitError::storage(format!(
                "no device with label {} found",
                label
            )));
        }
        debug!("label {} is on {}", label, device);
        Ok(device)
    }

    /// Mount `device` on `target`, loading the filesystem module first
    pub async fn mount(&self, device: &str, target: &Path, fstype: &str) -> Result<()> {
        if !self.exec.check_silent("modprobe", &[fstype]).await? {
            warn!("cannot load filesystem module {}", fstype);
        }
        std::fs::create_dir_all(target)?;
        let target = target.to_string_lossy();
        self.exec
            .execute("mount", &["-t", fstype, device, target.as_ref()])
            .await
    }

    pub async fn umount(&self, target: &Path) -> Result<()> {
        let target = target.to_string_lossy();
        self.exec.execute("umount", &[target.as_ref()]).await
    }
}
