// file: src/system/zfs.rs
// version: 1.0.0
// guid: 2b6c9d1e-4f3a-4e8b-a1c5-7d9e0f1a2b3c

//! ZFS pool and dataset operations

use super::executor::{CommandExecutor, CommandOutput};
use crate::error::K8sInitError;
use crate::Result;
use regex::Regex;
use serde::Serialize;
use tracing::{error, info, warn};

/// One line of `zpool list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolInfo {
    pub name: String,
    pub size: u64,
    pub allocated: u64,
    pub free: u64,
    pub health: String,
}

/// One line of `zfs list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetInfo {
    pub name: String,
    pub used: u64,
    pub available: u64,
    pub mountpoint: String,
}

pub struct ZfsManager<'a> {
    exec: &'a dyn CommandExecutor,
}

impl<'a> ZfsManager<'a> {
    pub fn new(exec: &'a dyn CommandExecutor) -> Self {
        Self { exec }
    }

    /// Names of exported pools that `zpool import` can see
    pub async fn list_importable(&self) -> Result<Vec<String>> {
        let out = self.exec.run("zpool", &["import"]).await?;
        let text = out.combined();
        if !out.success() {
            if text.contains("no pools available") {
                return Ok(Vec::new());
            }
            return Err(K8sInitError::Process {
                command: "zpool import".to_string(),
                exit_code: out.status,
                stderr: out.stderr,
            });
        }
        parse_importable(&text)
    }

    /// Import a pool by name. Pools are matched by name only.
    pub async fn import(&self, pool: &str) -> Result<()> {
        self.log_and_execute("Importing pool", "zpool", &["import", pool])
            .await
            .map(|_| ())
    }

    /// Scan and import every exported pool
    pub async fn import_all(&self) -> Result<Vec<String>> {
        let pools = self.list_importable().await?;
        for pool in &pools {
            self.import(pool).await?;
        }
        info!("imported {} pool(s)", pools.len());
        Ok(pools)
    }

    pub async fn list_pools(&self) -> Result<Vec<PoolInfo>> {
        let out = self
            .exec
            .execute_with_output(
                "zpool",
                &["list", "-H", "-p", "-o", "name,size,alloc,free,health"],
            )
            .await?;
        out.lines()
            .filter(|l| !l.trim().is_empty())
            .map(parse_pool_line)
            .collect()
    }

    pub async fn pool_exists(&self, pool: &str) -> Result<bool> {
        Ok(self.list_pools().await?.iter().any(|p| p.name == pool))
    }

    /// Datasets below `pool`, recursively
    pub async fn list_datasets(&self, pool: &str) -> Result<Vec<DatasetInfo>> {
        let out = self
            .exec
            .execute_with_output(
                "zfs",
                &["list", "-H", "-p", "-r", "-o", "name,used,avail,mountpoint", pool],
            )
            .await?;
        out.lines()
            .filter(|l| !l.trim().is_empty())
            .map(parse_dataset_line)
            .collect()
    }

    pub async fn destroy_pool(&self, pool: &str) -> Result<CommandOutput> {
        self.log_and_execute("Destroying pool", "zpool", &["destroy", "-f", pool])
            .await
    }

    pub async fn create_pool(&self, pool: &str, device: &str) -> Result<CommandOutput> {
        self.log_and_execute(
            "Creating pool",
            "zpool",
            &["create", "-f", "-o", "ashift=12", pool, device],
        )
        .await
    }

    pub async fn set_property(&self, target: &str, property: &str) -> Result<CommandOutput> {
        self.log_and_execute("Setting property", "zfs", &["set", property, target])
            .await
    }

    pub async fn create_dataset(&self, dataset: &str) -> Result<CommandOutput> {
        self.log_and_execute("Creating dataset", "zfs", &["create", dataset])
            .await
    }

    /// Export every pool, forcing when a clean export fails. Failures are
    /// only logged.
    pub async fn export_all(&self) {
        match self.exec.run("zpool", &["export", "-a"]).await {
            Ok(out) if out.success() => {
                info!("all pools exported");
                return;
            }
            Ok(out) => warn!("zpool export failed: {}", out.combined().trim()),
            Err(e) => warn!("zpool export failed: {}", e),
        }

        match self.exec.run("zpool", &["export", "-a", "-f"]).await {
            Ok(out) if out.success() => info!("all pools force exported"),
            Ok(out) => error!("zpool force export failed: {}", out.combined().trim()),
            Err(e) => error!("zpool force export failed: {}", e),
        }
    }

    async fn log_and_execute(
        &self,
        description: &str,
        program: &str,
        args: &[&str],
    ) -> Result<CommandOutput> {
        info!("Executing: {} -> {} {}", description, program, args.join(" "));
        let out = self.exec.run(program, args).await?;
        if !out.success() {
            error!("{} failed: {}", description, out.combined().trim());
            return Err(K8sInitError::Process {
                command: format!("{} {}", program, args.join(" ")),
                exit_code: out.status,
                stderr: out.combined(),
            });
        }
        Ok(out)
    }
}

fn parse_importable(text: &str) -> Result<Vec<String>> {
    let re = Regex::new(r"pool: (\S+)")
        .map_err(|e| K8sInitError::storage(format!("Invalid regex pattern: {}", e)))?;
    Ok(re
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect())
}

fn parse_number(field: &str, line: &str) -> Result<u64> {
    field
        .parse()
        .map_err(|_| K8sInitError::storage(format!("Unexpected zfs output: {}", line)))
}

fn parse_pool_line(line: &str) -> Result<PoolInfo> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 5 {
        return Err(K8sInitError::storage(format!("Unexpected zpool output: {}", line)));
    }
    Ok(PoolInfo {
        name: fields[0].to_string(),
        size: parse_number(fields[1], line)?,
        allocated: parse_number(fields[2], line)?,
        free: parse_number(fields[3], line)?,
        health: fields[4].trim().to_string(),
    })
}

fn parse_dataset_line(line: &str) -> Result<DatasetInfo> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 4 {
        return Err(K8sInitError::storage(format!("Unexpected zfs output: {}", line)));
    }
    Ok(DatasetInfo {
        name: fields[0].to_string(),
        used: parse_number(fields[1], line)?,
        available: parse_number(fields[2], line)?,
        mountpoint: fields[3].trim().to_string(),
    })
}
