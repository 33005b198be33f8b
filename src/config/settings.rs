// file: src/config/settings.rs
// version: 1.0.0
// guid: 54376332-5a48-4027-b77a-fc09a529aaa4

//! Appliance settings with optional TOML overrides and environment variable
//! substitution

use crate::error::K8sInitError;
use crate::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Layout of the appliance image and parameters of the management services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitSettings {
    /// Prefix for every absolute path the init process touches
    pub root_dir: PathBuf,
    pub cmdline_path: PathBuf,
    pub htdocs_dir: PathBuf,
    pub http_address: Ipv4Addr,
    pub http_port: u16,
    pub tftp_port: u16,
    pub dhcp_server_port: u16,
    pub dhcp_client_port: u16,
    pub dhcp_lease_secs: u64,
    /// Network boot binary served over TFTP
    pub undi_filename: String,
    pub undi_url: String,
    pub apk_repositories: Vec<String>,
    pub installer_label: String,
    pub installer_mount: PathBuf,
    pub power_delay_secs: u64,
    pub seed_size: usize,
}

impl Default for InitSettings {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/"),
            cmdline_path: PathBuf::from("/proc/cmdline"),
            htdocs_dir: PathBuf::from("/usr/share/k8sinit/htdocs"),
            http_address: Ipv4Addr::UNSPECIFIED,
            http_port: 8000,
            tftp_port: 69,
            dhcp_server_port: 67,
            dhcp_client_port: 68,
            dhcp_lease_secs: 30 * 60,
            undi_filename: "undionly.kpxe".to_string(),
            undi_url: "http://boot.ipxe.org/undionly.kpxe".to_string(),
            apk_repositories: vec![
                "http://dl-cdn.alpinelinux.org/alpine/v3.12/main".to_string(),
                "http://dl-cdn.alpinelinux.org/alpine/v3.12/community".to_string(),
            ],
            installer_label: "K8SINIT_INSTALLER".to_string(),
            installer_mount: PathBuf::from("/mnt/cdrom"),
            power_delay_secs: 15,
            seed_size: 512 * 1024,
        }
    }
}

impl InitSettings {
    /// Load settings from an optional TOML file; a missing file yields the
    /// defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    K8sInitError::config(format!(
                        "Failed to read settings file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let vars: HashMap<String, String> = std::env::vars().collect();
                let expanded = expand_env_vars(&content, &vars)?;
                info!("loaded settings from {}", path.display());
                toml::from_str::<InitSettings>(&expanded)?
            }
            _ => Self::default(),
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.undi_filename.is_empty() || self.undi_filename.contains('/') {
            return Err(K8sInitError::validation(format!(
                "Invalid network boot filename: '{}'",
                self.undi_filename
            )));
        }

        let url = url::Url::parse(&self.undi_url)
            .map_err(|e| K8sInitError::validation(format!("Invalid undi url: {}", e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(K8sInitError::validation(format!(
                "Unsupported undi url scheme: {}",
                url.scheme()
            )));
        }

        if self.power_delay_secs == 0 {
            return Err(K8sInitError::validation(
                "power_delay_secs must be greater than zero",
            ));
        }

        Ok(())
    }

    /// Resolve an absolute appliance path below `root_dir`
    pub fn host_path<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        let path = path.as_ref();
        self.root_dir
            .join(path.strip_prefix("/").unwrap_or(path))
    }

    /// Mountpoint of the root dataset of `pool`
    pub fn pool_dir(&self, pool: &str) -> PathBuf {
        self.root_dir.join(pool)
    }

    pub fn pool_boot_dir(&self, pool: &str) -> PathBuf {
        self.pool_dir(pool).join("boot")
    }

    pub fn pool_config_dir(&self, pool: &str) -> PathBuf {
        self.pool_dir(pool).join("config")
    }

    /// Random seed persisted across boots
    pub fn seed_file(&self, pool: &str) -> PathBuf {
        self.pool_config_dir(pool).join("rndfile")
    }

    pub fn lease_time(&self) -> Duration {
        Duration::from_secs(self.dhcp_lease_secs)
    }

    pub fn power_delay(&self) -> Duration {
        Duration::from_secs(self.power_delay_secs)
    }
}

/// Replace `${VAR}` placeholders with values from `vars`
pub fn expand_env_vars(content: &str, vars: &HashMap<String, String>) -> Result<String> {
    let re = Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| K8sInitError::config(format!("Invalid regex pattern: {}", e)))?;

    let mut missing = Vec::new();
    let expanded = re.replace_all(content, |caps: &regex::Captures| {
        match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => {
                missing.push(caps[1].to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(K8sInitError::config(format!(
            "Missing environment variables: {}",
            missing.join(", ")
        )));
    }

    Ok(expanded.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = InitSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.http_port, 8000);
        assert_eq!(settings.lease_time(), Duration::from_secs(1800));
        assert_eq!(settings.power_delay(), Duration::from_secs(15));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = InitSettings::load(Some(&dir.path().join("none.toml"))).unwrap();
        assert_eq!(settings, InitSettings::default());
        assert_eq!(InitSettings::load(None).unwrap(), InitSettings::default());
    }

    #[test]
    fn test_load_partial_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("k8sinit.toml");
        std::fs::write(&path, "http_port = 8080\nundi_filename = \"ipxe.pxe\"\n").unwrap();
        let settings = InitSettings::load(Some(&path)).unwrap();
        assert_eq!(settings.http_port, 8080);
        assert_eq!(settings.undi_filename, "ipxe.pxe");
        assert_eq!(settings.tftp_port, 69);
    }

    #[test]
    fn test_expand_env_vars() {
        let mut vars = HashMap::new();
        vars.insert("MIRROR".to_string(), "http://mirror.local".to_string());
        let out = expand_env_vars("undi_url = \"${MIRROR}/undionly.kpxe\"", &vars).unwrap();
        assert_eq!(out, "undi_url = \"http://mirror.local/undionly.kpxe\"");
        assert!(expand_env_vars("x = \"${NOPE}\"", &vars).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut s = InitSettings::default();
        s.undi_url = "ftp://example.com/undi".to_string();
        assert!(s.validate().is_err());

        let mut s = InitSettings::default();
        s.undi_filename = "../undi".to_string();
        assert!(s.validate().is_err());

        let mut s = InitSettings::default();
        s.power_delay_secs = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_paths_are_rooted() {
        let mut s = InitSettings::default();
        s.root_dir = PathBuf::from("/tmp/root");
        assert_eq!(s.host_path("/etc/mtab"), PathBuf::from("/tmp/root/etc/mtab"));
        assert_eq!(
            s.seed_file("zp_k8s"),
            PathBuf::from("/tmp/root/zp_k8s/config/rndfile")
        );
        assert_eq!(s.pool_boot_dir("tank"), PathBuf::from("/tmp/root/tank/boot"));
    }
}
