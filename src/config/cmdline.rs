// file: src/config/cmdline.rs
// version: 1.0.0
// guid: 67b240ef-91fa-46d9-bf96-33473878f539

//! Kernel command line parameters

use super::Role;
use crate::Result;
use std::path::Path;
use tracing::warn;

pub const ROLE_PARAM: &str = "k8sinit.role";
pub const POOL_PARAM: &str = "k8sinit.pool";
pub const DEFAULT_POOL_NAME: &str = "zp_k8s";

/// Parsed kernel parameters, in command line order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelParams {
    params: Vec<(String, Option<String>)>,
}

impl KernelParams {
    /// Parse a space separated list of `key=value` or bare `key` tokens
    pub fn parse(cmdline: &str) -> Self {
        let params = cmdline
            .split_whitespace()
            .map(|token| match token.split_once('=') {
                Some((key, value)) => (key.to_string(), Some(value.to_string())),
                None => (token.to_string(), None),
            })
            .collect();
        Self { params }
    }

    /// Read and parse the kernel command line
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            crate::error::K8sInitError::config(format!(
                "cannot read kernel parameters from {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Ok(Self::parse(&data))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.params.iter().any(|(k, _)| k == key)
    }

    /// All values given for `key`
    pub fn values(&self, key: &str) -> Vec<&str> {
        self.params
            .iter()
            .filter(|(k, _)| k == key)
            .filter_map(|(_, v)| v.as_deref())
            .collect()
    }

    /// First value given for `key`
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values(key).into_iter().next()
    }

    /// Node role; anything but `manager` is a plain node
    pub fn role(&self) -> Role {
        match self.value(ROLE_PARAM) {
            None => Role::Node,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!("unknown role '{}', falling back to node", raw);
                Role::Node
            }),
        }
    }

    pub fn pool_name(&self) -> &str {
        self.value(POOL_PARAM)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_POOL_NAME)
    }
}
