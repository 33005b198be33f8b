// file: src/error.rs
// version: 1.0.0
// guid: f4d5ec78-5c91-4ef7-a444-e60d82851988

use thiserror::Error;

/// Result type alias for the init process
pub type Result<T> = std::result::Result<T, K8sInitError>;

/// Error types for k8sinit
#[derive(Error, Debug)]
pub enum K8sInitError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Command '{command}' failed with exit code {exit_code:?}: {stderr}")]
    Process {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Installation error: {0}")]
    Installation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("System error: {0}")]
    System(String),

    /// No install configuration or pool name exists yet
    #[error("k8sinit is not installed")]
    NotProvisioned,

    #[error("Boot step '{step}' failed: {source}")]
    BootStep {
        step: String,
        #[source]
        source: Box<K8sInitError>,
    },
}

impl K8sInitError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a new storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new installation error
    pub fn installation(msg: impl Into<String>) -> Self {
        Self::Installation(msg.into())
    }

    /// Create a new system error
    pub fn system(msg: impl Into<String>) -> Self {
        Self::System(msg.into())
    }

    /// Wrap an error with the name of the boot step that produced it
    pub fn boot_step(step: impl Into<String>, source: K8sInitError) -> Self {
        Self::BootStep {
            step: step.into(),
            source: Box::new(source),
        }
    }

    /// True for the "not installed yet" condition, which callers treat as
    /// a missing feature rather than a failure
    pub fn is_not_provisioned(&self) -> bool {
        matches!(self, Self::NotProvisioned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_step_keeps_source() {
        let err = K8sInitError::boot_step("network", K8sInitError::network("no links"));
        let msg = err.to_string();
        assert!(msg.contains("network"));
        assert!(msg.contains("no links"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_not_provisioned_predicate() {
        assert!(K8sInitError::NotProvisioned.is_not_provisioned());
        assert!(!K8sInitError::system("x").is_not_provisioned());
    }

    #[test]
    fn test_process_error_display() {
        let err = K8sInitError::Process {
            command: "zpool list".to_string(),
            exit_code: Some(1),
            stderr: "no pools".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Command 'zpool list' failed with exit code Some(1): no pools"
        );
    }
}
