mod logging_config;

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use dimse::{DimseConfig, RemoteNode};
use serde::{Deserialize, Serialize};

use crate::dispatcher::DispatcherConfig;
use crate::error::{Result, TransferError};
use crate::queue::QueueConfig;
use crate::reliability::{CircuitBreakerConfig, RetryPolicy};

pub use logging_config::LoggingConfig;

/// Top level configuration, read from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    pub dimse: DimseConfig,

    /// Remote nodes by name
    #[serde(default)]
    pub nodes: HashMap<String, RemoteNode>,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

impl Config {
    /// Read and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            TransferError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        text.parse()
    }

    pub fn node(&self, name: &str) -> Result<&RemoteNode> {
        self.nodes
            .get(name)
            .ok_or_else(|| TransferError::UnknownNode(name.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.logging.validate()?;
        self.dimse
            .validate()
            .map_err(|e| TransferError::config(format!("dimse: {e}")))?;
        for (name, node) in &self.nodes {
            if name.trim().is_empty() {
                return Err(TransferError::config("Node names must not be empty"));
            }
            node.validate()
                .map_err(|e| TransferError::config(format!("nodes.{name}: {e}")))?;
        }
        self.queue.validate()?;
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.dispatcher.validate()?;
        Ok(())
    }
}

impl FromStr for Config {
    type Err = TransferError;

    /// Parse TOML and validate
    fn from_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)
            .map_err(|e| TransferError::config(format!("Invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}
