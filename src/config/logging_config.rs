use serde::{Deserialize, Serialize};

use crate::error::{Result, TransferError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, e.g. `info` or `dimse=debug,info`
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub log_to_file: bool,

    #[serde(default)]
    pub log_file_path: String,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            log_to_file: false,
            log_file_path: String::new(),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.log_to_file && self.log_file_path.trim().is_empty() {
            return Err(TransferError::config(
                "logging.log_file_path is required when log_to_file is enabled",
            ));
        }
        Ok(())
    }
}
