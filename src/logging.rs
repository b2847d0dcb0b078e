//! Logging initialisation

use std::fs::File;
use std::sync::Arc;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Result, TransferError};

/// Install the global subscriber: stdout, plus a file when `log_to_file` is set.
///
/// Fails if the filter does not parse, the file cannot be created, or a
/// subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.level).map_err(|e| {
        TransferError::Logging(format!("invalid level '{}': {}", config.level, e))
    })?;

    let file_layer = if config.log_to_file {
        let file = File::create(&config.log_file_path).map_err(|e| {
            TransferError::Logging(format!("cannot create {}: {}", config.log_file_path, e))
        })?;
        Some(
            fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_writer(Arc::new(file)),
        )
    } else {
        None
    };

    let stdout_layer = fmt::layer().with_file(true).with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| TransferError::Logging(e.to_string()))?;

    tracing::info!("Logging initialised at '{}'", config.level);
    Ok(())
}
