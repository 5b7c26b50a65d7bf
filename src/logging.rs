use std::str::FromStr;

use tracing::Level;

use crate::error::{Error, Result};

/// Installs the global fmt subscriber at `level` (`trace`, `debug`, `info`, `warn` or `error`).
pub fn init(level: &str) -> Result<()> {
    let level: Level =
        Level::from_str(level.trim()).map_err(|_| Error::config(format!("invalid log level '{}'", level)))?;
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_line_number(true)
        .with_thread_names(true)
        .try_init()
        .map_err(|error| Error::Internal(format!("unable to install log subscriber: {}", error)))
}
