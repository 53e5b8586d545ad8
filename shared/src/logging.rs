//! Logging setup for PimmsLink binaries
//!
//! Every run writes its own `<prefix>_<timestamp>.log` next to the console
//! output, so the messages sent during a ride day can be traced afterwards.

use std::fs;
use std::path::Path;

use chrono::Local;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{Error, Result};

/// Install console and per-run file logging.
///
/// `level` is an `EnvFilter` directive such as `info` or
/// `pimms_shared::transport=debug`; `RUST_LOG` overrides it.
pub fn init_logging(log_dir: &str, prefix: &str, level: &str) -> Result<()> {
    let log_path = Path::new(log_dir);
    fs::create_dir_all(log_path)?;

    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let log_file = log_path.join(format!("{}_{}.log", prefix, timestamp));
    let file = fs::File::create(&log_file)?;

    let subscriber = tracing_subscriber::registry()
        .with(env_filter(level))
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true),
        );

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Other(format!("installing log subscriber: {}", e)))?;

    tracing::info!("Logging to {}", log_file.display());
    Ok(())
}

/// Console-only logging, for runs that must not leave files behind
pub fn init_console_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .init();
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}
