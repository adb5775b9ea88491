//! Tracing/logging initialization.
//!
//! Sets up `tracing_subscriber` with an env-filter and either JSON or
//! human-readable output, written to stdout, stderr or a rotating file.

use std::sync::Mutex;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LogOutput, LoggerConfig};
use crate::error::{Error, Result};
use crate::log_writer::{RotatingFile, RotationPolicy};

/// Build the writer selected by `logger.output`.
pub fn make_writer(config: &LoggerConfig) -> Result<BoxMakeWriter> {
    Ok(match config.output {
        LogOutput::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogOutput::Stderr => BoxMakeWriter::new(std::io::stderr),
        LogOutput::File => {
            let path = config
                .file_path
                .clone()
                .ok_or_else(|| Error::Logging("logger.file_path is not set".into()))?;
            let policy =
                RotationPolicy::from_settings(config.max_size, config.max_backups, config.max_age);
            let file = RotatingFile::open(&path, policy).map_err(|e| {
                Error::Logging(format!("Failed to open log file {}: {e}", path.display()))
            })?;
            BoxMakeWriter::new(Mutex::new(file))
        }
    })
}

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `logger.level`. ANSI colours are only
/// emitted for text output to a terminal stream with `enable_colors` set.
pub fn init_tracing(config: &LoggerConfig) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.level.clone()),
    );
    let writer = make_writer(config)?;
    let ansi = config.enable_colors && config.output != LogOutput::File;

    let installed = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .try_init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(ansi)
                    .with_writer(writer),
            )
            .try_init(),
    };
    installed.map_err(|e| Error::Logging(e.to_string()))?;

    if config.compress && config.output == LogOutput::File {
        tracing::warn!("logger.compress is set but rotated logs are kept uncompressed");
    }
    Ok(())
}
