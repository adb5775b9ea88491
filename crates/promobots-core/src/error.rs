//! Error types for the promobots core library.

use thiserror::Error;

/// Result type alias using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Logging setup error
    #[error("Logging setup error: {0}")]
    Logging(String),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
