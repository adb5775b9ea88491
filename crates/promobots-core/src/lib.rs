//! Promobots Core Library
//!
//! Shared functionality for the promobots service:
//! - Configuration resolution (YAML file + environment)
//! - Tracing initialisation and rotating log files
//! - Database pool helpers and error types

pub mod config;
pub mod db;
pub mod error;
pub mod log_writer;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
