//! Configuration resolution for promobots.
//!
//! Resolution order (lowest to highest priority):
//! 1. Built-in defaults
//! 2. `config.yaml` inside the directory named by `PROMO_BOTS_CONFIG_PATH`
//! 3. `PROMO_BOTS_<SECTION>_<KEY>` environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Prefix for per-key environment overrides.
pub const ENV_PREFIX: &str = "PROMO_BOTS_";

/// The only supported token encryption algorithm.
pub const AES_GCM: &str = "aes_gcm";

const CONFIG_FILE_NAMES: [&str; 2] = ["config.yaml", "config.yml"];

/// Complete promobots configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logger: LoggerConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub broadcasts: BroadcastsConfig,
    #[serde(default)]
    pub bots: BotsConfig,
}

/// Relational store and pool tuning. Durations are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub conn_max_lifetime: u64,
    pub conn_max_idle_time: u64,
    pub health_check_period: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/promobots.db"),
            max_open_conns: 10,
            max_idle_conns: 2,
            conn_max_lifetime: 3600,
            conn_max_idle_time: 600,
            health_check_period: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    Stderr,
    File,
}

/// Logging configuration. `max_size` is in MiB, `max_age` in days.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
    pub file_path: Option<PathBuf>,
    pub max_size: u64,
    pub max_backups: u32,
    pub max_age: u32,
    pub compress: bool,
    pub enable_colors: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            output: LogOutput::Stdout,
            file_path: None,
            max_size: 100,
            max_backups: 3,
            max_age: 28,
            compress: false,
            enable_colors: true,
        }
    }
}

/// Token encryption settings. Key bytes never live here; they come from
/// `PROMO_BOTS_TOKEN_ENCRYPTION_KEY[_V{N}]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// `0` means "highest loaded version".
    pub current_key_version: u32,
    pub crypto_algorithm: String,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            current_key_version: 0,
            crypto_algorithm: AES_GCM.to_string(),
        }
    }
}

impl CryptoConfig {
    /// The pinned key version, if any.
    pub const fn pinned_version(&self) -> Option<u32> {
        match self.current_key_version {
            0 => None,
            v => Some(v),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastsConfig {
    pub path: PathBuf,
    /// Pause between two recipients of one broadcast.
    pub send_interval_ms: u64,
}

impl Default for BroadcastsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/broadcasts.json"),
            send_interval_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotsConfig {
    /// Platform user ids granted the admin role on first contact.
    pub admin_ids: Vec<i64>,
    /// Server-side wait of one long-poll request.
    pub poll_timeout_secs: u64,
}

impl Default for BotsConfig {
    fn default() -> Self {
        Self {
            admin_ids: Vec::new(),
            poll_timeout_secs: 60,
        }
    }
}

/// Load configuration from `dir` and the process environment.
pub fn load_config(dir: &Path) -> Result<Config> {
    let mut config = match find_config_file(dir) {
        Some(path) => load_config_file(&path)?,
        None => Config::default(),
    };
    apply_env_overrides(&mut config, std::env::vars())?;
    config.validate()?;
    Ok(config)
}

fn find_config_file(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_yaml::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("Invalid value for {name}: {value:?}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("Invalid value for {name}: {value:?}"))),
    }
}

fn parse_enum<T: serde::de::DeserializeOwned>(name: &str, value: &str) -> Result<T> {
    serde_yaml::from_str(&value.trim().to_ascii_lowercase())
        .map_err(|_| Error::Config(format!("Invalid value for {name}: {value:?}")))
}

/// Apply `PROMO_BOTS_<SECTION>_<KEY>` overrides from `(name, value)` pairs.
///
/// Unknown names under the prefix are ignored so unrelated variables such as
/// key material or the config path pass through.
pub fn apply_env_overrides<I>(config: &mut Config, vars: I) -> Result<()>
where
    I: IntoIterator<Item = (String, String)>,
{
    for (name, value) in vars {
        let Some(key) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let n = name.as_str();
        let v = value.as_str();
        match key {
            "DATABASE_PATH" => config.database.path = PathBuf::from(v),
            "DATABASE_MAX_OPEN_CONNS" => config.database.max_open_conns = parse_env(n, v)?,
            "DATABASE_MAX_IDLE_CONNS" => config.database.max_idle_conns = parse_env(n, v)?,
            "DATABASE_CONN_MAX_LIFETIME" => config.database.conn_max_lifetime = parse_env(n, v)?,
            "DATABASE_CONN_MAX_IDLE_TIME" => config.database.conn_max_idle_time = parse_env(n, v)?,
            "DATABASE_HEALTH_CHECK_PERIOD" => {
                config.database.health_check_period = parse_env(n, v)?;
            }
            "LOGGER_LEVEL" => config.logger.level = v.to_string(),
            "LOGGER_FORMAT" => config.logger.format = parse_enum(n, v)?,
            "LOGGER_OUTPUT" => config.logger.output = parse_enum(n, v)?,
            "LOGGER_FILE_PATH" => config.logger.file_path = Some(PathBuf::from(v)),
            "LOGGER_MAX_SIZE" => config.logger.max_size = parse_env(n, v)?,
            "LOGGER_MAX_BACKUPS" => config.logger.max_backups = parse_env(n, v)?,
            "LOGGER_MAX_AGE" => config.logger.max_age = parse_env(n, v)?,
            "LOGGER_COMPRESS" => config.logger.compress = parse_bool(n, v)?,
            "LOGGER_ENABLE_COLORS" => config.logger.enable_colors = parse_bool(n, v)?,
            "CRYPTO_CURRENT_KEY_VERSION" => config.crypto.current_key_version = parse_env(n, v)?,
            "CRYPTO_CRYPTO_ALGORITHM" => config.crypto.crypto_algorithm = v.trim().to_string(),
            "BROADCASTS_PATH" => config.broadcasts.path = PathBuf::from(v),
            "BROADCASTS_SEND_INTERVAL_MS" => config.broadcasts.send_interval_ms = parse_env(n, v)?,
            "BOTS_ADMIN_IDS" => {
                config.bots.admin_ids = v
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| parse_env(n, s))
                    .collect::<Result<_>>()?;
            }
            "BOTS_POLL_TIMEOUT_SECS" => config.bots.poll_timeout_secs = parse_env(n, v)?,
            _ => {}
        }
    }
    Ok(())
}

impl Config {
    /// Reject combinations the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.crypto.crypto_algorithm != AES_GCM {
            return Err(Error::Config(format!(
                "Unsupported crypto_algorithm {:?}, expected {AES_GCM:?}",
                self.crypto.crypto_algorithm
            )));
        }
        if self.database.max_open_conns == 0 {
            return Err(Error::Config("database.max_open_conns must be positive".into()));
        }
        if self.database.max_idle_conns > self.database.max_open_conns {
            return Err(Error::Config(
                "database.max_idle_conns must not exceed max_open_conns".into(),
            ));
        }
        if self.database.health_check_period == 0 {
            return Err(Error::Config("database.health_check_period must be positive".into()));
        }
        if self.logger.output == LogOutput::File && self.logger.file_path.is_none() {
            return Err(Error::Config("logger.file_path is required for file output".into()));
        }
        if self.bots.poll_timeout_secs == 0 {
            return Err(Error::Config("bots.poll_timeout_secs must be positive".into()));
        }
        Ok(())
    }
}
