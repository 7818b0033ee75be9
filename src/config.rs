//! Configuration loader for the `weatherflow` pipeline.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). Components receive the values they need from the
//! resulting [`Config`] instead of reading `env::var` themselves.
//!
use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Result};

/// Default base URL of the data.gov.sg v2 real-time API.
pub const DEFAULT_API_URL: &str = "https://api-open.data.gov.sg/v2/real-time/api";

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_num {
    ($var_name:expr, $ty:ty, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of a run.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// PostgreSQL connection string.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Weather API base URL.
    pub api_url: String,

    /// Maximum number of API pages to fetch per request (safety limit).
    pub api_max_pages: u32,

    /// Retries per API page after the first attempt.
    pub api_max_retries: u32,

    /// Base delay of the exponential retry backoff, in milliseconds.
    pub api_retry_base_ms: u64,

    /// Whole-request timeout of one API page, in seconds.
    pub api_timeout_secs: u64,

    /// TCP/TLS connect timeout of the API client, in seconds.
    pub api_connect_timeout_secs: u64,

    /// Raw documents committed per transaction.
    pub raw_batch_size: usize,

    /// Transformed rows committed per transaction.
    pub write_batch_size: usize,

    /// Dates (or ingest units) processed concurrently.
    pub parallelism: usize,

    /// Local archive of fetched documents; `None` disables archiving.
    pub raw_archive_dir: Option<PathBuf>,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string
///
/// Optional:
/// - `WEATHER_API_URL` – API base URL (default: data.gov.sg v2 real-time)
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `API_MAX_PAGES` – max API pages to fetch (default: 100)
/// - `API_MAX_RETRIES` – retries per page (default: 3)
/// - `API_RETRY_BASE_MS` – first backoff delay (default: 500)
/// - `API_TIMEOUT_SECS` – per-page request timeout (default: 30)
/// - `API_CONNECT_TIMEOUT_SECS` – connect timeout (default: 10)
/// - `RAW_BATCH_SIZE` – raw documents per transaction (default: 300)
/// - `WRITE_BATCH_SIZE` – transformed rows per transaction (default: 500)
/// - `PARALLELISM` – concurrent dates (default: 3)
/// - `RAW_ARCHIVE_DIR` – directory archiving fetched documents (default: unset)
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let db_url = require_env!("DATABASE_URL");
    let api_url = env::var("WEATHER_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
    let db_pool_max = parse_env_num!("DB_POOL_MAX", u32, 5);
    let api_max_pages = parse_env_num!("API_MAX_PAGES", u32, 100);
    let api_max_retries = parse_env_num!("API_MAX_RETRIES", u32, 3);
    let api_retry_base_ms = parse_env_num!("API_RETRY_BASE_MS", u64, 500);
    let api_timeout_secs = parse_env_num!("API_TIMEOUT_SECS", u64, 30);
    let api_connect_timeout_secs = parse_env_num!("API_CONNECT_TIMEOUT_SECS", u64, 10);
    let raw_batch_size = parse_env_num!("RAW_BATCH_SIZE", usize, 300);
    let write_batch_size = parse_env_num!("WRITE_BATCH_SIZE", usize, 500);
    let parallelism = parse_env_num!("PARALLELISM", usize, 3);
    let raw_archive_dir = env::var("RAW_ARCHIVE_DIR")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from);

    if raw_batch_size == 0 || write_batch_size == 0 || parallelism == 0 {
        return Err(anyhow!(
            "RAW_BATCH_SIZE, WRITE_BATCH_SIZE and PARALLELISM must be greater than zero"
        ));
    }
    if api_timeout_secs == 0 || api_connect_timeout_secs == 0 {
        return Err(anyhow!(
            "API_TIMEOUT_SECS and API_CONNECT_TIMEOUT_SECS must be greater than zero"
        ));
    }

    Ok(Config {
        db_url,
        db_pool_max,
        api_url,
        api_max_pages,
        api_max_retries,
        api_retry_base_ms,
        api_timeout_secs,
        api_connect_timeout_secs,
        raw_batch_size,
        write_batch_size,
        parallelism,
        raw_archive_dir,
    })
}

impl Config {
    /// Database URL with the password replaced by `****`.
    pub fn masked_db_url(&self) -> String {
        // ---
        if let Some(at_pos) = self.db_url.rfind('@') {
            if let Some(colon_pos) = self.db_url[..at_pos].rfind(':') {
                // the scheme colon is not a password separator
                if !self.db_url[colon_pos..].starts_with("://") {
                    return format!(
                        "{}:****{}",
                        &self.db_url[..colon_pos],
                        &self.db_url[at_pos..]
                    );
                }
            }
        }
        self.db_url.clone()
    }

    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks the database password while showing all other values.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL             : {}", self.masked_db_url());
        tracing::info!("  WEATHER_API_URL          : {}", self.api_url);
        tracing::info!("  DB_POOL_MAX              : {}", self.db_pool_max);
        tracing::info!("  API_MAX_PAGES            : {}", self.api_max_pages);
        tracing::info!("  API_MAX_RETRIES          : {}", self.api_max_retries);
        tracing::info!("  API_RETRY_BASE_MS        : {}", self.api_retry_base_ms);
        tracing::info!("  API_TIMEOUT_SECS         : {}", self.api_timeout_secs);
        tracing::info!("  API_CONNECT_TIMEOUT_SECS : {}", self.api_connect_timeout_secs);
        tracing::info!("  RAW_BATCH_SIZE           : {}", self.raw_batch_size);
        tracing::info!("  WRITE_BATCH_SIZE         : {}", self.write_batch_size);
        tracing::info!("  PARALLELISM              : {}", self.parallelism);
        match &self.raw_archive_dir {
            Some(dir) => tracing::info!("  RAW_ARCHIVE_DIR          : {}", dir.display()),
            None => tracing::info!("  RAW_ARCHIVE_DIR          : (disabled)"),
        }
    }
}
