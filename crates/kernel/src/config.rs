//! Configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port (default: 3000).
    pub port: u16,

    /// Cache root holding the input/output namespaces (default: ./cache).
    pub cache_dir: PathBuf,

    /// Root for local sources. When None, local sources are refused.
    pub files_dir: Option<PathBuf>,

    /// Remove the cache root at startup (default: false).
    pub clear_cache: bool,

    /// Timeout for remote source fetches (default: 30s).
    pub fetch_timeout: Duration,

    /// Largest source accepted, in bytes (default: 50 MB).
    pub max_source_bytes: u64,

    /// Maximum concurrent transforms (default: 4).
    pub max_concurrent_transforms: usize,

    /// CORS allowed origins (comma-separated, default: "*").
    pub cors_allowed_origins: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = var("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse()
            .context("PORT must be a valid u16")?;

        let cache_dir = var("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./cache"));

        let files_dir = var("FILES_DIRECTORY")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let clear_cache = var("CLEAR_CACHE")
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false);

        let fetch_timeout_secs: u64 = var("FETCH_TIMEOUT_SECS")
            .unwrap_or_else(|| "30".to_string())
            .parse()
            .context("FETCH_TIMEOUT_SECS must be a valid u64")?;
        if fetch_timeout_secs == 0 {
            anyhow::bail!("FETCH_TIMEOUT_SECS must be greater than zero");
        }

        let max_source_bytes = var("MAX_SOURCE_BYTES")
            .unwrap_or_else(|| (50 * 1024 * 1024).to_string())
            .parse()
            .context("MAX_SOURCE_BYTES must be a valid u64")?;

        let max_concurrent_transforms: usize = var("MAX_CONCURRENT_TRANSFORMS")
            .unwrap_or_else(|| "4".to_string())
            .parse()
            .context("MAX_CONCURRENT_TRANSFORMS must be a valid usize")?;
        if max_concurrent_transforms == 0 {
            anyhow::bail!("MAX_CONCURRENT_TRANSFORMS must be greater than zero");
        }

        let cors_allowed_origins = var("CORS_ALLOWED_ORIGINS")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_else(|| vec!["*".to_string()]);

        Ok(Self {
            port,
            cache_dir,
            files_dir,
            clear_cache,
            fetch_timeout: Duration::from_secs(fetch_timeout_secs),
            max_source_bytes,
            max_concurrent_transforms,
            cors_allowed_origins,
        })
    }
}
