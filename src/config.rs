//! Server configuration.
//!
//! Defaults match the reference deployment. A JSON file can override any
//! subset of fields; command-line flags are applied on top by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upper bound on the inner per-query thread pool.
pub const MAX_THREADS_PER_QUERY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// CSV table datasets are built from.
    pub source_table: PathBuf,
    /// Directory holding `list.txt` and the `db_<key id>` trees.
    pub dataset_dir: PathBuf,
    /// Key directory; `<dataset_dir>/keys` when unset.
    pub key_dir: Option<PathBuf>,
    pub max_concurrent_queries: usize,
    pub max_results: usize,
    pub max_result_lifetime_secs: u64,
    /// Number of Calc Workers.
    pub workers: usize,
    /// Size of each worker's inner chunk pool.
    pub threads_per_query: usize,
    pub retry_interval_ms: u64,
    pub chunk_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 10001,
            source_table: PathBuf::from("demo.csv"),
            dataset_dir: PathBuf::from("."),
            key_dir: None,
            max_concurrent_queries: 128,
            max_results: 128,
            max_result_lifetime_secs: 50_000,
            workers: 2,
            threads_per_query: 28,
            retry_interval_ms: 100,
            chunk_size: 100,
        }
    }
}

impl ServerConfig {
    /// Load from a JSON file; absent fields keep their defaults.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reject configurations the scheduler cannot run with, and clamp the
    /// inner pool size to [`MAX_THREADS_PER_QUERY`].
    ///
    /// # Errors
    /// Returns `ConfigError::Zero` naming the first zero capacity.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        let required = [
            ("max_concurrent_queries", self.max_concurrent_queries),
            ("max_results", self.max_results),
            ("workers", self.workers),
            ("threads_per_query", self.threads_per_query),
            ("chunk_size", self.chunk_size),
        ];
        if let Some((name, _)) = required.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero(*name));
        }
        if self.retry_interval_ms == 0 {
            return Err(ConfigError::Zero("retry_interval_ms"));
        }
        if self.threads_per_query > MAX_THREADS_PER_QUERY {
            tracing::warn!(
                requested = self.threads_per_query,
                max = MAX_THREADS_PER_QUERY,
                "Clamping threads per query"
            );
            self.threads_per_query = MAX_THREADS_PER_QUERY;
        }
        Ok(self)
    }

    #[must_use]
    pub fn key_dir(&self) -> PathBuf {
        self.key_dir
            .clone()
            .unwrap_or_else(|| self.dataset_dir.join("keys"))
    }

    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    #[must_use]
    pub fn max_result_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_result_lifetime_secs)
    }
}
