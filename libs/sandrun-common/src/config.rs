use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::guard::MAX_CODE_CHARS;

/// Application configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    /// Shared scratch directory for job artifacts
    pub scratch_dir: PathBuf,
    pub status_ttl_secs: u64,
    /// Safety expiry for source blobs a worker never got to delete
    pub blob_ttl_secs: u64,
    pub max_code_chars: usize,
    pub structure_check: bool,
    /// Descriptors pulled per worker iteration
    pub batch_size: usize,
    pub poll_timeout_secs: f64,
    /// Descriptors of one batch processed at the same time
    pub worker_concurrency: usize,
    /// Outer deadline of the synchronous run endpoint
    pub sync_deadline_ms: u64,
    /// Per-stream capture ceiling
    pub output_limit_bytes: usize,
    pub port: u16,
}

impl Config {
    /// Built-in defaults, no environment lookups
    pub fn defaults() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            scratch_dir: env::temp_dir().join("sandrun"),
            status_ttl_secs: 3600,
            blob_ttl_secs: 86_400,
            max_code_chars: MAX_CODE_CHARS,
            structure_check: true,
            batch_size: 10,
            poll_timeout_secs: 5.0,
            worker_concurrency: 1,
            sync_deadline_ms: 60_000,
            output_limit_bytes: 1024 * 1024,
            port: 3000,
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::defaults();
        Self {
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            scratch_dir: env::var("SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_dir),
            status_ttl_secs: parse_env("STATUS_TTL_SECS", defaults.status_ttl_secs),
            blob_ttl_secs: parse_env("BLOB_TTL_SECS", defaults.blob_ttl_secs),
            max_code_chars: parse_env("MAX_CODE_CHARS", defaults.max_code_chars),
            structure_check: parse_env("STRUCTURE_CHECK", defaults.structure_check),
            batch_size: parse_env("BATCH_SIZE", defaults.batch_size).max(1),
            poll_timeout_secs: parse_env("POLL_TIMEOUT_SECS", defaults.poll_timeout_secs),
            worker_concurrency: parse_env("WORKER_CONCURRENCY", defaults.worker_concurrency)
                .max(1),
            sync_deadline_ms: parse_env("SYNC_DEADLINE_MS", defaults.sync_deadline_ms),
            output_limit_bytes: parse_env("OUTPUT_LIMIT_BYTES", defaults.output_limit_bytes),
            port: parse_env("PORT", defaults.port),
        }
    }

    pub fn new() -> Self {
        Self::from_env()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
