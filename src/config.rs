use crate::cache::{CacheConfig, EvictionMode};
use crate::chunker::BLOCK_SIZE;
use crate::notifier::DEFAULT_NOTIFIER_CAPACITY;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid stream configuration: {0}")]
    Invalid(String),
}

/// Tuning for streams and their upstream connections
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Body chunk size in bytes, a multiple of the block size (default: 1MB)
    pub chunk_size: u64,
    /// Longest wait for the next upstream buffer before reconnecting
    pub stream_timeout_seconds: u64,
    /// Longest a read waits for its chunks before giving up
    pub chunk_wait_timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    /// How far ahead of the connection cursor a read may land without forcing a reconnect
    pub sequential_read_tolerance_blocks: u64,
    /// Distance from the previous read beyond which a small read counts as a scan
    pub scan_tolerance_blocks: u64,
    pub max_connection_attempts: u32,
    /// Backoff before the second attempt, doubled for each one after
    pub retry_backoff_ms: u64,
    /// Chunks the connection may run ahead of the latest read before pausing
    pub read_ahead_chunks: u64,
    pub notifier_capacity: usize,
    pub proxy_url: Option<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            chunk_size: 1024 * 1024,
            stream_timeout_seconds: 30,
            chunk_wait_timeout_seconds: 20,
            connect_timeout_seconds: 10,
            sequential_read_tolerance_blocks: 16,
            scan_tolerance_blocks: 256,
            max_connection_attempts: 4,
            retry_backoff_ms: 500,
            read_ahead_chunks: 8,
            notifier_capacity: DEFAULT_NOTIFIER_CAPACITY,
            proxy_url: None,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive".to_string()));
        }
        if self.chunk_size % BLOCK_SIZE != 0 {
            return Err(ConfigError::Invalid(format!(
                "chunk_size {} is not a multiple of {}",
                self.chunk_size, BLOCK_SIZE
            )));
        }
        if self.max_connection_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_connection_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_seconds)
    }

    pub fn chunk_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_wait_timeout_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn sequential_tolerance_bytes(&self) -> u64 {
        self.sequential_read_tolerance_blocks * BLOCK_SIZE
    }

    pub fn scan_tolerance_bytes(&self) -> u64 {
        self.scan_tolerance_blocks * BLOCK_SIZE
    }

    /// Backoff after the `attempt`-th failed attempt (1-based)
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

/// Application configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub stream: StreamConfig,
    pub cache: CacheConfig,
}

impl Config {
    /// Load configuration from a `.env` file (if present) and `STREAMFS_*` variables
    pub fn load() -> Self {
        if dotenvy::dotenv().is_ok() {
            info!("Config: loaded .env file");
        }
        Self::from_env()
    }

    /// Build configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let stream_defaults = StreamConfig::default();
        let cache_defaults = CacheConfig::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let mut stream = StreamConfig {
            chunk_size: parsed(&var, "STREAMFS_CHUNK_SIZE", stream_defaults.chunk_size),
            stream_timeout_seconds: parsed(
                &var,
                "STREAMFS_STREAM_TIMEOUT_SECONDS",
                stream_defaults.stream_timeout_seconds,
            ),
            chunk_wait_timeout_seconds: parsed(
                &var,
                "STREAMFS_CHUNK_WAIT_TIMEOUT_SECONDS",
                stream_defaults.chunk_wait_timeout_seconds,
            ),
            connect_timeout_seconds: parsed(
                &var,
                "STREAMFS_CONNECT_TIMEOUT_SECONDS",
                stream_defaults.connect_timeout_seconds,
            ),
            sequential_read_tolerance_blocks: parsed(
                &var,
                "STREAMFS_SEQUENTIAL_READ_TOLERANCE_BLOCKS",
                stream_defaults.sequential_read_tolerance_blocks,
            ),
            scan_tolerance_blocks: parsed(
                &var,
                "STREAMFS_SCAN_TOLERANCE_BLOCKS",
                stream_defaults.scan_tolerance_blocks,
            ),
            max_connection_attempts: parsed(
                &var,
                "STREAMFS_MAX_CONNECTION_ATTEMPTS",
                stream_defaults.max_connection_attempts,
            ),
            retry_backoff_ms: parsed(
                &var,
                "STREAMFS_RETRY_BACKOFF_MS",
                stream_defaults.retry_backoff_ms,
            ),
            read_ahead_chunks: parsed(
                &var,
                "STREAMFS_READ_AHEAD_CHUNKS",
                stream_defaults.read_ahead_chunks,
            ),
            notifier_capacity: parsed(
                &var,
                "STREAMFS_NOTIFIER_CAPACITY",
                stream_defaults.notifier_capacity,
            ),
            proxy_url: var("STREAMFS_PROXY_URL"),
        };

        if let Err(e) = stream.validate() {
            warn!("Config: {}, using default stream settings", e);
            stream = StreamConfig {
                proxy_url: stream.proxy_url,
                ..StreamConfig::default()
            };
        }

        let cache = CacheConfig {
            cache_dir: var("STREAMFS_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(cache_defaults.cache_dir),
            max_size_bytes: parsed(
                &var,
                "STREAMFS_CACHE_MAX_SIZE_BYTES",
                cache_defaults.max_size_bytes,
            ),
            ttl_seconds: parsed(&var, "STREAMFS_CACHE_TTL_SECONDS", cache_defaults.ttl_seconds),
            eviction: parsed::<EvictionMode>(&var, "STREAMFS_CACHE_EVICTION", cache_defaults.eviction),
            metrics: parsed(&var, "STREAMFS_CACHE_METRICS", cache_defaults.metrics),
            maintenance_interval_seconds: parsed(
                &var,
                "STREAMFS_CACHE_MAINTENANCE_INTERVAL_SECONDS",
                cache_defaults.maintenance_interval_seconds,
            ),
        };

        Config { stream, cache }
    }
}

fn parsed<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match var(name) {
        Some(raw) => match raw.trim().to_ascii_lowercase().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!("Config: invalid {}={:?}, using {:?}", name, raw, default);
                default
            }
        },
        None => default,
    }
}
