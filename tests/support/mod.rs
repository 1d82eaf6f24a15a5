use std::sync::Arc;
use streamfs::cache::{Cache, CacheConfig, EvictionMode};
use streamfs::config::StreamConfig;
use streamfs::notifier::ChunkCacheNotifier;
use tempfile::TempDir;

/// Initialize tracing for tests with proper test output handling
pub fn tracing_init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Cache and notifier over a fresh temp directory
pub async fn notifier_in(dir: &TempDir) -> Arc<ChunkCacheNotifier> {
    let config = CacheConfig {
        cache_dir: dir.path().to_path_buf(),
        max_size_bytes: 1 << 30,
        ttl_seconds: 3600,
        eviction: EvictionMode::Lru,
        metrics: true,
        maintenance_interval_seconds: 300,
    };
    let cache = Arc::new(Cache::open(config).await.unwrap());
    Arc::new(ChunkCacheNotifier::new(cache))
}

/// Stream settings with short timeouts and backoff
#[allow(dead_code)]
pub fn fast_config() -> StreamConfig {
    StreamConfig {
        chunk_wait_timeout_seconds: 5,
        stream_timeout_seconds: 5,
        retry_backoff_ms: 10,
        ..StreamConfig::default()
    }
}
