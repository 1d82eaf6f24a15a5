// Library exports for the filesystem layer, the CLI and integration tests

pub mod cache;
pub mod chunker;
pub mod config;
pub mod notifier;
pub mod stream;
pub mod upstream;

pub use cache::{Cache, CacheConfig, EvictionMode};
pub use chunker::{Chunk, ChunkRange, Chunker};
pub use config::{Config, StreamConfig};
pub use notifier::ChunkCacheNotifier;
pub use stream::{MediaStream, StreamError};

// Test support (only available with test-utils feature)
#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;
