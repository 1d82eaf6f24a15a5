use crate::cache::Cache;
use crate::chunker::Chunk;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Default number of chunk flags kept alive at once
pub const DEFAULT_NOTIFIER_CAPACITY: usize = 1024;

/// Pause before a waiter whose flag was pushed out subscribes again
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_millis(10);

/// Process-wide registry of "is this chunk cached" flags.
///
/// Readers waiting on the same chunk share one `watch` channel, so a single
/// `mark_cached` wakes all of them. Entries are created lazily (seeded from
/// `Cache::has`) and removed once the chunk is cached. When the bounded registry
/// is full, flags nobody is waiting on are dropped first; only when every flag has
/// waiters is the least recently used one pushed out. A waiter that sees its
/// channel close re-checks the cache and subscribes again after a short pause.
pub struct ChunkCacheNotifier {
    cache: Arc<Cache>,
    registry: Mutex<LruCache<Chunk, watch::Sender<bool>>>,
}

impl ChunkCacheNotifier {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self::with_capacity(cache, DEFAULT_NOTIFIER_CAPACITY)
    }

    pub fn with_capacity(cache: Arc<Cache>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        ChunkCacheNotifier {
            cache,
            registry: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Subscribe to a chunk's cached flag, creating the entry if needed
    pub fn subscribe(&self, chunk: &Chunk) -> watch::Receiver<bool> {
        let mut registry = self.lock_registry();
        if let Some(sender) = registry.get(chunk) {
            return sender.subscribe();
        }

        let cached = chunk.is_cached(&self.cache);
        let (sender, receiver) = watch::channel(cached);
        if !cached {
            if registry.len() >= registry.cap().get() {
                let idle = registry
                    .iter()
                    .rev()
                    .find(|(_, flag)| flag.receiver_count() == 0)
                    .map(|(chunk, _)| chunk.clone());
                if let Some(idle) = idle {
                    registry.pop(&idle);
                }
            }
            registry.push(chunk.clone(), sender);
        }
        receiver
    }

    pub fn is_cached(&self, chunk: &Chunk) -> bool {
        *self.subscribe(chunk).borrow()
    }

    /// Flag a chunk as cached, waking every waiter and freeing its entry
    pub fn mark_cached(&self, chunk: &Chunk) {
        let sender = self.lock_registry().pop(chunk);
        if let Some(sender) = sender {
            sender.send_replace(true);
            debug!("Notifier: {} of {} cached", chunk, chunk.cache_key);
        }
    }

    /// Wait until `chunk` is cached
    pub async fn wait(&self, chunk: &Chunk) {
        loop {
            let mut receiver = self.subscribe(chunk);
            if wait_for_true(&mut receiver).await {
                return;
            }
            // Entry was evicted from the registry; the flag is recreated on resubscribe
            tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
        }
    }

    /// Wait until `chunk` is cached. Returns false if `timeout` elapses first.
    pub async fn wait_cached(&self, chunk: &Chunk, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait(chunk)).await.is_ok()
    }

    /// Drop every entry belonging to one file
    pub fn clear_file(&self, cache_key: &str) {
        let mut registry = self.lock_registry();
        let chunks: Vec<Chunk> = registry
            .iter()
            .filter(|(chunk, _)| chunk.cache_key == cache_key)
            .map(|(chunk, _)| chunk.clone())
            .collect();
        for chunk in &chunks {
            registry.pop(chunk);
        }
        if !chunks.is_empty() {
            debug!(
                "Notifier: cleared {} chunk flags of {}",
                chunks.len(),
                cache_key
            );
        }
    }

    pub fn len(&self) -> usize {
        self.lock_registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_registry(&self) -> MutexGuard<'_, LruCache<Chunk, watch::Sender<bool>>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resolves true once the flag is set, or false if the sender went away unset
pub(crate) async fn wait_for_true(receiver: &mut watch::Receiver<bool>) -> bool {
    loop {
        if *receiver.borrow_and_update() {
            return true;
        }
        if receiver.changed().await.is_err() {
            return *receiver.borrow();
        }
    }
}
