use filetime::FileTime;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

const META_EXTENSION: &str = "meta";
const TMP_EXTENSION: &str = "tmp";

/// Access-time refreshes closer together than this are skipped to bound write amplification
const MTIME_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Errors that can occur during cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cache configuration error: {0}")]
    Config(String),
    #[error("Sidecar serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Chunk of {size} bytes exceeds the cache budget of {budget} bytes")]
    TooLarge { size: u64, budget: u64 },
}

/// How the cache reclaims space
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionMode {
    /// Evict least recently touched entries once over budget
    #[default]
    Lru,
    /// Evict entries older than the TTL, regardless of size
    Ttl,
}

impl FromStr for EvictionMode {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionMode::Lru),
            "ttl" => Ok(EvictionMode::Ttl),
            other => Err(CacheError::Config(format!("Unknown eviction mode: {}", other))),
        }
    }
}

/// Configuration for the chunk cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory where cached chunks are stored
    pub cache_dir: PathBuf,
    /// Maximum cache size in bytes (default: 10GB)
    pub max_size_bytes: u64,
    /// Entry lifetime in TTL mode (default: 7 days)
    pub ttl_seconds: u64,
    pub eviction: EvictionMode,
    /// Track hit/miss/eviction counters
    pub metrics: bool,
    /// How often the safety net re-checks tracked totals (default: 5 minutes)
    pub maintenance_interval_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let base_dir = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
        CacheConfig {
            cache_dir: base_dir.join(".streamfs").join("cache"),
            max_size_bytes: 10 * 1024 * 1024 * 1024, // 10GB
            ttl_seconds: 7 * 24 * 60 * 60,
            eviction: EvictionMode::Lru,
            metrics: false,
            maintenance_interval_seconds: 300,
        }
    }
}

/// Metadata about a stored chunk
#[derive(Debug, Clone)]
struct CacheEntry {
    /// SHA-1 of "{cache_key}|{start}", also the content file name
    key: String,
    cache_key: String,
    start: u64,
    size: u64,
    /// Last touch time, mirrored to the content file's mtime
    mtime: SystemTime,
    file_path: PathBuf,
}

/// Sidecar written next to every content file
#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    cache_key: String,
    start: u64,
}

struct Index {
    /// Ordered from least to most recently touched
    entries: LruCache<String, CacheEntry>,
    total_bytes: u64,
}

/// Stored chunk extents per file (`start -> size`), all `has()` needs
#[derive(Default)]
struct Extents {
    by_file: HashMap<String, BTreeMap<u64, u64>>,
}

impl Extents {
    fn insert(&mut self, cache_key: &str, start: u64, size: u64) {
        self.by_file
            .entry(cache_key.to_string())
            .or_default()
            .insert(start, size);
    }

    fn remove(&mut self, cache_key: &str, start: u64) {
        if let Some(extents) = self.by_file.get_mut(cache_key) {
            extents.remove(&start);
            if extents.is_empty() {
                self.by_file.remove(cache_key);
            }
        }
    }

    fn remove_all(&mut self, entries: &[CacheEntry]) {
        for entry in entries {
            self.remove(&entry.cache_key, entry.start);
        }
    }

    /// The stored chunk containing `offset`, as (start, size)
    fn covering(&self, cache_key: &str, offset: u64) -> Option<(u64, u64)> {
        let (&start, &size) = self
            .by_file
            .get(cache_key)?
            .range(..=offset)
            .next_back()?;
        (offset < start + size).then_some((start, size))
    }
}

#[derive(Default)]
struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Disk-resident byte-range cache keyed by (file identity, start offset)
///
/// Two locks: `index` serializes every mutation (get ordering, put, evict), while
/// `extents` backs the synchronous `has()` probe so membership checks never wait on
/// disk I/O or other cache mutations. When both are needed, `index` is taken first.
/// Neither is held across file I/O.
pub struct Cache {
    config: CacheConfig,
    index: Mutex<Index>,
    extents: Mutex<Extents>,
    metrics: CacheMetrics,
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub total_chunks: usize,
    pub total_size_bytes: u64,
    pub max_size_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

/// Content file name for a chunk of `cache_key` starting at `start`
pub fn entry_key(cache_key: &str, start: u64) -> String {
    hex::encode(Sha1::digest(format!("{}|{}", cache_key, start).as_bytes()))
}

impl Cache {
    /// Open the cache, rebuilding the index from whatever is already on disk
    pub async fn open(config: CacheConfig) -> Result<Self, CacheError> {
        if config.max_size_bytes == 0 {
            return Err(CacheError::Config(
                "max_size_bytes must be greater than zero".to_string(),
            ));
        }

        fs::create_dir_all(&config.cache_dir).await?;

        let cache = Cache {
            config,
            index: Mutex::new(Index {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
            extents: Mutex::new(Extents::default()),
            metrics: CacheMetrics::default(),
        };

        cache.rebuild(true).await?;
        Ok(cache)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Read `[start, end]` (inclusive) of `cache_key`. A miss returns an empty vector.
    pub async fn get(&self, cache_key: &str, start: u64, end: u64) -> Vec<u8> {
        if end < start {
            return Vec::new();
        }

        let covering = self.lock_extents().covering(cache_key, start);
        let data = match covering {
            Some((chunk_start, size)) if chunk_start + size - 1 >= end => self
                .read_slice(cache_key, chunk_start, start - chunk_start, end - start + 1)
                .await
                .unwrap_or_default(),
            Some(_) => self.get_stitched(cache_key, start, end).await,
            None => Vec::new(),
        };

        if data.is_empty() {
            self.record(&self.metrics.misses);
        } else {
            self.record(&self.metrics.hits);
        }
        data
    }

    /// Synchronous single-chunk membership probe. Does not stitch across chunks.
    pub fn has(&self, cache_key: &str, start: u64, end: u64) -> bool {
        self.lock_extents()
            .covering(cache_key, start)
            .is_some_and(|(chunk_start, size)| chunk_start + size - 1 >= end)
    }

    /// Store `data` as the chunk of `cache_key` beginning at `start`
    pub async fn put(&self, cache_key: &str, start: u64, data: &[u8]) -> Result<(), CacheError> {
        if data.is_empty() {
            return Ok(());
        }

        let size = data.len() as u64;
        if self.config.eviction == EvictionMode::Lru && size > self.config.max_size_bytes {
            warn!(
                "Cache: refusing {} bytes of {} at {}, larger than the {} byte budget",
                size, cache_key, start, self.config.max_size_bytes
            );
            return Err(CacheError::TooLarge {
                size,
                budget: self.config.max_size_bytes,
            });
        }

        let key = entry_key(cache_key, start);
        let file_path = self.content_path(&key);

        if let Err(e) = self.write_entry(&file_path, cache_key, start, data).await {
            warn!(
                "Cache: failed to store {} bytes of {} at {}: {}",
                data.len(),
                cache_key,
                start,
                e
            );
            // The content file may have been replaced underneath an existing entry
            self.forget(&key).await;
            return Err(e);
        }

        let victims = {
            let mut index = self.lock_index();

            let replaced = index.entries.pop(&key);
            if let Some(old) = &replaced {
                index.total_bytes = index.total_bytes.saturating_sub(old.size);
            }

            let victims = self.select_victims(&mut index, size);

            index.entries.push(
                key.clone(),
                CacheEntry {
                    key,
                    cache_key: cache_key.to_string(),
                    start,
                    size,
                    mtime: SystemTime::now(),
                    file_path,
                },
            );
            index.total_bytes += size;

            {
                let mut extents = self.lock_extents();
                if let Some(old) = &replaced {
                    extents.remove(&old.cache_key, old.start);
                }
                extents.remove_all(&victims);
                extents.insert(cache_key, start, size);
            }

            debug!(
                "Cache: stored {} bytes of {} at {} (total: {} bytes)",
                size, cache_key, start, index.total_bytes
            );
            victims
        };

        self.discard(victims).await;
        Ok(())
    }

    /// Drop a single stored chunk
    pub async fn remove(&self, cache_key: &str, start: u64) {
        self.forget(&entry_key(cache_key, start)).await;
    }

    /// Drop every stored chunk of one file
    pub async fn clear_file(&self, cache_key: &str) {
        let removed = {
            let mut index = self.lock_index();
            let keys: Vec<String> = index
                .entries
                .iter()
                .filter(|(_, entry)| entry.cache_key == cache_key)
                .map(|(key, _)| key.clone())
                .collect();

            let mut removed = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(entry) = index.entries.pop(&key) {
                    index.total_bytes = index.total_bytes.saturating_sub(entry.size);
                    removed.push(entry);
                }
            }
            self.lock_extents().by_file.remove(cache_key);
            removed
        };

        info!("Cache: cleared {} chunks of {}", removed.len(), cache_key);
        self.discard(removed).await;
    }

    /// Clear all cached chunks
    pub async fn clear(&self) {
        let removed: Vec<CacheEntry> = {
            let mut index = self.lock_index();
            let mut removed = Vec::with_capacity(index.entries.len());
            while let Some((_, entry)) = index.entries.pop_lru() {
                removed.push(entry);
            }
            index.total_bytes = 0;
            self.lock_extents().by_file.clear();
            removed
        };

        info!("Cache: cleared all {} cached chunks", removed.len());
        self.discard(removed).await;
    }

    /// Get current cache statistics
    pub fn stats(&self) -> CacheStats {
        let index = self.lock_index();
        let hits = self.metrics.hits.load(Ordering::Relaxed);
        let misses = self.metrics.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            total_chunks: index.entries.len(),
            total_size_bytes: index.total_bytes,
            max_size_bytes: self.config.max_size_bytes,
            hits,
            misses,
            evictions: self.metrics.evictions.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    /// Start the periodic safety net. The task stops once the cache is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::downgrade(self);
        let period = Duration::from_secs(self.config.maintenance_interval_seconds.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                if let Err(e) = cache.check_drift().await {
                    warn!("Cache: maintenance pass failed: {}", e);
                }
            }
        })
    }

    /// Rebuild from disk when tracked totals drifted from the entries or the budget.
    /// Returns whether a rebuild happened.
    pub async fn check_drift(&self) -> Result<bool, CacheError> {
        let (tracked, actual) = {
            let index = self.lock_index();
            let actual: u64 = index.entries.iter().map(|(_, entry)| entry.size).sum();
            (index.total_bytes, actual)
        };

        let over_budget =
            self.config.eviction == EvictionMode::Lru && tracked > self.config.max_size_bytes;
        if tracked == actual && !over_budget {
            if self.config.eviction == EvictionMode::Ttl {
                self.evict(0).await;
            }
            return Ok(false);
        }

        warn!(
            "Cache: tracked size {} bytes differs from entries ({} bytes) or budget ({} bytes), rebuilding",
            tracked, actual, self.config.max_size_bytes
        );
        self.rebuild(false).await?;
        Ok(true)
    }

    async fn evict(&self, incoming: u64) {
        let victims = {
            let mut index = self.lock_index();
            let victims = self.select_victims(&mut index, incoming);
            self.lock_extents().remove_all(&victims);
            victims
        };
        self.discard(victims).await;
    }

    /// Remove entries from the index so `incoming` more bytes fit. The caller drops their
    /// extents; files are deleted later, outside the lock, by `discard`.
    fn select_victims(&self, index: &mut Index, incoming: u64) -> Vec<CacheEntry> {
        let mut victims = Vec::new();

        match self.config.eviction {
            EvictionMode::Lru => {
                while index.total_bytes + incoming > self.config.max_size_bytes {
                    let Some((_, entry)) = index.entries.pop_lru() else {
                        break;
                    };
                    index.total_bytes = index.total_bytes.saturating_sub(entry.size);
                    victims.push(entry);
                }
            }
            EvictionMode::Ttl => {
                let Some(cutoff) =
                    SystemTime::now().checked_sub(Duration::from_secs(self.config.ttl_seconds))
                else {
                    return victims;
                };
                let expired: Vec<String> = index
                    .entries
                    .iter()
                    .filter(|(_, entry)| entry.mtime < cutoff)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in expired {
                    if let Some(entry) = index.entries.pop(&key) {
                        index.total_bytes = index.total_bytes.saturating_sub(entry.size);
                        victims.push(entry);
                    }
                }
            }
        }

        if !victims.is_empty() {
            self.metrics
                .evictions
                .fetch_add(victims.len() as u64, Ordering::Relaxed);
        }
        victims
    }

    async fn discard(&self, victims: Vec<CacheEntry>) {
        for entry in victims {
            debug!(
                "Cache: evicting {} at {} ({} bytes)",
                entry.cache_key, entry.start, entry.size
            );
            remove_quietly(&entry.file_path).await;
            remove_quietly(&meta_path(&entry.file_path)).await;
        }
    }

    /// Drop an entry whose file turned out to be missing or short
    async fn forget(&self, key: &str) {
        let removed = {
            let mut index = self.lock_index();
            let removed = index.entries.pop(key);
            if let Some(entry) = &removed {
                index.total_bytes = index.total_bytes.saturating_sub(entry.size);
                self.lock_extents().remove(&entry.cache_key, entry.start);
            }
            removed
        };

        if let Some(entry) = removed {
            self.discard(vec![entry]).await;
        }
    }

    async fn get_stitched(&self, cache_key: &str, start: u64, end: u64) -> Vec<u8> {
        // Walk adjacent stored chunks until `end` is covered; any gap is a miss
        let pieces = {
            let extents = self.lock_extents();
            let mut pieces = Vec::new();
            let mut cursor = start;
            loop {
                let Some((chunk_start, size)) = extents.covering(cache_key, cursor) else {
                    return Vec::new();
                };
                pieces.push((chunk_start, size));
                let chunk_end = chunk_start + size - 1;
                if chunk_end >= end {
                    break;
                }
                cursor = chunk_end + 1;
            }
            pieces
        };

        let mut data = Vec::with_capacity((end - start + 1) as usize);
        for (chunk_start, size) in pieces {
            let from = start.max(chunk_start);
            let to = end.min(chunk_start + size - 1);
            match self
                .read_slice(cache_key, chunk_start, from - chunk_start, to - from + 1)
                .await
            {
                Some(slice) => data.extend_from_slice(&slice),
                None => return Vec::new(),
            }
        }
        data
    }

    /// Read `len` bytes at `offset` within the chunk stored at `chunk_start`
    async fn read_slice(
        &self,
        cache_key: &str,
        chunk_start: u64,
        offset: u64,
        len: u64,
    ) -> Option<Vec<u8>> {
        let key = entry_key(cache_key, chunk_start);
        let (file_path, refresh) = {
            let mut index = self.lock_index();
            let entry = index.entries.get_mut(&key)?;
            let now = SystemTime::now();
            let refresh = now
                .duration_since(entry.mtime)
                .is_ok_and(|age| age > MTIME_REFRESH_INTERVAL);
            if refresh {
                entry.mtime = now;
            }
            (entry.file_path.clone(), refresh)
        };

        match read_range(&file_path, offset, len).await {
            Ok(data) => {
                if refresh {
                    touch(file_path);
                }
                Some(data)
            }
            Err(e) => {
                warn!(
                    "Cache: chunk of {} at {} unreadable, dropping entry: {}",
                    cache_key, chunk_start, e
                );
                self.forget(&key).await;
                None
            }
        }
    }

    async fn write_entry(
        &self,
        file_path: &Path,
        cache_key: &str,
        start: u64,
        data: &[u8],
    ) -> Result<(), CacheError> {
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let meta = serde_json::to_vec(&EntryMeta {
            cache_key: cache_key.to_string(),
            start,
        })?;

        write_atomic(file_path, data).await?;
        write_atomic(&meta_path(file_path), &meta).await?;
        Ok(())
    }

    /// Replace the in-memory index with what is on disk, ordered by mtime
    async fn rebuild(&self, startup: bool) -> Result<(), CacheError> {
        let scanned = self.scan_disk(startup).await?;

        {
            let mut index = self.lock_index();
            let mut extents = self.lock_extents();

            index.entries.clear();
            extents.by_file.clear();
            let mut total_bytes = 0;
            for entry in scanned {
                total_bytes += entry.size;
                extents.insert(&entry.cache_key, entry.start, entry.size);
                index.entries.push(entry.key.clone(), entry);
            }
            index.total_bytes = total_bytes;

            info!(
                "Cache: loaded {} existing cache entries ({} bytes)",
                index.entries.len(),
                index.total_bytes
            );
        }

        self.evict(0).await;
        Ok(())
    }

    async fn scan_disk(&self, startup: bool) -> Result<Vec<CacheEntry>, CacheError> {
        let mut found = Vec::new();
        let mut orphans = 0usize;

        let mut shards = fs::read_dir(&self.config.cache_dir).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }

            let mut files = fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                match path.extension().and_then(|ext| ext.to_str()) {
                    Some(META_EXTENSION) => {
                        if !fs::try_exists(path.with_extension("")).await.unwrap_or(false) {
                            remove_quietly(&path).await;
                        }
                        continue;
                    }
                    Some(TMP_EXTENSION) => {
                        // In-flight writes of this process may still own temp files
                        if startup {
                            remove_quietly(&path).await;
                        }
                        continue;
                    }
                    _ => {}
                }

                match load_entry(&path).await {
                    Some(entry) => found.push(entry),
                    None => {
                        orphans += 1;
                        remove_quietly(&path).await;
                        remove_quietly(&meta_path(&path)).await;
                    }
                }
            }
        }

        if orphans > 0 {
            warn!("Cache: removed {} orphaned cache files", orphans);
        }

        found.sort_by_key(|entry| entry.mtime);
        Ok(found)
    }

    fn content_path(&self, key: &str) -> PathBuf {
        self.config.cache_dir.join(&key[..2]).join(key)
    }

    fn record(&self, counter: &AtomicU64) {
        if self.config.metrics {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn lock_index(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_extents(&self) -> MutexGuard<'_, Extents> {
        self.extents.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Build an entry from a content file and its sidecar, or None if either is unusable
async fn load_entry(file_path: &Path) -> Option<CacheEntry> {
    let raw = fs::read(meta_path(file_path)).await.ok()?;
    let meta: EntryMeta = serde_json::from_slice(&raw).ok()?;

    let key = entry_key(&meta.cache_key, meta.start);
    if file_path.file_name()?.to_str()? != key {
        return None;
    }

    let metadata = fs::metadata(file_path).await.ok()?;
    if metadata.len() == 0 {
        return None;
    }

    Some(CacheEntry {
        key,
        cache_key: meta.cache_key,
        start: meta.start,
        size: metadata.len(),
        mtime: metadata.modified().unwrap_or_else(|_| SystemTime::now()),
        file_path: file_path.to_path_buf(),
    })
}

fn meta_path(file_path: &Path) -> PathBuf {
    file_path.with_extension(META_EXTENSION)
}

async fn read_range(file_path: &Path, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
    let mut file = fs::File::open(file_path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_extension(format!("{}.{}", n, TMP_EXTENSION));
    if let Err(e) = fs::write(&tmp, data).await {
        remove_quietly(&tmp).await;
        return Err(e);
    }
    if let Err(e) = fs::rename(&tmp, path).await {
        remove_quietly(&tmp).await;
        return Err(e);
    }
    Ok(())
}

fn touch(file_path: PathBuf) {
    tokio::task::spawn_blocking(move || {
        if let Err(e) = filetime::set_file_mtime(&file_path, FileTime::now()) {
            debug!(
                "Cache: failed to refresh mtime of {}: {}",
                file_path.display(),
                e
            );
        }
    });
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(
                "Cache: failed to remove cache file {}: {}",
                path.display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir, max_size_bytes: u64) -> CacheConfig {
        CacheConfig {
            cache_dir: dir.path().to_path_buf(),
            max_size_bytes,
            ttl_seconds: 60,
            eviction: EvictionMode::Lru,
            metrics: true,
            maintenance_interval_seconds: 300,
        }
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
    }

    #[tokio::test]
    async fn test_put_get_fast_path() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(config(&dir, 1 << 20)).await.unwrap();
        let data = pattern(1000, 1);

        cache.put("movie.mkv", 0, &data).await.unwrap();

        assert_eq!(cache.get("movie.mkv", 0, 999).await, data);
        assert_eq!(cache.get("movie.mkv", 100, 199).await, data[100..200].to_vec());
        assert!(cache.has("movie.mkv", 0, 999));
        assert!(!cache.has("other.mkv", 0, 999));
    }

    #[tokio::test]
    async fn test_get_stitches_adjacent_chunks() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(config(&dir, 1 << 20)).await.unwrap();
        let first = pattern(100, 1);
        let second = pattern(100, 2);

        cache.put("movie.mkv", 0, &first).await.unwrap();
        cache.put("movie.mkv", 100, &second).await.unwrap();

        let mut expected = first[50..].to_vec();
        expected.extend_from_slice(&second[..50]);
        assert_eq!(cache.get("movie.mkv", 50, 149).await, expected);

        // has() only answers for a single stored chunk
        assert!(!cache.has("movie.mkv", 50, 149));
    }

    #[tokio::test]
    async fn test_gap_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(config(&dir, 1 << 20)).await.unwrap();

        cache.put("movie.mkv", 0, &pattern(100, 1)).await.unwrap();
        cache.put("movie.mkv", 200, &pattern(100, 2)).await.unwrap();

        assert!(cache.get("movie.mkv", 50, 250).await.is_empty());
        assert!(cache.get("movie.mkv", 400, 450).await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_heals_index() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(config(&dir, 1 << 20)).await.unwrap();
        cache.put("movie.mkv", 0, &pattern(100, 1)).await.unwrap();

        let path = cache.content_path(&entry_key("movie.mkv", 0));
        std::fs::remove_file(&path).unwrap();

        assert!(cache.get("movie.mkv", 0, 99).await.is_empty());
        assert!(!cache.has("movie.mkv", 0, 99));
        assert_eq!(cache.stats().total_size_bytes, 0);
    }

    #[tokio::test]
    async fn test_lru_eviction_keeps_recently_touched() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(config(&dir, 300)).await.unwrap();

        cache.put("a", 0, &pattern(100, 1)).await.unwrap();
        cache.put("b", 0, &pattern(100, 2)).await.unwrap();
        cache.put("c", 0, &pattern(100, 3)).await.unwrap();

        // Touch "a" so "b" becomes the least recently used
        assert!(!cache.get("a", 0, 9).await.is_empty());
        cache.put("d", 0, &pattern(100, 4)).await.unwrap();

        assert!(cache.has("a", 0, 99));
        assert!(!cache.has("b", 0, 99));
        assert!(cache.has("c", 0, 99));
        assert!(cache.has("d", 0, 99));

        let stats = cache.stats();
        assert!(stats.total_size_bytes <= 300);
        assert_eq!(stats.evictions, 1);
        assert!(!cache.content_path(&entry_key("b", 0)).exists());
    }

    #[tokio::test]
    async fn test_put_replaces_existing_entry() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(config(&dir, 1 << 20)).await.unwrap();

        cache.put("movie.mkv", 0, &pattern(100, 1)).await.unwrap();
        cache.put("movie.mkv", 0, &pattern(50, 2)).await.unwrap();

        assert_eq!(cache.stats().total_size_bytes, 50);
        assert_eq!(cache.get("movie.mkv", 0, 49).await, pattern(50, 2));
    }

    #[tokio::test]
    async fn test_ttl_evicts_expired_entries() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, 1 << 20);
        cfg.eviction = EvictionMode::Ttl;

        {
            let cache = Cache::open(cfg.clone()).await.unwrap();
            cache.put("old", 0, &pattern(100, 1)).await.unwrap();
            cache.put("fresh", 0, &pattern(100, 2)).await.unwrap();

            let old_path = cache.content_path(&entry_key("old", 0));
            let an_hour_ago = SystemTime::now() - Duration::from_secs(3600);
            filetime::set_file_mtime(&old_path, FileTime::from_system_time(an_hour_ago)).unwrap();
        }

        let cache = Cache::open(cfg).await.unwrap();
        assert!(!cache.has("old", 0, 99));
        assert!(cache.has("fresh", 0, 99));
        assert_eq!(cache.stats().total_size_bytes, 100);
    }

    #[tokio::test]
    async fn test_reopen_removes_orphans() {
        let dir = TempDir::new().unwrap();
        {
            let cache = Cache::open(config(&dir, 1 << 20)).await.unwrap();
            cache.put("movie.mkv", 0, &pattern(100, 1)).await.unwrap();
            cache.put("movie.mkv", 100, &pattern(150, 2)).await.unwrap();
        }

        let shard = dir.path().join("ab");
        std::fs::create_dir_all(&shard).unwrap();
        let orphan = shard.join("ab00000000000000000000000000000000000000");
        std::fs::write(&orphan, b"no sidecar").unwrap();
        let stray_meta = shard.join("ab11111111111111111111111111111111111111.meta");
        std::fs::write(&stray_meta, b"{\"cache_key\":\"x\",\"start\":0}").unwrap();

        let cache = Cache::open(config(&dir, 1 << 20)).await.unwrap();
        assert!(!orphan.exists());
        assert!(!stray_meta.exists());

        let stats = cache.stats();
        assert_eq!(stats.total_chunks, 2);
        assert_eq!(stats.total_size_bytes, 250);
        assert_eq!(cache.get("movie.mkv", 90, 109).await.len(), 20);
    }

    #[tokio::test]
    async fn test_layout_uses_hash_fan_out_and_sidecar() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(config(&dir, 1 << 20)).await.unwrap();
        cache.put("movie.mkv", 4096, &pattern(10, 1)).await.unwrap();

        let key = entry_key("movie.mkv", 4096);
        let path = dir.path().join(&key[..2]).join(&key);
        assert!(path.exists());

        let meta: serde_json::Value =
            serde_json::from_slice(&std::fs::read(path.with_extension("meta")).unwrap()).unwrap();
        assert_eq!(meta["cache_key"], "movie.mkv");
        assert_eq!(meta["start"], 4096);
    }

    #[tokio::test]
    async fn test_clear_file_only_touches_one_file() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(config(&dir, 1 << 20)).await.unwrap();
        cache.put("a", 0, &pattern(10, 1)).await.unwrap();
        cache.put("a", 10, &pattern(10, 2)).await.unwrap();
        cache.put("b", 0, &pattern(10, 3)).await.unwrap();

        cache.clear_file("a").await;

        assert!(!cache.has("a", 0, 9));
        assert!(!cache.has("a", 10, 19));
        assert!(cache.has("b", 0, 9));
        assert_eq!(cache.stats().total_size_bytes, 10);
    }

    #[tokio::test]
    async fn test_check_drift_rebuilds_index() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(config(&dir, 1 << 20)).await.unwrap();
        cache.put("a", 0, &pattern(10, 1)).await.unwrap();

        assert!(!cache.check_drift().await.unwrap());

        cache.lock_index().total_bytes = 12345;
        assert!(cache.check_drift().await.unwrap());
        assert_eq!(cache.stats().total_size_bytes, 10);
        assert!(cache.has("a", 0, 9));
    }

    #[tokio::test]
    async fn test_oversized_chunk_is_refused() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(config(&dir, 300)).await.unwrap();
        cache.put("a", 0, &pattern(100, 1)).await.unwrap();

        let err = cache.put("b", 0, &pattern(500, 2)).await.unwrap_err();
        assert!(matches!(err, CacheError::TooLarge { size: 500, budget: 300 }));

        // Nothing was evicted to make room and nothing was written
        assert!(cache.has("a", 0, 99));
        assert!(!cache.has("b", 0, 499));
        assert!(!cache.content_path(&entry_key("b", 0)).exists());
        let stats = cache.stats();
        assert_eq!(stats.total_chunks, 1);
        assert_eq!(stats.total_size_bytes, 100);
        assert_eq!(stats.evictions, 0);
    }

    #[tokio::test]
    async fn test_ttl_put_evicts_expired_entries() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, 1 << 20);
        cfg.eviction = EvictionMode::Ttl;
        let cache = Cache::open(cfg).await.unwrap();

        cache.put("old", 0, &pattern(100, 1)).await.unwrap();
        {
            let mut index = cache.lock_index();
            let entry = index.entries.get_mut(&entry_key("old", 0)).unwrap();
            entry.mtime = SystemTime::now() - Duration::from_secs(3600);
        }

        cache.put("new", 0, &pattern(100, 2)).await.unwrap();

        assert!(!cache.has("old", 0, 99));
        assert!(cache.has("new", 0, 99));
        assert!(!cache.content_path(&entry_key("old", 0)).exists());
        let stats = cache.stats();
        assert_eq!(stats.total_size_bytes, 100);
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test]
    async fn test_maintenance_repairs_drift() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, 1 << 20);
        cfg.maintenance_interval_seconds = 1;
        let cache = Arc::new(Cache::open(cfg).await.unwrap());
        cache.put("a", 0, &pattern(10, 1)).await.unwrap();

        let maintenance = cache.spawn_maintenance();
        cache.lock_index().total_bytes = 999_999;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while cache.stats().total_size_bytes != 10 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "maintenance never corrected the tracked size"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(cache.has("a", 0, 9));

        // The task winds down once the cache is gone
        drop(cache);
        tokio::time::timeout(Duration::from_secs(3), maintenance)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_eviction_mode_parsing() {
        assert_eq!("LRU".parse::<EvictionMode>().unwrap(), EvictionMode::Lru);
        assert_eq!("ttl".parse::<EvictionMode>().unwrap(), EvictionMode::Ttl);
        assert!("fifo".parse::<EvictionMode>().is_err());
    }
}
