use super::connection::StreamConnection;
use super::error::StreamError;
use super::reads::{Read, ReadType, RecentReads};
use crate::cache::Cache;
use crate::chunker::{Chunk, ChunkRange, Chunker};
use crate::config::StreamConfig;
use crate::notifier::ChunkCacheNotifier;
use crate::upstream::{
    redact_url, ByteRange, Upstream, UpstreamError, UpstreamResponse, UrlResolver,
};
use futures::StreamExt;
use lru::LruCache;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bounded wait for the connection loop to exit on close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
/// A body read re-checks the cache this many times if bytes vanish between wait and get
const MAX_BODY_PASSES: usize = 2;
/// Downloaded chunks the cache refused, kept in memory for this stream's readers
const SPILL_CHUNKS: usize = 4;

/// Session counters for one open file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub reads: u64,
    pub cache_hits: u64,
    pub scans: u64,
    pub body_reads: u64,
    pub seeks: u64,
    pub connections_opened: u64,
    pub bytes_downloaded: u64,
    pub bytes_served: u64,
}

#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    cache_hits: AtomicU64,
    scans: AtomicU64,
    body_reads: AtomicU64,
    seeks: AtomicU64,
    connections_opened: AtomicU64,
    bytes_downloaded: AtomicU64,
    bytes_served: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StreamStats {
        StreamStats {
            reads: self.reads.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
            body_reads: self.body_reads.load(Ordering::Relaxed),
            seeks: self.seeks.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            bytes_served: self.bytes_served.load(Ordering::Relaxed),
        }
    }
}

/// State shared between a stream's readers and its connection loop
struct Session {
    filename: String,
    chunker: Chunker,
    config: StreamConfig,
    notifier: Arc<ChunkCacheNotifier>,
    upstream: Arc<dyn Upstream>,
    resolver: Arc<dyn UrlResolver>,
    url: Mutex<String>,
    connection: Mutex<StreamConnection>,
    /// End of the latest body read, used to pause read-ahead
    demand: watch::Sender<u64>,
    /// Fatal error that ended the connection loop, surfaced to the next read
    terminal: watch::Sender<Option<StreamError>>,
    spill: Mutex<LruCache<Chunk, Vec<u8>>>,
    /// Bumped whenever a chunk lands in `spill`
    spilled: watch::Sender<u64>,
    kill: CancellationToken,
    is_killed: AtomicBool,
    counters: Counters,
}

struct Supervisor {
    handle: JoinHandle<()>,
    token: CancellationToken,
    seek_tx: mpsc::UnboundedSender<()>,
}

impl Supervisor {
    fn is_running(&self) -> bool {
        !self.handle.is_finished() && !self.seek_tx.is_closed()
    }
}

/// Serves byte-range reads of one remote file for one open file handle.
///
/// Each read is classified, then served from the cache, from a one-off scan fetch,
/// or by driving a live upstream connection until the needed chunks are cached.
/// Reads on one stream are served one at a time in arrival order.
pub struct MediaStream {
    session: Arc<Session>,
    reads: tokio::sync::Mutex<RecentReads>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl MediaStream {
    pub fn new(
        notifier: Arc<ChunkCacheNotifier>,
        upstream: Arc<dyn Upstream>,
        resolver: Arc<dyn UrlResolver>,
        config: StreamConfig,
        original_filename: impl Into<String>,
        file_size: u64,
        url: impl Into<String>,
    ) -> Result<Self, StreamError> {
        let filename = original_filename.into();
        let chunker = Chunker::new(filename.clone(), file_size, config.chunk_size)?;
        let (demand, _) = watch::channel(0);
        let (terminal, _) = watch::channel(None);
        let (spilled, _) = watch::channel(0);
        let spill_capacity = NonZeroUsize::new(SPILL_CHUNKS).unwrap_or(NonZeroUsize::MIN);

        debug!(
            "MediaStream: opened {} ({} bytes, {} chunks)",
            filename,
            file_size,
            chunker.max_chunks()
        );

        Ok(MediaStream {
            session: Arc::new(Session {
                filename,
                chunker,
                config,
                notifier,
                upstream,
                resolver,
                url: Mutex::new(url.into()),
                connection: Mutex::new(StreamConnection::new(0)),
                demand,
                terminal,
                spill: Mutex::new(LruCache::new(spill_capacity)),
                spilled,
                kill: CancellationToken::new(),
                is_killed: AtomicBool::new(false),
                counters: Counters::default(),
            }),
            reads: tokio::sync::Mutex::new(RecentReads::new()),
            supervisor: Mutex::new(None),
        })
    }

    pub fn filename(&self) -> &str {
        &self.session.filename
    }

    pub fn file_size(&self) -> u64 {
        self.session.chunker.file_size()
    }

    pub fn chunker(&self) -> &Chunker {
        &self.session.chunker
    }

    /// Current direct URL (changes after a refresh)
    pub fn url(&self) -> String {
        self.session.url()
    }

    pub fn is_streaming(&self) -> bool {
        self.lock_supervisor()
            .as_ref()
            .is_some_and(Supervisor::is_running)
    }

    pub fn is_killed(&self) -> bool {
        self.session.is_killed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StreamStats {
        self.session.counters.snapshot()
    }

    /// Position and cursor of the live connection, if one is running
    pub fn connection(&self) -> Option<StreamConnection> {
        if self.is_streaming() {
            Some(self.session.lock_connection().clone())
        } else {
            None
        }
    }

    /// Read `size` bytes at `position`. Sizes past end of file are clamped.
    pub async fn read(&self, position: u64, size: u64) -> Result<Vec<u8>, StreamError> {
        let session = &self.session;
        if self.is_killed() {
            return Err(StreamError::Killed);
        }

        let mut reads = self.reads.lock().await;
        let range = session.chunker.range(position, size)?;
        let cache = session.cache();
        let read_type = reads.classify(
            &range,
            range.is_cached(cache),
            session.config.scan_tolerance_bytes(),
        );
        reads.push(Read::new(range.clone(), read_type));
        Counters::add(&session.counters.reads, 1);

        debug!(
            "MediaStream: {} {}+{} of {}",
            read_type, position, range.size, session.filename
        );

        let data = match read_type {
            ReadType::CacheHit => {
                let data = self.read_cached(&range).await;
                if data.is_empty() {
                    // Evicted since classification
                    self.read_body(&range).await?
                } else {
                    Counters::add(&session.counters.cache_hits, 1);
                    data
                }
            }
            ReadType::HeaderScan => {
                let header = range.header_chunk.clone();
                self.scan_chunk(&range, &header, read_type).await?
            }
            ReadType::FooterScan | ReadType::FooterRead => match range.footer_chunk.clone() {
                Some(footer) => self.scan_chunk(&range, &footer, read_type).await?,
                None => self.read_body(&range).await?,
            },
            ReadType::GeneralScan => self.general_scan(&range).await?,
            ReadType::BodyRead | ReadType::Unknown => self.read_body(&range).await?,
        };

        Counters::add(&session.counters.bytes_served, data.len() as u64);
        Ok(data)
    }

    /// Tear down the live connection and release this file's chunk flags
    pub async fn close(&self) {
        let session = &self.session;
        if session.is_killed.swap(true, Ordering::SeqCst) {
            return;
        }
        session.kill.cancel();
        session.notifier.clear_file(&session.filename);
        session.lock_spill().clear();

        let supervisor = self.lock_supervisor().take();
        if let Some(supervisor) = supervisor {
            supervisor.token.cancel();
            if tokio::time::timeout(CLOSE_TIMEOUT, supervisor.handle)
                .await
                .is_err()
            {
                warn!(
                    "MediaStream: connection loop for {} did not exit within {:?}",
                    session.filename, CLOSE_TIMEOUT
                );
            }
        }

        let stats = self.stats();
        info!(
            "MediaStream: closed {} after {} reads ({} cache hits, {} scans, {} seeks, {} connections, {} bytes downloaded, {} bytes served)",
            session.filename,
            stats.reads,
            stats.cache_hits,
            stats.scans,
            stats.seeks,
            stats.connections_opened,
            stats.bytes_downloaded,
            stats.bytes_served
        );
    }

    async fn read_cached(&self, range: &ChunkRange) -> Vec<u8> {
        let (start, end) = range.request_range();
        self.session
            .cache()
            .get(&range.cache_key, start, end)
            .await
    }

    /// Like `read_cached`, but fills chunks the cache refused from this stream's spill
    async fn read_assembled(&self, range: &ChunkRange) -> Vec<u8> {
        let data = self.read_cached(range).await;
        let session = &self.session;
        if !data.is_empty() || session.lock_spill().is_empty() {
            return data;
        }

        let (start, end) = range.request_range();
        let mut data = Vec::with_capacity(range.size as usize);
        for chunk in range.chunks() {
            let from = start.max(chunk.start);
            let to = end.min(chunk.end);
            let piece = match session.spilled_slice(chunk, from, to) {
                Some(piece) => piece,
                None => session.cache().get(&chunk.cache_key, from, to).await,
            };
            if piece.is_empty() {
                return Vec::new();
            }
            data.extend_from_slice(&piece);
        }
        data
    }

    /// Fetch a whole header or footer chunk, persist it and serve the requested slice
    async fn scan_chunk(
        &self,
        range: &ChunkRange,
        chunk: &Chunk,
        read_type: ReadType,
    ) -> Result<Vec<u8>, StreamError> {
        let session = &self.session;
        Counters::add(&session.counters.scans, 1);

        let data = session.fetch_discrete(chunk.start, chunk.end).await?;
        if let Err(e) = session.cache().put(&chunk.cache_key, chunk.start, &data).await {
            warn!(
                "MediaStream: could not cache {} {} of {}: {}",
                read_type, chunk, session.filename, e
            );
        } else {
            session.notifier.mark_cached(chunk);
        }

        let (start, end) = range.request_range();
        if end <= chunk.end {
            let offset = (start - chunk.start) as usize;
            let len = range.size as usize;
            return Ok(data[offset..offset + len].to_vec());
        }

        // Request runs past the chunk; anything beyond is served like playback
        self.read_body(range).await
    }

    /// One-off fetch of exactly the requested bytes, not cached
    async fn general_scan(&self, range: &ChunkRange) -> Result<Vec<u8>, StreamError> {
        let session = &self.session;
        Counters::add(&session.counters.scans, 1);
        let (start, end) = range.request_range();
        session.fetch_discrete(start, end).await
    }

    /// Serve a read through the live connection, starting or seeking it as needed
    async fn read_body(&self, range: &ChunkRange) -> Result<Vec<u8>, StreamError> {
        let session = &self.session;
        Counters::add(&session.counters.body_reads, 1);
        let (start, end) = range.request_range();

        for _ in 0..MAX_BODY_PASSES {
            if let Some(err) = session.take_terminal() {
                return Err(err);
            }

            let missing: Vec<Chunk> = range
                .uncached_chunks(session.cache())
                .into_iter()
                .filter(|chunk| !session.is_spilled(chunk))
                .collect();
            if let Some(first) = missing.first() {
                session.demand.send_replace(end);
                self.ensure_connection(first, range);
                self.wait_for_chunks(&missing).await?;
            }

            let data = self.read_assembled(range).await;
            if !data.is_empty() {
                return Ok(data);
            }
            debug!(
                "MediaStream: {}-{} of {} evicted before it was read, retrying",
                start, end, session.filename
            );
        }

        Err(StreamError::CacheUnavailable { start, end })
    }

    /// Make sure a connection will deliver `target`, reconnecting when it is behind the
    /// cursor or too far ahead of it
    fn ensure_connection(&self, target: &Chunk, range: &ChunkRange) {
        let session = &self.session;
        let mut slot = self.lock_supervisor();

        if let Some(supervisor) = slot.as_ref().filter(|s| s.is_running()) {
            let mut conn = session.lock_connection();
            let cursor = conn.current_read_position();
            let reach = cursor
                + session.chunker.chunk_size()
                + session.config.sequential_tolerance_bytes();
            if target.start < cursor || target.start > reach {
                debug!(
                    "MediaStream: seeking {} from {} to {}",
                    session.filename, cursor, target.start
                );
                conn.seek(range.request_range(), target.start);
                drop(conn);
                Counters::add(&session.counters.seeks, 1);
                if supervisor.seek_tx.send(()).is_ok() {
                    return;
                }
                debug!(
                    "MediaStream: connection loop for {} exited before the seek, restarting",
                    session.filename
                );
            } else {
                return;
            }
        }

        *session.lock_connection() = StreamConnection::new(target.start);
        session.terminal.send_replace(None);

        let token = session.kill.child_token();
        let (seek_tx, seek_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_connection(session.clone(), token.clone(), seek_rx));

        *slot = Some(Supervisor {
            handle,
            token,
            seek_tx,
        });
    }

    /// Wait until every chunk in `chunks` is cached, the loop fails, or the wait times out
    async fn wait_for_chunks(&self, chunks: &[Chunk]) -> Result<(), StreamError> {
        let session = &self.session;
        let timeout = session.config.chunk_wait_timeout();
        let mut terminal_rx = session.terminal.subscribe();

        let wait_all = async {
            for chunk in chunks {
                session.wait_chunk(chunk).await;
            }
        };

        let failure = async {
            loop {
                let current = terminal_rx.borrow_and_update().clone();
                if current.is_some() {
                    return session.take_terminal().unwrap_or(StreamError::Killed);
                }
                if terminal_rx.changed().await.is_err() {
                    return StreamError::Killed;
                }
            }
        };

        tokio::select! {
            _ = session.kill.cancelled() => Err(StreamError::Killed),
            err = failure => Err(err),
            waited = tokio::time::timeout(timeout, wait_all) => match waited {
                Ok(()) => Ok(()),
                Err(_) => {
                    let still_uncached: Vec<Chunk> = chunks
                        .iter()
                        .filter(|chunk| {
                            !chunk.is_cached(session.cache()) && !session.is_spilled(chunk)
                        })
                        .cloned()
                        .collect();
                    warn!(
                        "MediaStream: {} chunks of {} not cached after {:?}",
                        still_uncached.len(),
                        session.filename,
                        timeout
                    );
                    Err(StreamError::ChunksTooSlow {
                        chunks: still_uncached,
                        timeout_secs: session.config.chunk_wait_timeout_seconds,
                    })
                }
            },
        }
    }

    fn lock_supervisor(&self) -> MutexGuard<'_, Option<Supervisor>> {
        self.supervisor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for MediaStream {
    fn drop(&mut self) {
        self.session.kill.cancel();
    }
}

impl Session {
    fn cache(&self) -> &Cache {
        self.notifier.cache()
    }

    fn url(&self) -> String {
        self.url.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_url(&self, url: String) {
        *self.url.lock().unwrap_or_else(PoisonError::into_inner) = url;
    }

    fn lock_connection(&self) -> MutexGuard<'_, StreamConnection> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn take_terminal(&self) -> Option<StreamError> {
        self.terminal.send_replace(None)
    }

    fn lock_spill(&self) -> MutexGuard<'_, LruCache<Chunk, Vec<u8>>> {
        self.spill.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_spilled(&self, chunk: &Chunk) -> bool {
        self.lock_spill().contains(chunk)
    }

    /// Bytes `from..=to` of a spilled chunk
    fn spilled_slice(&self, chunk: &Chunk, from: u64, to: u64) -> Option<Vec<u8>> {
        let mut spill = self.lock_spill();
        let data = spill.get(chunk)?;
        let offset = (from - chunk.start) as usize;
        let len = (to - from + 1) as usize;
        data.get(offset..offset + len).map(<[u8]>::to_vec)
    }

    /// Wait until `chunk` is cached or spilled
    async fn wait_chunk(&self, chunk: &Chunk) {
        let mut spilled_rx = self.spilled.subscribe();
        loop {
            if self.is_spilled(chunk) {
                return;
            }
            tokio::select! {
                _ = self.notifier.wait(chunk) => return,
                changed = spilled_rx.changed() => {
                    if changed.is_err() {
                        self.notifier.wait(chunk).await;
                        return;
                    }
                }
            }
        }
    }

    /// Closed-range fetch with length verification, retried like a connection
    async fn fetch_discrete(&self, start: u64, end: u64) -> Result<Vec<u8>, StreamError> {
        let range = ByteRange::closed(start, end);
        let expected = end - start + 1;
        let file_size = self.chunker.file_size();
        let upstream = &self.upstream;
        let body_timeout = self.config.stream_timeout();

        let data = self
            .with_retry("scan", move |url| async move {
                let response = upstream.fetch(&url, range).await?;
                response.check_range(&range, file_size)?;
                let data = tokio::time::timeout(body_timeout, response.collect())
                    .await
                    .map_err(|_| UpstreamError::Timeout)??;
                if data.is_empty() {
                    return Err(UpstreamError::EmptyBody);
                }
                if data.len() as u64 != expected {
                    return Err(UpstreamError::LengthMismatch {
                        expected,
                        actual: data.len() as u64,
                    });
                }
                Ok::<_, UpstreamError>(data)
            })
            .await?;

        Counters::add(&self.counters.bytes_downloaded, data.len() as u64);
        Ok(data)
    }

    /// Open-ended range request from a chunk-aligned offset
    async fn open_connection(
        &self,
        start: u64,
    ) -> Result<UpstreamResponse, StreamError> {
        let range = ByteRange::open(start);
        let file_size = self.chunker.file_size();
        let upstream = &self.upstream;

        let response = self
            .with_retry("connect", move |url| async move {
                let response = upstream.fetch(&url, range).await?;
                response.check_range(&range, file_size)?;
                Ok::<_, UpstreamError>(response)
            })
            .await?;

        Counters::add(&self.counters.connections_opened, 1);
        info!(
            "MediaStream: connected to {} at {} (HTTP {})",
            self.filename, start, response.status
        );
        Ok(response)
    }

    /// Run `attempt` against the current URL until it succeeds or attempts run out.
    ///
    /// Not-found, unavailable, closed and timed-out attempts re-resolve the URL once.
    /// Forbidden and rate-limited attempts only back off.
    async fn with_retry<T, F, Fut>(&self, action: &str, mut attempt: F) -> Result<T, StreamError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let max_attempts = self.config.max_connection_attempts.max(1);
        let mut refreshed = false;
        let mut last_error = UpstreamError::EmptyBody;

        for n in 1..=max_attempts {
            let url = self.url();
            let err = tokio::select! {
                _ = self.kill.cancelled() => return Err(StreamError::Killed),
                result = attempt(url.clone()) => match result {
                    Ok(value) => return Ok(value),
                    Err(err) => err,
                },
            };

            if !err.is_recoverable() {
                warn!("MediaStream: {} {} failed: {}", action, self.filename, err);
                return Err(StreamError::exhausted(&self.filename, n, err));
            }
            warn!(
                "MediaStream: {} attempt {}/{} for {} ({}) failed: {}",
                action,
                n,
                max_attempts,
                self.filename,
                redact_url(&url),
                err
            );

            if err.wants_url_refresh() && !refreshed {
                refreshed = true;
                let refreshed_url = self.refresh_url().await;
                if refreshed_url.is_none() && matches!(err, UpstreamError::NotFound { .. }) {
                    return Err(StreamError::NotFound(self.filename.clone()));
                }
            }

            last_error = err;
            if n < max_attempts {
                tokio::select! {
                    _ = self.kill.cancelled() => return Err(StreamError::Killed),
                    _ = tokio::time::sleep(self.config.retry_backoff(n)) => {}
                }
            }
        }

        error!(
            "MediaStream: giving up on {} of {} after {} attempts: {}",
            action, self.filename, max_attempts, last_error
        );
        Err(StreamError::exhausted(
            &self.filename,
            max_attempts,
            last_error,
        ))
    }

    /// Ask the resolver for a fresh URL. Returns the new URL if one was found.
    async fn refresh_url(&self) -> Option<String> {
        match self.resolver.refresh_url(&self.filename).await {
            Ok(Some(url)) => {
                info!("MediaStream: refreshed URL for {}", self.filename);
                self.set_url(url.clone());
                Some(url)
            }
            Ok(None) => {
                warn!("MediaStream: no fresh URL available for {}", self.filename);
                None
            }
            Err(e) => {
                warn!("MediaStream: URL refresh for {} failed: {}", self.filename, e);
                None
            }
        }
    }

    /// Drive the live connection: (re)connect at the connection's start position,
    /// cut arriving bytes into chunks, cache and announce them, and follow seeks.
    async fn drive(
        &self,
        token: &CancellationToken,
        seek_rx: &mut mpsc::UnboundedReceiver<()>,
    ) -> Result<(), StreamError> {
        let chunker = &self.chunker;
        let file_size = chunker.file_size();
        let max_failures = self.config.max_connection_attempts.max(1);
        let read_ahead = self.config.read_ahead_chunks.max(1) * chunker.chunk_size();
        let mut demand_rx = self.demand.subscribe();
        let mut failures = 0u32;

        'connect: loop {
            while seek_rx.try_recv().is_ok() {}
            let start = {
                let mut conn = self.lock_connection();
                if let Some((from, to)) = conn.take_seek() {
                    debug!(
                        "MediaStream: reconnecting {} at {} for {}-{}",
                        self.filename,
                        conn.start_position(),
                        from,
                        to
                    );
                }
                conn.start_position()
            };

            let Some(mut chunk) = chunker.chunk_at(start) else {
                return Ok(());
            };

            let response = tokio::select! {
                _ = token.cancelled() => return Err(StreamError::Killed),
                response = self.open_connection(start) => response?,
            };
            let mut body = response.body;
            let mut offset = start;
            let mut pending: Vec<u8> = Vec::with_capacity(chunk.size() as usize);

            loop {
                // Idle while far enough ahead of what readers asked for
                loop {
                    let demanded = *demand_rx.borrow_and_update();
                    if offset <= demanded.saturating_add(read_ahead) {
                        break;
                    }
                    tokio::select! {
                        _ = token.cancelled() => return Err(StreamError::Killed),
                        Some(()) = seek_rx.recv() => continue 'connect,
                        changed = demand_rx.changed() => {
                            if changed.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }

                let next = tokio::select! {
                    _ = token.cancelled() => return Err(StreamError::Killed),
                    Some(()) = seek_rx.recv() => continue 'connect,
                    next = tokio::time::timeout(self.config.stream_timeout(), body.next()) => next,
                };

                let bytes = match next {
                    Ok(Some(Ok(bytes))) => bytes,
                    Ok(Some(Err(e))) => {
                        self.connection_failed(&mut failures, max_failures, e.to_string())?;
                        continue 'connect;
                    }
                    Ok(None) => {
                        self.connection_failed(
                            &mut failures,
                            max_failures,
                            format!("body ended at {} of {}", offset, file_size),
                        )?;
                        continue 'connect;
                    }
                    Err(_) => {
                        self.connection_failed(
                            &mut failures,
                            max_failures,
                            format!("no data for {:?}", self.config.stream_timeout()),
                        )?;
                        continue 'connect;
                    }
                };
                Counters::add(&self.counters.bytes_downloaded, bytes.len() as u64);

                let mut data = &bytes[..];
                while !data.is_empty() {
                    let take = ((chunk.end + 1 - offset) as usize).min(data.len());
                    pending.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    offset += take as u64;

                    if offset <= chunk.end {
                        break;
                    }

                    self.store_chunk(&chunk, std::mem::take(&mut pending)).await;
                    {
                        let mut conn = self.lock_connection();
                        if conn.seek_required() {
                            drop(conn);
                            continue 'connect;
                        }
                        conn.advance(chunk.size());
                    }
                    failures = 0;

                    match chunker.chunk_at(offset) {
                        Some(next_chunk) => {
                            pending.reserve(next_chunk.size() as usize);
                            chunk = next_chunk;
                        }
                        None => {
                            debug!("MediaStream: {} streamed to end of file", self.filename);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Cache a downloaded chunk and wake its waiters. A chunk the cache refuses is kept
    /// in the spill so this stream's readers still get the bytes.
    async fn store_chunk(&self, chunk: &Chunk, data: Vec<u8>) {
        if !chunk.is_cached(self.cache()) {
            if let Err(e) = self.cache().put(&chunk.cache_key, chunk.start, &data).await {
                warn!(
                    "MediaStream: failed to cache {} of {}, serving it from memory: {}",
                    chunk, self.filename, e
                );
                self.lock_spill().put(chunk.clone(), data);
                self.spilled.send_modify(|n| *n += 1);
                return;
            }
        }
        self.lock_spill().pop(chunk);
        self.notifier.mark_cached(chunk);
        debug!("MediaStream: cached {} of {}", chunk, self.filename);
    }

    /// Count a mid-stream failure and resume at the cursor, or give up
    fn connection_failed(
        &self,
        failures: &mut u32,
        max_failures: u32,
        reason: String,
    ) -> Result<(), StreamError> {
        *failures += 1;
        warn!(
            "MediaStream: connection for {} interrupted ({}/{}): {}",
            self.filename, failures, max_failures, reason
        );
        if *failures >= max_failures {
            return Err(StreamError::ConnectFailed {
                attempts: *failures,
                reason,
            });
        }
        self.lock_connection().resume_at_cursor();
        Ok(())
    }
}

/// Supervising task for one live connection
async fn run_connection(
    session: Arc<Session>,
    token: CancellationToken,
    mut seek_rx: mpsc::UnboundedReceiver<()>,
) {
    match session.drive(&token, &mut seek_rx).await {
        Ok(()) => debug!("MediaStream: connection loop for {} finished", session.filename),
        Err(StreamError::Killed) => {
            debug!("MediaStream: connection loop for {} killed", session.filename)
        }
        Err(e) => {
            error!(
                "MediaStream: connection loop for {} failed: {}",
                session.filename, e
            );
            session.terminal.send_replace(Some(e));
        }
    }
}
