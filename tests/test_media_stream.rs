#![cfg(feature = "test-utils")]

mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};
use streamfs::cache::entry_key;
use streamfs::chunker::ChunkKind;
use streamfs::config::StreamConfig;
use streamfs::notifier::ChunkCacheNotifier;
use streamfs::stream::{MediaStream, StreamError};
use streamfs::test_support::{test_file, MockResolver, MockUpstream};
use streamfs::upstream::{ByteRange, UpstreamError};
use support::{fast_config, notifier_in, tracing_init};
use tempfile::TempDir;

const FILE_SIZE: u64 = 10_000_000;
const MIB: u64 = 1024 * 1024;
const HEADER_SIZE: u64 = 262_144;
const KEY: &str = "movie.mkv";
const URL: &str = "http://cdn.test/movie.mkv";

struct Fixture {
    _dir: TempDir,
    notifier: Arc<ChunkCacheNotifier>,
    upstream: Arc<MockUpstream>,
    resolver: Arc<MockResolver>,
    stream: MediaStream,
}

async fn fixture_with(config: StreamConfig, resolver: MockResolver) -> Fixture {
    tracing_init();
    let dir = TempDir::new().unwrap();
    let notifier = notifier_in(&dir).await;
    let upstream = Arc::new(MockUpstream::new(test_file(FILE_SIZE as usize)));
    let resolver = Arc::new(resolver);

    let stream = MediaStream::new(
        notifier.clone(),
        upstream.clone(),
        resolver.clone(),
        config,
        KEY,
        FILE_SIZE,
        URL,
    )
    .unwrap();

    Fixture {
        _dir: dir,
        notifier,
        upstream,
        resolver,
        stream,
    }
}

async fn fixture() -> Fixture {
    fixture_with(fast_config(), MockResolver::new()).await
}

fn expected(upstream: &MockUpstream, position: u64, size: u64) -> Vec<u8> {
    upstream.data()[position as usize..(position + size) as usize].to_vec()
}

#[tokio::test]
async fn test_scenario_header_footer_then_body() {
    let f = fixture().await;
    let cache = f.notifier.cache();

    let data = f.stream.read(0, 100).await.unwrap();
    assert_eq!(data, expected(&f.upstream, 0, 100));
    assert!(cache.has(KEY, 0, 99));
    assert_eq!(
        f.upstream.requests()[0].1,
        ByteRange::closed(0, HEADER_SIZE - 1)
    );

    let data = f.stream.read(9_999_000, 1000).await.unwrap();
    assert_eq!(data, expected(&f.upstream, 9_999_000, 1000));
    assert!(cache.has(KEY, 9_999_000, 9_999_999));
    assert_eq!(f.stream.stats().scans, 2);
    assert!(f.upstream.connection_starts().is_empty());

    let data = f.stream.read(2_097_152, 1000).await.unwrap();
    assert_eq!(data, expected(&f.upstream, 2_097_152, 1000));

    let starts = f.upstream.connection_starts();
    assert_eq!(starts.len(), 1);
    let start = starts[0];
    assert!(start <= 2_097_152);
    assert_eq!((start - HEADER_SIZE) % MIB, 0, "connection must start on a chunk boundary");
    assert_eq!(start, HEADER_SIZE + MIB);
    assert_eq!(f.stream.stats().body_reads, 1);

    f.stream.close().await;
}

#[tokio::test]
async fn test_sequential_reads_across_chunk_boundary() {
    let f = fixture().await;
    f.stream.read(0, 100).await.unwrap();

    let mut position = HEADER_SIZE;
    while position < HEADER_SIZE + 3 * MIB {
        let data = f.stream.read(position, 128 * 1024).await.unwrap();
        assert_eq!(data, expected(&f.upstream, position, 128 * 1024));
        position += 128 * 1024;
    }

    // Straddles body chunks 0 and 1
    let straddle = HEADER_SIZE + MIB - 100;
    let data = f.stream.read(straddle, 200).await.unwrap();
    assert_eq!(data, expected(&f.upstream, straddle, 200));

    assert_eq!(f.upstream.connection_starts(), vec![HEADER_SIZE]);
    f.stream.close().await;
}

#[tokio::test]
async fn test_backward_seek_reopens_at_chunk_start() {
    let config = StreamConfig {
        // Treat every jump as playback, not a scan
        scan_tolerance_blocks: 100_000,
        read_ahead_chunks: 2,
        ..fast_config()
    };
    let f = fixture_with(config, MockResolver::new()).await;
    f.stream.read(0, 100).await.unwrap();

    let far = HEADER_SIZE + 5 * MIB;
    let data = f.stream.read(far, 4096).await.unwrap();
    assert_eq!(data, expected(&f.upstream, far, 4096));

    let back = HEADER_SIZE + MIB + 10;
    let data = f.stream.read(back, 4096).await.unwrap();
    assert_eq!(data, expected(&f.upstream, back, 4096));

    assert_eq!(
        f.upstream.connection_starts(),
        vec![HEADER_SIZE + 5 * MIB, HEADER_SIZE + MIB]
    );
    f.stream.close().await;
}

#[tokio::test]
async fn test_forward_jump_reconnects() {
    let config = StreamConfig {
        scan_tolerance_blocks: 100_000,
        read_ahead_chunks: 1,
        ..fast_config()
    };
    let f = fixture_with(config, MockResolver::new()).await;
    f.stream.read(0, 100).await.unwrap();
    f.stream.read(HEADER_SIZE, 4096).await.unwrap();

    let ahead = HEADER_SIZE + 6 * MIB + 5;
    let data = f.stream.read(ahead, 4096).await.unwrap();
    assert_eq!(data, expected(&f.upstream, ahead, 4096));
    assert_eq!(
        f.upstream.connection_starts(),
        vec![HEADER_SIZE, HEADER_SIZE + 6 * MIB]
    );
    f.stream.close().await;
}

#[tokio::test]
async fn test_general_scan_is_not_cached() {
    let f = fixture().await;

    let data = f.stream.read(5_000_000, 4096).await.unwrap();
    assert_eq!(data, expected(&f.upstream, 5_000_000, 4096));
    assert_eq!(
        f.upstream.requests(),
        vec![(URL.to_string(), ByteRange::closed(5_000_000, 5_004_095))]
    );
    assert!(!f.notifier.cache().has(KEY, 5_000_000, 5_004_095));
    assert!(!f.stream.is_streaming());
}

#[tokio::test]
async fn test_cache_hit_makes_no_requests() {
    let f = fixture().await;
    f.stream.read(0, 100).await.unwrap();
    let requests = f.upstream.request_count();

    let data = f.stream.read(100, 4000).await.unwrap();
    assert_eq!(data, expected(&f.upstream, 100, 4000));
    assert_eq!(f.upstream.request_count(), requests);
    assert_eq!(f.stream.stats().cache_hits, 1);
}

#[tokio::test]
async fn test_url_refresh_on_not_found() {
    let f = fixture_with(
        fast_config(),
        MockResolver::with_fresh_url("http://fresh.test/movie.mkv"),
    )
    .await;
    f.upstream.reject_url(URL);

    let data = f.stream.read(0, 100).await.unwrap();
    assert_eq!(data, expected(&f.upstream, 0, 100));
    assert_eq!(f.resolver.refreshes(), 1);
    assert_eq!(f.stream.url(), "http://fresh.test/movie.mkv");

    let urls: Vec<String> = f.upstream.requests().into_iter().map(|(url, _)| url).collect();
    assert_eq!(urls, vec![URL.to_string(), "http://fresh.test/movie.mkv".to_string()]);
}

#[tokio::test]
async fn test_not_found_after_failed_refresh_is_fatal() {
    let f = fixture().await;
    f.upstream.reject_url(URL);

    let err = f.stream.read(0, 100).await.unwrap_err();
    assert_eq!(err, StreamError::NotFound(KEY.to_string()));
    assert!(err.is_fatal());
    assert_eq!(f.resolver.refreshes(), 1);
    assert_eq!(f.upstream.request_count(), 1);
}

#[tokio::test]
async fn test_forbidden_backs_off_without_refresh() {
    let f = fixture().await;
    for _ in 0..4 {
        f.upstream.fail_next(UpstreamError::Forbidden);
    }

    let err = f.stream.read(0, 100).await.unwrap_err();
    assert_eq!(err, StreamError::Forbidden(KEY.to_string()));
    assert_eq!(f.resolver.refreshes(), 0);
    assert_eq!(f.upstream.request_count(), 4);
}

#[tokio::test]
async fn test_rate_limit_is_retried() {
    let f = fixture().await;
    f.upstream.fail_next(UpstreamError::RateLimited);
    f.upstream.fail_next(UpstreamError::RateLimited);

    let data = f.stream.read(0, 100).await.unwrap();
    assert_eq!(data, expected(&f.upstream, 0, 100));
    assert_eq!(f.upstream.request_count(), 3);
    assert_eq!(f.resolver.refreshes(), 0);
}

#[tokio::test]
async fn test_ignored_range_is_refused() {
    let f = fixture().await;
    f.upstream.set_ignore_range(true);

    let err = f.stream.read(0, 100).await.unwrap_err();
    assert_eq!(err, StreamError::RangeRefused(KEY.to_string()));
    assert_eq!(f.upstream.request_count(), 4);
}

#[tokio::test]
async fn test_range_not_satisfiable_is_immediately_fatal() {
    let f = fixture().await;
    f.upstream.fail_next(UpstreamError::RangeNotSatisfiable);

    let err = f.stream.read(0, 100).await.unwrap_err();
    assert_eq!(err, StreamError::RangeNotSatisfiable(KEY.to_string()));
    assert_eq!(f.upstream.request_count(), 1);
}

#[tokio::test]
async fn test_chunk_wait_times_out() {
    let config = StreamConfig {
        chunk_wait_timeout_seconds: 1,
        ..fast_config()
    };
    let f = fixture_with(config, MockResolver::new()).await;
    f.stream.read(0, 100).await.unwrap();

    f.upstream.set_stall(true);
    let err = f.stream.read(HEADER_SIZE + 100, 4096).await.unwrap_err();
    match err {
        StreamError::ChunksTooSlow {
            chunks,
            timeout_secs,
        } => {
            assert_eq!(timeout_secs, 1);
            assert_eq!(chunks.len(), 1);
            assert_eq!(chunks[0].kind, ChunkKind::Body);
            assert_eq!(chunks[0].start, HEADER_SIZE);
        }
        other => panic!("expected ChunksTooSlow, got {:?}", other),
    }
    f.stream.close().await;
}

#[tokio::test]
async fn test_close_stops_streaming() {
    let f = fixture().await;
    f.stream.read(0, 100).await.unwrap();
    f.stream.read(HEADER_SIZE, 4096).await.unwrap();

    f.stream.close().await;
    assert!(f.stream.is_killed());
    assert!(!f.stream.is_streaming());
    assert_eq!(
        f.stream.read(HEADER_SIZE, 4096).await.unwrap_err(),
        StreamError::Killed
    );
}

#[tokio::test]
async fn test_streams_share_cached_chunks() {
    let f = fixture().await;
    f.stream.read(0, 100).await.unwrap();
    f.stream.read(HEADER_SIZE, 4096).await.unwrap();
    f.stream.close().await;
    let requests = f.upstream.request_count();

    // A second handle on the same file finds the chunks already on disk
    let other = MediaStream::new(
        f.notifier.clone(),
        f.upstream.clone(),
        f.resolver.clone(),
        fast_config(),
        KEY,
        FILE_SIZE,
        URL,
    )
    .unwrap();
    let data = other.read(HEADER_SIZE, 4096).await.unwrap();
    assert_eq!(data, expected(&f.upstream, HEADER_SIZE, 4096));
    assert_eq!(f.upstream.request_count(), requests);
    assert_eq!(other.stats().cache_hits, 1);
}

#[tokio::test]
async fn test_body_chunk_refused_by_cache_is_still_served() {
    let f = fixture().await;
    f.stream.read(0, 100).await.unwrap();

    // A plain file where body chunk 0's fan-out directory belongs makes its put fail
    let key = entry_key(KEY, HEADER_SIZE);
    assert_ne!(key[..2], entry_key(KEY, 0)[..2]);
    std::fs::write(f._dir.path().join(&key[..2]), b"in the way").unwrap();

    let started = Instant::now();
    let data = f.stream.read(HEADER_SIZE + 10, 4096).await.unwrap();
    assert_eq!(data, expected(&f.upstream, HEADER_SIZE + 10, 4096));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!f.notifier.cache().has(KEY, HEADER_SIZE, HEADER_SIZE + 4095));

    // Later reads of the same chunk come from memory without reconnecting
    let data = f.stream.read(HEADER_SIZE + 5000, 4096).await.unwrap();
    assert_eq!(data, expected(&f.upstream, HEADER_SIZE + 5000, 4096));
    assert_eq!(f.upstream.connection_starts(), vec![HEADER_SIZE]);
    f.stream.close().await;
}

#[tokio::test]
async fn test_interrupted_body_resumes_at_next_chunk() {
    let f = fixture().await;
    f.upstream.fail_body_after(
        MIB + MIB / 2,
        UpstreamError::ClosedConnection("connection reset".to_string()),
    );
    f.stream.read(0, 100).await.unwrap();

    let mut position = HEADER_SIZE;
    while position < HEADER_SIZE + 3 * MIB {
        let data = f.stream.read(position, 128 * 1024).await.unwrap();
        assert_eq!(data, expected(&f.upstream, position, 128 * 1024));
        position += 128 * 1024;
    }

    // Chunk 0 completed before the cut, so the reconnect starts at chunk 1
    assert_eq!(
        f.upstream.connection_starts(),
        vec![HEADER_SIZE, HEADER_SIZE + MIB]
    );
    assert_eq!(f.stream.stats().connections_opened, 2);
    f.stream.close().await;
}

#[tokio::test]
async fn test_reconnects_without_progress_give_up() {
    let config = StreamConfig {
        max_connection_attempts: 3,
        ..fast_config()
    };
    let f = fixture_with(config, MockResolver::new()).await;
    for _ in 0..3 {
        f.upstream.fail_body_after(
            0,
            UpstreamError::ClosedConnection("connection reset".to_string()),
        );
    }
    f.stream.read(0, 100).await.unwrap();

    let err = f.stream.read(HEADER_SIZE, 4096).await.unwrap_err();
    match err {
        StreamError::ConnectFailed { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected ConnectFailed, got {:?}", other),
    }
    assert_eq!(f.upstream.connection_starts(), vec![HEADER_SIZE; 3]);

    // The failure is reported once; the next read starts over
    let data = f.stream.read(HEADER_SIZE, 4096).await.unwrap();
    assert_eq!(data, expected(&f.upstream, HEADER_SIZE, 4096));
    f.stream.close().await;
}

#[tokio::test]
async fn test_playback_into_expired_footer_refetches_footer() {
    let config = StreamConfig {
        scan_tolerance_blocks: 100_000,
        ..fast_config()
    };
    let f = fixture_with(config, MockResolver::new()).await;
    let cache = f.notifier.cache();
    let footer_start = f.stream.chunker().footer_start();
    f.stream.read(0, 100).await.unwrap();

    let data = f.stream.read(footer_start - 4096, 4096).await.unwrap();
    assert_eq!(data, expected(&f.upstream, footer_start - 4096, 4096));

    // The connection streams on through the footer; then the footer expires
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cache.has(KEY, footer_start, FILE_SIZE - 1) {
        assert!(Instant::now() < deadline, "footer never streamed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    while f.stream.is_streaming() {
        assert!(Instant::now() < deadline, "connection never reached end of file");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cache.remove(KEY, footer_start).await;
    let requests = f.upstream.request_count();

    let data = f.stream.read(footer_start, 4096).await.unwrap();
    assert_eq!(data, expected(&f.upstream, footer_start, 4096));
    let requests_after = f.upstream.requests();
    assert_eq!(requests_after.len(), requests + 1);
    assert_eq!(
        requests_after[requests].1,
        ByteRange::closed(footer_start, FILE_SIZE - 1)
    );
    assert!(cache.has(KEY, footer_start, FILE_SIZE - 1));
    assert_eq!(f.stream.stats().scans, 2);
    f.stream.close().await;
}

#[tokio::test]
async fn test_streams_waiting_on_one_chunk_share_its_arrival() {
    let f = fixture().await;
    f.stream.read(0, 100).await.unwrap();

    // The second stream's upstream never delivers body bytes
    let stalled = Arc::new(MockUpstream::new(test_file(FILE_SIZE as usize)));
    stalled.set_stall(true);
    let other = MediaStream::new(
        f.notifier.clone(),
        stalled.clone(),
        Arc::new(MockResolver::new()),
        StreamConfig {
            scan_tolerance_blocks: 100_000,
            ..fast_config()
        },
        KEY,
        FILE_SIZE,
        URL,
    )
    .unwrap();
    other.read(0, 100).await.unwrap();

    let (first, second) = tokio::join!(
        f.stream.read(HEADER_SIZE, 4096),
        other.read(HEADER_SIZE, 4096)
    );
    assert_eq!(first.unwrap(), expected(&f.upstream, HEADER_SIZE, 4096));
    assert_eq!(second.unwrap(), expected(&f.upstream, HEADER_SIZE, 4096));
    assert_eq!(stalled.connection_starts(), vec![HEADER_SIZE]);

    other.close().await;
    f.stream.close().await;
}
