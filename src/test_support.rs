// Test support utilities for both unit and integration tests

use crate::upstream::{ByteRange, Upstream, UpstreamError, UpstreamResponse, UrlResolver};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Deterministic file contents: byte `i` is `i % 251`
pub fn test_file(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// Mock upstream serving one in-memory file
///
/// Honors range requests by default. Failures can be scripted per request or
/// part way through a body, specific URLs can be made to 404, and the body can
/// be made to stall.
pub struct MockUpstream {
    data: Arc<Vec<u8>>,
    buffer_size: usize,
    failures: Mutex<VecDeque<UpstreamError>>,
    body_failures: Mutex<VecDeque<(u64, UpstreamError)>>,
    rejected_urls: Mutex<HashSet<String>>,
    requests: Mutex<Vec<(String, ByteRange)>>,
    ignore_range: AtomicBool,
    stall: AtomicBool,
}

impl MockUpstream {
    pub fn new(data: Vec<u8>) -> Self {
        MockUpstream {
            data: Arc::new(data),
            buffer_size: 64 * 1024,
            failures: Mutex::new(VecDeque::new()),
            body_failures: Mutex::new(VecDeque::new()),
            rejected_urls: Mutex::new(HashSet::new()),
            requests: Mutex::new(Vec::new()),
            ignore_range: AtomicBool::new(false),
            stall: AtomicBool::new(false),
        }
    }

    /// Size of each body buffer handed out
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Fail the next request with `err` (queued in order)
    pub fn fail_next(&self, err: UpstreamError) {
        self.failures.lock().unwrap().push_back(err);
    }

    /// Cut the body of the next open-ended request with `err` after `after` bytes
    pub fn fail_body_after(&self, after: u64, err: UpstreamError) {
        self.body_failures.lock().unwrap().push_back((after, err));
    }

    /// Answer every request for `url` with 404
    pub fn reject_url(&self, url: &str) {
        self.rejected_urls.lock().unwrap().insert(url.to_string());
    }

    /// Reply 200 with the whole file regardless of the requested range
    pub fn set_ignore_range(&self, ignore: bool) {
        self.ignore_range.store(ignore, Ordering::SeqCst);
    }

    /// Respond normally but never deliver body bytes
    pub fn set_stall(&self, stall: bool) {
        self.stall.store(stall, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<(String, ByteRange)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Starts of all open-ended (connection) requests, in order
    pub fn connection_starts(&self) -> Vec<u64> {
        self.requests()
            .into_iter()
            .filter(|(_, range)| range.end.is_none())
            .map(|(_, range)| range.start)
            .collect()
    }
}

#[async_trait::async_trait]
impl Upstream for MockUpstream {
    async fn fetch(&self, url: &str, range: ByteRange) -> Result<UpstreamResponse, UpstreamError> {
        self.requests
            .lock()
            .unwrap()
            .push((url.to_string(), range));

        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        if self.rejected_urls.lock().unwrap().contains(url) {
            return Err(UpstreamError::NotFound { status: 404 });
        }

        let file_size = self.data.len() as u64;
        let (status, start, end) = if self.ignore_range.load(Ordering::SeqCst) {
            (200, 0, file_size)
        } else {
            if range.start >= file_size {
                return Err(UpstreamError::RangeNotSatisfiable);
            }
            let end = range.end.map_or(file_size, |end| (end + 1).min(file_size));
            (206, range.start, end)
        };

        let cut = if range.end.is_none() {
            self.body_failures.lock().unwrap().pop_front()
        } else {
            None
        };

        let body = if self.stall.load(Ordering::SeqCst) {
            stream::pending().boxed()
        } else {
            let served_end = cut
                .as_ref()
                .map_or(end, |(after, _)| (start + after).min(end));
            let mut buffers: Vec<Result<Bytes, UpstreamError>> = (start..served_end)
                .step_by(self.buffer_size)
                .map(|s| {
                    let e = (s + self.buffer_size as u64).min(served_end);
                    Ok(Bytes::copy_from_slice(&self.data[s as usize..e as usize]))
                })
                .collect();
            if let Some((_, err)) = cut {
                buffers.push(Err(err));
            }
            stream::iter(buffers).boxed()
        };

        Ok(UpstreamResponse {
            status,
            content_length: Some(end - start),
            body,
        })
    }
}

/// Resolver handing out a preset fresh URL
#[derive(Default)]
pub struct MockResolver {
    fresh_url: Mutex<Option<String>>,
    refreshes: AtomicUsize,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fresh_url(url: &str) -> Self {
        MockResolver {
            fresh_url: Mutex::new(Some(url.to_string())),
            refreshes: AtomicUsize::new(0),
        }
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl UrlResolver for MockResolver {
    async fn refresh_url(&self, _original_filename: &str) -> Result<Option<String>, UpstreamError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(self.fresh_url.lock().unwrap().clone())
    }
}
