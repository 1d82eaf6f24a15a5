use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::{ACCEPT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Fault kinds reported by an upstream byte-range source
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("Upstream refused access (403)")]
    Forbidden,
    #[error("Upstream file not found ({status})")]
    NotFound { status: u16 },
    #[error("Requested range not satisfiable (416)")]
    RangeNotSatisfiable,
    #[error("Upstream rate limited the request (429)")]
    RateLimited,
    #[error("Upstream unavailable: {0}")]
    Unavailable(String),
    #[error("Upstream request timed out")]
    Timeout,
    #[error("Connection closed prematurely: {0}")]
    ClosedConnection(String),
    #[error("Upstream ignored the range request (status {status}, {content_length:?} bytes)")]
    RangeIgnored {
        status: u16,
        content_length: Option<u64>,
    },
    #[error("Expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("Upstream returned no data")]
    EmptyBody,
    #[error("Unexpected upstream response: {0}")]
    Protocol(String),
}

impl UpstreamError {
    /// Map an HTTP status that is not a usable range response
    pub fn from_status(status: u16) -> Self {
        match status {
            403 => UpstreamError::Forbidden,
            404 | 410 => UpstreamError::NotFound { status },
            416 => UpstreamError::RangeNotSatisfiable,
            429 => UpstreamError::RateLimited,
            500..=599 => UpstreamError::Unavailable(format!("HTTP {}", status)),
            other => UpstreamError::Protocol(format!("unexpected HTTP status {}", other)),
        }
    }

    /// Faults worth another attempt
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, UpstreamError::RangeNotSatisfiable)
    }

    /// Faults that suggest the direct URL went stale and should be re-resolved
    pub fn wants_url_refresh(&self) -> bool {
        matches!(
            self,
            UpstreamError::NotFound { .. }
                | UpstreamError::Unavailable(_)
                | UpstreamError::ClosedConnection(_)
                | UpstreamError::Timeout
        )
    }
}

/// An HTTP byte range, `end` inclusive. `end: None` is open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn open(start: u64) -> Self {
        ByteRange { start, end: None }
    }

    pub fn closed(start: u64, end: u64) -> Self {
        ByteRange {
            start,
            end: Some(end),
        }
    }

    /// Bytes expected back, given the total file size
    pub fn expected_len(&self, file_size: u64) -> u64 {
        let last = file_size.saturating_sub(1);
        let end = self.end.unwrap_or(last).min(last);
        (end + 1).saturating_sub(self.start)
    }

    pub fn header_value(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "bytes={}-{}", self.start, end),
            None => write!(f, "bytes={}-", self.start),
        }
    }
}

pub type ByteStream = BoxStream<'static, Result<Bytes, UpstreamError>>;

/// A successful upstream response whose body has not been consumed yet
pub struct UpstreamResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl UpstreamResponse {
    /// Reject responses that ignored the requested range: anything but 206, unless a
    /// 200 starting at byte 0 carries no more than the bytes we asked for.
    pub fn check_range(&self, range: &ByteRange, file_size: u64) -> Result<(), UpstreamError> {
        match self.status {
            206 => Ok(()),
            200 => {
                let expected = range.expected_len(file_size);
                let excess = self.content_length.map_or(true, |len| len > expected);
                if range.start != 0 || excess {
                    Err(UpstreamError::RangeIgnored {
                        status: self.status,
                        content_length: self.content_length,
                    })
                } else {
                    Ok(())
                }
            }
            other => Err(UpstreamError::from_status(other)),
        }
    }

    /// Drain the body into memory
    pub async fn collect(mut self) -> Result<Vec<u8>, UpstreamError> {
        let mut data = Vec::with_capacity(self.content_length.unwrap_or(0) as usize);
        while let Some(bytes) = self.body.next().await {
            data.extend_from_slice(&bytes?);
        }
        Ok(data)
    }
}

/// Trait for byte-range sources (allows mocking for tests)
#[async_trait::async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch(&self, url: &str, range: ByteRange) -> Result<UpstreamResponse, UpstreamError>;
}

/// Resolves a fresh direct URL for a file when the current one goes stale
#[async_trait::async_trait]
pub trait UrlResolver: Send + Sync {
    /// Returns None when no newer URL is available
    async fn refresh_url(&self, original_filename: &str) -> Result<Option<String>, UpstreamError>;
}

/// Resolver for URLs that never change
pub struct StaticUrl;

#[async_trait::async_trait]
impl UrlResolver for StaticUrl {
    async fn refresh_url(&self, _original_filename: &str) -> Result<Option<String>, UpstreamError> {
        Ok(None)
    }
}

/// Settings for the HTTP upstream client
#[derive(Debug, Clone)]
pub struct HttpUpstreamConfig {
    pub connect_timeout: Duration,
    /// Optional proxy for all requests (e.g. a per-provider proxy)
    pub proxy_url: Option<String>,
    pub user_agent: String,
}

impl Default for HttpUpstreamConfig {
    fn default() -> Self {
        HttpUpstreamConfig {
            connect_timeout: Duration::from_secs(10),
            proxy_url: None,
            user_agent: format!("streamfs/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Production byte-range source over HTTP
#[derive(Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(config: HttpUpstreamConfig) -> Result<Self, UpstreamError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent);

        if let Some(proxy_url) = &config.proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| UpstreamError::Protocol(format!("invalid proxy URL: {}", e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| UpstreamError::Protocol(format!("failed to build HTTP client: {}", e)))?;
        Ok(HttpUpstream { client })
    }

    /// Discover the size of a remote file: HEAD first, then a one-byte range request
    pub async fn probe_size(&self, url: &str) -> Result<u64, UpstreamError> {
        if let Ok(resp) = self.client.head(url).send().await {
            if resp.status().is_success() {
                if let Some(len) = header_u64(resp.headers(), CONTENT_LENGTH) {
                    return Ok(len);
                }
            }
        }

        let resp = self
            .client
            .get(url)
            .header(RANGE, ByteRange::closed(0, 0).header_value())
            .header(ACCEPT_ENCODING, "identity")
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if resp.status() != StatusCode::PARTIAL_CONTENT {
            return Err(UpstreamError::from_status(resp.status().as_u16()));
        }

        resp.headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| UpstreamError::Protocol("missing Content-Range total".to_string()))
    }
}

#[async_trait::async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, url: &str, range: ByteRange) -> Result<UpstreamResponse, UpstreamError> {
        debug!("HttpUpstream: GET {} ({})", redact_url(url), range);

        let resp = self
            .client
            .get(url)
            .header(RANGE, range.header_value())
            // Cached bytes must match the file exactly
            .header(ACCEPT_ENCODING, "identity")
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(UpstreamError::from_status(status.as_u16()));
        }

        let content_length = resp.content_length();
        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(map_reqwest_error))
            .boxed();

        Ok(UpstreamResponse {
            status: status.as_u16(),
            content_length,
            body,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        return UpstreamError::Timeout;
    }
    if let Some(status) = err.status() {
        return UpstreamError::from_status(status.as_u16());
    }
    let is_connect = err.is_connect();
    let message = err.without_url().to_string();
    if is_connect {
        UpstreamError::Unavailable(message)
    } else {
        UpstreamError::ClosedConnection(message)
    }
}

fn header_u64(headers: &reqwest::header::HeaderMap, name: reqwest::header::HeaderName) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Total size from a `Content-Range: bytes 0-0/12345` header
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (unit, spec) = value.trim().split_once(' ')?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }
    spec.split_once('/')?.1.trim().parse().ok()
}

/// Direct download URLs often embed auth tokens in the query string
pub(crate) fn redact_url(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}
