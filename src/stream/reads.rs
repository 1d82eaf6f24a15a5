use crate::chunker::ChunkRange;
use std::fmt;
use std::time::Instant;

/// How a read was served, decided from its position and the reads before it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadType {
    HeaderScan,
    FooterScan,
    GeneralScan,
    BodyRead,
    FooterRead,
    CacheHit,
    Unknown,
}

impl ReadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadType::HeaderScan => "header_scan",
            ReadType::FooterScan => "footer_scan",
            ReadType::GeneralScan => "general_scan",
            ReadType::BodyRead => "body_read",
            ReadType::FooterRead => "footer_read",
            ReadType::CacheHit => "cache_hit",
            ReadType::Unknown => "unknown",
        }
    }

    /// Served by a one-off discrete fetch rather than the live connection
    pub fn is_scan(&self) -> bool {
        matches!(
            self,
            ReadType::HeaderScan | ReadType::FooterScan | ReadType::GeneralScan | ReadType::FooterRead
        )
    }
}

impl fmt::Display for ReadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Read {
    pub chunk_range: ChunkRange,
    pub read_type: ReadType,
    pub timestamp: Instant,
}

impl Read {
    pub fn new(chunk_range: ChunkRange, read_type: ReadType) -> Self {
        Read {
            chunk_range,
            read_type,
            timestamp: Instant::now(),
        }
    }

    /// One past the last byte requested
    pub fn end(&self) -> u64 {
        self.chunk_range.position + self.chunk_range.size
    }
}

/// The current and previous read of one stream
#[derive(Debug, Default)]
pub struct RecentReads {
    current: Option<Read>,
    previous: Option<Read>,
}

impl RecentReads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, read: Read) {
        self.previous = self.current.replace(read);
    }

    pub fn current(&self) -> Option<&Read> {
        self.current.as_ref()
    }

    pub fn previous(&self) -> Option<&Read> {
        self.previous.as_ref()
    }

    /// One past the last byte of the most recent read
    pub fn last_read_end(&self) -> Option<u64> {
        self.current.as_ref().map(Read::end)
    }

    pub fn last_read_type(&self) -> Option<ReadType> {
        self.current.as_ref().map(|read| read.read_type)
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none()
    }

    pub fn clear(&mut self) {
        self.current = None;
        self.previous = None;
    }

    /// Classify a new read against this history.
    ///
    /// `cached` is whether every chunk of `range` is on disk. `scan_tolerance` is the
    /// distance in bytes from the previous read beyond which a jump counts as a scan.
    pub fn classify(&self, range: &ChunkRange, cached: bool, scan_tolerance: u64) -> ReadType {
        if cached {
            return ReadType::CacheHit;
        }
        if range.is_header_only() {
            return ReadType::HeaderScan;
        }

        let last_end = self.last_read_end();
        if range.starts_in_footer() {
            return match last_end {
                Some(end) if range.position.abs_diff(end) <= scan_tolerance => ReadType::FooterRead,
                _ => ReadType::FooterScan,
            };
        }

        let past_header = range.position > range.header_chunk.end;
        match (last_end, self.last_read_type()) {
            (None, _) if past_header => ReadType::GeneralScan,
            (Some(end), Some(ReadType::BodyRead | ReadType::CacheHit))
                if range.size <= range.chunk_size
                    && range.position.abs_diff(end) > scan_tolerance =>
            {
                ReadType::GeneralScan
            }
            _ => ReadType::BodyRead,
        }
    }
}
