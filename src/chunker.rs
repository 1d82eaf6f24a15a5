use crate::cache::Cache;
use std::fmt;
use thiserror::Error;

/// Filesystem block size used for header/footer alignment
pub const BLOCK_SIZE: u64 = 4096;
/// Header chunk spans this many blocks (256 KiB)
pub const HEADER_BLOCKS: u64 = 64;

const MIN_FOOTER_SIZE: u64 = 16 * 1024;
const MAX_FOOTER_SIZE: u64 = 10 * 1024 * 1024;
// 0.2% of the file size
const FOOTER_DIVISOR: u64 = 500;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("Read size must be positive")]
    InvalidSize,
    #[error("Offset {offset} is beyond end of file ({file_size} bytes)")]
    OutOfBounds { offset: u64, file_size: u64 },
    #[error("Chunk size must be positive")]
    InvalidChunkSize,
    #[error("Cannot chunk an empty file")]
    EmptyFile,
}

/// Which region of the file a chunk belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkKind {
    Header,
    Body,
    Footer,
}

/// A fixed-boundary byte range of a remote file, the unit of caching and fetching.
///
/// Chunks are plain values: computing the same region twice yields equal chunks,
/// which is what lets concurrent readers share one cached-flag per chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Chunk {
    pub cache_key: String,
    pub kind: ChunkKind,
    pub index: u64,
    /// First byte of the chunk
    pub start: u64,
    /// Last byte of the chunk (inclusive)
    pub end: u64,
}

impl Chunk {
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset <= self.end
    }

    pub fn is_cached(&self, cache: &Cache) -> bool {
        cache.has(&self.cache_key, self.start, self.end)
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}#{} [{}-{}]",
            self.kind, self.index, self.start, self.end
        )
    }
}

/// Splits a file into header, fixed-size body chunks and footer.
#[derive(Debug, Clone)]
pub struct Chunker {
    cache_key: String,
    file_size: u64,
    chunk_size: u64,
    header_size: u64,
    footer_start: u64,
}

impl Chunker {
    pub fn new(
        cache_key: impl Into<String>,
        file_size: u64,
        chunk_size: u64,
    ) -> Result<Self, ChunkError> {
        if chunk_size == 0 {
            return Err(ChunkError::InvalidChunkSize);
        }
        if file_size == 0 {
            return Err(ChunkError::EmptyFile);
        }

        let header_size = (HEADER_BLOCKS * BLOCK_SIZE).min(file_size);
        let footer_start = if file_size <= header_size {
            file_size
        } else {
            file_size
                .saturating_sub(footer_size_for(file_size))
                .max(header_size)
        };

        Ok(Chunker {
            cache_key: cache_key.into(),
            file_size,
            chunk_size,
            header_size,
            footer_start,
        })
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn header_size(&self) -> u64 {
        self.header_size
    }

    /// Offset of the first footer byte (equal to file size when there is no footer)
    pub fn footer_start(&self) -> u64 {
        self.footer_start
    }

    pub fn footer_size(&self) -> u64 {
        self.file_size - self.footer_start
    }

    pub fn body_chunk_count(&self) -> u64 {
        (self.footer_start - self.header_size).div_ceil(self.chunk_size)
    }

    /// Total number of chunks in the file, header and footer included
    pub fn max_chunks(&self) -> u64 {
        let footer = if self.footer_start < self.file_size { 1 } else { 0 };
        1 + self.body_chunk_count() + footer
    }

    pub fn header_chunk(&self) -> Chunk {
        Chunk {
            cache_key: self.cache_key.clone(),
            kind: ChunkKind::Header,
            index: 0,
            start: 0,
            end: self.header_size - 1,
        }
    }

    pub fn footer_chunk(&self) -> Option<Chunk> {
        if self.footer_start >= self.file_size {
            return None;
        }
        Some(Chunk {
            cache_key: self.cache_key.clone(),
            kind: ChunkKind::Footer,
            index: self.body_chunk_count(),
            start: self.footer_start,
            end: self.file_size - 1,
        })
    }

    /// Body chunk index for an offset inside the body region, clamped to the last body chunk
    pub fn body_index(&self, offset: u64) -> u64 {
        let last = self.body_chunk_count().saturating_sub(1);
        (offset.saturating_sub(self.header_size) / self.chunk_size).min(last)
    }

    pub fn body_chunk(&self, index: u64) -> Chunk {
        let start = self.header_size + index * self.chunk_size;
        let end = (start + self.chunk_size - 1).min(self.footer_start - 1);
        Chunk {
            cache_key: self.cache_key.clone(),
            kind: ChunkKind::Body,
            index,
            start,
            end,
        }
    }

    /// The chunk containing `offset`, or None past end of file
    pub fn chunk_at(&self, offset: u64) -> Option<Chunk> {
        if offset >= self.file_size {
            None
        } else if offset < self.header_size {
            Some(self.header_chunk())
        } else if offset >= self.footer_start {
            self.footer_chunk()
        } else {
            Some(self.body_chunk(self.body_index(offset)))
        }
    }

    /// Ordered chunks intersecting `[start, end]` (inclusive). Callers must keep `end` in bounds.
    pub fn chunks_for_range(&self, start: u64, end: u64) -> Vec<Chunk> {
        if end < self.header_size {
            return vec![self.header_chunk()];
        }
        if start >= self.footer_start {
            return self.footer_chunk().into_iter().collect();
        }

        let mut chunks = Vec::new();
        if start < self.header_size {
            chunks.push(self.header_chunk());
        }

        let body_lo = start.max(self.header_size);
        let body_hi = end.min(self.footer_start - 1);
        if body_lo <= body_hi && self.body_chunk_count() > 0 {
            for index in self.body_index(body_lo)..=self.body_index(body_hi) {
                chunks.push(self.body_chunk(index));
            }
        }

        if end >= self.footer_start {
            chunks.extend(self.footer_chunk());
        }
        chunks
    }

    /// Resolve a read of `size` bytes at `position`. Sizes running past EOF are clamped.
    pub fn range(&self, position: u64, size: u64) -> Result<ChunkRange, ChunkError> {
        if size == 0 {
            return Err(ChunkError::InvalidSize);
        }
        if position >= self.file_size {
            return Err(ChunkError::OutOfBounds {
                offset: position,
                file_size: self.file_size,
            });
        }

        let size = size.min(self.file_size - position);
        let end = position + size - 1;

        Ok(ChunkRange {
            cache_key: self.cache_key.clone(),
            position,
            size,
            chunk_size: self.chunk_size,
            file_size: self.file_size,
            header_chunk: self.header_chunk(),
            footer_chunk: self.footer_chunk(),
            max_chunks: self.max_chunks(),
            chunks: self.chunks_for_range(position, end),
        })
    }
}

fn footer_size_for(file_size: u64) -> u64 {
    let raw = (file_size / FOOTER_DIVISOR).clamp(MIN_FOOTER_SIZE, MAX_FOOTER_SIZE);
    raw.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

/// A single read request resolved against the chunk layout of its file
#[derive(Debug, Clone)]
pub struct ChunkRange {
    pub cache_key: String,
    pub position: u64,
    pub size: u64,
    pub chunk_size: u64,
    pub file_size: u64,
    pub header_chunk: Chunk,
    pub footer_chunk: Option<Chunk>,
    pub max_chunks: u64,
    chunks: Vec<Chunk>,
}

impl ChunkRange {
    /// Inclusive byte range requested
    pub fn request_range(&self) -> (u64, u64) {
        (self.position, self.end())
    }

    pub fn end(&self) -> u64 {
        self.position + self.size - 1
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn first_chunk(&self) -> &Chunk {
        // A range always resolves to at least one chunk
        &self.chunks[0]
    }

    pub fn last_chunk(&self) -> &Chunk {
        &self.chunks[self.chunks.len() - 1]
    }

    /// The request lies entirely inside the header chunk
    pub fn is_header_only(&self) -> bool {
        self.end() <= self.header_chunk.end
    }

    pub fn starts_in_footer(&self) -> bool {
        self.footer_chunk
            .as_ref()
            .is_some_and(|footer| self.position >= footer.start)
    }

    pub fn cached_chunks(&self, cache: &Cache) -> Vec<Chunk> {
        self.chunks
            .iter()
            .filter(|chunk| chunk.is_cached(cache))
            .cloned()
            .collect()
    }

    pub fn uncached_chunks(&self, cache: &Cache) -> Vec<Chunk> {
        self.chunks
            .iter()
            .filter(|chunk| !chunk.is_cached(cache))
            .cloned()
            .collect()
    }

    pub fn is_cached(&self, cache: &Cache) -> bool {
        self.chunks.iter().all(|chunk| chunk.is_cached(cache))
    }
}
