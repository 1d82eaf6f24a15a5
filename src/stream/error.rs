use crate::chunker::{Chunk, ChunkError};
use crate::upstream::UpstreamError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("Upstream for {0} does not honor range requests")]
    RangeRefused(String),
    #[error("Access to {0} is forbidden")]
    Forbidden(String),
    #[error("{0} not found upstream")]
    NotFound(String),
    #[error("Range not satisfiable for {0}")]
    RangeNotSatisfiable(String),
    #[error("Unable to connect after {attempts} attempts: {reason}")]
    ConnectFailed { attempts: u32, reason: String },
    #[error("Chunks not cached within {timeout_secs}s: {}", describe_chunks(.chunks))]
    ChunksTooSlow { chunks: Vec<Chunk>, timeout_secs: u64 },
    #[error("Stream was closed")]
    Killed,
    #[error("Invalid read: {0}")]
    Chunk(#[from] ChunkError),
    #[error("Cached bytes {start}-{end} disappeared before they could be read")]
    CacheUnavailable { start: u64, end: u64 },
}

impl StreamError {
    /// Errors that end the session's connection loop
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StreamError::RangeRefused(_)
                | StreamError::Forbidden(_)
                | StreamError::NotFound(_)
                | StreamError::RangeNotSatisfiable(_)
                | StreamError::ConnectFailed { .. }
        )
    }

    /// Final error once retries for `filename` are used up on `last`
    pub(crate) fn exhausted(filename: &str, attempts: u32, last: UpstreamError) -> Self {
        match last {
            UpstreamError::Forbidden => StreamError::Forbidden(filename.to_string()),
            UpstreamError::NotFound { .. } => StreamError::NotFound(filename.to_string()),
            UpstreamError::RangeNotSatisfiable => {
                StreamError::RangeNotSatisfiable(filename.to_string())
            }
            UpstreamError::RangeIgnored { .. } => StreamError::RangeRefused(filename.to_string()),
            other => StreamError::ConnectFailed {
                attempts,
                reason: other.to_string(),
            },
        }
    }
}

fn describe_chunks(chunks: &[Chunk]) -> String {
    chunks
        .iter()
        .map(|chunk| chunk.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        let kind = match &err {
            StreamError::NotFound(_) => io::ErrorKind::NotFound,
            StreamError::Forbidden(_) => io::ErrorKind::PermissionDenied,
            StreamError::ChunksTooSlow { .. } => io::ErrorKind::TimedOut,
            StreamError::Killed => io::ErrorKind::Interrupted,
            StreamError::Chunk(_) | StreamError::RangeNotSatisfiable(_) => {
                io::ErrorKind::InvalidInput
            }
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
