/// Cursor and seek state of one live upstream range-fetch session.
///
/// `start_position` is where the current request began and `current_read_position`
/// is the next chunk boundary the session will complete; the cursor only moves
/// forward, except through `seek` which restarts both at a new chunk start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConnection {
    start_position: u64,
    current_read_position: u64,
    seek_required: bool,
    seek_range: Option<(u64, u64)>,
    sequential_chunks_fetched: u64,
}

impl StreamConnection {
    pub fn new(start_position: u64) -> Self {
        StreamConnection {
            start_position,
            current_read_position: start_position,
            seek_required: false,
            seek_range: None,
            sequential_chunks_fetched: 0,
        }
    }

    pub fn start_position(&self) -> u64 {
        self.start_position
    }

    pub fn current_read_position(&self) -> u64 {
        self.current_read_position
    }

    pub fn seek_required(&self) -> bool {
        self.seek_required
    }

    /// Inclusive byte range of the read that requested the pending seek
    pub fn seek_range(&self) -> Option<(u64, u64)> {
        self.seek_range
    }

    pub fn sequential_chunks_fetched(&self) -> u64 {
        self.sequential_chunks_fetched
    }

    /// Record a completed chunk of `size` bytes
    pub fn advance(&mut self, size: u64) {
        self.current_read_position += size;
        self.sequential_chunks_fetched += 1;
    }

    /// Request a reconnect at `chunk_start` on behalf of the read covering `range`
    pub fn seek(&mut self, range: (u64, u64), chunk_start: u64) {
        self.seek_range = Some(range);
        self.start_position = chunk_start;
        self.current_read_position = chunk_start;
        self.seek_required = true;
        self.sequential_chunks_fetched = 0;
    }

    /// Clear a pending seek, returning the range that asked for it
    pub fn take_seek(&mut self) -> Option<(u64, u64)> {
        self.seek_required = false;
        self.seek_range.take()
    }

    /// Start the next request where the previous one stopped
    pub fn resume_at_cursor(&mut self) {
        self.start_position = self.current_read_position;
    }
}
