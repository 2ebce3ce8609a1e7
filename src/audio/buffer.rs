//! # Session Audio Buffer
//!
//! Accumulates the raw PCM bytes of one session in arrival order, up to a fixed
//! byte limit. An append that would cross the limit is refused as a whole and
//! leaves the buffer untouched, so a client that overruns the limit can still end
//! the session and get the audio received so far recognized.

/// Bounded, append-only byte buffer.
#[derive(Debug)]
pub struct SessionBuffer {
    data: Vec<u8>,
    limit: usize,
    appends: u32,
}

/// Returned when an append would exceed the buffer limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitExceeded {
    pub limit: usize,
    pub attempted: usize,
}

impl SessionBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            appends: 0,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<(), LimitExceeded> {
        let attempted = self.data.len().saturating_add(bytes.len());
        if attempted > self.limit {
            return Err(LimitExceeded { limit: self.limit, attempted });
        }
        self.data.extend_from_slice(bytes);
        self.appends += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of successful appends so far.
    pub fn appends(&self) -> u32 {
        self.appends
    }

    /// Consume the buffer and hand out its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}
