//! Random payload for throughput tests
//!
//! The payload content is irrelevant to the measurement; only its volume
//! matters. One buffer is filled with pseudo-random bytes at startup and
//! shared read-only by every session, which then serve fixed-size blocks
//! out of it round-robin.

use rand::RngCore;
use std::sync::Arc;

/// Size of the shared random buffer (10 MiB).
pub const PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// A read-only, cheaply cloneable buffer of random bytes
#[derive(Clone)]
pub struct PayloadSource {
    data: Arc<[u8]>,
}

impl PayloadSource {
    /// Creates a payload of [`PAYLOAD_SIZE`] random bytes.
    pub fn new() -> Self {
        Self::with_size(PAYLOAD_SIZE)
    }

    /// Creates a payload of `size` random bytes.
    pub fn with_size(size: usize) -> Self {
        let mut data = vec![0u8; size];
        rand::thread_rng().fill_bytes(&mut data);
        Self { data: data.into() }
    }

    /// Returns the number of bytes in the payload
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns a cursor that yields `block_size` slices of the payload.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is zero or larger than the payload;
    /// `Config::validate` rules both out before any session starts.
    pub fn blocks(&self, block_size: usize) -> PayloadCursor {
        assert!(
            block_size > 0 && block_size <= self.data.len(),
            "block size {} out of range for payload of {} bytes",
            block_size,
            self.data.len()
        );
        PayloadCursor {
            data: self.data.clone(),
            block_size,
            offset: 0,
        }
    }
}

impl Default for PayloadSource {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PayloadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadSource")
            .field("len", &self.data.len())
            .finish()
    }
}

/// Serves consecutive blocks of a [`PayloadSource`], wrapping to the start
/// whenever a full block no longer fits.
pub struct PayloadCursor {
    data: Arc<[u8]>,
    block_size: usize,
    offset: usize,
}

impl PayloadCursor {
    /// Returns the next block; always exactly `block_size` bytes long.
    pub fn next_block(&mut self) -> &[u8] {
        if self.offset + self.block_size > self.data.len() {
            self.offset = 0;
        }
        let start = self.offset;
        self.offset += self.block_size;
        &self.data[start..start + self.block_size]
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}
