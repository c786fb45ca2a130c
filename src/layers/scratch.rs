//! Per-call scratch buffers for attention
//!
//! Score grids and per-head outputs are large (`heads × q_len × k_len`), so
//! they are recycled through a [`ScratchPool`]. A buffer set is checked out
//! as a [`ScratchGuard`] and handed back when the guard drops, on the success
//! path and on every early `?` return alike. Two concurrent calls never hold
//! the same buffers.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};

/// Working memory for one attention call
#[derive(Debug, Default)]
pub struct ScratchBuffers {
    /// Attention scores / probabilities, `[num_heads, q_len, k_len]`
    pub scores: Vec<f32>,
    /// Per-head weighted sums, `[num_heads, q_len, head_dim]`
    pub head_outputs: Vec<f32>,
}

impl ScratchBuffers {
    /// Resize both buffers for a call, zero-filled
    pub fn prepare(&mut self, scores_len: usize, head_outputs_len: usize) {
        self.scores.clear();
        self.scores.resize(scores_len, 0.0);
        self.head_outputs.clear();
        self.head_outputs.resize(head_outputs_len, 0.0);
    }

    /// Bytes currently reserved by both buffers
    #[must_use]
    pub fn capacity_bytes(&self) -> usize {
        (self.scores.capacity() + self.head_outputs.capacity()) * std::mem::size_of::<f32>()
    }
}

/// Pool of reusable scratch buffer sets
#[derive(Debug)]
pub struct ScratchPool {
    free: Mutex<Vec<ScratchBuffers>>,
    max_pooled: usize,
}

impl ScratchPool {
    /// Create a pool that keeps at most `max_pooled` idle buffer sets
    #[must_use]
    pub fn new(max_pooled: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_pooled,
        }
    }

    /// Check out a buffer set, allocating a fresh one if none is idle
    pub fn checkout(&self) -> ScratchGuard<'_> {
        let buffers = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_default();
        ScratchGuard {
            pool: self,
            buffers,
        }
    }

    /// Number of idle buffer sets
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn give_back(&self, buffers: ScratchBuffers) {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_pooled {
            free.push(buffers);
        }
    }
}

impl Default for ScratchPool {
    fn default() -> Self {
        Self::new(4)
    }
}

impl Clone for ScratchPool {
    /// Clones start with an empty pool; buffers are never shared
    fn clone(&self) -> Self {
        Self::new(self.max_pooled)
    }
}

/// Exclusive handle on a checked-out [`ScratchBuffers`]
#[derive(Debug)]
pub struct ScratchGuard<'a> {
    pool: &'a ScratchPool,
    buffers: ScratchBuffers,
}

impl Deref for ScratchGuard<'_> {
    type Target = ScratchBuffers;

    fn deref(&self) -> &ScratchBuffers {
        &self.buffers
    }
}

impl DerefMut for ScratchGuard<'_> {
    fn deref_mut(&mut self) -> &mut ScratchBuffers {
        &mut self.buffers
    }
}

impl Drop for ScratchGuard<'_> {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buffers));
    }
}
