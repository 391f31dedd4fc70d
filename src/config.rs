//! Cache-wide configuration, fixed at [`crate::Cache::new`] time.
//!
//! Mirrors the option table in spec.md §6. All fields are validated once;
//! nothing here is mutable after construction.

use std::time::Duration;

use crate::error::Error;

/// Options recognized at cache construction time.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Total cache memory in bytes. `size / buffer_min` is the buffer count.
    pub size: usize,
    /// Minimum buffer size; also the group allocation granule.
    pub buffer_min: usize,
    /// Maximum buffer size; must be a multiple of `buffer_min`.
    pub buffer_max: usize,
    /// Upper bound on a read-ahead batch. 0 disables read-ahead.
    pub max_read_ahead_blocks: usize,
    /// Upper bound on a swapout batch.
    pub max_write_blocks: usize,
    /// Milliseconds between forced swapout scans.
    pub swapout_period: Duration,
    /// Initial hold timer for newly modified buffers.
    pub swap_block_hold: Duration,
    /// Number of swapout worker threads. 0 disables the worker pool and
    /// every batch runs on the main swapout thread.
    pub swapout_workers: usize,
    /// OS thread priority hint for the main swapout thread. Not portable on
    /// stable `std::thread`; stored for driver layers that can apply it via
    /// platform-specific APIs after `Cache::new` returns the thread handles.
    pub swapout_priority: i32,
    /// Priority hint for swapout worker threads.
    pub swapout_worker_priority: i32,
    /// Priority hint for the read-ahead thread.
    pub read_ahead_priority: i32,
    /// Per-thread stack size, passed to `std::thread::Builder::stack_size`.
    pub task_stack_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: 4 * 1024 * 1024,
            buffer_min: 512,
            buffer_max: 4096,
            max_read_ahead_blocks: 16,
            max_write_blocks: 32,
            swapout_period: Duration::from_millis(1000),
            swap_block_hold: Duration::from_millis(3000),
            swapout_workers: 2,
            swapout_priority: 0,
            swapout_worker_priority: 0,
            read_ahead_priority: 0,
            task_stack_size: 256 * 1024,
        }
    }
}

impl CacheConfig {
    /// Validates cross-field invariants from spec.md §6:
    /// `size / buffer_min` must be exact, and `buffer_max` must be a
    /// multiple of `buffer_min`.
    pub fn validate(&self) -> Result<(), Error> {
        if self.buffer_min == 0 || !self.buffer_min.is_power_of_two() {
            return Err(Error::InvalidArgument("buffer_min must be a positive power of two"));
        }
        if self.buffer_max < self.buffer_min || self.buffer_max % self.buffer_min != 0 {
            return Err(Error::InvalidArgument("buffer_max must be a multiple of buffer_min"));
        }
        if self.size % self.buffer_min != 0 {
            return Err(Error::InvalidArgument("size must be a multiple of buffer_min"));
        }
        if self.size == 0 {
            return Err(Error::InvalidArgument("size must be nonzero"));
        }
        Ok(())
    }

    /// Total number of buffer descriptors the pool carries.
    pub fn total_buffers(&self) -> usize {
        self.size / self.buffer_min
    }

    /// `max_bds_per_group` from spec.md §4.2.
    pub fn max_bds_per_group(&self) -> usize {
        self.buffer_max / self.buffer_min
    }
}
