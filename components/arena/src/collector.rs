// Copyright 2023 Silt Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;

/// Basic statistics of an arena. Offers [bytes_allocated] and
/// [bytes_used].
///
/// [bytes_allocated]: BasicStats::bytes_allocated
/// [bytes_used]: BasicStats::bytes_used
#[derive(Debug, Clone, Copy)]
pub struct BasicStats {
    pub(crate) bytes_allocated: usize,
    pub(crate) bytes_used: usize,
}

impl BasicStats {
    /// Total bytes reserved from the system for the buffer.
    #[inline]
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Total bytes handed out to callers, alignment padding included.
    #[inline]
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }
}

/// Collect memory usage from an arena.
pub trait Collector {
    /// Called when `bytes` bytes are reserved from the system.
    fn on_alloc(&self, bytes: usize);

    /// Called when `bytes` bytes are handed out to a caller.
    fn on_used(&self, bytes: usize);

    /// Called when the buffer is released, with `used` bytes handed out
    /// of `allocated` reserved.
    fn on_free(&self, used: usize, allocated: usize);
}

pub type CollectorRef = Arc<dyn Collector + Send + Sync>;

/// The noop collector does nothing on alloc and free.
pub struct NoopCollector;

impl Collector for NoopCollector {
    fn on_alloc(&self, _bytes: usize) {}

    fn on_used(&self, _bytes: usize) {}

    fn on_free(&self, _used: usize, _allocated: usize) {}
}
