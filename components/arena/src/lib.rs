// Copyright 2023 Silt Project Authors. Licensed under Apache-2.0.

//! Fixed-capacity bump arena addressed by packed 64-bit handles.
//!
//! All storage of a memtable lives in one [Arena]: a page-aligned,
//! zero-initialized buffer with a monotonic allocation cursor. Blocks
//! are referenced by [Handle] (offset and requested size packed into a
//! `u64`) instead of native pointers, so the structures built on top
//! are position independent.

mod collector;
mod fixed_size;
mod handle;

/// Buffer sizes are rounded up to a multiple of this page size.
pub const PAGE_SIZE: usize = 1 << 16;

/// Largest size a single allocation may request.
pub const MAX_ALLOC_SIZE: u32 = (1 << 31) - 1;

/// Smallest offset a valid handle can carry. Offsets below this are
/// reserved so that no allocation ever collides with [Handle::INVALID].
pub const MIN_OFFSET: u32 = 128;

/// Offset sentinel shared by handles and offset-based links.
pub const INVALID_OFFSET: u32 = 0;

pub use collector::{BasicStats, Collector, CollectorRef, NoopCollector};
pub use fixed_size::Arena;
pub use handle::Handle;
