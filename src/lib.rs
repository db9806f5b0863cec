// Copyright 2023 Silt Project Authors. Licensed under Apache-2.0.

//! Engine surface over the arena-backed memtable core.
//!
//! A memtable is one [Arena] plus one [SkipList]; the enclosing storage
//! engine writes through the list and reads through [KvIterator], the
//! only interface the core contributes to the engine boundary. Rotation
//! protocol: stop the writer, observe [SkipList::ref_count] == 1, drop
//! the list, then reset the arena through [std::sync::Arc::get_mut].

pub use arena::{
    Arena, BasicStats, Collector, CollectorRef, Handle, NoopCollector, INVALID_OFFSET,
    MAX_ALLOC_SIZE, MIN_OFFSET, PAGE_SIZE,
};
pub use skiplist::{
    bytewise_compare, ArenaSlice, Comparator, SkipList, SkipListIter, MAX_LEVEL,
};

/// Ordered cursor over the entries of one memtable.
///
/// # Concurrency
/// A single writer may mutate the underlying list while iterators read,
/// under ordering the caller provides. Every iterator must be closed
/// (or dropped) before the memtable's arena is rotated.
pub trait KvIterator {
    /// Position at the smallest live key. Returns validity.
    fn first(&mut self) -> bool;

    /// Position at the smallest key >= `key`. Returns validity.
    fn seek(&mut self, key: &[u8]) -> bool;

    /// Whether the cursor references an entry.
    fn valid(&self) -> bool;

    /// Advance to the next live entry. Returns validity.
    fn next(&mut self) -> bool;

    /// Key of the current entry, `None` when invalid.
    fn key(&self) -> Option<&[u8]>;

    /// Value of the current entry, `None` when invalid or deleted.
    fn value(&self) -> Option<&[u8]>;

    /// Release the underlying memtable reference. Idempotent.
    fn close(&mut self);
}

/// A boxed iterator handed across the engine boundary.
pub type KvIteratorPtr = Box<dyn KvIterator + Send>;

impl KvIterator for SkipListIter {
    fn first(&mut self) -> bool {
        SkipListIter::first(self)
    }

    fn seek(&mut self, key: &[u8]) -> bool {
        SkipListIter::seek(self, key)
    }

    fn valid(&self) -> bool {
        SkipListIter::valid(self)
    }

    fn next(&mut self) -> bool {
        SkipListIter::next(self)
    }

    fn key(&self) -> Option<&[u8]> {
        SkipListIter::key(self)
    }

    fn value(&self) -> Option<&[u8]> {
        SkipListIter::value(self)
    }

    fn close(&mut self) {
        SkipListIter::close(self)
    }
}
