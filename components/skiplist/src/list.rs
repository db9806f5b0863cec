// Copyright 2023 Silt Project Authors. Licensed under Apache-2.0.

use std::{
    mem,
    sync::{
        atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use arena::{Arena, Handle, INVALID_OFFSET};
use snafu::{ensure, Backtrace, Snafu};

use crate::{key::Comparator, random, MAX_LEVEL};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "Failed to allocate head node, arena capacity:{}.\nBacktrace:\n{}",
        capacity,
        backtrace
    ))]
    AllocateHead { capacity: usize, backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The layout of Node inside the arena
/// 1. key_ref: handle of the key bytes
/// 2. value_ref: handle bits of the value bytes, invalid = tombstone
/// 3. level: height of the node, in [1, MAX_LEVEL]
/// 4. nexts: u32 offset of the successor at each level, one per level
// Uses C layout so nexts sits at the record tail
#[repr(C)]
struct Node {
    /// Written once while the node is still unlinked, never mutated
    /// after publication.
    key_ref: Handle,
    /// Swapped in place on update and delete, hence atomic: readers may
    /// observe it concurrently with the single writer.
    value_ref: AtomicU64,
    level: u32,
    /// Only `[0, level)` is allocated and used; the record is sized
    /// down to the sampled height, head alone carries the full tower.
    nexts: [AtomicU32; MAX_LEVEL],
}

impl Node {
    /// Record size for a node of `level`, trailing alignment included.
    fn record_size(level: u32) -> u32 {
        (mem::size_of::<Node>() - (MAX_LEVEL - level as usize) * mem::size_of::<AtomicU32>())
            as u32
    }
}

pub(crate) struct SkipListCore {
    arena: Arc<Arena>,
    compare: Comparator,
    head: u32,
    seed: AtomicU64,
    refcount: AtomicI64,
}

impl SkipListCore {
    fn node(&self, offset: u32) -> *mut Node {
        self.arena.index(offset) as *mut Node
    }

    pub(crate) fn head(&self) -> u32 {
        self.head
    }

    pub(crate) fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    pub(crate) fn compare_keys(&self, lhs: &[u8], rhs: &[u8]) -> std::cmp::Ordering {
        (self.compare)(lhs, rhs)
    }

    pub(crate) fn dec_ref(&self) -> i64 {
        self.refcount.fetch_add(-1, Ordering::SeqCst) - 1
    }

    /// Successor offset of `offset` at `level`.
    ///
    /// # Safety
    /// `offset` must reference a node record of height > `level` in
    /// this arena.
    pub(crate) unsafe fn next(&self, offset: u32, level: usize) -> u32 {
        (*self.node(offset)).nexts[level].load(Ordering::SeqCst)
    }

    /// # Safety
    /// `offset` must reference a node record in this arena.
    pub(crate) unsafe fn key_of(&self, offset: u32) -> &[u8] {
        let key_ref = (*self.node(offset)).key_ref;
        self.arena.view(key_ref).unwrap_or_default()
    }

    /// # Safety
    /// `offset` must reference a node record in this arena.
    pub(crate) unsafe fn key_handle(&self, offset: u32) -> Handle {
        (*self.node(offset)).key_ref
    }

    /// # Safety
    /// `offset` must reference a node record in this arena.
    pub(crate) unsafe fn value_handle(&self, offset: u32) -> Handle {
        Handle::from_raw((*self.node(offset)).value_ref.load(Ordering::SeqCst))
    }

    /// Value bytes of the node, `None` on a tombstone.
    ///
    /// # Safety
    /// `offset` must reference a node record in this arena.
    pub(crate) unsafe fn value_of(&self, offset: u32) -> Option<&[u8]> {
        let handle = self.value_handle(offset);
        if !handle.is_valid() {
            return None;
        }
        self.arena.view(handle)
    }

    /// Offset of the node with the greatest key strictly less than
    /// `key`, the head when no such node exists. Records the terminal
    /// node of every level in `log` when provided; that log is the
    /// splice input for [insert_next](Self::insert_next).
    pub(crate) fn seek_lt(&self, key: &[u8], log: Option<&mut [u32; MAX_LEVEL]>) -> u32 {
        let mut dummy = [INVALID_OFFSET; MAX_LEVEL];
        let log = log.unwrap_or(&mut dummy);

        let mut cursor = self.head;
        unsafe {
            for i in (0..MAX_LEVEL).rev() {
                // Invariant: cursor.key < key at this level.
                loop {
                    let next = self.next(cursor, i);
                    if next == INVALID_OFFSET
                        || self.compare_keys(key, self.key_of(next)) != std::cmp::Ordering::Greater
                    {
                        break;
                    }
                    cursor = next;
                }
                log[i] = cursor;
            }
        }
        cursor
    }

    /// 1 plus the number of consecutive even draws, capped at
    /// MAX_LEVEL. P(level >= k) = 2^(1-k).
    fn rand_level(&self) -> u32 {
        let mut seed = self.seed.load(Ordering::Relaxed);
        let mut level = 1;
        while level < MAX_LEVEL as u32 && random::splitmix64(&mut seed) % 2 == 0 {
            level += 1;
        }
        self.seed.store(seed, Ordering::Relaxed);
        level
    }

    /// Insert or update `key` at the position described by the `log`
    /// produced by [seek_lt](Self::seek_lt). `None` marks the key
    /// deleted. Returns the offset of the affected node, or
    /// `INVALID_OFFSET` when an arena allocation fails; no link has
    /// been rewritten at that point, so the list stays intact.
    ///
    /// REQUIRE: external writer exclusivity, guaranteed by `&mut self`
    /// on the public entry points.
    fn insert_next(&self, log: &[u32; MAX_LEVEL], key: &[u8], value: Option<&[u8]>) -> u32 {
        unsafe {
            let next = self.next(log[0], 0);
            if next != INVALID_OFFSET
                && self.compare_keys(key, self.key_of(next)) == std::cmp::Ordering::Equal
            {
                // Existing key: swap the value handle in place. The old
                // value bytes leak until the arena resets.
                let value_ref = match self.allocate_value(value) {
                    Some(handle) => handle,
                    None => return INVALID_OFFSET,
                };
                (*self.node(next))
                    .value_ref
                    .store(value_ref.raw(), Ordering::SeqCst);
                return next;
            }

            let level = self.rand_level();
            let mut handles = [Handle::INVALID; 2];
            if !self.arena.allocate_multiple(
                &[Node::record_size(level), key.len() as u32],
                &mut handles,
            ) {
                return INVALID_OFFSET;
            }
            let (node_ref, key_ref) = (handles[0], handles[1]);

            // The value block is allocated separately; if this fails the
            // node and key bytes leak, but nothing is linked yet.
            let value_ref = match self.allocate_value(value) {
                Some(handle) => handle,
                None => return INVALID_OFFSET,
            };

            let offset = node_ref.offset();
            let node = self.node(offset);
            (*node).level = level;
            (*node).key_ref = key_ref;
            (*node).value_ref = AtomicU64::new(value_ref.raw());
            self.arena.write(key_ref, key);

            // Splice bottom-up. Searches descend from the top, so a
            // node reachable at level 0 is already complete for them.
            for i in 0..level as usize {
                (*node).nexts[i].store(self.next(log[i], i), Ordering::SeqCst);
                (*self.node(log[i])).nexts[i].store(offset, Ordering::SeqCst);
            }

            offset
        }
    }

    fn allocate_value(&self, value: Option<&[u8]>) -> Option<Handle> {
        match value {
            None => Some(Handle::INVALID),
            Some(value) => {
                let handle = self.arena.allocate(value.len() as u32);
                if !handle.is_valid() {
                    return None;
                }
                unsafe { self.arena.write(handle, value) };
                Some(handle)
            }
        }
    }
}

/// Ordered byte map over an arena.
///
/// Writes go through `&mut self` and the list is deliberately not
/// `Clone`, so there is exactly one writer. Readers share the list
/// through [iter](SkipList::iter); each live iterator contributes one
/// count to [ref_count](SkipList::ref_count), and the enclosing engine
/// must observe a count of 1 before dropping the list and resetting the
/// arena.
pub struct SkipList {
    pub(crate) core: Arc<SkipListCore>,
}

impl SkipList {
    /// Create a list over `arena`, allocating the head sentinel at full
    /// height. The seed drives height sampling; equal seeds replay
    /// equal towers.
    pub fn new(arena: Arc<Arena>, compare: Comparator, seed: u64) -> Result<SkipList> {
        let head_ref = arena.allocate(Node::record_size(MAX_LEVEL as u32));
        ensure!(
            head_ref.is_valid(),
            AllocateHead {
                capacity: arena.capacity()
            }
        );

        let head = head_ref.offset();
        let core = SkipListCore {
            arena,
            compare,
            head,
            seed: AtomicU64::new(seed),
            refcount: AtomicI64::new(1),
        };
        unsafe {
            let node = core.node(head);
            (*node).level = MAX_LEVEL as u32;
            (*node).key_ref = Handle::INVALID;
            (*node).value_ref = AtomicU64::new(Handle::INVALID.raw());
            for i in 0..MAX_LEVEL {
                (*node).nexts[i].store(INVALID_OFFSET, Ordering::SeqCst);
            }
        }

        Ok(SkipList {
            core: Arc::new(core),
        })
    }

    /// Insert `key` with `value`, or mark the key deleted when `value`
    /// is `None`. Key and value bytes are copied into the arena.
    ///
    /// Returns false when the arena cannot fit the entry; the list is
    /// left unchanged and stays usable.
    pub fn insert(&mut self, key: &[u8], value: Option<&[u8]>) -> bool {
        let mut log = [INVALID_OFFSET; MAX_LEVEL];
        self.core.seek_lt(key, Some(&mut log));
        self.core.insert_next(&log, key, value) != INVALID_OFFSET
    }

    /// Mark `key` deleted. The node stays linked as a tombstone; a key
    /// never seen before gets a tombstone node so the deletion shadows
    /// older tables during reads.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        self.insert(key, None)
    }

    /// Value of `key`, `None` when absent or deleted.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.get_with_key(key).map(|(_, value)| value)
    }

    /// Key and value of the entry matching `key` exactly, `None` when
    /// absent or deleted.
    pub fn get_with_key(&self, key: &[u8]) -> Option<(&[u8], &[u8])> {
        let prev = self.core.seek_lt(key, None);
        unsafe {
            let node = self.core.next(prev, 0);
            if node == INVALID_OFFSET {
                return None;
            }
            let node_key = self.core.key_of(node);
            if self.core.compare_keys(key, node_key) != std::cmp::Ordering::Equal {
                return None;
            }
            self.core.value_of(node).map(|value| (node_key, value))
        }
    }

    /// Number of live entries. Tombstones are excluded, so this always
    /// matches the length of a forward scan.
    pub fn len(&self) -> usize {
        let mut count = 0;
        unsafe {
            let mut node = self.core.next(self.core.head, 0);
            while node != INVALID_OFFSET {
                if self.core.value_handle(node).is_valid() {
                    count += 1;
                }
                node = self.core.next(node, 0);
            }
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        unsafe {
            let mut node = self.core.next(self.core.head, 0);
            while node != INVALID_OFFSET {
                if self.core.value_handle(node).is_valid() {
                    return false;
                }
                node = self.core.next(node, 0);
            }
        }
        true
    }

    /// Arena bytes consumed so far, alignment padding included.
    pub fn mem_size(&self) -> usize {
        self.core.arena.stats().bytes_used()
    }

    /// Increment the reference count, returning the updated count.
    pub fn inc_ref(&self) -> i64 {
        self.core.refcount.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrement the reference count, returning the updated count.
    pub fn dec_ref(&self) -> i64 {
        self.core.dec_ref()
    }

    /// Current reference count: 1 for the list itself plus 1 per live
    /// iterator.
    pub fn ref_count(&self) -> i64 {
        self.core.refcount.load(Ordering::SeqCst)
    }
}
