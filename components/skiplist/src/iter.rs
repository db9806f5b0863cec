// Copyright 2023 Silt Project Authors. Licensed under Apache-2.0.

use std::{cmp::Ordering, mem, sync::Arc};

use arena::INVALID_OFFSET;
use lazy_static::lazy_static;
use parking_lot::Mutex;

use crate::{
    list::{SkipList, SkipListCore},
    slice::ArenaSlice,
};

lazy_static! {
    /// Process-wide pool of closed iterator shells.
    static ref ITER_POOL: Mutex<Vec<SkipListIter>> = Mutex::new(Vec::new());
}

/// Bidirectional cursor over the live entries of a [SkipList].
///
/// Obtained from [SkipList::iter]. Starts invalid; position it with
/// [first](SkipListIter::first) or [seek](SkipListIter::seek). Holding
/// an iterator contributes one count to the list's reference count, so
/// [close](SkipListIter::close) it when done; dropping an unclosed
/// iterator releases the count as well, close additionally recycles the
/// shell through the pool.
pub struct SkipListIter {
    core: Option<Arc<SkipListCore>>,
    current: u32,
}

impl Default for SkipListIter {
    fn default() -> Self {
        Self {
            core: None,
            current: INVALID_OFFSET,
        }
    }
}

impl SkipList {
    /// Returns a pooled iterator over this list.
    pub fn iter(&self) -> SkipListIter {
        self.inc_ref();
        let mut iter = ITER_POOL.lock().pop().unwrap_or_default();
        iter.core = Some(self.core.clone());
        iter.current = INVALID_OFFSET;
        iter
    }
}

impl SkipListIter {
    /// Whether the cursor references an entry. The head sentinel is
    /// never observable as a position.
    pub fn valid(&self) -> bool {
        match &self.core {
            Some(core) => self.current != INVALID_OFFSET && self.current != core.head(),
            None => false,
        }
    }

    /// Position at the smallest live key. Returns validity.
    pub fn first(&mut self) -> bool {
        let core = match &self.core {
            Some(core) => core.clone(),
            None => return false,
        };
        self.current = core.head();
        self.advance_live(&core);
        self.valid()
    }

    /// Step level-0 links until a live node or the end; tombstones are
    /// skipped.
    fn advance_live(&mut self, core: &SkipListCore) {
        unsafe {
            loop {
                self.current = core.next(self.current, 0);
                if self.current == INVALID_OFFSET || core.value_handle(self.current).is_valid() {
                    break;
                }
            }
        }
    }

    /// Advance to the next live entry. Returns validity.
    pub fn next(&mut self) -> bool {
        if !self.valid() {
            return false;
        }
        let core = self.core.clone().unwrap();
        self.advance_live(&core);
        self.valid()
    }

    /// Move to the entry preceding the current key, the nearest one in
    /// key order. Unlike [next](SkipListIter::next) this does not skip
    /// tombstones. Returns validity.
    pub fn prev(&mut self) -> bool {
        if !self.valid() {
            return false;
        }
        let core = self.core.clone().unwrap();
        let key = unsafe { core.key_of(self.current) };
        let prev = core.seek_lt(key, None);
        if prev == core.head() {
            self.current = INVALID_OFFSET;
            return false;
        }
        self.current = prev;
        true
    }

    /// Position at the smallest key >= `key`. When that exact key is
    /// deleted the cursor rests on its tombstone with an absent value.
    /// Returns validity.
    pub fn seek(&mut self, key: &[u8]) -> bool {
        self.seek_le(key);
        if self.valid() {
            let core = self.core.clone().unwrap();
            let current_key = unsafe { core.key_of(self.current) };
            if core.compare_keys(current_key, key) == Ordering::Less {
                self.next();
            }
        }
        self.valid()
    }

    /// Position at the largest key <= `key`, invalid when every key is
    /// greater.
    pub(crate) fn seek_le(&mut self, key: &[u8]) {
        let core = match &self.core {
            Some(core) => core.clone(),
            None => return,
        };
        let prev = core.seek_lt(key, None);
        unsafe {
            if prev == core.head() {
                // Everything is >= key; adopt the first node only on an
                // exact match.
                let first = core.next(core.head(), 0);
                if first != INVALID_OFFSET
                    && core.compare_keys(key, core.key_of(first)) == Ordering::Equal
                {
                    self.current = first;
                } else {
                    self.current = INVALID_OFFSET;
                }
                return;
            }

            self.current = prev;
            let next = core.next(prev, 0);
            if next != INVALID_OFFSET && core.compare_keys(key, core.key_of(next)) == Ordering::Equal
            {
                self.current = next;
            }
        }
    }

    /// Position at the largest key strictly below `key`, invalid when
    /// that would be the head.
    pub(crate) fn seek_lt(&mut self, key: &[u8]) {
        let core = match &self.core {
            Some(core) => core.clone(),
            None => return,
        };
        let prev = core.seek_lt(key, None);
        self.current = if prev == core.head() {
            INVALID_OFFSET
        } else {
            prev
        };
    }

    /// Key of the current entry, `None` when invalid.
    pub fn key(&self) -> Option<&[u8]> {
        if !self.valid() {
            return None;
        }
        let core = self.core.as_ref().unwrap();
        Some(unsafe { core.key_of(self.current) })
    }

    /// Value of the current entry, `None` when invalid or on a
    /// tombstone.
    pub fn value(&self) -> Option<&[u8]> {
        if !self.valid() {
            return None;
        }
        let core = self.core.as_ref().unwrap();
        unsafe { core.value_of(self.current) }
    }

    /// Owned reference to the current key, kept readable by the arena
    /// independently of this iterator.
    pub fn key_slice(&self) -> Option<ArenaSlice> {
        if !self.valid() {
            return None;
        }
        let core = self.core.as_ref().unwrap();
        let handle = unsafe { core.key_handle(self.current) };
        ArenaSlice::from_handle(core.arena().clone(), handle)
    }

    /// Owned reference to the current value, `None` on a tombstone.
    pub fn value_slice(&self) -> Option<ArenaSlice> {
        if !self.valid() {
            return None;
        }
        let core = self.core.as_ref().unwrap();
        let handle = unsafe { core.value_handle(self.current) };
        ArenaSlice::from_handle(core.arena().clone(), handle)
    }

    /// Release the list reference and return the shell to the pool.
    /// Idempotent.
    pub fn close(&mut self) {
        if let Some(core) = self.core.take() {
            core.dec_ref();
            self.current = INVALID_OFFSET;
            ITER_POOL.lock().push(mem::take(self));
        }
    }
}

impl Drop for SkipListIter {
    fn drop(&mut self) {
        if let Some(core) = self.core.take() {
            core.dec_ref();
        }
    }
}
