// Copyright 2023 Silt Project Authors. Licensed under Apache-2.0.

use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    ptr::{self, NonNull},
    slice,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crate::{
    collector::{BasicStats, Collector, CollectorRef, NoopCollector},
    handle::Handle,
    MAX_ALLOC_SIZE, MIN_OFFSET, PAGE_SIZE,
};

const DEFAULT_ALIGN: usize = 8;
const MAX_CAPACITY: usize = 1 << 31;

#[inline]
fn align_up(n: usize) -> usize {
    (n + (DEFAULT_ALIGN - 1)) & !(DEFAULT_ALIGN - 1)
}

/// A fixed-capacity arena addressed by 32-bit offsets.
///
/// The buffer is zero-initialized, sized to a multiple of
/// [PAGE_SIZE](crate::PAGE_SIZE) and never grows. Allocation is a
/// single atomic bump of the cursor, so any number of threads may
/// allocate concurrently. Blocks are aligned to 8 bytes and are never
/// reclaimed individually; [reset](Arena::reset) drops everything at
/// once.
pub struct Arena {
    buf: NonNull<u8>,
    size: usize,
    cursor: AtomicUsize,
    /// Bytes actually granted to callers. Kept separate from the
    /// cursor, which a racing failed allocation may push past the
    /// buffer end without handing anything out.
    used: AtomicUsize,
    collector: CollectorRef,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Create an arena of at least `capacity` bytes, rounded up to a
    /// page multiple (one page minimum) and capped at 2 GiB.
    pub fn with_capacity(capacity: usize) -> Arena {
        Self::with_collector(capacity, Arc::new(NoopCollector))
    }

    /// # Safety
    /// ## alloc_zeroed
    /// See [std::alloc::alloc_zeroed]. The layout is non-zero sized and
    /// the buffer is deallocated in drop().
    pub fn with_collector(capacity: usize, collector: CollectorRef) -> Arena {
        let mut size = ((capacity + (PAGE_SIZE - 1)) / PAGE_SIZE) * PAGE_SIZE;
        size = size.max(PAGE_SIZE);
        if size > MAX_ALLOC_SIZE as usize {
            size = MAX_CAPACITY;
        }

        let layout = Layout::from_size_align(size, DEFAULT_ALIGN).unwrap();
        let buf = unsafe { alloc_zeroed(layout) };
        collector.on_alloc(size);

        Arena {
            buf: NonNull::new(buf).unwrap(),
            size,
            cursor: AtomicUsize::new(MIN_OFFSET as usize),
            used: AtomicUsize::new(0),
            collector,
        }
    }

    /// Reserve a block of `size` bytes, aligned to 8.
    ///
    /// Returns [Handle::INVALID] when `size` exceeds
    /// [MAX_ALLOC_SIZE](crate::MAX_ALLOC_SIZE) or the buffer cannot fit
    /// the block. A racing failure may leave the cursor past the buffer
    /// end; that capacity stays lost until [reset](Arena::reset).
    pub fn allocate(&self, size: u32) -> Handle {
        if size > MAX_ALLOC_SIZE {
            return Handle::INVALID;
        }

        let aligned = align_up(size as usize);
        if self.cursor.load(Ordering::SeqCst) + aligned > self.size {
            return Handle::INVALID;
        }

        let start = self.cursor.fetch_add(aligned, Ordering::SeqCst);
        if start + aligned > self.size {
            return Handle::INVALID;
        }

        self.used.fetch_add(aligned, Ordering::SeqCst);
        self.collector.on_used(aligned);
        Handle::pack(start as u32, size)
    }

    /// Reserve one block per entry of `sizes` in a single cursor bump,
    /// so the set either fully succeeds or fully fails.
    ///
    /// On success every slot of `handles` is overwritten with the
    /// handle of the matching block; sub-offsets follow input order.
    /// On failure `handles` is left untouched.
    pub fn allocate_multiple(&self, sizes: &[u32], handles: &mut [Handle]) -> bool {
        assert_eq!(sizes.len(), handles.len());

        let mut total = 0;
        for &size in sizes {
            if size > MAX_ALLOC_SIZE {
                return false;
            }
            total += align_up(size as usize);
        }

        if self.cursor.load(Ordering::SeqCst) + total > self.size {
            return false;
        }

        let mut start = self.cursor.fetch_add(total, Ordering::SeqCst);
        if start + total > self.size {
            return false;
        }

        for (handle, &size) in handles.iter_mut().zip(sizes) {
            *handle = Handle::pack(start as u32, size);
            start += align_up(size as usize);
        }

        self.used.fetch_add(total, Ordering::SeqCst);
        self.collector.on_used(total);
        true
    }

    /// Borrow the bytes of the block referenced by `handle`.
    ///
    /// Returns `None` when the handle does not decode to a range inside
    /// the buffer, [Handle::INVALID] included.
    pub fn view(&self, handle: Handle) -> Option<&[u8]> {
        let offset = handle.offset() as usize;
        let size = handle.size() as usize;
        if offset < MIN_OFFSET as usize || offset + size > self.size {
            return None;
        }

        Some(unsafe { slice::from_raw_parts(self.buf.as_ptr().add(offset), size) })
    }

    /// Copy `data` into the block referenced by `handle`.
    ///
    /// # Safety
    /// `handle` must come from a successful allocation on this arena,
    /// the caller must own that block, and nothing may read or write it
    /// concurrently.
    pub unsafe fn write(&self, handle: Handle, data: &[u8]) {
        let offset = handle.offset() as usize;
        debug_assert!(offset >= MIN_OFFSET as usize);
        debug_assert!(data.len() <= handle.size() as usize);
        debug_assert!(offset + handle.size() as usize <= self.size);

        ptr::copy_nonoverlapping(data.as_ptr(), self.buf.as_ptr().add(offset), data.len());
    }

    /// Raw pointer to the byte at `offset`.
    ///
    /// The pointer is only as good as the handle the offset came from;
    /// staying inside the allocated block is the caller's obligation.
    pub fn index(&self, offset: u32) -> *mut u8 {
        debug_assert!((offset as usize) < self.size);

        unsafe { self.buf.as_ptr().add(offset as usize) }
    }

    /// Rewind the cursor to the minimum offset and zero the buffer. All
    /// previously returned handles become meaningless.
    ///
    /// Exclusive access guarantees no allocator, view or iterator is
    /// live; share the arena through `Arc` and reset via
    /// [Arc::get_mut].
    pub fn reset(&mut self) {
        *self.cursor.get_mut() = MIN_OFFSET as usize;
        *self.used.get_mut() = 0;
        unsafe { ptr::write_bytes(self.buf.as_ptr(), 0, self.size) };
    }

    /// Bytes still available at the moment of observation, 0 after the
    /// cursor overshot on a failed allocation.
    pub fn remaining(&self) -> usize {
        self.size.saturating_sub(self.cursor.load(Ordering::SeqCst))
    }

    /// Buffer length after page rounding.
    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn stats(&self) -> BasicStats {
        BasicStats {
            bytes_allocated: self.size,
            bytes_used: self.used.load(Ordering::SeqCst),
        }
    }
}

impl Drop for Arena {
    /// Reclaim the buffer.
    fn drop(&mut self) {
        let stats = self.stats();
        self.collector.on_free(stats.bytes_used, stats.bytes_allocated);
        unsafe {
            dealloc(
                self.buf.as_ptr(),
                Layout::from_size_align_unchecked(self.size, DEFAULT_ALIGN),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    use super::*;
    use crate::Collector;

    #[test]
    fn test_allocate() {
        let arena = Arena::with_capacity(PAGE_SIZE);
        assert_eq!(PAGE_SIZE, arena.capacity());
        assert_eq!(PAGE_SIZE - MIN_OFFSET as usize, arena.remaining());

        let handle = arena.allocate(100);
        assert!(handle.is_valid());
        assert_eq!(100, handle.size());
        assert!(handle.offset() >= MIN_OFFSET);
        assert_eq!(65536 - 128 - 104, arena.remaining());
    }

    #[test]
    fn test_allocate_multiple() {
        let arena = Arena::with_capacity(PAGE_SIZE);
        let sizes = [50, 200, 300];
        let mut handles = [Handle::INVALID; 3];
        assert!(arena.allocate_multiple(&sizes, &mut handles));

        assert_eq!(50, handles[0].size());
        assert_eq!(200, handles[1].size());
        assert_eq!(300, handles[2].size());
        assert_eq!(MIN_OFFSET, handles[0].offset());
        assert_eq!(56, handles[1].offset() - handles[0].offset());
        assert_eq!(200, handles[2].offset() - handles[1].offset());
        assert_eq!(65536 - 128 - (56 + 200 + 304), arena.remaining());
    }

    #[test]
    fn test_view() {
        let arena = Arena::with_capacity(PAGE_SIZE);
        let handle = arena.allocate(100);
        assert!(handle.is_valid());

        let data: Vec<u8> = (0..100).collect();
        unsafe { arena.write(handle, &data) };
        assert_eq!(Some(&data[..]), arena.view(handle));

        assert_eq!(None, arena.view(Handle::INVALID));
        // A decoded range past the buffer end is rejected.
        assert_eq!(None, arena.view(Handle::from_raw((128u64 << 32) | (1 << 24))));
    }

    #[test]
    fn test_zero_size_allocation() {
        let arena = Arena::with_capacity(PAGE_SIZE);
        let before = arena.remaining();
        let handle = arena.allocate(0);
        assert!(handle.is_valid());
        assert_eq!(0, handle.size());
        assert!(handle.offset() >= MIN_OFFSET);
        assert_eq!(before, arena.remaining());
        assert_eq!(Some(&[][..]), arena.view(handle));
    }

    #[test]
    fn test_allocation_failures() {
        // Request exceeds the absolute allocation limit.
        let arena = Arena::with_capacity(PAGE_SIZE);
        assert!(!arena.allocate(1 << 31).is_valid());

        // Fill almost the whole page, then overflow it.
        let first = arena.allocate((PAGE_SIZE - MIN_OFFSET as usize - 16) as u32);
        assert!(first.is_valid());
        assert!(!arena.allocate(32).is_valid());
    }

    #[test]
    fn test_allocate_multiple_failures() {
        let arena = Arena::with_capacity(PAGE_SIZE);

        // Total exceeds the remaining space; outputs stay untouched.
        let half = ((PAGE_SIZE - MIN_OFFSET as usize) / 2) as u32;
        let mut handles = [Handle::INVALID; 2];
        assert!(!arena.allocate_multiple(&[half, half + 64], &mut handles));
        assert!(!handles[0].is_valid());
        assert!(!handles[1].is_valid());

        // One oversized entry poisons the whole request.
        assert!(!arena.allocate_multiple(&[100, 1 << 31], &mut handles));
        assert!(!handles[0].is_valid());
        assert_eq!(PAGE_SIZE - MIN_OFFSET as usize, arena.remaining());
    }

    #[test]
    fn test_reset() {
        let mut arena = Arena::with_capacity(PAGE_SIZE);
        let handle = arena.allocate(100);
        unsafe { arena.write(handle, &[0xAB; 100]) };

        arena.reset();
        assert_eq!(PAGE_SIZE - MIN_OFFSET as usize, arena.remaining());
        assert_eq!(0, arena.stats().bytes_used());

        // The old range is zeroed and the space is reusable.
        let fresh = arena.allocate(100);
        assert!(fresh.is_valid());
        assert_eq!(handle.offset(), fresh.offset());
        assert_eq!(Some(&[0u8; 100][..]), arena.view(fresh));
    }

    #[test]
    fn test_concurrent_allocate() {
        let arena = Arc::new(Arena::with_capacity(PAGE_SIZE * 4));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let arena = arena.clone();
                thread::spawn(move || {
                    (0..100)
                        .map(|_| {
                            let handle = arena.allocate(24);
                            assert!(handle.is_valid());
                            handle
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut handles: Vec<Handle> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();
        handles.sort_by_key(|h| h.offset());

        // Blocks are disjoint and the cursor advanced by exactly the
        // aligned total.
        for pair in handles.windows(2) {
            assert!(pair[0].offset() + 24 <= pair[1].offset());
        }
        assert_eq!(
            arena.capacity() - MIN_OFFSET as usize - 800 * 24,
            arena.remaining()
        );
        assert_eq!(800 * 24, arena.stats().bytes_used());
    }

    #[test]
    fn test_stats_after_overshoot() {
        let arena = Arena::with_capacity(PAGE_SIZE);
        let granted = arena.allocate(100);
        assert!(granted.is_valid());
        assert_eq!(104, arena.stats().bytes_used());

        // Emulate the losing side of an allocation race: a concurrent
        // failed request leaves the cursor past the buffer end, but no
        // bytes were handed out for it.
        arena.cursor.fetch_add(PAGE_SIZE, Ordering::SeqCst);
        assert_eq!(0, arena.remaining());
        assert!(!arena.allocate(8).is_valid());

        // bytes_used still counts granted bytes only, not the lost
        // capacity.
        assert_eq!(104, arena.stats().bytes_used());
    }

    struct MockCollector {
        allocated: AtomicUsize,
        used: AtomicUsize,
    }

    impl Collector for MockCollector {
        fn on_alloc(&self, bytes: usize) {
            self.allocated.fetch_add(bytes, Ordering::Relaxed);
        }

        fn on_used(&self, bytes: usize) {
            self.used.fetch_add(bytes, Ordering::Relaxed);
        }

        fn on_free(&self, _used: usize, _allocated: usize) {}
    }

    #[test]
    fn test_collector() {
        let collector = Arc::new(MockCollector {
            allocated: AtomicUsize::new(0),
            used: AtomicUsize::new(0),
        });
        let arena = Arena::with_collector(PAGE_SIZE, collector.clone());

        for _ in 0..20 {
            arena.allocate(80);
        }

        assert_eq!(PAGE_SIZE, collector.allocated.load(Ordering::Relaxed));
        assert_eq!(1600, collector.used.load(Ordering::Relaxed));
        assert_eq!(PAGE_SIZE, arena.stats().bytes_allocated());
        assert_eq!(1600, arena.stats().bytes_used());
    }
}
