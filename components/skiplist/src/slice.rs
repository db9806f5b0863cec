// Copyright 2023 Silt Project Authors. Licensed under Apache-2.0.

//! Byte slices that keep their arena alive.

use std::{fmt, ops::Deref, slice, sync::Arc};

use arena::{Arena, Handle, MIN_OFFSET};

/// A block of bytes allocated from an arena.
///
/// Holds a reference to the arena, so the bytes stay readable after the
/// iterator or list they came from is gone, and the arena cannot be
/// reset while any such slice is alive (resetting requires exclusive
/// access to the `Arc`).
#[derive(Clone)]
pub struct ArenaSlice {
    arena: Arc<Arena>,
    offset: u32,
    len: u32,
}

impl ArenaSlice {
    /// `None` when the handle does not decode to a block inside
    /// `arena`.
    pub(crate) fn from_handle(arena: Arc<Arena>, handle: Handle) -> Option<ArenaSlice> {
        let offset = handle.offset();
        if offset < MIN_OFFSET || offset as usize + handle.size() as usize > arena.capacity() {
            return None;
        }
        Some(ArenaSlice {
            arena,
            offset,
            len: handle.size(),
        })
    }
}

impl Deref for ArenaSlice {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        unsafe { slice::from_raw_parts(self.arena.index(self.offset), self.len as usize) }
    }
}

impl fmt::Debug for ArenaSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_slice() {
        let arena = Arc::new(Arena::with_capacity(1 << 16));
        let handle = arena.allocate(5);
        unsafe { arena.write(handle, b"hello") };

        let slice = ArenaSlice::from_handle(arena.clone(), handle).unwrap();
        assert_eq!(b"hello", &slice[..]);
        assert_eq!(b"hello", &slice.clone()[..]);

        assert!(ArenaSlice::from_handle(arena, Handle::INVALID).is_none());
    }
}
