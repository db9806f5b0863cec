// Copyright 2023 Silt Project Authors. Licensed under Apache-2.0.

use std::cmp::Ordering;

/// Total order over byte-slice keys.
///
/// Must be deterministic: the list persists nothing about ordering
/// besides what the comparator answers, and every search replays it.
pub type Comparator = fn(&[u8], &[u8]) -> Ordering;

/// Plain lexicographic byte order.
#[inline]
pub fn bytewise_compare(lhs: &[u8], rhs: &[u8]) -> Ordering {
    lhs.cmp(rhs)
}
