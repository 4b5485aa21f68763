//! Intrusive doubly linked free list over an arena's frame table.
//!
//! Nodes are frame indices; the links live in [`Frame::prev`] / [`Frame::next`],
//! so the list needs no storage of its own and removal from the middle (for
//! contiguous and fixed-address allocations) is O(1).

use crate::frame::Frame;

/// End-of-list marker.
pub(crate) const NIL: u32 = u32::MAX;

/// Head/tail of a free list plus its length.
///
/// # Invariants
/// - `len` equals the number of nodes reachable from `head`.
/// - Every linked frame has `in_use == false`.
pub(crate) struct FreeList {
    head: u32,
    tail: u32,
    len: usize,
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    #[inline]
    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn push_back(&mut self, frames: &mut [Frame], idx: u32) {
        let i = idx as usize;
        debug_assert!(frames[i].prev == NIL && frames[i].next == NIL && self.head != idx);

        frames[i].prev = self.tail;
        frames[i].next = NIL;
        if self.tail == NIL {
            self.head = idx;
        } else {
            frames[self.tail as usize].next = idx;
        }
        self.tail = idx;
        self.len += 1;
    }

    pub(crate) fn pop_front(&mut self, frames: &mut [Frame]) -> Option<u32> {
        if self.head == NIL {
            return None;
        }
        let idx = self.head;
        self.remove(frames, idx);
        Some(idx)
    }

    /// Unlink `idx`, which must currently be on this list.
    pub(crate) fn remove(&mut self, frames: &mut [Frame], idx: u32) {
        let Frame { prev, next, .. } = frames[idx as usize];

        if prev == NIL {
            debug_assert_eq!(self.head, idx);
            self.head = next;
        } else {
            frames[prev as usize].next = next;
        }
        if next == NIL {
            debug_assert_eq!(self.tail, idx);
            self.tail = prev;
        } else {
            frames[next as usize].prev = prev;
        }

        frames[idx as usize].prev = NIL;
        frames[idx as usize].next = NIL;
        self.len -= 1;
    }

    /// Walk the list from head to tail.
    pub(crate) fn iter<'a>(&self, frames: &'a [Frame]) -> impl Iterator<Item = u32> + 'a {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            if cursor == NIL {
                return None;
            }
            let idx = cursor;
            cursor = frames[idx as usize].next;
            Some(idx)
        })
    }
}
