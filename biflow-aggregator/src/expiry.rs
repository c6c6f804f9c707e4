//! The expiry list: live flows ordered by ascending passive deadline.
//!
//! The list is doubly linked through the `prev`/`next` indices embedded in
//! each [`FlowSlot`], so membership costs no storage beyond the arena itself.
//! Insertion walks backwards from the tail; deadlines usually grow with the
//! watermark, so the walk almost always stops at the first comparison and the
//! head peek and unlink stay O(1), which is what the drain loop needs.

use crate::arena::{FlowSlot, SlotHandle, NIL};

/// Head and tail of the deadline-ordered list. All link storage lives in the
/// slot arena; operations borrow it explicitly.
#[derive(Debug, Default)]
pub struct ExpiryList {
    head: u32,
    tail: u32,
    len: usize,
}

impl ExpiryList {
    /// An empty list.
    pub fn new() -> ExpiryList {
        ExpiryList { head: NIL, tail: NIL, len: 0 }
    }

    /// The slot with the earliest passive deadline, if any.
    #[inline]
    pub fn head(&self) -> Option<SlotHandle> {
        if self.head == NIL {
            None
        } else {
            Some(SlotHandle::from_index(self.head))
        }
    }

    /// Number of member slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no slot is listed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Links `handle` in deadline order, scanning from the tail.
    ///
    /// A slot with a deadline no earlier than the current tail's links in O(1).
    /// Equal deadlines order by insertion, newest last.
    pub fn insert(&mut self, slots: &mut [FlowSlot], handle: SlotHandle) {
        let node = handle.index();
        let deadline = slots[node as usize].passive_deadline;

        if self.head == NIL {
            slots[node as usize].prev = NIL;
            slots[node as usize].next = NIL;
            self.head = node;
            self.tail = node;
            self.len = 1;
            return;
        }

        let mut cursor = self.tail;
        while cursor != NIL && slots[cursor as usize].passive_deadline > deadline {
            cursor = slots[cursor as usize].prev;
        }

        if cursor == NIL {
            // Earlier than everything: new head.
            slots[node as usize].prev = NIL;
            slots[node as usize].next = self.head;
            slots[self.head as usize].prev = node;
            self.head = node;
        } else {
            let next = slots[cursor as usize].next;
            slots[node as usize].prev = cursor;
            slots[node as usize].next = next;
            slots[cursor as usize].next = node;
            if next == NIL {
                self.tail = node;
            } else {
                slots[next as usize].prev = node;
            }
        }
        self.len += 1;
    }

    /// Unlinks `handle` in O(1) through its stored neighbours.
    pub fn unlink(&mut self, slots: &mut [FlowSlot], handle: SlotHandle) {
        let node = handle.index();
        let prev = slots[node as usize].prev;
        let next = slots[node as usize].next;

        if prev == NIL {
            debug_assert_eq!(self.head, node, "unlink of a slot that is not listed");
            self.head = next;
        } else {
            slots[prev as usize].next = next;
        }
        if next == NIL {
            debug_assert_eq!(self.tail, node, "unlink of a slot that is not listed");
            self.tail = prev;
        } else {
            slots[next as usize].prev = prev;
        }

        slots[node as usize].prev = NIL;
        slots[node as usize].next = NIL;
        self.len -= 1;
    }

    /// Moves `handle` to its ordered position after a deadline change.
    pub fn reposition(&mut self, slots: &mut [FlowSlot], handle: SlotHandle) {
        self.unlink(slots, handle);
        self.insert(slots, handle);
    }

    /// Forgets every member. The slots themselves are recycled by the caller.
    pub fn clear(&mut self) {
        self.head = NIL;
        self.tail = NIL;
        self.len = 0;
    }
}
