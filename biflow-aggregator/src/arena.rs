//! Slab pools for per-flow state.
//!
//! Both pools are sized once, at binding time, to the cache capacity plus one.
//! `acquire` and `release` are a free-stack push and pop; neither touches the
//! general allocator, so the per-record insert and evict paths stay
//! allocation-free. Handles are plain indices: nothing here hands out
//! pointers, and a handle is only meaningful to the pool that produced it.
//!
//! The flow slot keeps its expiry-list links inline, as indices into the same
//! slot arena, so the timeout structure lives in the arena too.

use crate::ops::FieldState;
use crate::types::Timestamp;

/// Index marking a detached expiry link.
pub const NIL: u32 = u32::MAX;

/// Handle to one fixed-width key slot in a [`KeyPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KeyHandle(u32);

/// Handle to one [`FlowSlot`] in a [`SlotPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotHandle(u32);

impl SlotHandle {
    /// The slot's index in the arena; the expiry links store these.
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }

    /// Rebuilds a handle from a stored link index.
    #[inline]
    pub fn from_index(index: u32) -> SlotHandle {
        SlotHandle(index)
    }
}

/// A pool of fixed-width key buffers backed by one contiguous allocation.
#[derive(Debug)]
pub struct KeyPool {
    data: Vec<u8>,
    width: usize,
    free: Vec<u32>,
    capacity: usize,
}

impl KeyPool {
    /// A pool of `capacity` slots of `width` bytes each.
    pub fn new(capacity: usize, width: usize) -> KeyPool {
        KeyPool {
            data: vec![0; capacity * width],
            width,
            free: (0..capacity as u32).rev().collect(),
            capacity,
        }
    }

    /// Claims a slot. The cache bounds live flows, so a caller that respects
    /// it never observes exhaustion.
    pub fn acquire(&mut self) -> KeyHandle {
        match self.free.pop() {
            Some(index) => KeyHandle(index),
            None => panic!("key pool exhausted: more than {} outstanding keys", self.capacity),
        }
    }

    /// Returns a slot to the pool.
    pub fn release(&mut self, handle: KeyHandle) {
        debug_assert!(!self.free.contains(&handle.0), "double release of key slot");
        self.free.push(handle.0);
    }

    /// Copies `bytes` into the slot.
    pub fn write(&mut self, handle: KeyHandle, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), self.width);
        let at = handle.0 as usize * self.width;
        self.data[at..at + self.width].copy_from_slice(bytes);
    }

    /// The slot's bytes.
    #[inline]
    pub fn get(&self, handle: KeyHandle) -> &[u8] {
        let at = handle.0 as usize * self.width;
        &self.data[at..at + self.width]
    }

    /// Number of slots currently claimed.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.capacity - self.free.len()
    }
}

/// The live state of one flow: expiry links and deadlines, the key handle,
/// the counters and timestamps, and the per-field aggregation states in
/// configuration order.
#[derive(Debug)]
pub struct FlowSlot {
    /// Previous slot in the expiry list, or [`NIL`].
    pub prev: u32,
    /// Next slot in the expiry list, or [`NIL`].
    pub next: u32,
    /// Second at which the passive timeout fires.
    pub passive_deadline: u64,
    /// Second at which the active timeout fires.
    pub active_deadline: u64,
    /// The flow's serialised key.
    pub key: KeyHandle,
    /// Accumulated record count.
    pub count: u32,
    /// Earliest `time_first` seen.
    pub time_first: Timestamp,
    /// Latest `time_last` seen.
    pub time_last: Timestamp,
    /// Whether the record that established `time_first` ran against the
    /// canonical direction.
    pub reversed: bool,
    /// Aggregation state, one entry per bound field.
    pub states: Vec<FieldState>,
}

impl FlowSlot {
    /// Folds a record's count and timestamps into the slot.
    pub fn update(&mut self, first: Timestamp, last: Timestamp, count: u32, reversed: bool) {
        self.count = self.count.wrapping_add(count);
        if first < self.time_first {
            self.time_first = first;
            self.reversed = reversed;
        }
        if last > self.time_last {
            self.time_last = last;
        }
    }
}

/// A pool of reusable [`FlowSlot`]s.
///
/// Every slot's state vector is built once, when the pool is sized; acquiring
/// a slot hands back the same allocation with its previous contents intact,
/// and the caller resets it through the field table.
#[derive(Debug)]
pub struct SlotPool {
    slots: Vec<FlowSlot>,
    free: Vec<u32>,
}

impl SlotPool {
    /// A pool of `capacity` slots whose state vectors come from `states`.
    pub fn new(capacity: usize, mut states: impl FnMut() -> Vec<FieldState>) -> SlotPool {
        let slots = (0..capacity)
            .map(|_| FlowSlot {
                prev: NIL,
                next: NIL,
                passive_deadline: 0,
                active_deadline: 0,
                key: KeyHandle(0),
                count: 0,
                time_first: Timestamp(u64::MAX),
                time_last: Timestamp(0),
                reversed: false,
                states: states(),
            })
            .collect();
        SlotPool { slots, free: (0..capacity as u32).rev().collect() }
    }

    /// Claims a slot; same contract as [`KeyPool::acquire`].
    pub fn acquire(&mut self) -> SlotHandle {
        match self.free.pop() {
            Some(index) => SlotHandle(index),
            None => panic!("slot pool exhausted: more than {} live flows", self.slots.len()),
        }
    }

    /// Returns a slot to the pool.
    pub fn release(&mut self, handle: SlotHandle) {
        debug_assert!(!self.free.contains(&handle.0), "double release of flow slot");
        self.free.push(handle.0);
    }

    /// The slot behind a handle.
    #[inline]
    pub fn get(&self, handle: SlotHandle) -> &FlowSlot {
        &self.slots[handle.0 as usize]
    }

    /// Mutable access to the slot behind a handle.
    #[inline]
    pub fn get_mut(&mut self, handle: SlotHandle) -> &mut FlowSlot {
        &mut self.slots[handle.0 as usize]
    }

    /// The whole arena, for the expiry list's link surgery.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [FlowSlot] {
        &mut self.slots
    }

    /// Number of slots currently claimed.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_pool_cursor_discipline() {
        let mut pool = KeyPool::new(3, 4);
        let a = pool.acquire();
        let b = pool.acquire();
        pool.write(a, &[1, 2, 3, 4]);
        pool.write(b, &[5, 6, 7, 8]);
        assert_eq!(pool.get(a), &[1, 2, 3, 4]);
        assert_eq!(pool.get(b), &[5, 6, 7, 8]);
        assert_eq!(pool.outstanding(), 2);

        pool.release(a);
        assert_eq!(pool.outstanding(), 1);
        let c = pool.acquire();
        // The freed slot is handed out again before any untouched one.
        assert_eq!(c, a);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    #[should_panic(expected = "key pool exhausted")]
    fn key_pool_panics_past_capacity() {
        let mut pool = KeyPool::new(1, 4);
        let _a = pool.acquire();
        let _b = pool.acquire();
    }

    #[test]
    fn slot_pool_reuses_state_vectors() {
        let mut pool = SlotPool::new(2, Vec::new);
        let a = pool.acquire();
        pool.get_mut(a).count = 9;
        pool.release(a);
        let b = pool.acquire();
        assert_eq!(a, b);
        // Contents survive release; the engine resets them on admit.
        assert_eq!(pool.get(b).count, 9);
    }

    #[test]
    fn flow_slot_update_tracks_extremes() {
        let mut pool = SlotPool::new(1, Vec::new);
        let handle = pool.acquire();
        let slot = pool.get_mut(handle);
        slot.update(Timestamp::from_secs(50), Timestamp::from_secs(60), 1, true);
        slot.update(Timestamp::from_secs(40), Timestamp::from_secs(55), 2, false);
        slot.update(Timestamp::from_secs(45), Timestamp::from_secs(70), 1, true);
        assert_eq!(slot.count, 4);
        assert_eq!(slot.time_first, Timestamp::from_secs(40));
        assert_eq!(slot.time_last, Timestamp::from_secs(70));
        // The reversed flag follows the record that set time_first.
        assert!(!slot.reversed);
    }
}
