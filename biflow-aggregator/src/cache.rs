//! The bounded flow cache.
//!
//! An open-addressed table over serialised keys, sized to a power of two at
//! startup and never resized. Probing is linear within a bounded window; when
//! the window is saturated the table displaces the occupant of the window's
//! last slot and hands it back to the caller, which bounds every probe
//! sequence without rehashing. Only when the table itself is at capacity does
//! an insert report `Full`, and the caller must evict a victim of its own
//! choosing before retrying.
//!
//! Deletion uses backward shifting rather than tombstones, so the probe
//! invariant — an entry always lies within the probe window of its home slot,
//! with no empty slot in between — holds for the lifetime of the table.

use crate::arena::{KeyHandle, KeyPool, SlotHandle};
use crate::key::hash_bytes;

#[derive(Clone, Copy, Debug)]
struct Entry {
    hash: u64,
    key: KeyHandle,
    flow: SlotHandle,
}

/// Outcome of [`FlowCache::insert`].
#[derive(Debug)]
pub enum Insert {
    /// The key is new and `slot` is free for it; the caller initialises flow
    /// state and then occupies the slot.
    Inserted(usize),
    /// The key is present at `slot`; the caller updates the existing flow.
    Duplicated(usize),
    /// The probe window was saturated: the displaced occupant is handed back
    /// for finalize-and-emit, after which the caller occupies `slot`.
    Swapped {
        /// The slot to occupy.
        slot: usize,
        /// Displaced entry's key.
        key: KeyHandle,
        /// Displaced entry's flow.
        flow: SlotHandle,
    },
    /// The table is at capacity; the caller must evict before retrying.
    Full,
}

/// The bounded open-addressed flow table.
#[derive(Debug)]
pub struct FlowCache {
    entries: Vec<Option<Entry>>,
    mask: usize,
    len: usize,
    max_probe: usize,
}

impl FlowCache {
    /// A table of exactly `capacity` slots; `capacity` must be a power of two.
    pub fn with_capacity(capacity: usize) -> FlowCache {
        assert!(capacity.is_power_of_two(), "cache capacity must be a power of two");
        let max_probe = (capacity.trailing_zeros() as usize).max(4).min(capacity);
        FlowCache { entries: vec![None; capacity], mask: capacity - 1, len: 0, max_probe }
    }

    /// The hash of a serialised key.
    #[inline]
    pub fn hash(key: &[u8]) -> u64 {
        hash_bytes(key)
    }

    #[inline]
    fn home(&self, hash: u64) -> usize {
        hash as usize & self.mask
    }

    /// Number of live entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no flow is cached.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The fixed capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Probes for `key`, reporting how the caller should proceed. The table
    /// is not modified; a claimed slot becomes live through [`FlowCache::occupy`].
    pub fn insert(&mut self, key: &[u8], hash: u64, keys: &KeyPool) -> Insert {
        let home = self.home(hash);
        for step in 0..self.max_probe {
            let at = (home + step) & self.mask;
            match &self.entries[at] {
                None => return Insert::Inserted(at),
                Some(entry) if entry.hash == hash && keys.get(entry.key) == key => {
                    return Insert::Duplicated(at);
                }
                Some(_) => {}
            }
        }
        if self.len == self.capacity() {
            return Insert::Full;
        }
        let at = (home + self.max_probe - 1) & self.mask;
        let entry = self.entries[at].take().unwrap_or_else(|| unreachable!("saturated window"));
        self.len -= 1;
        Insert::Swapped { slot: at, key: entry.key, flow: entry.flow }
    }

    /// Fills a slot claimed by `Inserted` or vacated by `Swapped`.
    pub fn occupy(&mut self, slot: usize, hash: u64, key: KeyHandle, flow: SlotHandle) {
        if self.entries[slot].is_none() {
            self.len += 1;
        }
        self.entries[slot] = Some(Entry { hash, key, flow });
    }

    /// The handles stored at an occupied slot.
    pub fn entry(&self, slot: usize) -> (KeyHandle, SlotHandle) {
        match &self.entries[slot] {
            Some(entry) => (entry.key, entry.flow),
            None => panic!("read of an empty cache slot"),
        }
    }

    /// Removes `key`, returning its handles. Later entries of the touched
    /// cluster are shifted backwards so probe chains stay intact.
    pub fn remove(&mut self, key: &[u8], hash: u64, keys: &KeyPool) -> Option<(KeyHandle, SlotHandle)> {
        let home = self.home(hash);
        let mut found = None;
        for step in 0..self.max_probe {
            let at = (home + step) & self.mask;
            match &self.entries[at] {
                None => break,
                Some(entry) if entry.hash == hash && keys.get(entry.key) == key => {
                    found = Some(at);
                    break;
                }
                Some(_) => {}
            }
        }
        let at = found?;
        let entry = self.entries[at].take().unwrap_or_else(|| unreachable!("probed entry"));
        self.len -= 1;

        // Backward-shift: walk the cluster, pulling back every entry whose
        // home lies at or before the hole, until the cluster ends.
        let mut hole = at;
        let mut cursor = at;
        loop {
            cursor = (cursor + 1) & self.mask;
            let Some(follower) = self.entries[cursor] else { break };
            let distance = cursor.wrapping_sub(self.home(follower.hash)) & self.mask;
            let offset = cursor.wrapping_sub(hole) & self.mask;
            if distance >= offset {
                self.entries[hole] = Some(follower);
                self.entries[cursor] = None;
                hole = cursor;
            }
        }

        Some((entry.key, entry.flow))
    }

    /// Iterates the handles of every live entry, in table order.
    pub fn iter(&self) -> impl Iterator<Item = (KeyHandle, SlotHandle)> + '_ {
        self.entries.iter().flatten().map(|entry| (entry.key, entry.flow))
    }

    /// Empties the table. Handle recycling is the caller's business.
    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|entry| *entry = None);
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A pool pre-loaded with 4-byte keys 0..n; handle i holds key i.
    fn pool_with_keys(n: u32) -> (KeyPool, Vec<KeyHandle>) {
        let mut pool = KeyPool::new(n as usize, 4);
        let handles: Vec<_> = (0..n)
            .map(|i| {
                let handle = pool.acquire();
                pool.write(handle, &i.to_le_bytes());
                handle
            })
            .collect();
        (pool, handles)
    }

    fn insert_fresh(cache: &mut FlowCache, pool: &KeyPool, handle: KeyHandle, flow: u32) -> usize {
        let key = pool.get(handle).to_vec();
        let hash = FlowCache::hash(&key);
        match cache.insert(&key, hash, pool) {
            Insert::Inserted(slot) => {
                cache.occupy(slot, hash, handle, SlotHandle::from_index(flow));
                slot
            }
            other => panic!("expected Inserted, got {:?}", other),
        }
    }

    #[test]
    fn insert_then_duplicate() {
        let (pool, handles) = pool_with_keys(2);
        let mut cache = FlowCache::with_capacity(16);

        insert_fresh(&mut cache, &pool, handles[0], 0);
        assert_eq!(cache.len(), 1);

        let key = pool.get(handles[0]).to_vec();
        let hash = FlowCache::hash(&key);
        match cache.insert(&key, hash, &pool) {
            Insert::Duplicated(slot) => {
                assert_eq!(cache.entry(slot), (handles[0], SlotHandle::from_index(0)));
            }
            other => panic!("expected Duplicated, got {:?}", other),
        }
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn full_only_at_capacity() {
        let (pool, handles) = pool_with_keys(5);
        let mut cache = FlowCache::with_capacity(4);

        // Capacity 4 gives a probe window of 4, the whole table, so as long
        // as an empty slot exists every distinct key finds one.
        for (flow, &handle) in handles[..4].iter().enumerate() {
            insert_fresh(&mut cache, &pool, handle, flow as u32);
        }
        assert_eq!(cache.len(), 4);

        let key = pool.get(handles[4]).to_vec();
        let hash = FlowCache::hash(&key);
        assert!(matches!(cache.insert(&key, hash, &pool), Insert::Full));
    }

    #[test]
    fn saturated_window_swaps_the_last_probed_slot() {
        // Find seven keys that share one home slot in a table whose window
        // (log2(64) = 6) is far smaller than its capacity.
        let mut cache = FlowCache::with_capacity(64);
        let mut pool = KeyPool::new(8, 4);
        let mut colliders = Vec::new();
        let mut target = None;
        let mut probe = 0u32;
        while colliders.len() < 7 {
            let key = probe.to_le_bytes();
            let home = FlowCache::hash(&key) as usize & 63;
            if *target.get_or_insert(home) == home {
                let handle = pool.acquire();
                pool.write(handle, &key);
                colliders.push(handle);
            }
            probe += 1;
        }
        let target = target.unwrap();

        // The first six land on home, home+1, .., home+5.
        for (flow, &handle) in colliders[..6].iter().enumerate() {
            let slot = insert_fresh(&mut cache, &pool, handle, flow as u32);
            assert_eq!(slot, (target + flow) & 63);
        }

        // The seventh saturates the window and displaces its last slot, which
        // holds the sixth key.
        let key = pool.get(colliders[6]).to_vec();
        let hash = FlowCache::hash(&key);
        match cache.insert(&key, hash, &pool) {
            Insert::Swapped { slot, key: victim_key, flow: victim_flow } => {
                assert_eq!(slot, (target + 5) & 63);
                assert_eq!(victim_key, colliders[5]);
                assert_eq!(victim_flow, SlotHandle::from_index(5));
                cache.occupy(slot, hash, colliders[6], SlotHandle::from_index(6));
            }
            other => panic!("expected Swapped, got {:?}", other),
        }
        assert_eq!(cache.len(), 6);
    }

    #[test]
    fn remove_shifts_cluster_back() {
        let (pool, handles) = pool_with_keys(4);
        let mut cache = FlowCache::with_capacity(4);
        for (flow, &handle) in handles.iter().enumerate() {
            let key = pool.get(handle).to_vec();
            let hash = FlowCache::hash(&key);
            match cache.insert(&key, hash, &pool) {
                Insert::Inserted(slot) | Insert::Swapped { slot, .. } => {
                    cache.occupy(slot, hash, handle, SlotHandle::from_index(flow as u32));
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        // Remove each key in turn; every other key must stay findable.
        for (index, &handle) in handles.iter().enumerate() {
            let key = pool.get(handle).to_vec();
            let hash = FlowCache::hash(&key);
            let removed = cache.remove(&key, hash, &pool);
            assert_eq!(removed.map(|(k, _)| k), Some(handle));
            for &other in &handles[index + 1..] {
                let other_key = pool.get(other).to_vec();
                let other_hash = FlowCache::hash(&other_key);
                assert!(
                    matches!(cache.insert(&other_key, other_hash, &pool), Insert::Duplicated(_)),
                    "key lost after backward shift"
                );
            }
        }
        assert!(cache.is_empty());
    }

    #[test]
    fn clear_empties_the_table() {
        let (pool, handles) = pool_with_keys(3);
        let mut cache = FlowCache::with_capacity(8);
        for (flow, &handle) in handles.iter().enumerate() {
            insert_fresh(&mut cache, &pool, handle, flow as u32);
        }
        assert_eq!(cache.iter().count(), 3);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.iter().count(), 0);
    }
}
