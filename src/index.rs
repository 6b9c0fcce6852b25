//! The sparse index table: an array of atomic cursors into the list.

use crossbeam::epoch::{Atomic, Guard, Shared};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::entry::Entry;

/// A single generation of the index. Built once by the resize
/// coordinator and swapped into place atomically; never mutated in size
/// after construction (slots themselves remain writable).
pub(crate) struct IndexTable<K, V> {
    shift: u32,
    slots: Box<[Atomic<Entry<K, V>>]>,
    size: usize,
    filled: AtomicUsize,
}

impl<K, V> IndexTable<K, V> {
    pub(crate) fn new(size: usize) -> Self {
        debug_assert!(size.is_power_of_two() && size >= 2);
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, Atomic::null);
        IndexTable {
            shift: u64::BITS - size.trailing_zeros(),
            slots: slots.into_boxed_slice(),
            size,
            filled: AtomicUsize::new(0),
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn shift(&self) -> u32 {
        self.shift
    }

    pub(crate) fn filled(&self) -> usize {
        self.filled.load(Ordering::Acquire)
    }

    pub(crate) fn fill_rate(&self) -> usize {
        self.filled() * 100 / self.size
    }

    pub(crate) fn slot(&self, i: usize) -> &Atomic<Entry<K, V>> {
        &self.slots[i]
    }

    fn slot_index(&self, hash: u64) -> usize {
        (hash >> self.shift) as usize
    }

    /// The starting cursor for a lookup or insert of `hash`: the target
    /// slot's anchor if set, else the nearest set slot to its left, else
    /// null (caller falls back to `List::first`).
    pub(crate) fn cursor<'g>(&self, hash: u64, guard: &'g Guard) -> Shared<'g, Entry<K, V>> {
        let i = self.slot_index(hash);
        let direct = self.slots[i].load(Ordering::Acquire, guard);
        if !direct.is_null() {
            return direct;
        }
        for slot in self.slots[..i].iter().rev() {
            let cursor = slot.load(Ordering::Acquire, guard);
            if !cursor.is_null() {
                // Anchoring invariant: any anchor this lookup returns must
                // not sort past the target hash, or a caller starting its
                // scan here could walk right past a match.
                debug_assert!(unsafe { cursor.as_ref() }.map_or(true, |e| e.hash <= hash));
                return cursor;
            }
        }
        Shared::null()
    }

    /// Anchor `entry` in its slot if the slot is empty or currently
    /// anchored to a larger-hash entry. Returns 1 the first time a slot
    /// transitions from empty to anchored, 0 otherwise — this return
    /// value drives the fill-rate heuristic only, never the true entry
    /// population (`List::len` is authoritative for that).
    pub(crate) fn add_item<'g>(&self, entry: Shared<'g, Entry<K, V>>, guard: &'g Guard) -> usize {
        let e = match unsafe { entry.as_ref() } {
            Some(e) => e,
            None => return 0,
        };
        let slot = &self.slots[self.slot_index(e.hash)];
        let mut current = slot.load(Ordering::Acquire, guard);
        loop {
            match unsafe { current.as_ref() } {
                None => {
                    match slot.compare_exchange(current, entry, Ordering::AcqRel, Ordering::Acquire, guard) {
                        Ok(_) => {
                            self.filled.fetch_add(1, Ordering::AcqRel);
                            return 1;
                        }
                        Err(err) => current = err.current,
                    }
                }
                Some(anchor) if e.hash < anchor.hash => {
                    match slot.compare_exchange(current, entry, Ordering::AcqRel, Ordering::Acquire, guard) {
                        Ok(_) => return 0,
                        Err(err) => current = err.current,
                    }
                }
                _ => return 0,
            }
        }
    }
}
