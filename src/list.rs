//! The hash-ordered singly-linked list of live entries.
//!
//! Modeled on `ferrisdb-storage`'s `SkipList`: every mutation pins an
//! epoch guard, builds an `Owned` node up front, and retries the whole
//! CAS on contention by pulling the rejected node back out of the
//! `Err` rather than rebuilding it from scratch.

use crossbeam::epoch::{Guard, Owned, Shared};
use crossbeam::epoch::Atomic;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::entry::Entry;

/// Outcome of [`List::add_or_update`].
pub(crate) enum Insert<'g, K, V> {
    /// A fresh node was linked into the list.
    Linked(Shared<'g, Entry<K, V>>),
    /// An existing live entry with the same key had its value replaced in
    /// place; no new node was linked and no index work is needed.
    Updated,
}

/// A hash-ordered singly-linked list.
///
/// There is no materialized sentinel head node — `head` is the CAS target
/// for the first real entry, and every predecessor slot used by the CAS
/// loops below is uniformly `&Atomic<Entry<K, V>>`, whether that's `head`
/// or some entry's `next`.
pub(crate) struct List<K, V> {
    head: Atomic<Entry<K, V>>,
    len: AtomicUsize,
}

impl<K, V> List<K, V> {
    pub(crate) fn new() -> Self {
        List {
            head: Atomic::null(),
            len: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// The first non-tombstoned entry.
    pub(crate) fn first<'g>(&'g self, guard: &'g Guard) -> Shared<'g, Entry<K, V>> {
        Self::skip_tombstones(&self.head, guard)
    }

    /// The nearest non-tombstoned successor of `entry`.
    pub(crate) fn next<'g>(&'g self, entry: Shared<'g, Entry<K, V>>, guard: &'g Guard) -> Shared<'g, Entry<K, V>> {
        let next = &unsafe { entry.deref() }.next;
        Self::skip_tombstones(next, guard)
    }

    /// Walk forward from `start`, opportunistically unlinking any
    /// tombstone found along the way (a single best-effort CAS per node;
    /// a lost race just leaves the tombstone for the next reader).
    fn skip_tombstones<'g>(start: &'g Atomic<Entry<K, V>>, guard: &'g Guard) -> Shared<'g, Entry<K, V>> {
        let mut pred = start;
        let mut cursor = pred.load(Ordering::Acquire, guard);
        loop {
            match unsafe { cursor.as_ref() } {
                Some(e) if e.deleted.load(Ordering::Acquire) => {
                    let next = e.next.load(Ordering::Acquire, guard);
                    if pred
                        .compare_exchange(cursor, next, Ordering::AcqRel, Ordering::Acquire, guard)
                        .is_ok()
                    {
                        unsafe { guard.defer_destroy(cursor) };
                    }
                    pred = &e.next;
                    cursor = next;
                }
                _ => return cursor,
            }
        }
    }

    /// Find the CAS slot and its currently loaded value for `(hash,
    /// key_bytes)`, starting the scan at `hint` if it's usable
    /// (`hint.hash <= hash`), else at the list head.
    fn locate<'g>(
        &'g self,
        hash: u64,
        key_bytes: &[u8],
        hint: Shared<'g, Entry<K, V>>,
        guard: &'g Guard,
    ) -> (&'g Atomic<Entry<K, V>>, Shared<'g, Entry<K, V>>) {
        let mut slot: &Atomic<Entry<K, V>> = match unsafe { hint.as_ref() } {
            Some(h) if h.hash <= hash => &h.next,
            _ => &self.head,
        };
        loop {
            let curr = slot.load(Ordering::Acquire, guard);
            match unsafe { curr.as_ref() } {
                None => return (slot, curr),
                Some(e) => {
                    if e.matches(hash, key_bytes) || !e.precedes(hash, key_bytes) {
                        return (slot, curr);
                    }
                    slot = &e.next;
                }
            }
        }
    }

    /// Insert `(key, value)` or, if a live entry with the same key is
    /// already present, overwrite its value in place.
    pub(crate) fn add_or_update<'g>(
        &'g self,
        hash: u64,
        key: K,
        key_bytes: Box<[u8]>,
        value: V,
        hint: Shared<'g, Entry<K, V>>,
        guard: &'g Guard,
    ) -> Insert<'g, K, V> {
        let mut new = Owned::new(Entry::new(hash, key, key_bytes, value));
        loop {
            let (slot, curr) = self.locate(hash, &new.key_bytes, hint, guard);
            if let Some(e) = unsafe { curr.as_ref() } {
                if e.matches(hash, &new.key_bytes) && !e.deleted.load(Ordering::Acquire) {
                    // `new` is never published; reclaim its value without
                    // destructuring (Entry has a custom Drop, so the
                    // compiler won't allow moving `value` out of it
                    // directly) by swapping the field out to a null
                    // atomic first, then letting `new` drop normally.
                    let value_atomic = std::mem::replace(&mut new.value, Atomic::null());
                    drop(new);
                    let value = *unsafe { value_atomic.into_owned() }.into_box();
                    let old = e.value.swap(Owned::new(value), Ordering::AcqRel, guard);
                    if !old.is_null() {
                        unsafe { guard.defer_destroy(old) };
                    }
                    return Insert::Updated;
                }
            }
            // List order invariant: `new` must sort at or before whatever
            // it's about to displace (equal only for a re-insert racing a
            // still-linked tombstone of the same key), or `locate` walked
            // past where it belongs.
            debug_assert!(unsafe { curr.as_ref() }
                .map_or(true, |e| !e.precedes(hash, &new.key_bytes)));
            new.next.store(curr, Ordering::Relaxed);
            match slot.compare_exchange(curr, new, Ordering::AcqRel, Ordering::Acquire, guard) {
                Ok(linked) => {
                    self.len.fetch_add(1, Ordering::AcqRel);
                    return Insert::Linked(linked);
                }
                Err(err) => {
                    log::trace!("add_or_update CAS retry");
                    new = err.new;
                }
            }
        }
    }

    /// Find, tombstone, and best-effort unlink the live entry matching
    /// `(hash, key_bytes)`. Returns the removed entry (for index
    /// clean-up) or `None` if there was nothing to delete.
    pub(crate) fn delete<'g>(
        &'g self,
        hash: u64,
        key_bytes: &[u8],
        hint: Shared<'g, Entry<K, V>>,
        guard: &'g Guard,
    ) -> Option<Shared<'g, Entry<K, V>>> {
        let (slot, curr) = self.locate(hash, key_bytes, hint, guard);
        let e = match unsafe { curr.as_ref() } {
            Some(e) if e.matches(hash, key_bytes) => e,
            _ => return None,
        };
        if e.deleted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        self.len.fetch_sub(1, Ordering::AcqRel);
        let next = e.next.load(Ordering::Acquire, guard);
        if slot
            .compare_exchange(curr, next, Ordering::AcqRel, Ordering::Acquire, guard)
            .is_ok()
        {
            unsafe { guard.defer_destroy(curr) };
        }
        Some(curr)
    }

    /// Visit every live `(key, value)` pair in ascending `(hash, key)`
    /// order. No snapshot is taken; concurrent mutation may add or remove
    /// entries on either side of the traversal's current position.
    pub(crate) fn for_each<'g, F: FnMut(&K, &V)>(&'g self, mut f: F, guard: &'g Guard) {
        let mut cursor = self.first(guard);
        while let Some(e) = unsafe { cursor.as_ref() } {
            if let Some(v) = unsafe { e.value.load(Ordering::Acquire, guard).as_ref() } {
                f(&e.key, v);
            }
            cursor = self.next(cursor, guard);
        }
    }
}

impl<K, V> Drop for List<K, V> {
    fn drop(&mut self) {
        unsafe {
            let guard = crossbeam::epoch::unprotected();
            let mut cursor = self.head.load(Ordering::Relaxed, guard);
            while let Some(e) = cursor.as_ref() {
                let next = e.next.load(Ordering::Relaxed, guard);
                drop(cursor.into_owned());
                cursor = next;
            }
        }
    }
}
