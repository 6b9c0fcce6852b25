//! Nodes of the hash-ordered sorted list.

use crossbeam::epoch::Atomic;
use std::sync::atomic::{AtomicBool, Ordering};

/// A single key-value pair in the sorted list.
///
/// `key_bytes` is cached at construction time so the CAS-retry loops in
/// [`crate::list`] never recompute a key's byte view mid-traversal.
/// `value` is independently atomic so an overwrite of an existing key
/// never touches `next`, and `deleted` is the tombstone flag set once by
/// `del` before any physical unlink is attempted.
pub(crate) struct Entry<K, V> {
    pub(crate) hash: u64,
    pub(crate) key: K,
    pub(crate) key_bytes: Box<[u8]>,
    pub(crate) value: Atomic<V>,
    pub(crate) next: Atomic<Entry<K, V>>,
    pub(crate) deleted: AtomicBool,
}

impl<K, V> Entry<K, V> {
    pub(crate) fn new(hash: u64, key: K, key_bytes: Box<[u8]>, value: V) -> Self {
        Entry {
            hash,
            key,
            key_bytes,
            value: Atomic::new(value),
            next: Atomic::null(),
            deleted: AtomicBool::new(false),
        }
    }

    /// Whether `self` sorts strictly before `(hash, key_bytes)`.
    pub(crate) fn precedes(&self, hash: u64, key_bytes: &[u8]) -> bool {
        (self.hash, &*self.key_bytes) < (hash, key_bytes)
    }

    pub(crate) fn matches(&self, hash: u64, key_bytes: &[u8]) -> bool {
        self.hash == hash && &*self.key_bytes == key_bytes
    }
}

impl<K, V> Drop for Entry<K, V> {
    /// `value` is exclusively owned by this entry (never shared, unlike
    /// `next`), so it must be freed explicitly here — `Atomic<V>` itself
    /// has no drop glue for its pointee.
    fn drop(&mut self) {
        unsafe {
            let guard = crossbeam::epoch::unprotected();
            let value = self.value.load(Ordering::Relaxed, guard);
            if !value.is_null() {
                drop(value.into_owned());
            }
        }
    }
}
