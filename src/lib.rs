//! A read-optimised, lock-free concurrent hash map.
//!
//! The map is a hash-ordered singly-linked list of entries (the source of
//! truth) overlaid with a sparse index table that lets lookups skip
//! straight to a nearby point in the list instead of scanning from the
//! head. A background coordinator thread rebuilds the index when the
//! table's fill rate grows too high, without blocking concurrent readers
//! or writers.
//!
//! Reclamation of unlinked list nodes and retired index tables uses
//! `crossbeam_epoch`, in the idiom of `ferrisdb-storage`'s `SkipList`:
//! every mutating operation pins a [`crossbeam::epoch::Guard`] for its
//! duration and defers destruction of anything it unlinks until no
//! pinned thread could still be observing it.

mod config;
mod entry;
mod hash;
mod index;
mod list;
mod resize;

pub use config::Config;
pub use hash::{Complex128, Complex64, Hashable};

use crossbeam::channel::Sender;
use crossbeam::epoch::{self, Atomic, Shared};
use parking_lot::RwLock;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use entry::Entry;
use index::IndexTable;
use list::{Insert, List};

type HasherFn<K> = dyn Fn(&K) -> u64 + Send + Sync;

struct Inner<K, V> {
    hasher: RwLock<Arc<HasherFn<K>>>,
    table: Atomic<IndexTable<K, V>>,
    list: List<K, V>,
    config: Config,
}

impl<K, V> Inner<K, V> {
    fn needs_grow(&self, guard: &epoch::Guard) -> bool {
        let table = self.table.load(Ordering::Acquire, guard);
        match unsafe { table.as_ref() } {
            Some(t) => t.fill_rate() > self.config.max_fill_rate,
            None => false,
        }
    }
}

impl<K, V> Drop for Inner<K, V> {
    fn drop(&mut self) {
        let guard = unsafe { epoch::unprotected() };
        let table = self.table.swap(Shared::null(), Ordering::Relaxed, guard);
        if !table.is_null() {
            unsafe { drop(table.into_owned()) };
        }
    }
}

/// A read-optimised, lock-free concurrent hash map.
///
/// The background resize coordinator thread is stopped and joined when
/// the map is dropped.
pub struct HashMap<K, V> {
    inner: Arc<Inner<K, V>>,
    grow_tx: Option<Sender<usize>>,
    coordinator: Option<JoinHandle<()>>,
}

impl<K, V> HashMap<K, V>
where
    K: Hashable + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// A new, empty map using the default hasher and the default
    /// `DefaultSize`/`MaxFillRate` tunables.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// A new, empty map pre-grown to hold at least `size` entries at the
    /// default fill rate.
    pub fn with_capacity(size: usize) -> Self {
        let map = Self::new();
        map.grow(size);
        map
    }

    /// A new, empty map with custom tunables.
    pub fn with_config(config: Config) -> Self {
        let (tx, rx) = crossbeam::channel::bounded(3);
        let inner = Arc::new(Inner {
            hasher: RwLock::new(Arc::new(hash::default_hash::<K>) as Arc<HasherFn<K>>),
            table: Atomic::null(),
            list: List::new(),
            config,
        });
        let coordinator = {
            let inner = Arc::clone(&inner);
            std::thread::spawn(move || resize::run(inner, rx))
        };
        HashMap {
            inner,
            grow_tx: Some(tx),
            coordinator: Some(coordinator),
        }
    }

    /// Replace the hash function used for new keys.
    ///
    /// Only safe to call before the first `set`: entries already in the
    /// list keep the hash they were inserted with, so swapping hashers
    /// afterward silently breaks the table's sort order for old entries.
    /// Not enforced — left as caller responsibility rather than erroring.
    pub fn set_hasher<F>(&self, f: F)
    where
        F: Fn(&K) -> u64 + Send + Sync + 'static,
    {
        *self.inner.hasher.write() = Arc::new(f);
    }

    fn hash(&self, key: &K) -> u64 {
        (self.inner.hasher.read())(key)
    }

    /// The number of live entries.
    pub fn len(&self) -> usize {
        self.inner.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The index table's occupancy percentage. `0` if no table has been
    /// allocated yet (the map has never grown).
    pub fn fill_rate(&self) -> usize {
        let guard = &epoch::pin();
        let table = self.inner.table.load(Ordering::Acquire, guard);
        match unsafe { table.as_ref() } {
            Some(t) => t.fill_rate(),
            None => 0,
        }
    }

    /// Request that the index table grow to at least `size` slots
    /// (rounded up to a power of two). `size == 0` requests a plain
    /// doubling of the current table instead of a target size. Non-blocking:
    /// the request is dropped if the coordinator's signal queue is full,
    /// since a grow is already pending.
    pub fn grow(&self, size: usize) {
        if let Some(tx) = &self.grow_tx {
            let _ = tx.try_send(size);
        }
    }

    fn request_initial_grow(&self) {
        if let Some(tx) = &self.grow_tx {
            let _ = tx.try_send(0);
        }
    }

    fn maybe_request_grow(&self, table: &IndexTable<K, V>) {
        if table.fill_rate() > self.inner.config.max_fill_rate {
            if let Some(tx) = &self.grow_tx {
                let _ = tx.try_send(0);
            }
        }
    }

    /// Look up `key`, cloning its value if present.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let hash = self.hash(key);
        let key_bytes = key.key_bytes();
        let guard = &epoch::pin();
        let table = self.inner.table.load(Ordering::Acquire, guard);
        let hint = match unsafe { table.as_ref() } {
            Some(t) => t.cursor(hash, guard),
            None => Shared::null(),
        };
        let mut cursor = if hint.is_null() {
            self.inner.list.first(guard)
        } else {
            hint
        };
        loop {
            let e = unsafe { cursor.as_ref() }?;
            if e.hash == hash {
                if &*e.key_bytes == key_bytes.as_slice() && !e.deleted.load(Ordering::Acquire) {
                    let v = unsafe { e.value.load(Ordering::Acquire, guard).as_ref() }?;
                    return Some(v.clone());
                }
            } else if e.hash > hash {
                return None;
            }
            cursor = e.next.load(Ordering::Acquire, guard);
        }
    }

    /// Insert `key -> value`, overwriting any existing value for `key`.
    pub fn set(&self, key: K, value: V) {
        let hash = self.hash(&key);
        let key_bytes = key.key_bytes().into_boxed_slice();
        loop {
            let guard = epoch::pin();
            let table_shared = self.inner.table.load(Ordering::Acquire, &guard);
            let table = match unsafe { table_shared.as_ref() } {
                Some(t) => t,
                None => {
                    self.request_initial_grow();
                    drop(guard);
                    std::thread::yield_now();
                    continue;
                }
            };
            let hint = table.cursor(hash, &guard);
            match self.inner.list.add_or_update(hash, key, key_bytes, value, hint, &guard) {
                Insert::Linked(entry) => {
                    let delta = table.add_item(entry, &guard);
                    if delta > 0 {
                        self.maybe_request_grow(table);
                    }
                }
                Insert::Updated => {}
            }
            return;
        }
    }

    /// Remove `key` if present. A no-op if it isn't.
    pub fn del(&self, key: &K) {
        let hash = self.hash(key);
        let key_bytes = key.key_bytes();
        let guard = &epoch::pin();
        let table = self.inner.table.load(Ordering::Acquire, guard);
        let table_ref = match unsafe { table.as_ref() } {
            Some(t) => t,
            None => return,
        };
        let hint = table_ref.cursor(hash, guard);
        if let Some(doomed) = self.inner.list.delete(hash, &key_bytes, hint, guard) {
            self.clear_index_slot(doomed, guard);
        }
    }

    /// If the index currently anchors `doomed`, replace that anchor with
    /// `doomed`'s successor (if it still falls in the same slot) or clear
    /// the slot entirely.
    fn clear_index_slot<'g>(&self, doomed: Shared<'g, Entry<K, V>>, guard: &'g epoch::Guard) {
        loop {
            let table = self.inner.table.load(Ordering::Acquire, guard);
            let table_ref = match unsafe { table.as_ref() } {
                Some(t) => t,
                None => return,
            };
            let doomed_ref = match unsafe { doomed.as_ref() } {
                Some(d) => d,
                None => return,
            };
            let i = (doomed_ref.hash >> table_ref.shift()) as usize;
            let slot = table_ref.slot(i);
            let current = slot.load(Ordering::Acquire, guard);
            if current != doomed {
                return;
            }
            let next = doomed_ref.next.load(Ordering::Acquire, guard);
            let replacement = match unsafe { next.as_ref() } {
                Some(n) if (n.hash >> table_ref.shift()) as usize == i => next,
                _ => Shared::null(),
            };
            if slot
                .compare_exchange(current, replacement, Ordering::AcqRel, Ordering::Acquire, guard)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Visit every live `(key, value)` pair in ascending `(hash, key)`
    /// order. No snapshot is taken — concurrent mutation may or may not
    /// be observed depending on where it lands relative to the walk.
    pub fn for_each<F: FnMut(&K, &V)>(&self, f: F) {
        let guard = &epoch::pin();
        self.inner.list.for_each(f, guard);
    }
}

impl<K, V> Default for HashMap<K, V>
where
    K: Hashable + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Drop for HashMap<K, V> {
    fn drop(&mut self) {
        // Dropping the sender closes the channel; the coordinator thread
        // observes `Receiver::recv` returning `Err` and exits.
        self.grow_tx.take();
        if let Some(handle) = self.coordinator.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn get_and_set_basic() {
        init_logging();
        let map: HashMap<i32, String> = HashMap::new();
        assert_eq!(map.get(&1), None);
        map.set(1, "one".to_string());
        assert_eq!(map.get(&1), Some("one".to_string()));
    }

    #[test]
    fn overwrite_does_not_change_len() {
        init_logging();
        let map: HashMap<i32, i32> = HashMap::new();
        map.set(5, 10);
        assert_eq!(map.len(), 1);
        map.set(5, 20);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&5), Some(20));
    }

    #[test]
    fn grows_past_initial_table_on_many_inserts() {
        init_logging();
        let map: HashMap<i32, i32> = HashMap::with_capacity(2);
        for i in 0..100 {
            map.set(i, i * i);
        }
        for i in 0..100 {
            assert_eq!(map.get(&i), Some(i * i));
        }
        assert_eq!(map.len(), 100);

        // The coordinator grows the table on a background thread; give it
        // a moment to catch up to the fill-rate threshold crossed above.
        let mut size = 0;
        for _ in 0..200 {
            let guard = &epoch::pin();
            size = unsafe { map.inner.table.load(Ordering::Acquire, guard).as_ref() }
                .map(IndexTable::size)
                .unwrap_or(0);
            if size >= 256 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(size >= 256, "expected table to grow past 256 slots, got {size}");
    }

    #[test]
    fn set_del_del_again() {
        init_logging();
        let map: HashMap<String, i32> = HashMap::new();
        map.set("k".to_string(), 1);
        assert_eq!(map.get(&"k".to_string()), Some(1));
        map.del(&"k".to_string());
        assert_eq!(map.get(&"k".to_string()), None);
        assert_eq!(map.len(), 0);
        // Deleting an absent key a second time is a no-op, not an error.
        map.del(&"k".to_string());
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn for_each_visits_every_live_entry_in_ascending_hash_order() {
        init_logging();
        let map: HashMap<i32, i32> = HashMap::new();
        for i in 0..20 {
            map.set(i, i);
        }
        map.del(&7);
        let mut seen = Vec::new();
        let mut hashes = Vec::new();
        map.for_each(|k, v| {
            assert_eq!(k, v);
            seen.push(*k);
            hashes.push(hash::default_hash(k));
        });
        assert_eq!(seen.len(), 19);
        assert!(!seen.contains(&7));
        let mut sorted = hashes.clone();
        sorted.sort_unstable();
        assert_eq!(hashes, sorted);
    }

    #[test]
    fn complex64_keys_order_and_retrieve_correctly() {
        init_logging();
        let map: HashMap<Complex64, &'static str> = HashMap::new();
        map.set(Complex64(1.0, 2.0), "a");
        map.set(Complex64(1.0, 3.0), "b");
        map.set(Complex64(-1.0, 0.0), "c");
        assert_eq!(map.get(&Complex64(1.0, 2.0)), Some("a"));
        assert_eq!(map.get(&Complex64(1.0, 3.0)), Some("b"));
        assert_eq!(map.get(&Complex64(-1.0, 0.0)), Some("c"));
        assert_eq!(map.get(&Complex64(2.0, 2.0)), None);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn eight_threads_ten_thousand_disjoint_keys_each() {
        init_logging();
        let map = Arc::new(HashMap::<i64, i64>::new());
        let threads = 8;
        let per_thread = 10_000;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let map = Arc::clone(&map);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let base = (t as i64) * per_thread;
                    for i in base..base + per_thread {
                        map.set(i, i * 2);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(map.len(), threads * per_thread as usize);
        for t in 0..threads as i64 {
            let base = t * per_thread;
            for i in base..base + per_thread {
                assert_eq!(map.get(&i), Some(i * 2));
            }
        }
    }
}
