//! The background resize coordinator.
//!
//! Runs on a dedicated `std::thread::spawn` worker, the way `conc`'s own
//! global garbage collector ran off the allocating thread rather than as
//! an async task — this crate has no async runtime dependency at all.

use crossbeam::channel::Receiver;
use crossbeam::epoch::{self, Owned};
use log::{debug, warn};
use std::sync::atomic::Ordering;

use crate::index::IndexTable;
use crate::list::List;
use crate::Inner;

/// Round `n` up to a power of two no smaller than `minimum`.
fn round_up_pow2(n: usize, minimum: usize) -> usize {
    n.max(minimum.max(1)).next_power_of_two()
}

pub(crate) fn run<K, V>(inner: std::sync::Arc<Inner<K, V>>, rx: Receiver<usize>)
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    while let Ok(mut signal) = rx.recv() {
        loop {
            let guard = &epoch::pin();
            let old = inner.table.load(Ordering::Acquire, guard);
            let old_size = unsafe { old.as_ref() }.map(IndexTable::size).unwrap_or(0);
            let new_size = if signal == 0 {
                if old_size == 0 {
                    round_up_pow2(0, inner.config.default_size)
                } else {
                    old_size * 2
                }
            } else {
                round_up_pow2(signal, inner.config.default_size)
            };

            if new_size <= old_size {
                break;
            }
            debug!("growing index table: {} -> {} slots", old_size, new_size);

            let new_table = Owned::new(IndexTable::new(new_size));
            seed(&new_table, &inner.list, guard);

            let prev = inner.table.swap(new_table, Ordering::AcqRel, guard);

            // Anything inserted into the list between the first seeding
            // pass and publication above is seeded a second time here,
            // against the now-published table.
            let current = inner.table.load(Ordering::Acquire, guard);
            if let Some(t) = unsafe { current.as_ref() } {
                seed(t, &inner.list, guard);
            }
            if !prev.is_null() {
                unsafe { guard.defer_destroy(prev) };
            }

            if inner.needs_grow(guard) {
                signal = 0;
                continue;
            }
            break;
        }
    }
    warn!("grow signal channel closed; resize coordinator exiting");
}

fn seed<K, V>(table: &IndexTable<K, V>, list: &List<K, V>, guard: &epoch::Guard) {
    let mut cursor = list.first(guard);
    let mut last_slot = None;
    while let Some(e) = unsafe { cursor.as_ref() } {
        let slot = e.hash >> table.shift();
        if last_slot != Some(slot) {
            table.add_item(cursor, guard);
            last_slot = Some(slot);
        }
        cursor = list.next(cursor, guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_power_of_two() {
        assert_eq!(round_up_pow2(100, 8), 128);
        assert_eq!(round_up_pow2(8, 8), 8);
        assert_eq!(round_up_pow2(1, 8), 8);
        assert_eq!(round_up_pow2(257, 8), 512);
    }
}
