use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::dict::fnv1a;

/// A fixed pool of reader/writer locks addressed by key hash. Commands
/// that mutate in several steps (RPUSH, INCR, ZADD with update) take the
/// stripe for their keys; the dict's shard locks only cover one call.
pub struct Locks {
    table: Vec<RwLock<()>>,
    mask: usize,
}

/// Guards for one multi-key acquisition. Slots are always taken in
/// ascending index order, so two acquisitions can never deadlock.
pub struct MultiGuard<'a> {
    _guards: Vec<SlotGuard<'a>>,
}

enum SlotGuard<'a> {
    Read(RwLockReadGuard<'a, ()>),
    Write(RwLockWriteGuard<'a, ()>),
}

impl Locks {
    pub fn new(size: usize) -> Locks {
        let count = size.next_power_of_two().max(1);
        Locks {
            table: (0..count).map(|_| RwLock::new(())).collect(),
            mask: count - 1,
        }
    }

    fn spread(&self, key: &str) -> usize {
        fnv1a(key.as_bytes()) as usize & self.mask
    }

    pub fn lock_write(&self, key: &str) -> RwLockWriteGuard<'_, ()> {
        self.table[self.spread(key)].write()
    }

    pub fn lock_read(&self, key: &str) -> RwLockReadGuard<'_, ()> {
        self.table[self.spread(key)].read()
    }

    /// Acquires the stripes covering `write_keys` exclusively and
    /// `read_keys` shared. A slot named by both sides is taken
    /// exclusively once.
    pub fn lock_keys<'a>(&'a self, write_keys: &[String], read_keys: &[String]) -> MultiGuard<'a> {
        let mut slots: Vec<(usize, bool)> = write_keys
            .iter()
            .map(|k| (self.spread(k), true))
            .chain(read_keys.iter().map(|k| (self.spread(k), false)))
            .collect();
        // write beats read on the same slot, then dedup; ascending slot
        // order is the deadlock-free total order
        slots.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        slots.dedup_by_key(|s| s.0);

        let guards = slots
            .into_iter()
            .map(|(slot, write)| {
                if write {
                    SlotGuard::Write(self.table[slot].write())
                } else {
                    SlotGuard::Read(self.table[slot].read())
                }
            })
            .collect();
        MultiGuard { _guards: guards }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn single_key_round_trip() {
        let locks = Locks::new(64);
        {
            let _w = locks.lock_write("a");
        }
        let _r1 = locks.lock_read("a");
        let _r2 = locks.lock_read("a");
    }

    #[test]
    fn overlapping_multi_key_sets_do_not_deadlock() {
        let locks = Arc::new(Locks::new(8));
        let mut handles = Vec::new();
        for t in 0..4 {
            let locks = locks.clone();
            handles.push(thread::spawn(move || {
                // every thread uses the same keys in a different order
                let mut keys: Vec<String> = (0..6).map(|i| format!("k{}", i)).collect();
                keys.rotate_left(t);
                for _ in 0..100 {
                    let (w, r) = keys.split_at(3);
                    let _g = locks.lock_keys(w, r);
                    thread::sleep(Duration::from_micros(10));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn same_slot_in_both_sets_is_taken_once() {
        let locks = Locks::new(8);
        let key = vec!["shared".to_string()];
        // would self-deadlock if the slot were locked twice
        let _g = locks.lock_keys(&key, &key);
    }
}
