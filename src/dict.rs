use std::collections::HashMap;

use parking_lot::RwLock;

/// Sharded concurrent map from string key to `V`. The shard count is a
/// power of two fixed at construction; a key picks its shard by FNV-1a
/// hash. Per-entry operations are atomic under the shard lock; anything
/// spanning several operations needs the striped locks in `lock`.
pub struct Dict<V> {
    shards: Vec<RwLock<HashMap<String, V>>>,
    mask: usize,
}

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

pub(crate) fn fnv1a(data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl<V: Clone> Dict<V> {
    pub fn new(shard_count: usize) -> Dict<V> {
        let count = shard_count.next_power_of_two().max(1);
        let shards = (0..count).map(|_| RwLock::new(HashMap::new())).collect();
        Dict {
            shards,
            mask: count - 1,
        }
    }

    fn shard(&self, key: &str) -> &RwLock<HashMap<String, V>> {
        &self.shards[fnv1a(key.as_bytes()) as usize & self.mask]
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.shard(key).read().get(key).cloned()
    }

    /// Stores `val` under `key`. Returns 1 when a new key was inserted,
    /// 0 when an existing one was overwritten.
    pub fn put(&self, key: &str, val: V) -> usize {
        match self.shard(key).write().insert(key.to_string(), val) {
            Some(_) => 0,
            None => 1,
        }
    }

    pub fn put_if_absent(&self, key: &str, val: V) -> usize {
        let mut shard = self.shard(key).write();
        if shard.contains_key(key) {
            return 0;
        }
        shard.insert(key.to_string(), val);
        1
    }

    pub fn put_if_exists(&self, key: &str, val: V) -> usize {
        let mut shard = self.shard(key).write();
        match shard.get_mut(key) {
            Some(slot) => {
                *slot = val;
                1
            }
            None => 0,
        }
    }

    pub fn remove(&self, key: &str) -> usize {
        match self.shard(key).write().remove(key) {
            Some(_) => 1,
            None => 0,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.shard(key).read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits every entry until the visitor returns false. Each shard is
    /// snapshotted before visiting so the callback may touch the dict
    /// (or take striped locks) without deadlocking.
    pub fn for_each<F>(&self, mut visit: F) -> bool
    where
        F: FnMut(&str, &V) -> bool,
    {
        for shard in &self.shards {
            let snapshot: Vec<(String, V)> = shard
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            for (key, val) in &snapshot {
                if !visit(key, val) {
                    return false;
                }
            }
        }
        true
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.len());
        for shard in &self.shards {
            keys.extend(shard.read().keys().cloned());
        }
        keys
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn put_reports_insert_vs_overwrite() {
        let d: Dict<i64> = Dict::new(16);
        assert_eq!(d.put("a", 1), 1);
        assert_eq!(d.put("a", 2), 0);
        assert_eq!(d.get("a"), Some(2));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn conditional_puts() {
        let d: Dict<i64> = Dict::new(16);
        assert_eq!(d.put_if_exists("a", 1), 0);
        assert_eq!(d.put_if_absent("a", 1), 1);
        assert_eq!(d.put_if_absent("a", 2), 0);
        assert_eq!(d.get("a"), Some(1));
        assert_eq!(d.put_if_exists("a", 3), 1);
        assert_eq!(d.get("a"), Some(3));
        assert_eq!(d.remove("a"), 1);
        assert_eq!(d.remove("a"), 0);
    }

    #[test]
    fn for_each_halts_on_false() {
        let d: Dict<i64> = Dict::new(4);
        for i in 0..10 {
            d.put(&format!("k{}", i), i);
        }
        let mut seen = 0;
        d.for_each(|_, _| {
            seen += 1;
            seen < 3
        });
        assert_eq!(seen, 3);

        let mut all = 0;
        assert!(d.for_each(|_, _| {
            all += 1;
            true
        }));
        assert_eq!(all, 10);
    }

    #[test]
    fn concurrent_puts_land() {
        let d: Arc<Dict<usize>> = Arc::new(Dict::new(16));
        let mut handles = Vec::new();
        for t in 0..4 {
            let d = d.clone();
            handles.push(thread::spawn(move || {
                for i in 0..250 {
                    d.put(&format!("k{}-{}", t, i), i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(d.len(), 1000);
    }
}
