//! Sharded concurrent dictionary.
//!
//! Keys are hash-partitioned across a power-of-two number of shards,
//! each an independent `AHashMap` behind its own `RwLock`. A key's
//! shard is `fnv1a32(key) & (shards - 1)`. The total entry count is an
//! atomic counter so `len` never touches a lock.
//!
//! Individual operations lock only their own shard and never fail.
//! Command-level atomicity across keys is the business of the
//! [`crate::lock`] stripe table, which uses the same hash so that a
//! key's lock stripe is stable for its lifetime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use ahash::AHashMap;
use rand::Rng;

use crate::pattern::Pattern;

/// FNV-1a 32-bit hash, shared by the dict and the lock stripe table.
pub fn fnv1a32(key: &str) -> u32 {
    const PRIME: u32 = 16_777_619;
    let mut hash: u32 = 2_166_136_261;
    for &b in key.as_bytes() {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Rounds a capacity hint up to the smallest power of two >= the hint,
/// with a floor of 16.
pub(crate) fn shard_count_for(hint: usize) -> usize {
    hint.max(16).next_power_of_two()
}

struct Shard<V> {
    map: RwLock<AHashMap<String, V>>,
}

impl<V> Shard<V> {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, AHashMap<String, V>> {
        self.map.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, AHashMap<String, V>> {
        self.map.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A hash-partitioned map with per-shard RW locks.
pub struct ConcurrentDict<V> {
    shards: Box<[Shard<V>]>,
    mask: u32,
    count: AtomicUsize,
}

impl<V> ConcurrentDict<V> {
    /// Creates a dict whose shard count is `hint` rounded up to a power
    /// of two.
    pub fn new(hint: usize) -> Self {
        let n = shard_count_for(hint);
        let shards = (0..n)
            .map(|_| Shard {
                map: RwLock::new(AHashMap::new()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            mask: (n - 1) as u32,
            count: AtomicUsize::new(0),
        }
    }

    /// The shard index a key hashes into.
    pub fn shard_index(&self, key: &str) -> u32 {
        fnv1a32(key) & self.mask
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, key: &str) -> &Shard<V> {
        &self.shards[self.shard_index(key) as usize]
    }

    /// Number of entries. Atomic read, never locks.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// `true` if the dict holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` if the key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.shard(key).read().contains_key(key)
    }

    /// Runs `f` against the value under the shard's read lock.
    pub fn with_value<R>(&self, key: &str, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.shard(key).read().get(key).map(f)
    }

    /// Runs `f` against the value under the shard's write lock.
    pub fn with_value_mut<R>(&self, key: &str, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.shard(key).write().get_mut(key).map(f)
    }

    /// Inserts or creates the value, then runs `f` on it. `init` is
    /// only invoked when the key is absent.
    pub fn upsert_with<R>(&self, key: &str, init: impl FnOnce() -> V, f: impl FnOnce(&mut V) -> R) -> R {
        let mut map = self.shard(key).write();
        if !map.contains_key(key) {
            map.insert(key.to_owned(), init());
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        f(map.get_mut(key).expect("entry just ensured"))
    }

    /// Stores a value. Returns 1 if the key was newly inserted, 0 if an
    /// existing value was overwritten (last writer wins within a shard).
    pub fn put(&self, key: &str, val: V) -> usize {
        let mut map = self.shard(key).write();
        if map.insert(key.to_owned(), val).is_some() {
            0
        } else {
            self.count.fetch_add(1, Ordering::Relaxed);
            1
        }
    }

    /// Stores the value only if the key is absent. Returns 1 on insert.
    pub fn put_if_absent(&self, key: &str, val: V) -> usize {
        let mut map = self.shard(key).write();
        if map.contains_key(key) {
            0
        } else {
            map.insert(key.to_owned(), val);
            self.count.fetch_add(1, Ordering::Relaxed);
            1
        }
    }

    /// Stores the value only if the key exists. Returns 1 on overwrite.
    pub fn put_if_exists(&self, key: &str, val: V) -> usize {
        let mut map = self.shard(key).write();
        if let Some(slot) = map.get_mut(key) {
            *slot = val;
            1
        } else {
            0
        }
    }

    /// Removes a key, returning the old value if present.
    pub fn remove(&self, key: &str) -> Option<V> {
        let mut map = self.shard(key).write();
        let old = map.remove(key);
        if old.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        old
    }

    /// Drops every entry.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.write().clear();
        }
        self.count.store(0, Ordering::Relaxed);
    }

    /// Visits every entry. Returning `false` from the consumer stops
    /// the walk. Each shard is visited under its read lock; entries
    /// inserted or removed concurrently in other shards may or may not
    /// be seen.
    pub fn for_each(&self, mut consumer: impl FnMut(&str, &V) -> bool) {
        for shard in self.shards.iter() {
            let map = shard.read();
            for (key, val) in map.iter() {
                if !consumer(key, val) {
                    return;
                }
            }
        }
    }

    /// All keys, in shard order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.len());
        self.for_each(|key, _| {
            keys.push(key.to_owned());
            true
        });
        keys
    }

    /// Up to `n` random keys; the same key may appear more than once.
    /// Returns all keys when `n` covers the whole dict.
    pub fn random_keys(&self, n: usize) -> Vec<String> {
        if n >= self.len() {
            return self.keys();
        }
        let mut rng = rand::rng();
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let shard = &self.shards[rng.random_range(0..self.shards.len())];
            if let Some(key) = random_key_of(&shard.read(), &mut rng) {
                out.push(key);
            }
        }
        out
    }

    /// `n` distinct random keys. Callers must ensure `n <= len()`;
    /// like `random_keys`, the whole key set is returned when `n`
    /// covers it.
    pub fn random_distinct_keys(&self, n: usize) -> Vec<String> {
        if n >= self.len() {
            return self.keys();
        }
        let mut rng = rand::rng();
        let mut seen = ahash::AHashSet::with_capacity(n);
        while seen.len() < n {
            let shard = &self.shards[rng.random_range(0..self.shards.len())];
            if let Some(key) = random_key_of(&shard.read(), &mut rng) {
                seen.insert(key);
            }
        }
        seen.into_iter().collect()
    }

    /// Cursor-based scan. The cursor is a shard index; the walk starts
    /// there and returns once the accumulated result exceeds `count`
    /// and at least one whole new shard has been visited. The returned
    /// cursor is the next shard to visit, or 0 when the scan completed.
    pub fn scan(&self, cursor: usize, count: usize, pattern: &str) -> (Vec<String>, usize) {
        if pattern == "*" && count >= self.len() && cursor == 0 {
            return (self.keys(), 0);
        }
        let compiled = Pattern::compile(pattern);

        let mut result = Vec::new();
        let mut shard_index = cursor;
        while shard_index < self.shards.len() {
            let map = self.shards[shard_index].read();
            if result.len() + map.len() > count && shard_index > cursor {
                return (result, shard_index);
            }
            for key in map.keys() {
                if pattern == "*" || compiled.matches(key) {
                    result.push(key.clone());
                }
            }
            drop(map);
            shard_index += 1;
        }
        (result, 0)
    }
}

/// Picks a uniformly random key from one shard map, or `None` if empty.
fn random_key_of<V>(map: &AHashMap<String, V>, rng: &mut impl Rng) -> Option<String> {
    if map.is_empty() {
        return None;
    }
    let idx = rng.random_range(0..map.len());
    map.keys().nth(idx).cloned()
}
