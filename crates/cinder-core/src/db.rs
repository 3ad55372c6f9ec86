//! A single logical database.
//!
//! Holds the three dicts (`data`, `ttl`, `versions`), the lock stripe
//! table, and the insert/delete callback slots the cluster layer uses
//! to track slot membership. TTLs are absolute unix-ms deadlines; each
//! one is mirrored by a timewheel task keyed `expire:<key>` that
//! re-acquires the key's write lock and re-checks the deadline before
//! deleting, so a racing `EXPIRE key later` never loses a live key.

use std::sync::{Arc, PoisonError, RwLock, Weak};

use tracing::debug;

use crate::dict::ConcurrentDict;
use crate::entity::DataEntity;
use crate::lock::{LockMap, LockSet};
use crate::timewheel::{now_unix_ms, TimeWheel};
use cinder_protocol::CmdLine;

/// Shard-table sizes. The data and version dicts share sizing; the ttl
/// dict is far smaller because few keys carry deadlines.
const DATA_DICT_SHARDS: usize = 1 << 10;
const TTL_DICT_SHARDS: usize = 1 << 4;

/// Callback invoked on key insert/delete: `(db_index, key, entity)`.
/// The entity is present for inserts and for deletes that removed a
/// live value.
pub type KeyEventCallback = Arc<dyn Fn(usize, &str, Option<&DataEntity>) + Send + Sync>;

/// Sink receiving every mutating command for the append-only file:
/// `(db_index, cmdline)`.
pub type AofSink = Arc<dyn Fn(usize, CmdLine) + Send + Sync>;

/// The timewheel task key guarding a key's expiration.
fn expire_task_key(key: &str) -> String {
    format!("expire:{key}")
}

pub struct Database {
    index: usize,
    /// Self-handle captured by timewheel tasks, so a pending expiry
    /// never keeps the database alive.
    me: Weak<Database>,
    data: ConcurrentDict<DataEntity>,
    ttl: ConcurrentDict<u64>,
    versions: ConcurrentDict<u32>,
    locks: LockMap,
    wheel: Arc<TimeWheel>,
    aof_sink: RwLock<Option<AofSink>>,
    insert_callback: RwLock<Option<KeyEventCallback>>,
    delete_callback: RwLock<Option<KeyEventCallback>>,
}

impl Database {
    /// Creates an empty database bound to the shared timewheel.
    pub fn new(index: usize, wheel: Arc<TimeWheel>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            index,
            me: me.clone(),
            data: ConcurrentDict::new(DATA_DICT_SHARDS),
            ttl: ConcurrentDict::new(TTL_DICT_SHARDS),
            versions: ConcurrentDict::new(DATA_DICT_SHARDS),
            locks: LockMap::new(DATA_DICT_SHARDS),
            wheel,
            aof_sink: RwLock::new(None),
            insert_callback: RwLock::new(None),
            delete_callback: RwLock::new(None),
        })
    }

    /// This database's index.
    pub fn index(&self) -> usize {
        self.index
    }

    // ---------------------------------------------------------------
    // locking
    // ---------------------------------------------------------------

    /// Acquires the stripes for a command's key sets.
    pub fn lock_keys<'a, W, R>(&'a self, write_keys: &[W], read_keys: &[R]) -> LockSet<'a>
    where
        W: AsRef<str>,
        R: AsRef<str>,
    {
        self.locks.lock(write_keys, read_keys)
    }

    /// Write-locks a single key.
    pub fn lock_single_write<'a>(&'a self, key: &str) -> LockSet<'a> {
        self.locks.lock(&[key], &[] as &[&str])
    }

    // ---------------------------------------------------------------
    // data access
    // ---------------------------------------------------------------

    /// Runs `f` on the live entity under `key`. Expired keys are
    /// removed on access and read as absent.
    pub fn with_entity<R>(&self, key: &str, f: impl FnOnce(&DataEntity) -> R) -> Option<R> {
        if self.is_expired(key) {
            return None;
        }
        self.data.with_value(key, f)
    }

    /// Mutable variant of [`Database::with_entity`].
    pub fn with_entity_mut<R>(&self, key: &str, f: impl FnOnce(&mut DataEntity) -> R) -> Option<R> {
        if self.is_expired(key) {
            return None;
        }
        self.data.with_value_mut(key, f)
    }

    /// Clones the live entity under `key`. Used where a snapshot is
    /// genuinely needed (undo logs, migration payloads).
    pub fn entity_snapshot(&self, key: &str) -> Option<DataEntity> {
        self.with_entity(key, |e| e.clone())
    }

    /// `true` if `key` holds a live entity.
    pub fn contains_key(&self, key: &str) -> bool {
        !self.is_expired(key) && self.data.contains_key(key)
    }

    /// Stores an entity. Returns 1 when the key is new, 0 on
    /// overwrite. The insert callback fires only for new keys.
    pub fn put_entity(&self, key: &str, entity: DataEntity) -> usize {
        let created = !self.data.contains_key(key);
        if created {
            if let Some(cb) = self.insert_callback() {
                cb(self.index, key, Some(&entity));
            }
        }
        self.data.put(key, entity)
    }

    /// Stores an entity only when absent. Returns 1 on insert.
    pub fn put_if_absent(&self, key: &str, entity: DataEntity) -> usize {
        if self.data.contains_key(key) {
            return 0;
        }
        self.put_entity(key, entity)
    }

    /// Stores an entity only when present. Returns 1 on overwrite.
    pub fn put_if_exists(&self, key: &str, entity: DataEntity) -> usize {
        self.data.put_if_exists(key, entity)
    }

    /// Runs `f` on the entity under `key`, creating it with `init`
    /// first when absent (firing the insert callback).
    pub fn upsert_entity_with<R>(
        &self,
        key: &str,
        init: impl FnOnce() -> DataEntity,
        f: impl FnOnce(&mut DataEntity) -> R,
    ) -> R {
        // clear a dead entity so init sees a clean slot
        self.is_expired(key);
        let created = !self.data.contains_key(key);
        let result = self.data.upsert_with(key, init, f);
        if created {
            if let Some(cb) = self.insert_callback() {
                self.data.with_value(key, |entity| {
                    cb(self.index, key, Some(entity));
                });
            }
        }
        result
    }

    /// Removes a key: drops its entity, its deadline, and its pending
    /// timewheel task, then fires the delete callback.
    pub fn remove(&self, key: &str) -> Option<DataEntity> {
        let entity = self.data.remove(key);
        self.ttl.remove(key);
        self.wheel.cancel(&expire_task_key(key));
        if let Some(cb) = self.delete_callback() {
            cb(self.index, key, entity.as_ref());
        }
        entity
    }

    /// Removes the key if its collection entity was left empty.
    /// Enforces the rule that no zero-length list/hash/set/zset stays
    /// in the keyspace.
    pub fn remove_if_empty_collection(&self, key: &str) {
        let empty = self
            .data
            .with_value(key, DataEntity::is_empty_collection)
            .unwrap_or(false);
        if empty {
            self.remove(key);
        }
    }

    /// Removes every named key; returns how many existed.
    pub fn removes<K: AsRef<str>>(&self, keys: &[K]) -> usize {
        let mut deleted = 0;
        for key in keys {
            if self.data.contains_key(key.as_ref()) {
                self.remove(key.as_ref());
                deleted += 1;
            }
        }
        deleted
    }

    /// Drops every key and deadline.
    pub fn flush(&self) {
        for key in self.ttl.keys() {
            self.wheel.cancel(&expire_task_key(&key));
        }
        self.data.clear();
        self.ttl.clear();
    }

    /// Live key count.
    pub fn key_count(&self) -> usize {
        self.data.len()
    }

    /// All keys. O(n).
    pub fn keys(&self) -> Vec<String> {
        self.data.keys()
    }

    /// Cursor scan over the data dict.
    pub fn scan(&self, cursor: usize, count: usize, pattern: &str) -> (Vec<String>, usize) {
        self.data.scan(cursor, count, pattern)
    }

    /// Up to `n` random keys, possibly repeating.
    pub fn random_keys(&self, n: usize) -> Vec<String> {
        self.data.random_keys(n)
    }

    /// Visits `(key, entity, deadline)` for every live key. Deadline is
    /// `None` for keys without a TTL. Used by the rewrite walk.
    pub fn for_each_entity(&self, mut f: impl FnMut(&str, &DataEntity, Option<u64>) -> bool) {
        self.data.for_each(|key, entity| {
            let deadline = self.ttl.with_value(key, |d| *d);
            f(key, entity, deadline)
        });
    }

    // ---------------------------------------------------------------
    // ttl
    // ---------------------------------------------------------------

    /// Sets an absolute unix-ms deadline on `key` and (re)schedules the
    /// timewheel task that enforces it.
    pub fn expire(&self, key: &str, deadline_unix_ms: u64) {
        self.ttl.put(key, deadline_unix_ms);
        let task_key = expire_task_key(key);
        let weak = self.me.clone();
        let key = key.to_owned();
        self.wheel.at(deadline_unix_ms, &task_key, move || {
            let Some(db) = weak.upgrade() else { return };
            let _guard = db.lock_single_write(&key);
            debug!(key = %key, "expiry task fired");
            // the deadline may have moved since this task was scheduled
            let Some(deadline) = db.ttl.with_value(&key, |d| *d) else {
                return;
            };
            if now_unix_ms() >= deadline {
                db.remove(&key);
            }
        });
    }

    /// Clears the deadline on `key` and cancels its timewheel task.
    pub fn persist(&self, key: &str) {
        self.ttl.remove(key);
        self.wheel.cancel(&expire_task_key(key));
    }

    /// Checks the deadline; a key at or past it is removed as a side
    /// effect and reported expired.
    pub fn is_expired(&self, key: &str) -> bool {
        let Some(deadline) = self.ttl.with_value(key, |d| *d) else {
            return false;
        };
        let expired = now_unix_ms() >= deadline;
        if expired {
            self.remove(key);
        }
        expired
    }

    /// The key's absolute deadline, if one is set.
    pub fn deadline_ms(&self, key: &str) -> Option<u64> {
        self.ttl.with_value(key, |d| *d)
    }

    // ---------------------------------------------------------------
    // versions
    // ---------------------------------------------------------------

    /// The key's current version; 0 when never written.
    pub fn get_version(&self, key: &str) -> u32 {
        self.versions.with_value(key, |v| *v).unwrap_or(0)
    }

    /// Bumps the version of every key.
    pub fn add_version<K: AsRef<str>>(&self, keys: &[K]) {
        for key in keys {
            let key = key.as_ref();
            let next = self.get_version(key).wrapping_add(1);
            self.versions.put(key, next);
        }
    }

    // ---------------------------------------------------------------
    // callbacks and persistence binding
    // ---------------------------------------------------------------

    /// Forwards a mutating command to the append-only file, if bound.
    pub fn add_aof(&self, line: CmdLine) {
        let sink = self
            .aof_sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(sink) = sink {
            sink(self.index, line);
        }
    }

    /// Installs the AOF sink. Called once when persistence is enabled.
    pub fn set_aof_sink(&self, sink: AofSink) {
        *self.aof_sink.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    /// Installs the insert callback (cluster slot tracking).
    pub fn set_insert_callback(&self, cb: KeyEventCallback) {
        *self
            .insert_callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(cb);
    }

    /// Installs the delete callback (cluster slot tracking).
    pub fn set_delete_callback(&self, cb: KeyEventCallback) {
        *self
            .delete_callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(cb);
    }

    fn insert_callback(&self) -> Option<KeyEventCallback> {
        self.insert_callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn delete_callback(&self) -> Option<KeyEventCallback> {
        self.delete_callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
