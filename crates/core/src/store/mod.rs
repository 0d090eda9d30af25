//! The keyspace: a sharded, concurrent map from key to entry.
//!
//! Each shard is an independent serialization point guarded by a write
//! lock; operations against the same key are applied in lock-acquisition
//! order, operations against keys in different shards proceed
//! concurrently. Composite operations take the union of their keys'
//! shards via [`Keyspace::with_locked`], acquiring guards in ascending
//! shard order so cross-shard lock acquisition cannot deadlock.
//!
//! Every mutation stamps the entry with a fresh value from the shard's
//! monotonic version counter; the optimistic-commit machinery compares
//! these stamps. Expired entries are dropped lazily on access, before any
//! operation can observe them.

pub mod entry;
pub mod expiration;
pub mod journal;
pub mod policy;
pub mod snapshot;
pub mod snapshot_scheduler;
pub mod stream;
pub mod value;
pub mod zset;

use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use hashbrown::HashMap;
use parking_lot::{RwLock, RwLockWriteGuard};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::pattern::Pattern;
pub use entry::{AccessMeta, Entry};
pub use value::{Value, ValueKind};

use value::{format_f64, parse_f64, parse_i64};

/// Remaining-lifetime answer for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlState {
    /// No such key (or it just expired).
    Missing,
    /// Key exists without a deadline.
    Persistent,
    /// Key exists; this many milliseconds remain.
    Remaining(u64),
}

/// One shard's contents. All keyed operations run against this through a
/// held shard guard.
#[derive(Debug, Default)]
pub struct ShardMap {
    entries: HashMap<Bytes, Entry>,
    /// Monotonic per-shard mutation counter; never reset, so a deleted and
    /// recreated key always carries a new version.
    next_version: u64,
}

#[derive(Debug, Default)]
struct Shard {
    map: RwLock<ShardMap>,
}

/// The keyspace. Explicitly owned and injectable: multiple instances
/// coexist, each initialized empty or from recovery.
pub struct Keyspace {
    shards: Box<[Shard]>,
    hasher: ahash::RandomState,
    mem_used: AtomicUsize,
    max_memory: usize,
    max_string_len: usize,
}

/// Write guards over the shards owning a set of keys, acquired in
/// ascending shard order. Exclusive access for a composite operation.
pub struct LockedKeys<'a> {
    ks: &'a Keyspace,
    guards: Vec<(usize, RwLockWriteGuard<'a, ShardMap>)>,
}

impl<'a> LockedKeys<'a> {
    /// The shard map owning `key`. The key's shard must be among the
    /// locked ones; locking is by key set, so this holds by construction.
    pub fn map_for(&mut self, key: &Bytes) -> &mut ShardMap {
        let idx = self.ks.shard_index(key);
        let pos = self
            .guards
            .binary_search_by_key(&idx, |(i, _)| *i)
            .unwrap_or_else(|_| panic!("shard {idx} not covered by this lock set"));
        &mut self.guards[pos].1
    }
}

impl Keyspace {
    pub fn new(config: &EngineConfig) -> Self {
        let shards = (0..config.shards.max(1)).map(|_| Shard::default()).collect();
        Self {
            shards,
            hasher: ahash::RandomState::new(),
            mem_used: AtomicUsize::new(0),
            max_memory: config.max_memory,
            max_string_len: config.max_string_len,
        }
    }

    pub(crate) fn shard_index(&self, key: &Bytes) -> usize {
        (self.hasher.hash_one(key.as_ref()) as usize) % self.shards.len()
    }

    pub(crate) fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub(crate) fn shard_guard(&self, idx: usize) -> RwLockWriteGuard<'_, ShardMap> {
        self.shards[idx].map.write()
    }

    /// Run `f` with the single shard owning `key` locked.
    pub fn with_shard<R>(&self, key: &Bytes, f: impl FnOnce(&mut ShardMap) -> R) -> R {
        let mut guard = self.shard_guard(self.shard_index(key));
        f(&mut guard)
    }

    /// Exclusive access across `keys` for the duration of a composite
    /// operation. Unrelated shards stay available to other callers.
    pub fn with_locked<R>(&self, keys: &[Bytes], f: impl FnOnce(&mut LockedKeys<'_>) -> R) -> R {
        let mut idxs: Vec<usize> = keys.iter().map(|k| self.shard_index(k)).collect();
        idxs.sort_unstable();
        idxs.dedup();
        let guards = idxs
            .into_iter()
            .map(|i| (i, self.shards[i].map.write()))
            .collect();
        f(&mut LockedKeys { ks: self, guards })
    }

    // -- memory accounting ---------------------------------------------------

    pub fn used_memory(&self) -> usize {
        self.mem_used.load(Ordering::Relaxed)
    }

    pub fn max_memory(&self) -> usize {
        self.max_memory
    }

    pub fn over_limit(&self) -> bool {
        self.max_memory > 0 && self.used_memory() > self.max_memory
    }

    fn mem_add(&self, n: usize) {
        self.mem_used.fetch_add(n, Ordering::Relaxed);
    }

    fn mem_sub(&self, n: usize) {
        self.mem_used.fetch_sub(n, Ordering::Relaxed);
    }

    // -- entry plumbing ------------------------------------------------------

    /// Drop the entry if its deadline has passed. Called before every
    /// keyed access so nothing ever observes an expired entry.
    pub(crate) fn expire_if_due(&self, map: &mut ShardMap, key: &Bytes, now: u64) {
        if map.entries.get(key).is_some_and(|e| e.is_expired(now))
            && let Some(entry) = map.entries.remove(key)
        {
            self.mem_sub(entry.meta.cost);
        }
    }

    /// Live entry without recording an access.
    pub(crate) fn peek<'m>(&self, map: &'m mut ShardMap, key: &Bytes, now: u64) -> Option<&'m Entry> {
        self.expire_if_due(map, key, now);
        map.entries.get(key)
    }

    /// Live entry, access recorded for the eviction policies.
    pub(crate) fn read_entry<'m>(
        &self,
        map: &'m mut ShardMap,
        key: &Bytes,
        now: u64,
    ) -> Option<&'m mut Entry> {
        self.expire_if_due(map, key, now);
        let entry = map.entries.get_mut(key)?;
        entry.touch(now);
        Some(entry)
    }

    /// Central mutation path: lazy-expire, create on demand, run `f`,
    /// then stamp the version, refresh the cached cost and drop vanishing
    /// empty containers. On error nothing stays behind: a freshly created
    /// entry is removed again, so failed operations never partially apply.
    pub(crate) fn mutate<R>(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        now: u64,
        create: Option<fn() -> Value>,
        f: impl FnOnce(&mut Entry) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        self.expire_if_due(map, key, now);
        let existed = map.entries.contains_key(key);
        if !existed {
            let Some(make) = create else {
                return Err(EngineError::KeyNotFound);
            };
            map.next_version += 1;
            let entry = Entry::new(make(), now, map.next_version);
            map.entries.insert(key.clone(), entry);
        }
        map.next_version += 1;
        let version = map.next_version;

        let Some(entry) = map.entries.get_mut(key) else {
            return Err(EngineError::KeyNotFound);
        };
        let old_cost = entry.meta.cost;
        match f(entry) {
            Ok(out) => {
                entry.last_access_update(now);
                entry.meta.version = version;
                let new_cost = entry.recompute_cost(key.len());
                let vanished = entry.value.is_vanishing_empty();
                self.mem_add(new_cost);
                self.mem_sub(old_cost);
                if vanished {
                    self.remove_from(map, key);
                }
                Ok(out)
            }
            Err(err) => {
                if !existed {
                    map.entries.remove(key);
                }
                Err(err)
            }
        }
    }

    /// Remove an entry unconditionally, keeping the memory gauge honest.
    pub(crate) fn remove_from(&self, map: &mut ShardMap, key: &Bytes) -> Option<Entry> {
        let entry = map.entries.remove(key)?;
        self.mem_sub(entry.meta.cost);
        Some(entry)
    }

    // -- string operations ---------------------------------------------------

    /// Store a string. A plain set clears any existing deadline;
    /// `keep_ttl` preserves it; `expire_at` installs a new one.
    pub fn set(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        data: Bytes,
        expire_at: Option<u64>,
        keep_ttl: bool,
        now: u64,
    ) -> Result<(), EngineError> {
        if data.len() > self.max_string_len {
            return Err(EngineError::out_of_range("string length"));
        }
        self.mutate(map, key, now, Some(|| Value::Str(Bytes::new())), |entry| {
            let prev_deadline = entry.expire_at;
            entry.value = Value::Str(data);
            entry.expire_at = if keep_ttl { prev_deadline } else { expire_at };
            Ok(())
        })?;
        // An already-elapsed deadline deletes the key immediately.
        self.expire_if_due(map, key, now);
        Ok(())
    }

    pub fn get(&self, map: &mut ShardMap, key: &Bytes, now: u64) -> Result<Option<Bytes>, EngineError> {
        match self.read_entry(map, key, now) {
            None => Ok(None),
            Some(entry) => Ok(Some(entry.value.as_str()?.clone())),
        }
    }

    /// Append bytes to a string, creating it on first write. Returns the
    /// resulting length.
    pub fn append(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        data: &Bytes,
        now: u64,
    ) -> Result<usize, EngineError> {
        let limit = self.max_string_len;
        self.mutate(map, key, now, Some(|| Value::Str(Bytes::new())), |entry| {
            let current = entry.value.as_str()?;
            let total = current.len() + data.len();
            if total > limit {
                return Err(EngineError::out_of_range("string length"));
            }
            let mut buf = BytesMut::with_capacity(total);
            buf.extend_from_slice(current);
            buf.extend_from_slice(data);
            entry.value = Value::Str(buf.freeze());
            Ok(total)
        })
    }

    pub fn strlen(&self, map: &mut ShardMap, key: &Bytes, now: u64) -> Result<usize, EngineError> {
        match self.read_entry(map, key, now) {
            None => Ok(0),
            Some(entry) => Ok(entry.value.as_str()?.len()),
        }
    }

    /// Add a signed delta to an integer string, creating it at zero.
    pub fn incr_by(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        delta: i64,
        now: u64,
    ) -> Result<i64, EngineError> {
        self.mutate(map, key, now, Some(|| Value::Str(Bytes::from_static(b"0"))), |entry| {
            let current = parse_i64(entry.value.as_str()?)?;
            let next = current
                .checked_add(delta)
                .ok_or_else(|| EngineError::out_of_range("increment"))?;
            entry.value = Value::Str(Bytes::from(next.to_string()));
            Ok(next)
        })
    }

    /// Float-delta variant of [`Keyspace::incr_by`].
    pub fn incr_by_float(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        delta: f64,
        now: u64,
    ) -> Result<f64, EngineError> {
        if !delta.is_finite() {
            return Err(EngineError::NotANumber);
        }
        self.mutate(map, key, now, Some(|| Value::Str(Bytes::from_static(b"0"))), |entry| {
            let current = parse_f64(entry.value.as_str()?)?;
            let next = current + delta;
            if !next.is_finite() {
                return Err(EngineError::NotANumber);
            }
            entry.value = Value::Str(Bytes::from(format_f64(next)));
            Ok(next)
        })
    }

    // -- generic operations --------------------------------------------------

    /// Delete a key. False when it was absent (or already expired).
    pub fn delete(&self, map: &mut ShardMap, key: &Bytes, now: u64) -> bool {
        self.expire_if_due(map, key, now);
        map.next_version += 1;
        self.remove_from(map, key).is_some()
    }

    pub fn exists(&self, map: &mut ShardMap, key: &Bytes, now: u64) -> bool {
        self.peek(map, key, now).is_some()
    }

    /// Install an absolute deadline. A deadline at or before `now`
    /// deletes the key. False when the key is absent.
    pub fn expire_at(&self, map: &mut ShardMap, key: &Bytes, at: u64, now: u64) -> bool {
        if self.peek(map, key, now).is_none() {
            return false;
        }
        let applied = self
            .mutate(map, key, now, None, |entry| {
                entry.expire_at = Some(at);
                Ok(())
            })
            .is_ok();
        self.expire_if_due(map, key, now);
        applied
    }

    /// Clear the deadline. True when one existed.
    pub fn persist(&self, map: &mut ShardMap, key: &Bytes, now: u64) -> bool {
        if self.peek(map, key, now).is_none() {
            return false;
        }
        self.mutate(map, key, now, None, |entry| {
            let had = entry.expire_at.is_some();
            entry.expire_at = None;
            Ok(had)
        })
        .unwrap_or(false)
    }

    pub fn ttl(&self, map: &mut ShardMap, key: &Bytes, now: u64) -> TtlState {
        match self.peek(map, key, now) {
            None => TtlState::Missing,
            Some(entry) => match entry.ttl_ms(now) {
                None => TtlState::Persistent,
                Some(ms) => TtlState::Remaining(ms),
            },
        }
    }

    pub fn type_of(&self, map: &mut ShardMap, key: &Bytes, now: u64) -> Option<ValueKind> {
        self.peek(map, key, now).map(|e| e.value.kind())
    }

    /// Version stamp for the watch mechanism: the key's current mutation
    /// version, or None when it is absent.
    pub fn watch_stamp(&self, map: &mut ShardMap, key: &Bytes, now: u64) -> Option<u64> {
        self.peek(map, key, now).map(|e| e.meta.version)
    }

    // -- whole-keyspace operations -------------------------------------------

    /// All live keys matching `pattern`, sorted. Expired entries found on
    /// the way are dropped.
    pub fn keys_matching(&self, pattern: &Pattern, now: u64) -> Vec<Bytes> {
        let mut found = Vec::new();
        for shard in &self.shards {
            let mut map = shard.map.write();
            self.purge_expired(&mut map, now);
            found.extend(
                map.entries
                    .keys()
                    .filter(|k| pattern.matches_all() || pattern.matches(k))
                    .cloned(),
            );
        }
        found.sort();
        found
    }

    /// Number of live keys.
    pub fn len(&self, now: u64) -> usize {
        let mut n = 0;
        for shard in &self.shards {
            let mut map = shard.map.write();
            self.purge_expired(&mut map, now);
            n += map.entries.len();
        }
        n
    }

    pub fn is_empty(&self, now: u64) -> bool {
        self.len(now) == 0
    }

    /// Drop everything. Version counters are preserved so outstanding
    /// watch registrations still conflict.
    pub fn flush_all(&self) {
        self.flush_all_with(|| ());
    }

    /// Flush variant that runs `f` while every shard guard is still
    /// held, so the caller can journal the flush before any concurrent
    /// write can slip in behind it.
    pub(crate) fn flush_all_with(&self, f: impl FnOnce()) {
        let mut guards: Vec<RwLockWriteGuard<'_, ShardMap>> =
            self.shards.iter().map(|s| s.map.write()).collect();
        for map in guards.iter_mut() {
            map.next_version += 1;
            map.entries.clear();
        }
        self.mem_used.store(0, Ordering::Relaxed);
        f();
    }

    fn purge_expired(&self, map: &mut ShardMap, now: u64) {
        let due: Vec<Bytes> = map
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in due {
            self.remove_from(map, &key);
        }
    }

    /// Consistent point-in-time clone of every live entry, plus the
    /// result of `f` evaluated while every shard guard is still held,
    /// the single logical instant of a snapshot. Writers are quiesced
    /// only for the clone and `f`, never for the serialization that
    /// follows.
    pub(crate) fn capture<R>(&self, now: u64, f: impl FnOnce() -> R) -> (Vec<(Bytes, Entry)>, R) {
        let mut guards: Vec<RwLockWriteGuard<'_, ShardMap>> =
            self.shards.iter().map(|s| s.map.write()).collect();
        let mut view = Vec::new();
        for map in guards.iter_mut() {
            self.purge_expired(map, now);
            view.extend(map.entries.iter().map(|(k, e)| (k.clone(), e.clone())));
        }
        let extra = f();
        (view, extra)
    }

    /// Consistent point-in-time clone of every live entry.
    pub fn snapshot_view(&self, now: u64) -> Vec<(Bytes, Entry)> {
        self.capture(now, || ()).0
    }

    /// Run `f` with every shard guard held, blocking all keyed writes.
    /// For short critical sections only (journal baseline swaps).
    pub(crate) fn quiesce<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guards: Vec<RwLockWriteGuard<'_, ShardMap>> =
            self.shards.iter().map(|s| s.map.write()).collect();
        f()
    }

    /// Insert an entry rebuilt from a snapshot, bypassing the eviction
    /// gate (restore must reproduce the captured state verbatim).
    pub(crate) fn insert_restored(
        &self,
        key: Bytes,
        value: Value,
        expire_at: Option<u64>,
        now: u64,
    ) {
        self.with_shard(&key, |map| {
            map.next_version += 1;
            let mut entry = Entry::new(value, now, map.next_version);
            entry.expire_at = expire_at;
            let cost = entry.recompute_cost(key.len());
            self.mem_add(cost);
            map.entries.insert(key.clone(), entry);
        });
    }

    /// Iterate entries of one shard from a rotating cursor, for sampled
    /// maintenance work (active expiry, eviction candidates).
    pub(crate) fn sample_shard(
        &self,
        idx: usize,
        cursor: usize,
        count: usize,
    ) -> (Vec<(Bytes, Option<u64>, AccessMeta)>, usize) {
        let map = self.shards[idx].map.read();
        let len = map.entries.len();
        if len == 0 {
            return (Vec::new(), 0);
        }
        let start = cursor % len;
        let sampled = map
            .entries
            .iter()
            .cycle()
            .skip(start)
            .take(count.min(len))
            .map(|(k, e)| (k.clone(), e.expire_at, e.meta.clone()))
            .collect();
        (sampled, (start + count) % len)
    }
}
