//! The command executor.
//!
//! [`Engine::execute`] is the sole entry point for reads and mutations:
//! one parsed operation maps to exactly one keyspace call, performed under
//! the owning shard guard. The journal record for a successful mutation is
//! appended while that guard is still held, so the journal observes
//! same-key operations in apply order; operations against disjoint keys
//! carry no ordering guarantee relative to each other.
//!
//! Composite operations ([`Engine::execute_batch`]) run under the union of
//! their keys' shard guards, optionally gated by a [`WatchToken`]: if any
//! watched key's presence or version changed since registration, the batch
//! fails with `WatchConflict` before anything is applied.
//!
//! Durability failures never take the engine down mid-flight: a failed
//! journal append flips the degraded-durability flag, logs loudly and the
//! engine keeps serving from memory.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::blocking::WaiterRegistry;
use crate::config::{EngineConfig, FsyncPolicy, JOURNAL_FILE, SNAPSHOT_FILE};
use crate::error::{EngineError, PersistError};
use crate::events::{EventBus, MutationEvent, MutationFeed};
use crate::now_ms;
use crate::pattern::Pattern;
use crate::store::journal::{
    JOURNAL_HEADER_LEN, JournalOp, JournalReader, JournalRecord, JournalWriter,
};
use crate::store::snapshot::{SnapshotReader, SnapshotWriter};
use crate::store::stream::{PendingSummary, StreamId};
use crate::store::{Keyspace, LockedKeys, TtlState, ValueKind, expiration::SweepTask, policy};

/// A parsed operation, as handed over by the (external) protocol layer.
#[derive(Debug, Clone)]
pub enum Operation {
    // Strings
    Set {
        key: Bytes,
        value: Bytes,
        /// Relative time to live; resolved against the executor clock.
        ttl_ms: Option<u64>,
        /// Preserve an existing deadline instead of clearing it.
        keep_ttl: bool,
    },
    Get {
        key: Bytes,
    },
    Append {
        key: Bytes,
        data: Bytes,
    },
    StrLen {
        key: Bytes,
    },
    IncrBy {
        key: Bytes,
        delta: i64,
    },
    IncrByFloat {
        key: Bytes,
        delta: f64,
    },
    // Generic
    Del {
        keys: Vec<Bytes>,
    },
    Exists {
        keys: Vec<Bytes>,
    },
    Expire {
        key: Bytes,
        ttl_ms: u64,
    },
    ExpireAt {
        key: Bytes,
        at: u64,
    },
    Ttl {
        key: Bytes,
    },
    Persist {
        key: Bytes,
    },
    TypeOf {
        key: Bytes,
    },
    Keys {
        pattern: Bytes,
    },
    DbSize,
    FlushAll,
    // Lists
    LPush {
        key: Bytes,
        elems: Vec<Bytes>,
    },
    RPush {
        key: Bytes,
        elems: Vec<Bytes>,
    },
    LPop {
        key: Bytes,
    },
    RPop {
        key: Bytes,
    },
    LRange {
        key: Bytes,
        start: i64,
        stop: i64,
    },
    LLen {
        key: Bytes,
    },
    // Sets
    SAdd {
        key: Bytes,
        members: Vec<Bytes>,
    },
    SRem {
        key: Bytes,
        members: Vec<Bytes>,
    },
    SMembers {
        key: Bytes,
    },
    SIsMember {
        key: Bytes,
        member: Bytes,
    },
    SCard {
        key: Bytes,
    },
    // Sorted sets
    ZAdd {
        key: Bytes,
        pairs: Vec<(f64, Bytes)>,
    },
    ZRem {
        key: Bytes,
        members: Vec<Bytes>,
    },
    ZScore {
        key: Bytes,
        member: Bytes,
    },
    ZCard {
        key: Bytes,
    },
    ZRange {
        key: Bytes,
        start: i64,
        stop: i64,
    },
    ZIncrBy {
        key: Bytes,
        delta: f64,
        member: Bytes,
    },
    // Hashes
    HSet {
        key: Bytes,
        pairs: Vec<(Bytes, Bytes)>,
    },
    HGet {
        key: Bytes,
        field: Bytes,
    },
    HDel {
        key: Bytes,
        fields: Vec<Bytes>,
    },
    HGetAll {
        key: Bytes,
    },
    HLen {
        key: Bytes,
    },
    HExists {
        key: Bytes,
        field: Bytes,
    },
    // Streams
    XAdd {
        key: Bytes,
        /// None = assign the next ID from the executor clock.
        id: Option<StreamId>,
        fields: Vec<(Bytes, Bytes)>,
    },
    XLen {
        key: Bytes,
    },
    XRange {
        key: Bytes,
        start: StreamId,
        end: StreamId,
        count: Option<usize>,
    },
    XGroupCreate {
        key: Bytes,
        group: Bytes,
        start: StreamId,
    },
    XReadGroup {
        key: Bytes,
        group: Bytes,
        consumer: Bytes,
        count: usize,
    },
    XAck {
        key: Bytes,
        group: Bytes,
        ids: Vec<StreamId>,
    },
    XPending {
        key: Bytes,
        group: Bytes,
    },
}

impl Operation {
    /// Keys this operation touches; empty for keyspace-wide operations.
    pub fn keys(&self) -> Vec<Bytes> {
        match self {
            Operation::Del { keys } | Operation::Exists { keys } => keys.clone(),
            Operation::Keys { .. } | Operation::DbSize | Operation::FlushAll => Vec::new(),
            Operation::Set { key, .. }
            | Operation::Get { key }
            | Operation::Append { key, .. }
            | Operation::StrLen { key }
            | Operation::IncrBy { key, .. }
            | Operation::IncrByFloat { key, .. }
            | Operation::Expire { key, .. }
            | Operation::ExpireAt { key, .. }
            | Operation::Ttl { key }
            | Operation::Persist { key }
            | Operation::TypeOf { key }
            | Operation::LPush { key, .. }
            | Operation::RPush { key, .. }
            | Operation::LPop { key }
            | Operation::RPop { key }
            | Operation::LRange { key, .. }
            | Operation::LLen { key }
            | Operation::SAdd { key, .. }
            | Operation::SRem { key, .. }
            | Operation::SMembers { key }
            | Operation::SIsMember { key, .. }
            | Operation::SCard { key }
            | Operation::ZAdd { key, .. }
            | Operation::ZRem { key, .. }
            | Operation::ZScore { key, .. }
            | Operation::ZCard { key }
            | Operation::ZRange { key, .. }
            | Operation::ZIncrBy { key, .. }
            | Operation::HSet { key, .. }
            | Operation::HGet { key, .. }
            | Operation::HDel { key, .. }
            | Operation::HGetAll { key }
            | Operation::HLen { key }
            | Operation::HExists { key, .. }
            | Operation::XAdd { key, .. }
            | Operation::XLen { key }
            | Operation::XRange { key, .. }
            | Operation::XGroupCreate { key, .. }
            | Operation::XReadGroup { key, .. }
            | Operation::XAck { key, .. }
            | Operation::XPending { key, .. } => vec![key.clone()],
        }
    }

    /// Operations that can grow memory and are therefore gated by the
    /// eviction policy. Deletions and reads pass even under pressure.
    pub fn grows_memory(&self) -> bool {
        matches!(
            self,
            Operation::Set { .. }
                | Operation::Append { .. }
                | Operation::IncrBy { .. }
                | Operation::IncrByFloat { .. }
                | Operation::LPush { .. }
                | Operation::RPush { .. }
                | Operation::SAdd { .. }
                | Operation::ZAdd { .. }
                | Operation::ZIncrBy { .. }
                | Operation::HSet { .. }
                | Operation::XAdd { .. }
                | Operation::XGroupCreate { .. }
        )
    }
}

/// The result of a successfully executed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Bytes),
    Array(Vec<Bytes>),
    Pairs(Vec<(Bytes, Bytes)>),
    Scored(Vec<(Bytes, f64)>),
    Entries(Vec<(StreamId, Vec<(Bytes, Bytes)>)>),
    Pending(Vec<PendingSummary>),
    Id(StreamId),
    Ttl(TtlState),
    Kind(Option<ValueKind>),
}

/// Version stamps recorded by [`Engine::watch`]; feed to
/// [`Engine::execute_batch`] for an optimistic commit.
#[derive(Debug, Clone)]
pub struct WatchToken {
    stamps: Vec<(Bytes, Option<u64>)>,
}

impl WatchToken {
    pub fn keys(&self) -> impl Iterator<Item = &Bytes> {
        self.stamps.iter().map(|(key, _)| key)
    }
}

/// The engine: keyspace, journal, snapshot paths and the event plumbing,
/// owned explicitly so multiple instances coexist in one process.
pub struct Engine {
    config: EngineConfig,
    keyspace: Arc<Keyspace>,
    journal: Option<Mutex<JournalWriter>>,
    journal_path: Option<PathBuf>,
    snapshot_path: Option<PathBuf>,
    events: EventBus,
    waiters: WaiterRegistry,
    degraded: AtomicBool,
}

impl Engine {
    /// A purely in-memory engine: no journal, no snapshot files.
    pub fn ephemeral(config: EngineConfig) -> Self {
        Self::build(config, None, None, None)
    }

    /// Open an engine rooted at `dir`, recovering the snapshot first and
    /// then replaying the journal. A truncated journal tail is tolerated;
    /// an unreadable snapshot *and* an unreadable journal is fatal.
    pub fn open(config: EngineConfig, dir: impl AsRef<Path>) -> Result<Self, PersistError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let snapshot_path = dir.join(SNAPSHOT_FILE);
        let journal_path = dir.join(JOURNAL_FILE);

        let engine = Self::build(
            config,
            None,
            Some(snapshot_path.clone()),
            Some(journal_path.clone()),
        );
        let now = now_ms();

        let mut snapshot_failed = false;
        if snapshot_path.exists() {
            let restored = File::open(&snapshot_path)
                .map_err(PersistError::from)
                .and_then(|file| SnapshotReader::new(BufReader::new(file)))
                .and_then(|reader| {
                    reader.read_entries(|key, value, expire_at| {
                        engine.keyspace.insert_restored(key, value, expire_at, now);
                    })
                });
            match restored {
                Ok(entries) => info!(entries, "snapshot restored"),
                Err(err) => {
                    error!(error = %err, "snapshot unreadable; relying on the journal alone");
                    snapshot_failed = true;
                    engine.keyspace.flush_all();
                }
            }
        }

        if journal_path.exists() {
            match JournalReader::open(&journal_path) {
                Ok(mut reader) => {
                    let mut replayed = 0u64;
                    loop {
                        match reader.next_record() {
                            Ok(Some((_, record))) => {
                                engine.apply_record(record);
                                replayed += 1;
                            }
                            Ok(None) => break,
                            Err(PersistError::JournalReplayTruncated { offset }) => {
                                warn!(
                                    offset,
                                    "journal tail truncated; recovered up to the last valid record"
                                );
                                break;
                            }
                            Err(err) => return Err(err),
                        }
                    }
                    info!(replayed, "journal replayed");
                }
                Err(err) if snapshot_failed => return Err(err),
                Err(err) => {
                    // Snapshot state is intact; set the broken journal
                    // aside so appends start from a clean baseline.
                    error!(error = %err, "journal unreadable; starting a fresh journal from snapshot state");
                    let aside = journal_path.with_extension("kst.bad");
                    std::fs::rename(&journal_path, &aside)?;
                }
            }
        }

        let writer = JournalWriter::open(&journal_path)?;
        Ok(Self {
            journal: Some(Mutex::new(writer)),
            ..engine
        })
    }

    /// Rebuild an engine from a snapshot byte stream (no on-disk files).
    pub fn restore(config: EngineConfig, reader: impl Read) -> Result<Self, PersistError> {
        let engine = Self::build(config, None, None, None);
        let now = now_ms();
        let snapshot = SnapshotReader::new(reader)?;
        let entries = snapshot.read_entries(|key, value, expire_at| {
            engine.keyspace.insert_restored(key, value, expire_at, now);
        })?;
        info!(entries, "snapshot restored into fresh keyspace");
        Ok(engine)
    }

    fn build(
        config: EngineConfig,
        journal: Option<Mutex<JournalWriter>>,
        snapshot_path: Option<PathBuf>,
        journal_path: Option<PathBuf>,
    ) -> Self {
        let keyspace = Arc::new(Keyspace::new(&config));
        Self {
            config,
            keyspace,
            journal,
            journal_path,
            snapshot_path,
            events: EventBus::new(1024),
            waiters: WaiterRegistry::new(),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    /// True once a journal or snapshot I/O failure has been swallowed;
    /// the engine serves from memory but writes may not be durable.
    pub fn durability_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Bytes currently in the journal, buffered appends included.
    pub fn journal_len(&self) -> u64 {
        self.journal
            .as_ref()
            .map(|j| j.lock().len())
            .unwrap_or(JOURNAL_HEADER_LEN)
    }

    // -- execution -----------------------------------------------------------

    /// Execute one operation.
    pub fn execute(&self, op: Operation) -> Result<Reply, EngineError> {
        let now = now_ms();
        if op.grows_memory() {
            self.reserve_memory(now)?;
        }
        let keys = op.keys();
        let reply = self.keyspace.with_locked(&keys, |locked| {
            let (reply, records) = self.apply(locked, &op, now)?;
            for record in records {
                self.log_record(record, now);
            }
            Ok(reply)
        })?;
        if let Operation::LPush { key, .. } | Operation::RPush { key, .. } = &op {
            self.waiters.wake_one(key);
        }
        Ok(reply)
    }

    /// Record the current version of each key for an optimistic commit.
    pub fn watch(&self, keys: &[Bytes]) -> WatchToken {
        let now = now_ms();
        self.keyspace.with_locked(keys, |locked| {
            let mut stamps: Vec<(Bytes, Option<u64>)> = Vec::with_capacity(keys.len());
            for key in keys {
                if stamps.iter().any(|(seen, _)| seen == key) {
                    continue;
                }
                let map = locked.map_for(key);
                let stamp = self.keyspace.watch_stamp(map, key, now);
                stamps.push((key.clone(), stamp));
            }
            WatchToken { stamps }
        })
    }

    /// Apply a batch of operations as one unit: the union of touched keys
    /// is locked for the whole batch, so no other operation interleaves.
    /// With a watch token, commit only happens if every watched key is
    /// unchanged; otherwise `WatchConflict` and nothing is applied.
    ///
    /// Individual operations inside a committed batch keep their own
    /// outcomes; a failing one does not undo its predecessors.
    pub fn execute_batch(
        &self,
        ops: &[Operation],
        watch: Option<&WatchToken>,
    ) -> Result<Vec<Result<Reply, EngineError>>, EngineError> {
        // Keyspace-wide operations take every shard; inside a batch that
        // already holds a subset they would self-deadlock.
        if ops.iter().any(|op| {
            matches!(
                op,
                Operation::FlushAll | Operation::Keys { .. } | Operation::DbSize
            )
        }) {
            return Err(EngineError::invalid(
                "keyspace-wide operations cannot run inside a batch",
            ));
        }
        let now = now_ms();
        if ops.iter().any(Operation::grows_memory) {
            self.reserve_memory(now)?;
        }

        let mut keys: Vec<Bytes> = ops.iter().flat_map(|op| op.keys()).collect();
        if let Some(token) = watch {
            keys.extend(token.keys().cloned());
        }

        let replies = self.keyspace.with_locked(&keys, |locked| {
            if let Some(token) = watch {
                for (key, stamp) in &token.stamps {
                    let map = locked.map_for(key);
                    if self.keyspace.watch_stamp(map, key, now) != *stamp {
                        return Err(EngineError::WatchConflict);
                    }
                }
            }
            let mut replies = Vec::with_capacity(ops.len());
            for op in ops {
                match self.apply(locked, op, now) {
                    Ok((reply, records)) => {
                        for record in records {
                            self.log_record(record, now);
                        }
                        replies.push(Ok(reply));
                    }
                    Err(err) => replies.push(Err(err)),
                }
            }
            Ok(replies)
        })?;

        for op in ops {
            if let Operation::LPush { key, .. } | Operation::RPush { key, .. } = op {
                self.waiters.wake_one(key);
            }
        }
        Ok(replies)
    }

    /// Blocking head-pop across `keys`: suspends the caller (never the
    /// shard) until one of the lists produces data or the timeout lapses.
    pub async fn blpop(
        &self,
        keys: &[Bytes],
        timeout: Duration,
    ) -> Result<Option<(Bytes, Bytes)>, EngineError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(found) = self.try_pop_any(keys)? {
                return Ok(Some(found));
            }
            let guard = self.waiters.register(keys);
            // Close the check-then-register window: data pushed in
            // between is picked up here instead of being slept past.
            if let Some(found) = self.try_pop_any(keys)? {
                return Ok(Some(found));
            }
            tokio::select! {
                _ = guard.notified() => continue,
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    fn try_pop_any(&self, keys: &[Bytes]) -> Result<Option<(Bytes, Bytes)>, EngineError> {
        for key in keys {
            match self.execute(Operation::LPop { key: key.clone() })? {
                Reply::Bytes(value) => return Ok(Some((key.clone(), value))),
                _ => continue,
            }
        }
        Ok(None)
    }

    // -- events --------------------------------------------------------------

    /// Live feed of mutations whose keys match `pattern`.
    pub fn subscribe(&self, pattern: &[u8]) -> MutationFeed {
        self.events.subscribe(Pattern::new(pattern))
    }

    /// Historical mutation events from the journal starting at `offset`
    /// (0 = the beginning). Offsets are valid within the current journal
    /// baseline; compaction starts a new one.
    pub fn events_from(&self, offset: u64) -> Result<Vec<MutationEvent>, PersistError> {
        let Some(path) = &self.journal_path else {
            return Ok(Vec::new());
        };
        if let Some(journal) = &self.journal {
            // Make buffered records visible to the reader below.
            let _ = journal.lock().flush();
        }
        let start = offset.max(JOURNAL_HEADER_LEN);
        let mut reader = JournalReader::open_at(path, start)?;
        let mut events = Vec::new();
        loop {
            match reader.next_record() {
                Ok(Some((at, record))) => events.push(MutationEvent {
                    key: record.op.key().cloned().unwrap_or_default(),
                    kind: record.op.name(),
                    offset: Some(at),
                    at: record.now,
                }),
                Ok(None) => break,
                Err(PersistError::JournalReplayTruncated { offset }) => {
                    warn!(offset, "journal tail truncated while reading events");
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(events)
    }

    // -- persistence ---------------------------------------------------------

    /// Serialize a consistent snapshot of the keyspace into `writer`.
    /// Returns the number of entries written.
    pub fn write_snapshot(&self, writer: impl Write) -> Result<u64, PersistError> {
        let now = now_ms();
        let view = self.keyspace.snapshot_view(now);
        let mut snapshot = SnapshotWriter::new(writer, now)?;
        for (key, entry) in &view {
            snapshot.write_entry(key, entry)?;
        }
        snapshot.finish()?;
        Ok(view.len() as u64)
    }

    /// Save a snapshot to disk and compact the journal onto the fresh
    /// baseline. Records appended while the snapshot was being serialized
    /// are preserved at the head of the new journal.
    pub fn save_snapshot(&self) -> Result<(), PersistError> {
        let Some(snapshot_path) = &self.snapshot_path else {
            debug!("ephemeral engine; nothing to save");
            return Ok(());
        };
        let now = now_ms();

        // The capture instant: clone the keyspace and note the journal
        // high-water mark with all writers quiesced.
        let (view, mark) = self.keyspace.capture(now, || {
            self.journal.as_ref().map(|journal| {
                let mut guard = journal.lock();
                let _ = guard.flush();
                guard.len()
            })
        });

        // Serialize without holding any keyspace lock.
        let tmp = snapshot_path.with_extension("tmp");
        {
            let file = File::create(&tmp)?;
            let mut snapshot = SnapshotWriter::new(BufWriter::new(file), now)?;
            for (key, entry) in &view {
                snapshot.write_entry(key, entry)?;
            }
            let inner = snapshot.finish()?;
            inner.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, snapshot_path)?;

        // Swap the journal baseline. Writers are quiesced again so no
        // record can slip between the tail copy and the reset.
        if let (Some(journal), Some(journal_path), Some(mark)) =
            (&self.journal, &self.journal_path, mark)
        {
            self.keyspace.quiesce(|| -> Result<(), PersistError> {
                let mut guard = journal.lock();
                guard.flush()?;
                let mut tail = Vec::new();
                let mut reader = JournalReader::open_at(journal_path, mark)?;
                while let Ok(Some((_, record))) = reader.next_record() {
                    tail.push(record);
                }
                guard.reset()?;
                for record in &tail {
                    guard.append(record)?;
                }
                guard.sync()?;
                Ok(())
            })?;
            // A fresh, fsynced baseline clears the degraded flag.
            self.degraded.store(false, Ordering::Relaxed);
        }

        info!(
            entries = view.len(),
            path = %snapshot_path.display(),
            "snapshot saved, journal compacted"
        );
        Ok(())
    }

    /// True when the journal has outgrown the dataset by the configured
    /// rewrite ratio.
    pub(crate) fn should_compact(&self) -> bool {
        let ratio = self.config.journal_rewrite_ratio;
        if ratio == 0 || self.journal.is_none() {
            return false;
        }
        let journal_bytes = self.journal_len().saturating_sub(JOURNAL_HEADER_LEN);
        let dataset_bytes = self.keyspace.used_memory().max(1) as u64;
        journal_bytes > ratio.saturating_mul(dataset_bytes)
    }

    /// Flush and fsync the journal, then report. The engine is unusable
    /// only by convention afterwards; background tasks are stopped by
    /// dropping their [`Maintenance`] handle.
    pub fn shutdown(&self) -> Result<(), PersistError> {
        if let Some(journal) = &self.journal {
            journal.lock().sync()?;
        }
        info!("engine shut down cleanly");
        Ok(())
    }

    // -- internals -----------------------------------------------------------

    /// Make room before a growing write: run the eviction policy, journal
    /// each victim's deletion, and fail with `OutOfMemory` when the
    /// policy cannot free enough.
    fn reserve_memory(&self, now: u64) -> Result<(), EngineError> {
        if !self.keyspace.over_limit() {
            return Ok(());
        }
        let run = policy::enforce(
            &self.keyspace,
            self.config.eviction,
            self.config.eviction_sample,
            now,
            |victim| {
                self.log_record(JournalOp::Del { key: victim.clone() }, now);
            },
        )?;
        if !run.evicted.is_empty() {
            debug!(
                evicted = run.evicted.len(),
                freed = run.freed,
                "memory pressure relieved by eviction"
            );
        }
        Ok(())
    }

    /// Append one record (when persistent) and publish its event. Called
    /// with the affected key's shard guard held, so the journal sees
    /// same-key records in apply order.
    fn log_record(&self, op: JournalOp, now: u64) {
        let offset = match &self.journal {
            Some(journal) => {
                let mut guard = journal.lock();
                match guard.append(&JournalRecord { now, op: op.clone() }) {
                    Ok(offset) => {
                        if self.config.fsync == FsyncPolicy::Always
                            && let Err(err) = guard.sync()
                        {
                            self.mark_degraded(&err);
                        }
                        Some(offset)
                    }
                    Err(err) => {
                        self.mark_degraded(&err);
                        None
                    }
                }
            }
            None => None,
        };
        self.events.publish(MutationEvent {
            key: op.key().cloned().unwrap_or_default(),
            kind: op.name(),
            offset,
            at: now,
        });
    }

    fn mark_degraded(&self, err: &PersistError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            error!(
                error = %err,
                "journal write failed; durability degraded, serving from memory only"
            );
        }
    }

    /// Dispatch: one operation, one keyspace call, plus the journal
    /// records a successful mutation emits.
    fn apply(
        &self,
        locked: &mut LockedKeys<'_>,
        op: &Operation,
        now: u64,
    ) -> Result<(Reply, Vec<JournalOp>), EngineError> {
        let ks = &self.keyspace;
        match op {
            Operation::Set {
                key,
                value,
                ttl_ms,
                keep_ttl,
            } => {
                let map = locked.map_for(key);
                let deadline = if *keep_ttl {
                    ks.peek(map, key, now).and_then(|e| e.expire_at)
                } else {
                    ttl_ms.map(|ttl| now.saturating_add(ttl))
                };
                ks.set(map, key, value.clone(), deadline, false, now)?;
                Ok((
                    Reply::Ok,
                    vec![JournalOp::Set {
                        key: key.clone(),
                        value: value.clone(),
                        expire_at: deadline,
                    }],
                ))
            }
            Operation::Get { key } => {
                let map = locked.map_for(key);
                Ok((
                    match ks.get(map, key, now)? {
                        Some(value) => Reply::Bytes(value),
                        None => Reply::Nil,
                    },
                    Vec::new(),
                ))
            }
            Operation::Append { key, data } => {
                let map = locked.map_for(key);
                let len = ks.append(map, key, data, now)?;
                Ok((
                    Reply::Int(len as i64),
                    vec![JournalOp::Append {
                        key: key.clone(),
                        data: data.clone(),
                    }],
                ))
            }
            Operation::StrLen { key } => {
                let map = locked.map_for(key);
                Ok((Reply::Int(ks.strlen(map, key, now)? as i64), Vec::new()))
            }
            Operation::IncrBy { key, delta } => {
                let map = locked.map_for(key);
                let value = ks.incr_by(map, key, *delta, now)?;
                Ok((
                    Reply::Int(value),
                    vec![JournalOp::IncrBy {
                        key: key.clone(),
                        delta: *delta,
                    }],
                ))
            }
            Operation::IncrByFloat { key, delta } => {
                let map = locked.map_for(key);
                let value = ks.incr_by_float(map, key, *delta, now)?;
                Ok((
                    Reply::Float(value),
                    vec![JournalOp::IncrByFloat {
                        key: key.clone(),
                        delta: *delta,
                    }],
                ))
            }
            Operation::Del { keys } => {
                let mut removed = 0i64;
                let mut records = Vec::new();
                for key in keys {
                    let map = locked.map_for(key);
                    if ks.delete(map, key, now) {
                        removed += 1;
                        records.push(JournalOp::Del { key: key.clone() });
                    }
                }
                Ok((Reply::Int(removed), records))
            }
            Operation::Exists { keys } => {
                let mut present = 0i64;
                for key in keys {
                    let map = locked.map_for(key);
                    if ks.exists(map, key, now) {
                        present += 1;
                    }
                }
                Ok((Reply::Int(present), Vec::new()))
            }
            Operation::Expire { key, ttl_ms } => {
                let at = now.saturating_add(*ttl_ms);
                let map = locked.map_for(key);
                let applied = ks.expire_at(map, key, at, now);
                let records = applied
                    .then(|| JournalOp::ExpireAt {
                        key: key.clone(),
                        at,
                    })
                    .into_iter()
                    .collect();
                Ok((Reply::Bool(applied), records))
            }
            Operation::ExpireAt { key, at } => {
                let map = locked.map_for(key);
                let applied = ks.expire_at(map, key, *at, now);
                let records = applied
                    .then(|| JournalOp::ExpireAt {
                        key: key.clone(),
                        at: *at,
                    })
                    .into_iter()
                    .collect();
                Ok((Reply::Bool(applied), records))
            }
            Operation::Ttl { key } => {
                let map = locked.map_for(key);
                Ok((Reply::Ttl(ks.ttl(map, key, now)), Vec::new()))
            }
            Operation::Persist { key } => {
                let map = locked.map_for(key);
                let cleared = ks.persist(map, key, now);
                let records = cleared
                    .then(|| JournalOp::Persist { key: key.clone() })
                    .into_iter()
                    .collect();
                Ok((Reply::Bool(cleared), records))
            }
            Operation::TypeOf { key } => {
                let map = locked.map_for(key);
                Ok((Reply::Kind(ks.type_of(map, key, now)), Vec::new()))
            }
            Operation::Keys { pattern } => {
                let found = ks.keys_matching(&Pattern::new(pattern), now);
                Ok((Reply::Array(found), Vec::new()))
            }
            Operation::DbSize => Ok((Reply::Int(ks.len(now) as i64), Vec::new())),
            Operation::FlushAll => {
                // Journal while the whole keyspace is still quiesced, so
                // no concurrent write lands behind the flush record.
                ks.flush_all_with(|| self.log_record(JournalOp::FlushAll, now));
                Ok((Reply::Ok, Vec::new()))
            }
            Operation::LPush { key, elems } | Operation::RPush { key, elems } => {
                let front = matches!(op, Operation::LPush { .. });
                let map = locked.map_for(key);
                let len = ks.push(map, key, front, elems, now)?;
                Ok((
                    Reply::Int(len as i64),
                    vec![JournalOp::Push {
                        key: key.clone(),
                        front,
                        elems: elems.clone(),
                    }],
                ))
            }
            Operation::LPop { key } | Operation::RPop { key } => {
                let front = matches!(op, Operation::LPop { .. });
                let map = locked.map_for(key);
                match ks.pop(map, key, front, now)? {
                    Some(value) => Ok((
                        Reply::Bytes(value),
                        vec![JournalOp::Pop {
                            key: key.clone(),
                            front,
                        }],
                    )),
                    None => Ok((Reply::Nil, Vec::new())),
                }
            }
            Operation::LRange { key, start, stop } => {
                let map = locked.map_for(key);
                Ok((
                    Reply::Array(ks.lrange(map, key, *start, *stop, now)?),
                    Vec::new(),
                ))
            }
            Operation::LLen { key } => {
                let map = locked.map_for(key);
                Ok((Reply::Int(ks.llen(map, key, now)? as i64), Vec::new()))
            }
            Operation::SAdd { key, members } => {
                let map = locked.map_for(key);
                let added = ks.sadd(map, key, members, now)?;
                let records = (added > 0)
                    .then(|| JournalOp::SAdd {
                        key: key.clone(),
                        members: members.clone(),
                    })
                    .into_iter()
                    .collect();
                Ok((Reply::Int(added as i64), records))
            }
            Operation::SRem { key, members } => {
                let map = locked.map_for(key);
                let removed = ks.srem(map, key, members, now)?;
                let records = (removed > 0)
                    .then(|| JournalOp::SRem {
                        key: key.clone(),
                        members: members.clone(),
                    })
                    .into_iter()
                    .collect();
                Ok((Reply::Int(removed as i64), records))
            }
            Operation::SMembers { key } => {
                let map = locked.map_for(key);
                Ok((Reply::Array(ks.smembers(map, key, now)?), Vec::new()))
            }
            Operation::SIsMember { key, member } => {
                let map = locked.map_for(key);
                Ok((
                    Reply::Bool(ks.sismember(map, key, member, now)?),
                    Vec::new(),
                ))
            }
            Operation::SCard { key } => {
                let map = locked.map_for(key);
                Ok((Reply::Int(ks.scard(map, key, now)? as i64), Vec::new()))
            }
            Operation::ZAdd { key, pairs } => {
                let map = locked.map_for(key);
                let added = ks.zadd(map, key, pairs, now)?;
                // Score updates are invisible in the count; always journal.
                Ok((
                    Reply::Int(added as i64),
                    vec![JournalOp::ZAdd {
                        key: key.clone(),
                        pairs: pairs.clone(),
                    }],
                ))
            }
            Operation::ZRem { key, members } => {
                let map = locked.map_for(key);
                let removed = ks.zrem(map, key, members, now)?;
                let records = (removed > 0)
                    .then(|| JournalOp::ZRem {
                        key: key.clone(),
                        members: members.clone(),
                    })
                    .into_iter()
                    .collect();
                Ok((Reply::Int(removed as i64), records))
            }
            Operation::ZScore { key, member } => {
                let map = locked.map_for(key);
                Ok((
                    match ks.zscore(map, key, member, now)? {
                        Some(score) => Reply::Float(score),
                        None => Reply::Nil,
                    },
                    Vec::new(),
                ))
            }
            Operation::ZCard { key } => {
                let map = locked.map_for(key);
                Ok((Reply::Int(ks.zcard(map, key, now)? as i64), Vec::new()))
            }
            Operation::ZRange { key, start, stop } => {
                let map = locked.map_for(key);
                Ok((
                    Reply::Scored(ks.zrange(map, key, *start, *stop, now)?),
                    Vec::new(),
                ))
            }
            Operation::ZIncrBy { key, delta, member } => {
                let map = locked.map_for(key);
                let score = ks.zincrby(map, key, *delta, member, now)?;
                Ok((
                    Reply::Float(score),
                    vec![JournalOp::ZIncrBy {
                        key: key.clone(),
                        delta: *delta,
                        member: member.clone(),
                    }],
                ))
            }
            Operation::HSet { key, pairs } => {
                let map = locked.map_for(key);
                let added = ks.hset(map, key, pairs, now)?;
                // Overwrites are invisible in the count; always journal.
                Ok((
                    Reply::Int(added as i64),
                    vec![JournalOp::HSet {
                        key: key.clone(),
                        pairs: pairs.clone(),
                    }],
                ))
            }
            Operation::HGet { key, field } => {
                let map = locked.map_for(key);
                Ok((
                    match ks.hget(map, key, field, now)? {
                        Some(value) => Reply::Bytes(value),
                        None => Reply::Nil,
                    },
                    Vec::new(),
                ))
            }
            Operation::HDel { key, fields } => {
                let map = locked.map_for(key);
                let removed = ks.hdel(map, key, fields, now)?;
                let records = (removed > 0)
                    .then(|| JournalOp::HDel {
                        key: key.clone(),
                        fields: fields.clone(),
                    })
                    .into_iter()
                    .collect();
                Ok((Reply::Int(removed as i64), records))
            }
            Operation::HGetAll { key } => {
                let map = locked.map_for(key);
                Ok((Reply::Pairs(ks.hgetall(map, key, now)?), Vec::new()))
            }
            Operation::HLen { key } => {
                let map = locked.map_for(key);
                Ok((Reply::Int(ks.hlen(map, key, now)? as i64), Vec::new()))
            }
            Operation::HExists { key, field } => {
                let map = locked.map_for(key);
                Ok((Reply::Bool(ks.hexists(map, key, field, now)?), Vec::new()))
            }
            Operation::XAdd { key, id, fields } => {
                let map = locked.map_for(key);
                let assigned = ks.xadd(map, key, *id, fields, now)?;
                Ok((
                    Reply::Id(assigned),
                    vec![JournalOp::XAdd {
                        key: key.clone(),
                        id: assigned,
                        fields: fields.clone(),
                    }],
                ))
            }
            Operation::XLen { key } => {
                let map = locked.map_for(key);
                Ok((Reply::Int(ks.xlen(map, key, now)? as i64), Vec::new()))
            }
            Operation::XRange {
                key,
                start,
                end,
                count,
            } => {
                let map = locked.map_for(key);
                Ok((
                    Reply::Entries(ks.xrange(map, key, *start, *end, *count, now)?),
                    Vec::new(),
                ))
            }
            Operation::XGroupCreate { key, group, start } => {
                let map = locked.map_for(key);
                ks.xgroup_create(map, key, group, *start, now)?;
                Ok((
                    Reply::Ok,
                    vec![JournalOp::XGroupCreate {
                        key: key.clone(),
                        group: group.clone(),
                        start: *start,
                    }],
                ))
            }
            Operation::XReadGroup {
                key,
                group,
                consumer,
                count,
            } => {
                let map = locked.map_for(key);
                let delivered = ks.xread_group(map, key, group, consumer, *count, now)?;
                Ok((
                    Reply::Entries(delivered),
                    vec![JournalOp::XReadGroup {
                        key: key.clone(),
                        group: group.clone(),
                        consumer: consumer.clone(),
                        count: *count as u64,
                    }],
                ))
            }
            Operation::XAck { key, group, ids } => {
                let map = locked.map_for(key);
                let acked = ks.xack(map, key, group, ids, now)?;
                let records = (acked > 0)
                    .then(|| JournalOp::XAck {
                        key: key.clone(),
                        group: group.clone(),
                        ids: ids.clone(),
                    })
                    .into_iter()
                    .collect();
                Ok((Reply::Int(acked as i64), records))
            }
            Operation::XPending { key, group } => {
                let map = locked.map_for(key);
                Ok((Reply::Pending(ks.xpending(map, key, group, now)?), Vec::new()))
            }
        }
    }

    /// Re-apply one journal record at its recorded time. Replay of a
    /// journal produced by this engine cannot fail; anything else is
    /// logged and skipped.
    fn apply_record(&self, record: JournalRecord) {
        let ks = &self.keyspace;
        let now = record.now;
        let outcome: Result<(), EngineError> = match record.op {
            JournalOp::Set {
                key,
                value,
                expire_at,
            } => ks.with_shard(&key, |map| ks.set(map, &key, value.clone(), expire_at, false, now)),
            JournalOp::Del { key } => ks.with_shard(&key, |map| {
                ks.delete(map, &key, now);
                Ok(())
            }),
            JournalOp::ExpireAt { key, at } => ks.with_shard(&key, |map| {
                ks.expire_at(map, &key, at, now);
                Ok(())
            }),
            JournalOp::Persist { key } => ks.with_shard(&key, |map| {
                ks.persist(map, &key, now);
                Ok(())
            }),
            JournalOp::IncrBy { key, delta } => {
                ks.with_shard(&key, |map| ks.incr_by(map, &key, delta, now).map(|_| ()))
            }
            JournalOp::IncrByFloat { key, delta } => ks.with_shard(&key, |map| {
                ks.incr_by_float(map, &key, delta, now).map(|_| ())
            }),
            JournalOp::Append { key, data } => {
                ks.with_shard(&key, |map| ks.append(map, &key, &data, now).map(|_| ()))
            }
            JournalOp::Push { key, front, elems } => ks.with_shard(&key, |map| {
                ks.push(map, &key, front, &elems, now).map(|_| ())
            }),
            JournalOp::Pop { key, front } => {
                ks.with_shard(&key, |map| ks.pop(map, &key, front, now).map(|_| ()))
            }
            JournalOp::SAdd { key, members } => {
                ks.with_shard(&key, |map| ks.sadd(map, &key, &members, now).map(|_| ()))
            }
            JournalOp::SRem { key, members } => {
                ks.with_shard(&key, |map| ks.srem(map, &key, &members, now).map(|_| ()))
            }
            JournalOp::ZAdd { key, pairs } => {
                ks.with_shard(&key, |map| ks.zadd(map, &key, &pairs, now).map(|_| ()))
            }
            JournalOp::ZRem { key, members } => {
                ks.with_shard(&key, |map| ks.zrem(map, &key, &members, now).map(|_| ()))
            }
            JournalOp::ZIncrBy { key, delta, member } => ks.with_shard(&key, |map| {
                ks.zincrby(map, &key, delta, &member, now).map(|_| ())
            }),
            JournalOp::HSet { key, pairs } => {
                ks.with_shard(&key, |map| ks.hset(map, &key, &pairs, now).map(|_| ()))
            }
            JournalOp::HDel { key, fields } => {
                ks.with_shard(&key, |map| ks.hdel(map, &key, &fields, now).map(|_| ()))
            }
            JournalOp::XAdd { key, id, fields } => ks.with_shard(&key, |map| {
                ks.xadd(map, &key, Some(id), &fields, now).map(|_| ())
            }),
            JournalOp::XGroupCreate { key, group, start } => {
                ks.with_shard(&key, |map| ks.xgroup_create(map, &key, &group, start, now))
            }
            JournalOp::XReadGroup {
                key,
                group,
                consumer,
                count,
            } => ks.with_shard(&key, |map| {
                ks.xread_group(map, &key, &group, &consumer, count as usize, now)
                    .map(|_| ())
            }),
            JournalOp::XAck { key, group, ids } => {
                ks.with_shard(&key, |map| ks.xack(map, &key, &group, &ids, now).map(|_| ()))
            }
            JournalOp::FlushAll => {
                ks.flush_all();
                Ok(())
            }
        };
        if let Err(err) = outcome {
            debug!(error = %err, "journal record did not re-apply cleanly");
        }
    }
}

/// Handles for the engine's background tasks: the active-expiry sweep,
/// the snapshot scheduler and (for the `EverySec` cadence) the journal
/// fsync loop. Dropping the handle stops all of them.
pub struct Maintenance {
    sweep: SweepTask,
    scheduler: Option<crate::store::snapshot_scheduler::SnapshotScheduler>,
    fsync_shutdown: Option<watch::Sender<bool>>,
}

impl Maintenance {
    /// Stop everything and wait for the sweep to exit.
    pub async fn shutdown(self) {
        if let Some(tx) = &self.fsync_shutdown {
            let _ = tx.send(true);
        }
        if let Some(scheduler) = self.scheduler {
            scheduler.shutdown().await;
        }
        self.sweep.shutdown().await;
    }
}

impl Engine {
    /// Spawn the background tasks on the current tokio runtime.
    pub fn start_maintenance(self: &Arc<Self>) -> Maintenance {
        let sweep = SweepTask::spawn(
            self.keyspace.clone(),
            self.config.sweep.clone(),
            self.config.lfu_decay,
        );
        let scheduler = self.journal.is_some().then(|| {
            crate::store::snapshot_scheduler::SnapshotScheduler::spawn(
                Arc::downgrade(self),
                self.config.snapshot_interval,
            )
        });
        let fsync_shutdown = (self.config.fsync == FsyncPolicy::EverySec).then(|| {
            let (tx, mut rx) = watch::channel(false);
            let engine = Arc::downgrade(self);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        changed = rx.changed() => {
                            if changed.is_err() || *rx.borrow() {
                                return;
                            }
                        }
                    }
                    let Some(engine) = engine.upgrade() else { return };
                    if let Some(journal) = &engine.journal {
                        let result = journal.lock().sync();
                        if let Err(err) = result {
                            engine.mark_degraded(&err);
                        }
                    }
                }
            });
            tx
        });
        Maintenance {
            sweep,
            scheduler,
            fsync_shutdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn engine() -> Engine {
        Engine::ephemeral(EngineConfig::default())
    }

    #[test]
    fn set_incr_get_worked_example() {
        let engine = engine();
        engine
            .execute(Operation::Set {
                key: b("a"),
                value: b("1"),
                ttl_ms: None,
                keep_ttl: false,
            })
            .unwrap();
        assert_eq!(
            engine.execute(Operation::IncrBy { key: b("a"), delta: 1 }).unwrap(),
            Reply::Int(2)
        );
        assert_eq!(
            engine.execute(Operation::Get { key: b("a") }).unwrap(),
            Reply::Bytes(b("2"))
        );
    }

    #[test]
    fn lpush_order_worked_example() {
        let engine = engine();
        engine
            .execute(Operation::LPush {
                key: b("l"),
                elems: vec![b("x")],
            })
            .unwrap();
        engine
            .execute(Operation::LPush {
                key: b("l"),
                elems: vec![b("y")],
            })
            .unwrap();
        assert_eq!(
            engine
                .execute(Operation::LRange {
                    key: b("l"),
                    start: 0,
                    stop: -1
                })
                .unwrap(),
            Reply::Array(vec![b("y"), b("x")])
        );
    }

    #[test]
    fn zadd_overwrites_score_worked_example() {
        let engine = engine();
        engine
            .execute(Operation::ZAdd {
                key: b("z"),
                pairs: vec![(5.0, b("m"))],
            })
            .unwrap();
        engine
            .execute(Operation::ZAdd {
                key: b("z"),
                pairs: vec![(3.0, b("m"))],
            })
            .unwrap();
        assert_eq!(
            engine
                .execute(Operation::ZScore {
                    key: b("z"),
                    member: b("m")
                })
                .unwrap(),
            Reply::Float(3.0)
        );
        assert_eq!(
            engine.execute(Operation::ZCard { key: b("z") }).unwrap(),
            Reply::Int(1)
        );
    }

    #[test]
    fn watch_conflict_applies_nothing() {
        let engine = engine();
        engine
            .execute(Operation::Set {
                key: b("w"),
                value: b("1"),
                ttl_ms: None,
                keep_ttl: false,
            })
            .unwrap();

        let token = engine.watch(&[b("w")]);
        // Concurrent mutation between watch and commit.
        engine
            .execute(Operation::Set {
                key: b("w"),
                value: b("2"),
                ttl_ms: None,
                keep_ttl: false,
            })
            .unwrap();

        let outcome = engine.execute_batch(
            &[Operation::Set {
                key: b("target"),
                value: b("should-not-land"),
                ttl_ms: None,
                keep_ttl: false,
            }],
            Some(&token),
        );
        assert_eq!(outcome.unwrap_err(), EngineError::WatchConflict);
        assert_eq!(
            engine.execute(Operation::Get { key: b("target") }).unwrap(),
            Reply::Nil
        );
    }

    #[test]
    fn watch_on_absent_key_conflicts_on_creation() {
        let engine = engine();
        let token = engine.watch(&[b("ghost")]);
        engine
            .execute(Operation::Set {
                key: b("ghost"),
                value: b("now-exists"),
                ttl_ms: None,
                keep_ttl: false,
            })
            .unwrap();
        let outcome = engine.execute_batch(
            &[Operation::Get { key: b("anything") }],
            Some(&token),
        );
        assert_eq!(outcome.unwrap_err(), EngineError::WatchConflict);
    }

    #[test]
    fn unwatched_batch_commits_atomically() {
        let engine = engine();
        let token = engine.watch(&[b("w")]);
        let replies = engine
            .execute_batch(
                &[
                    Operation::Set {
                        key: b("t1"),
                        value: b("a"),
                        ttl_ms: None,
                        keep_ttl: false,
                    },
                    Operation::IncrBy {
                        key: b("t2"),
                        delta: 7,
                    },
                ],
                Some(&token),
            )
            .unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[1], Ok(Reply::Int(7)));
    }

    #[test]
    fn oom_with_noeviction_rejects_growing_writes_only() {
        let engine = Engine::ephemeral(EngineConfig {
            max_memory: 1,
            ..EngineConfig::default()
        });
        engine
            .execute(Operation::Set {
                key: b("first"),
                value: b("fits-because-checked-before"),
                ttl_ms: None,
                keep_ttl: false,
            })
            .unwrap();
        // Now over the limit: growing writes fail, deletes pass.
        assert_eq!(
            engine
                .execute(Operation::Set {
                    key: b("second"),
                    value: b("x"),
                    ttl_ms: None,
                    keep_ttl: false,
                })
                .unwrap_err(),
            EngineError::OutOfMemory
        );
        assert_eq!(
            engine
                .execute(Operation::Del { keys: vec![b("first")] })
                .unwrap(),
            Reply::Int(1)
        );
        // With memory freed, writes work again.
        engine
            .execute(Operation::Set {
                key: b("second"),
                value: b("x"),
                ttl_ms: None,
                keep_ttl: false,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn blpop_wakes_on_push_and_times_out_otherwise() {
        let engine = Arc::new(engine());

        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine.blpop(&[b("q")], Duration::from_secs(5)).await
            })
        };
        // Give the waiter time to register.
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine
            .execute(Operation::RPush {
                key: b("q"),
                elems: vec![b("job")],
            })
            .unwrap();

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got, Some((b("q"), b("job"))));

        // Nothing produced: timeout yields None, no side effects.
        let none = engine.blpop(&[b("q")], Duration::from_millis(50)).await.unwrap();
        assert_eq!(none, None);
    }

    #[tokio::test]
    async fn mutation_feed_sees_matching_writes() {
        let engine = engine();
        let mut feed = engine.subscribe(b"user:*");
        engine
            .execute(Operation::Set {
                key: b("other"),
                value: b("v"),
                ttl_ms: None,
                keep_ttl: false,
            })
            .unwrap();
        engine
            .execute(Operation::Set {
                key: b("user:1"),
                value: b("v"),
                ttl_ms: None,
                keep_ttl: false,
            })
            .unwrap();
        let event = feed.recv().await.unwrap();
        assert_eq!(event.key, b("user:1"));
        assert_eq!(event.kind, "set");
    }
}
