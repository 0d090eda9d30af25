//! Engine configuration.
//!
//! The engine consumes this configuration but does not own its source:
//! loading it from files or CLI flags is the embedding layer's job. Every
//! knob has a default that yields a usable ephemeral engine.

use std::time::Duration;

/// On-disk file name for snapshots inside the engine directory.
pub const SNAPSHOT_FILE: &str = "dump.kst";
/// On-disk file name for the write journal inside the engine directory.
pub const JOURNAL_FILE: &str = "journal.kst";

/// What to do when used memory exceeds [`EngineConfig::max_memory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Reject writes with `OutOfMemory`; never evict.
    NoEviction,
    /// Evict the least-recently-accessed key, any key eligible.
    AllkeysLru,
    /// Evict the least-recently-accessed key among keys with a TTL.
    VolatileLru,
    /// Evict the least-frequently-used key; counters decay over time.
    AllkeysLfu,
    /// Evict the key with the nearest expiry deadline.
    VolatileTtl,
    /// Evict a sampled key at random.
    AllkeysRandom,
}

impl EvictionPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            EvictionPolicy::NoEviction => "noeviction",
            EvictionPolicy::AllkeysLru => "allkeys-lru",
            EvictionPolicy::VolatileLru => "volatile-lru",
            EvictionPolicy::AllkeysLfu => "allkeys-lfu",
            EvictionPolicy::VolatileTtl => "volatile-ttl",
            EvictionPolicy::AllkeysRandom => "allkeys-random",
        }
    }

    /// Policies that only consider keys carrying an expiry deadline.
    pub fn volatile_only(self) -> bool {
        matches!(
            self,
            EvictionPolicy::VolatileLru | EvictionPolicy::VolatileTtl
        )
    }
}

/// How often journal appends reach the disk platter.
///
/// A throughput/durability trade-off exposed to the operator, not decided
/// by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// fsync on every append. Slowest, loses nothing.
    Always,
    /// A background task flushes and fsyncs on a fixed interval,
    /// aggregating pending writes. Loses at most one interval.
    EverySec,
    /// Leave flushing to the OS page cache. Fastest, loses the most.
    Never,
}

/// Active-expiry sweep tuning.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Starting interval between sweep cycles.
    pub base_interval: Duration,
    /// Floor for the adaptive interval.
    pub min_interval: Duration,
    /// Ceiling for the adaptive interval.
    pub max_interval: Duration,
    /// Entries visited per shard per cycle.
    pub sample_size: usize,
    /// Re-run the cycle immediately while the expired fraction of the
    /// sample exceeds this threshold.
    pub repeat_threshold: f64,
    /// Upper bound on immediate re-runs within one wakeup, so a mass
    /// expiry cannot monopolize the task.
    pub max_rounds: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(100),
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
            sample_size: 20,
            repeat_threshold: 0.25,
            max_rounds: 16,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of keyspace shards. Each shard is an independent
    /// serialization point for command execution.
    pub shards: usize,
    /// Memory budget in bytes. 0 = unlimited.
    pub max_memory: usize,
    /// Eviction policy applied when the budget is exceeded.
    pub eviction: EvictionPolicy,
    /// Candidates sampled per eviction round.
    pub eviction_sample: usize,
    /// Upper bound on a single string value.
    pub max_string_len: usize,
    /// Journal fsync cadence.
    pub fsync: FsyncPolicy,
    /// Active-expiry sweep tuning.
    pub sweep: SweepConfig,
    /// Halve all LFU counters once this much time has passed, so stale
    /// hot keys do not shadow current traffic.
    pub lfu_decay: Duration,
    /// Interval between automatic snapshots (None = only explicit /
    /// ratio-triggered snapshots).
    pub snapshot_interval: Option<Duration>,
    /// Compact the journal once `journal bytes / used memory` exceeds
    /// this ratio (0 = never compact automatically).
    pub journal_rewrite_ratio: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shards: 16,
            max_memory: 0,
            eviction: EvictionPolicy::NoEviction,
            eviction_sample: 5,
            max_string_len: 512 * 1024 * 1024,
            fsync: FsyncPolicy::EverySec,
            sweep: SweepConfig::default(),
            lfu_decay: Duration::from_secs(60),
            snapshot_interval: None,
            journal_rewrite_ratio: 4,
        }
    }
}
