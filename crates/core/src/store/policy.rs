//! Memory-pressure eviction.
//!
//! Runs when used memory exceeds the configured limit: sample candidates
//! from every shard, evict the policy's best victim, repeat until back
//! under the limit or no eligible candidate remains (then the write fails
//! with `OutOfMemory`). Victim keys are reported to the caller so the
//! executor can journal the deletions like any other mutation.
//!
//! Tie-break is deterministic: equal-scoring candidates lose in
//! lexicographic key order, smallest first.

use bytes::Bytes;
use rand::Rng;

use crate::config::EvictionPolicy;
use crate::error::EngineError;
use crate::store::{AccessMeta, Keyspace};

/// What one enforcement pass did.
#[derive(Debug, Default)]
pub struct EvictionRun {
    /// Keys removed, in eviction order.
    pub evicted: Vec<Bytes>,
    /// Bytes released.
    pub freed: usize,
}

struct Candidate {
    key: Bytes,
    expire_at: Option<u64>,
    meta: AccessMeta,
}

/// Evict until used memory is back under the limit. `on_evict` fires for
/// each victim while its shard guard is still held, so the caller can
/// journal the deletion in apply order.
///
/// Returns `OutOfMemory` when the policy forbids eviction or runs out of
/// eligible candidates while still over the limit; evictions already
/// performed stay performed.
pub fn enforce(
    ks: &Keyspace,
    policy: EvictionPolicy,
    sample_size: usize,
    now: u64,
    mut on_evict: impl FnMut(&Bytes),
) -> Result<EvictionRun, EngineError> {
    let mut run = EvictionRun::default();
    if !ks.over_limit() {
        return Ok(run);
    }
    if policy == EvictionPolicy::NoEviction {
        return Err(EngineError::OutOfMemory);
    }

    let mut rng = rand::thread_rng();
    while ks.over_limit() {
        let candidates = sample_candidates(ks, policy, sample_size, &mut rng);
        let Some(victim) = pick_victim(policy, candidates, now) else {
            return Err(EngineError::OutOfMemory);
        };
        // The shard lock was not held across sampling; the victim may
        // have vanished meanwhile, in which case the next round resamples.
        let removed = ks.with_shard(&victim, |map| {
            let removed = ks.remove_from(map, &victim);
            if removed.is_some() {
                on_evict(&victim);
            }
            removed
        });
        if let Some(entry) = removed {
            run.freed += entry.meta.cost;
            run.evicted.push(victim);
        }
    }
    Ok(run)
}

fn sample_candidates(
    ks: &Keyspace,
    policy: EvictionPolicy,
    sample_size: usize,
    rng: &mut impl Rng,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for idx in 0..ks.shard_count() {
        let cursor = rng.gen_range(0..usize::MAX);
        let (sampled, _) = ks.sample_shard(idx, cursor, sample_size);
        for (key, expire_at, meta) in sampled {
            if policy.volatile_only() && expire_at.is_none() {
                continue;
            }
            candidates.push(Candidate {
                key,
                expire_at,
                meta,
            });
        }
    }
    candidates
}

fn pick_victim(policy: EvictionPolicy, candidates: Vec<Candidate>, now: u64) -> Option<Bytes> {
    use std::cmp::Ordering;

    let cmp = |a: &Candidate, b: &Candidate| -> Ordering {
        let preference = match policy {
            // Longest idle first.
            EvictionPolicy::AllkeysLru | EvictionPolicy::VolatileLru => {
                let idle_a = now.saturating_sub(a.meta.last_access);
                let idle_b = now.saturating_sub(b.meta.last_access);
                idle_b.cmp(&idle_a)
            }
            // Coldest counter first, older access wins ties.
            EvictionPolicy::AllkeysLfu => a
                .meta
                .freq
                .cmp(&b.meta.freq)
                .then_with(|| a.meta.last_access.cmp(&b.meta.last_access)),
            // Nearest deadline first.
            EvictionPolicy::VolatileTtl => a
                .expire_at
                .unwrap_or(u64::MAX)
                .cmp(&b.expire_at.unwrap_or(u64::MAX)),
            EvictionPolicy::AllkeysRandom => Ordering::Equal,
            EvictionPolicy::NoEviction => Ordering::Equal,
        };
        preference.then_with(|| a.key.cmp(&b.key))
    };

    candidates.into_iter().min_by(|a, b| cmp(a, b)).map(|c| c.key)
}

/// Halve every LFU counter, so long-dead hot keys stop outranking current
/// traffic. Invoked by the sweep task on its decay interval.
pub fn decay_frequency(ks: &Keyspace) {
    for idx in 0..ks.shard_count() {
        let mut map = ks.shard_guard(idx);
        for entry in map.entries.values_mut() {
            entry.meta.freq /= 2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn bounded_keyspace(max_memory: usize) -> Keyspace {
        Keyspace::new(&EngineConfig {
            max_memory,
            shards: 4,
            ..EngineConfig::default()
        })
    }

    fn fill(ks: &Keyspace, count: usize, now_for: impl Fn(usize) -> u64) {
        for i in 0..count {
            let key = b(&format!("key:{i:02}"));
            ks.with_shard(&key, |map| {
                ks.set(map, &key, b("0123456789abcdef"), None, false, now_for(i))
                    .unwrap();
            });
        }
    }

    #[test]
    fn noeviction_rejects_when_over_limit() {
        let ks = bounded_keyspace(1);
        fill(&ks, 2, |_| 0);
        assert!(ks.over_limit());
        assert_eq!(
            enforce(&ks, EvictionPolicy::NoEviction, 5, 0, |_| {}).unwrap_err(),
            EngineError::OutOfMemory
        );
        assert_eq!(ks.len(0), 2);
    }

    #[test]
    fn lru_evicts_the_least_recently_accessed_first() {
        // A one-byte limit forces every key out, so the eviction order is
        // fully observable; a generous sample makes each pass exhaustive
        // and the choice determined by recency alone.
        let ks = bounded_keyspace(1);
        fill(&ks, 8, |i| 1_000 + i as u64);
        let run = enforce(&ks, EvictionPolicy::AllkeysLru, 64, 10_000, |_| {}).unwrap();
        assert_eq!(run.evicted.len(), 8);
        assert_eq!(run.evicted[0], b("key:00"));
        assert_eq!(run.evicted[7], b("key:07"));
        assert_eq!(ks.len(10_000), 0);
    }

    #[test]
    fn lru_stops_once_under_limit() {
        let ks = bounded_keyspace(0);
        fill(&ks, 8, |i| 1_000 + i as u64);
        // No limit configured: enforcement is a no-op.
        let run = enforce(&ks, EvictionPolicy::AllkeysLru, 64, 10_000, |_| {}).unwrap();
        assert!(run.evicted.is_empty());
        assert_eq!(ks.len(10_000), 8);
    }

    #[test]
    fn volatile_ttl_only_touches_keys_with_deadlines() {
        let ks = bounded_keyspace(200);
        // Two persistent keys, one volatile.
        fill(&ks, 2, |_| 0);
        let volatile = b("volatile");
        ks.with_shard(&volatile, |map| {
            ks.set(map, &volatile, b("0123456789abcdef"), Some(u64::MAX), false, 0)
                .unwrap();
        });

        match enforce(&ks, EvictionPolicy::VolatileTtl, 64, 1, |_| {}) {
            // Either the volatile key sufficed, or eligible keys ran out.
            Ok(run) => assert_eq!(run.evicted, vec![volatile.clone()]),
            Err(EngineError::OutOfMemory) => {}
            Err(other) => panic!("unexpected error {other:?}"),
        }
        // The persistent keys survived regardless.
        ks.with_shard(&b("key:00"), |map| {
            assert!(ks.exists(map, &b("key:00"), 1));
        });
        ks.with_shard(&b("key:01"), |map| {
            assert!(ks.exists(map, &b("key:01"), 1));
        });
    }

    #[test]
    fn frequency_decay_halves_counters() {
        let ks = bounded_keyspace(0);
        let key = b("hot");
        ks.with_shard(&key, |map| {
            ks.set(map, &key, b("v"), None, false, 0).unwrap();
            for _ in 0..10 {
                ks.get(map, &key, 0).unwrap();
            }
        });
        let before = ks.with_shard(&key, |map| map.entries.get(&key).unwrap().meta.freq);
        decay_frequency(&ks);
        let after = ks.with_shard(&key, |map| map.entries.get(&key).unwrap().meta.freq);
        assert_eq!(after, before / 2);
    }
}
