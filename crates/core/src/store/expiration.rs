//! Active expiration sweep.
//!
//! Lazy expiry only reclaims keys that are touched again; this background
//! task bounds the staleness of the rest. Each cycle visits a bounded,
//! cursor-rotated sample per shard, deletes the expired ones, and re-runs
//! immediately (bounded) while the expired fraction of the sample stays
//! high. The inter-cycle interval adapts between a floor and a ceiling
//! depending on how much the sweeps are finding.
//!
//! The sweep takes the same per-shard write guard as foreground
//! operations, so it can never race a client's read against a deletion.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::config::SweepConfig;
use crate::now_ms;
use crate::store::{Keyspace, policy};

/// Handle to the running sweep task. Dropping it stops the task.
pub struct SweepTask {
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl SweepTask {
    /// Spawn the sweep loop on the current tokio runtime.
    pub fn spawn(ks: Arc<Keyspace>, config: SweepConfig, lfu_decay: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(sweep_loop(ks, config, lfu_decay, shutdown_rx));
        info!("active expiration sweep started");
        Self {
            shutdown_tx,
            handle: Some(handle),
        }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop and wait for the task to finish.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for SweepTask {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// One sweep over every shard. Returns (volatile keys visited, expired
/// keys deleted). Public so tests can drive cycles without the task.
pub fn sweep_cycle(
    ks: &Keyspace,
    cursors: &mut [usize],
    sample_size: usize,
    now: u64,
) -> (usize, usize) {
    let mut visited = 0;
    let mut expired = 0;
    for idx in 0..ks.shard_count() {
        let (sampled, next_cursor) = ks.sample_shard(idx, cursors[idx], sample_size);
        cursors[idx] = next_cursor;

        let due: Vec<_> = sampled
            .iter()
            .filter(|(_, expire_at, _)| expire_at.is_some())
            .inspect(|_| visited += 1)
            .filter(|(_, expire_at, _)| expire_at.is_some_and(|at| at <= now))
            .map(|(key, _, _)| key.clone())
            .collect();

        if due.is_empty() {
            continue;
        }
        let mut map = ks.shard_guard(idx);
        for key in due {
            // Re-check under the write guard: a concurrent PERSIST or
            // overwrite may have saved the key since sampling.
            if map.entries.get(&key).is_some_and(|e| e.is_expired(now))
                && ks.remove_from(&mut map, &key).is_some()
            {
                expired += 1;
            }
        }
    }
    (visited, expired)
}

async fn sweep_loop(
    ks: Arc<Keyspace>,
    config: SweepConfig,
    lfu_decay: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut cursors = vec![0usize; ks.shard_count()];
    let mut interval = config.base_interval;
    let mut last_decay = now_ms();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("expiration sweep shutting down");
                    return;
                }
            }
        }

        let mut visited = 0;
        let mut expired = 0;
        for _ in 0..config.max_rounds {
            let now = now_ms();
            let (v, e) = sweep_cycle(&ks, &mut cursors, config.sample_size, now);
            visited += v;
            expired += e;
            // Keep going only while the sample looks saturated with
            // expired keys.
            if v == 0 || (e as f64) / (v as f64) <= config.repeat_threshold {
                break;
            }
        }

        if expired > 0 {
            debug!(visited, expired, "expiration sweep reclaimed keys");
        }

        // Adapt: busy sweeps tighten the interval, idle ones relax it.
        if visited > 0 && (expired as f64) / (visited as f64) > config.repeat_threshold {
            interval = (interval / 2).max(config.min_interval);
            trace!(interval_ms = interval.as_millis() as u64, "sweep speeding up");
        } else if expired == 0 {
            interval = (interval * 2).min(config.max_interval);
        }

        let now = now_ms();
        if !lfu_decay.is_zero() && now.saturating_sub(last_decay) >= lfu_decay.as_millis() as u64 {
            policy::decay_frequency(&ks);
            last_decay = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use bytes::Bytes;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn seeded(volatile: usize, persistent: usize, deadline: u64) -> Arc<Keyspace> {
        let ks = Arc::new(Keyspace::new(&EngineConfig {
            shards: 4,
            ..EngineConfig::default()
        }));
        for i in 0..volatile {
            let key = b(&format!("v:{i}"));
            ks.with_shard(&key, |map| {
                ks.set(map, &key, b("x"), Some(deadline), false, 0).unwrap();
            });
        }
        for i in 0..persistent {
            let key = b(&format!("p:{i}"));
            ks.with_shard(&key, |map| {
                ks.set(map, &key, b("x"), None, false, 0).unwrap();
            });
        }
        ks
    }

    #[test]
    fn cycle_deletes_only_expired_samples() {
        let ks = seeded(10, 10, 1_000);
        let mut cursors = vec![0; ks.shard_count()];

        // Before the deadline nothing is reclaimed.
        let (visited, expired) = sweep_cycle(&ks, &mut cursors, 64, 999);
        assert_eq!(expired, 0);
        assert!(visited >= 10);

        // After the deadline every volatile key goes; persistents stay.
        let (_, expired) = sweep_cycle(&ks, &mut cursors, 64, 1_000);
        assert_eq!(expired, 10);
        assert_eq!(ks.len(1_000), 10);
    }

    #[test]
    fn cycle_visits_a_bounded_sample() {
        let ks = seeded(100, 0, 1);
        let mut cursors = vec![0; ks.shard_count()];
        let (_, expired) = sweep_cycle(&ks, &mut cursors, 2, 10);
        // At most sample_size per shard can be reclaimed per cycle.
        assert!(expired <= 2 * ks.shard_count());
        assert!(expired > 0);
    }

    #[tokio::test]
    async fn task_reclaims_without_access() {
        let ks = seeded(20, 1, now_ms() + 20);
        let config = SweepConfig {
            base_interval: Duration::from_millis(5),
            min_interval: Duration::from_millis(1),
            sample_size: 64,
            ..SweepConfig::default()
        };
        let task = SweepTask::spawn(ks.clone(), config, Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(ks.len(now_ms()), 1);

        task.shutdown().await;
    }
}
