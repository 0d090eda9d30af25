//! Stored entries and their access metadata.

use crate::store::value::Value;

/// Fixed per-entry bookkeeping overhead charged against the memory budget,
/// on top of key and value bytes.
pub const ENTRY_OVERHEAD: usize = 64;

/// Metadata recorded alongside every value, driving eviction and the
/// optimistic-commit (watch) machinery.
#[derive(Debug, Clone)]
pub struct AccessMeta {
    /// Last read or write access, unix milliseconds.
    pub last_access: u64,
    /// Saturating access-frequency counter for LFU eviction. Halved
    /// periodically by the sweep task.
    pub freq: u8,
    /// Logical version stamped from the owning shard's monotonic counter
    /// on every mutation. Watch registrations compare against this.
    pub version: u64,
    /// Cached approximate memory cost of the whole entry.
    pub cost: usize,
}

/// The stored unit: a typed value, an optional expiry deadline and its
/// access metadata. Exactly one entry exists per key.
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: Value,
    /// Absolute deadline, unix milliseconds. None = never expires.
    pub expire_at: Option<u64>,
    pub meta: AccessMeta,
}

impl Entry {
    pub fn new(value: Value, now: u64, version: u64) -> Self {
        Self {
            value,
            expire_at: None,
            meta: AccessMeta {
                last_access: now,
                freq: 1,
                version,
                cost: 0,
            },
        }
    }

    /// True once the deadline has passed. Expired entries are dropped on
    /// access before any operation sees them.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expire_at.is_some_and(|at| at <= now)
    }

    /// Remaining lifetime in milliseconds, None when no deadline is set.
    pub fn ttl_ms(&self, now: u64) -> Option<u64> {
        self.expire_at.map(|at| at.saturating_sub(now))
    }

    /// Record a read access for the eviction policies.
    pub fn touch(&mut self, now: u64) {
        self.last_access_update(now);
    }

    pub(crate) fn last_access_update(&mut self, now: u64) {
        self.meta.last_access = now;
        self.meta.freq = self.meta.freq.saturating_add(1);
    }

    /// Refresh the cached cost after a mutation.
    pub fn recompute_cost(&mut self, key_len: usize) -> usize {
        self.meta.cost = key_len + self.value.cost() + ENTRY_OVERHEAD;
        self.meta.cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn expiry_checks_are_inclusive_of_deadline() {
        let mut e = Entry::new(Value::Str(Bytes::from_static(b"v")), 1_000, 1);
        assert!(!e.is_expired(5_000));
        e.expire_at = Some(2_000);
        assert!(!e.is_expired(1_999));
        assert!(e.is_expired(2_000));
        assert_eq!(e.ttl_ms(1_500), Some(500));
        assert_eq!(e.ttl_ms(3_000), Some(0));
    }

    #[test]
    fn touch_saturates_frequency() {
        let mut e = Entry::new(Value::Str(Bytes::new()), 0, 1);
        e.meta.freq = u8::MAX - 1;
        e.touch(10);
        e.touch(20);
        assert_eq!(e.meta.freq, u8::MAX);
        assert_eq!(e.meta.last_access, 20);
    }

    #[test]
    fn cost_includes_key_and_overhead() {
        let mut e = Entry::new(Value::Str(Bytes::from_static(b"abcd")), 0, 1);
        let cost = e.recompute_cost(3);
        assert!(cost >= 3 + 4 + ENTRY_OVERHEAD);
        assert_eq!(cost, e.meta.cost);
    }
}
