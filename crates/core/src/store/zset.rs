//! Sorted sets: unique members, each carrying a float score.
//!
//! Representation is a member → score map; ordered views are produced on
//! demand by sorting on (score, member). Re-adding a member updates its
//! score in place, never duplicates.

use bytes::Bytes;
use hashbrown::HashMap;

use crate::error::EngineError;
use crate::store::value::{Value, normalize_range};
use crate::store::{Keyspace, ShardMap};

#[derive(Debug, Clone, Default)]
pub struct SortedSet {
    members: HashMap<Bytes, f64>,
}

impl SortedSet {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Insert or update. Returns true when the member was new.
    pub fn insert(&mut self, member: Bytes, score: f64) -> bool {
        self.members.insert(member, score).is_none()
    }

    pub fn remove(&mut self, member: &[u8]) -> bool {
        self.members.remove(member).is_some()
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.members.get(member).copied()
    }

    /// Add `delta` to a member's score, creating it at `delta` if absent.
    /// Rejects a non-finite result.
    pub fn incr(&mut self, member: &Bytes, delta: f64) -> Result<f64, EngineError> {
        let next = self.members.get(member.as_ref()).copied().unwrap_or(0.0) + delta;
        if !next.is_finite() {
            return Err(EngineError::NotANumber);
        }
        self.members.insert(member.clone(), next);
        Ok(next)
    }

    /// Members ordered by (score, member) ascending.
    pub fn sorted(&self) -> Vec<(Bytes, f64)> {
        let mut items: Vec<(Bytes, f64)> = self
            .members
            .iter()
            .map(|(m, s)| (m.clone(), *s))
            .collect();
        items.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        items
    }

    /// Rank-range view with negative-index semantics.
    pub fn range(&self, start: i64, stop: i64) -> Vec<(Bytes, f64)> {
        let sorted = self.sorted();
        match normalize_range(start, stop, sorted.len()) {
            Some((lo, hi)) => sorted[lo..=hi].to_vec(),
            None => Vec::new(),
        }
    }

    pub fn cost(&self) -> usize {
        self.members.iter().map(|(m, _)| m.len() + 24).sum()
    }
}

impl Keyspace {
    /// Add (score, member) pairs; returns how many members were new.
    /// Scores are validated before any mutation.
    pub fn zadd(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        pairs: &[(f64, Bytes)],
        now: u64,
    ) -> Result<usize, EngineError> {
        if pairs.iter().any(|(score, _)| !score.is_finite()) {
            return Err(EngineError::NotANumber);
        }
        self.mutate(map, key, now, Some(|| Value::Zset(SortedSet::default())), |entry| {
            let zset = entry.value.as_zset_mut()?;
            Ok(pairs
                .iter()
                .filter(|(score, member)| zset.insert(member.clone(), *score))
                .count())
        })
    }

    /// Remove members; returns how many were present.
    pub fn zrem(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        members: &[Bytes],
        now: u64,
    ) -> Result<usize, EngineError> {
        if self.peek(map, key, now).is_none() {
            return Ok(0);
        }
        self.mutate(map, key, now, None, |entry| {
            let zset = entry.value.as_zset_mut()?;
            Ok(members.iter().filter(|m| zset.remove(m)).count())
        })
    }

    pub fn zscore(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        member: &Bytes,
        now: u64,
    ) -> Result<Option<f64>, EngineError> {
        match self.read_entry(map, key, now) {
            None => Ok(None),
            Some(entry) => Ok(entry.value.as_zset()?.score(member)),
        }
    }

    pub fn zcard(&self, map: &mut ShardMap, key: &Bytes, now: u64) -> Result<usize, EngineError> {
        match self.read_entry(map, key, now) {
            None => Ok(0),
            Some(entry) => Ok(entry.value.as_zset()?.len()),
        }
    }

    pub fn zrange(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        start: i64,
        stop: i64,
        now: u64,
    ) -> Result<Vec<(Bytes, f64)>, EngineError> {
        match self.read_entry(map, key, now) {
            None => Ok(Vec::new()),
            Some(entry) => Ok(entry.value.as_zset()?.range(start, stop)),
        }
    }

    pub fn zincrby(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        delta: f64,
        member: &Bytes,
        now: u64,
    ) -> Result<f64, EngineError> {
        if !delta.is_finite() {
            return Err(EngineError::NotANumber);
        }
        self.mutate(map, key, now, Some(|| Value::Zset(SortedSet::default())), |entry| {
            entry.value.as_zset_mut()?.incr(member, delta)
        })
    }
}
