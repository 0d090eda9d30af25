//! The value model: one closed tagged variant over the six supported
//! kinds, plus the list, set and hash operations on the keyspace.
//!
//! Type-specific operations dispatch by pattern matching; an operation
//! against a key holding a different kind fails with `WrongType`, never a
//! coercion. String and generic operations live in `store::mod`, sorted
//! sets in `store::zset`, streams in `store::stream`.

use std::collections::VecDeque;

use bytes::Bytes;
use hashbrown::{HashMap, HashSet};

use crate::error::EngineError;
use crate::store::stream::Stream;
use crate::store::zset::SortedSet;
use crate::store::{Keyspace, ShardMap};

/// A stored value. Exactly one kind per key at any time.
#[derive(Debug, Clone)]
pub enum Value {
    Str(Bytes),
    List(VecDeque<Bytes>),
    Set(HashSet<Bytes>),
    Zset(SortedSet),
    Hash(HashMap<Bytes, Bytes>),
    Stream(Stream),
}

/// The kind tag, exposed to callers of `TypeOf` and used by the snapshot
/// format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Str,
    List,
    Set,
    Zset,
    Hash,
    Stream,
}

impl ValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::Str => "string",
            ValueKind::List => "list",
            ValueKind::Set => "set",
            ValueKind::Zset => "zset",
            ValueKind::Hash => "hash",
            ValueKind::Stream => "stream",
        }
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Str(_) => ValueKind::Str,
            Value::List(_) => ValueKind::List,
            Value::Set(_) => ValueKind::Set,
            Value::Zset(_) => ValueKind::Zset,
            Value::Hash(_) => ValueKind::Hash,
            Value::Stream(_) => ValueKind::Stream,
        }
    }

    /// Approximate heap footprint in bytes, charged against the memory
    /// budget. Container constants cover per-element bookkeeping.
    pub fn cost(&self) -> usize {
        match self {
            Value::Str(b) => b.len(),
            Value::List(l) => l.iter().map(|e| e.len() + 16).sum(),
            Value::Set(s) => s.iter().map(|m| m.len() + 16).sum(),
            Value::Zset(z) => z.cost(),
            Value::Hash(h) => h.iter().map(|(f, v)| f.len() + v.len() + 32).sum(),
            Value::Stream(s) => s.cost(),
        }
    }

    /// Containers that vanish when emptied. Streams persist empty so that
    /// their last-id and consumer groups survive, matching the append-only
    /// log contract.
    pub fn is_vanishing_empty(&self) -> bool {
        match self {
            Value::Str(_) | Value::Stream(_) => false,
            Value::List(l) => l.is_empty(),
            Value::Set(s) => s.is_empty(),
            Value::Zset(z) => z.is_empty(),
            Value::Hash(h) => h.is_empty(),
        }
    }

    pub fn as_str(&self) -> Result<&Bytes, EngineError> {
        match self {
            Value::Str(b) => Ok(b),
            _ => Err(EngineError::WrongType),
        }
    }

    pub fn as_list_mut(&mut self) -> Result<&mut VecDeque<Bytes>, EngineError> {
        match self {
            Value::List(l) => Ok(l),
            _ => Err(EngineError::WrongType),
        }
    }

    pub fn as_list(&self) -> Result<&VecDeque<Bytes>, EngineError> {
        match self {
            Value::List(l) => Ok(l),
            _ => Err(EngineError::WrongType),
        }
    }

    pub fn as_set_mut(&mut self) -> Result<&mut HashSet<Bytes>, EngineError> {
        match self {
            Value::Set(s) => Ok(s),
            _ => Err(EngineError::WrongType),
        }
    }

    pub fn as_set(&self) -> Result<&HashSet<Bytes>, EngineError> {
        match self {
            Value::Set(s) => Ok(s),
            _ => Err(EngineError::WrongType),
        }
    }

    pub fn as_hash_mut(&mut self) -> Result<&mut HashMap<Bytes, Bytes>, EngineError> {
        match self {
            Value::Hash(h) => Ok(h),
            _ => Err(EngineError::WrongType),
        }
    }

    pub fn as_hash(&self) -> Result<&HashMap<Bytes, Bytes>, EngineError> {
        match self {
            Value::Hash(h) => Ok(h),
            _ => Err(EngineError::WrongType),
        }
    }

    pub fn as_zset_mut(&mut self) -> Result<&mut SortedSet, EngineError> {
        match self {
            Value::Zset(z) => Ok(z),
            _ => Err(EngineError::WrongType),
        }
    }

    pub fn as_zset(&self) -> Result<&SortedSet, EngineError> {
        match self {
            Value::Zset(z) => Ok(z),
            _ => Err(EngineError::WrongType),
        }
    }

    pub fn as_stream_mut(&mut self) -> Result<&mut Stream, EngineError> {
        match self {
            Value::Stream(s) => Ok(s),
            _ => Err(EngineError::WrongType),
        }
    }

    pub fn as_stream(&self) -> Result<&Stream, EngineError> {
        match self {
            Value::Stream(s) => Ok(s),
            _ => Err(EngineError::WrongType),
        }
    }
}

/// Parse a string value as a signed integer, rejecting anything a strict
/// decimal grammar would not accept.
pub fn parse_i64(bytes: &[u8]) -> Result<i64, EngineError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(EngineError::NotANumber)
}

/// Parse a string value as a float, rejecting NaN and infinities: they are
/// never valid stored numbers.
pub fn parse_f64(bytes: &[u8]) -> Result<f64, EngineError> {
    let parsed = std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or(EngineError::NotANumber)?;
    if parsed.is_finite() {
        Ok(parsed)
    } else {
        Err(EngineError::NotANumber)
    }
}

/// Render a float the way stored numbers are written back: integral values
/// lose the trailing fraction.
pub fn format_f64(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1e17 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Clamp a (start, stop) pair with negative-from-the-end semantics onto
/// `len` elements. Returns None when the window is empty.
pub fn normalize_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

// ---------------------------------------------------------------------------
// List operations
// ---------------------------------------------------------------------------

impl Keyspace {
    /// Push elements onto the head (`front`) or tail of a list, creating
    /// it on first write. Returns the resulting length.
    pub fn push(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        front: bool,
        elems: &[Bytes],
        now: u64,
    ) -> Result<usize, EngineError> {
        self.mutate(map, key, now, Some(|| Value::List(VecDeque::new())), |entry| {
            let list = entry.value.as_list_mut()?;
            for elem in elems {
                if front {
                    list.push_front(elem.clone());
                } else {
                    list.push_back(elem.clone());
                }
            }
            Ok(list.len())
        })
    }

    /// Pop one element from the head or tail. None on a missing key.
    pub fn pop(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        front: bool,
        now: u64,
    ) -> Result<Option<Bytes>, EngineError> {
        if self.peek(map, key, now).is_none() {
            return Ok(None);
        }
        self.mutate(map, key, now, None, |entry| {
            let list = entry.value.as_list_mut()?;
            Ok(if front {
                list.pop_front()
            } else {
                list.pop_back()
            })
        })
    }

    /// Bounded range read with negative-index semantics.
    pub fn lrange(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        start: i64,
        stop: i64,
        now: u64,
    ) -> Result<Vec<Bytes>, EngineError> {
        match self.read_entry(map, key, now) {
            None => Ok(Vec::new()),
            Some(entry) => {
                let list = entry.value.as_list()?;
                Ok(match normalize_range(start, stop, list.len()) {
                    Some((lo, hi)) => list.iter().skip(lo).take(hi - lo + 1).cloned().collect(),
                    None => Vec::new(),
                })
            }
        }
    }

    pub fn llen(&self, map: &mut ShardMap, key: &Bytes, now: u64) -> Result<usize, EngineError> {
        match self.read_entry(map, key, now) {
            None => Ok(0),
            Some(entry) => Ok(entry.value.as_list()?.len()),
        }
    }
}

// ---------------------------------------------------------------------------
// Set operations
// ---------------------------------------------------------------------------

impl Keyspace {
    /// Add members; returns how many were not already present.
    pub fn sadd(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        members: &[Bytes],
        now: u64,
    ) -> Result<usize, EngineError> {
        self.mutate(map, key, now, Some(|| Value::Set(HashSet::new())), |entry| {
            let set = entry.value.as_set_mut()?;
            Ok(members.iter().filter(|m| set.insert((*m).clone())).count())
        })
    }

    /// Remove members; returns how many were present.
    pub fn srem(
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
            let set = entry.value.as_set_mut()?;
            Ok(members.iter().filter(|m| set.remove(m.as_ref())).count())
        })
    }

    /// All members, sorted for a stable observable order.
    pub fn smembers(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        now: u64,
    ) -> Result<Vec<Bytes>, EngineError> {
        match self.read_entry(map, key, now) {
            None => Ok(Vec::new()),
            Some(entry) => {
                let mut members: Vec<Bytes> = entry.value.as_set()?.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
        }
    }

    pub fn sismember(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        member: &Bytes,
        now: u64,
    ) -> Result<bool, EngineError> {
        match self.read_entry(map, key, now) {
            None => Ok(false),
            Some(entry) => Ok(entry.value.as_set()?.contains(member)),
        }
    }

    pub fn scard(&self, map: &mut ShardMap, key: &Bytes, now: u64) -> Result<usize, EngineError> {
        match self.read_entry(map, key, now) {
            None => Ok(0),
            Some(entry) => Ok(entry.value.as_set()?.len()),
        }
    }
}

// ---------------------------------------------------------------------------
// Hash operations
// ---------------------------------------------------------------------------

impl Keyspace {
    /// Set field/value pairs; returns how many fields were new.
    pub fn hset(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        pairs: &[(Bytes, Bytes)],
        now: u64,
    ) -> Result<usize, EngineError> {
        self.mutate(map, key, now, Some(|| Value::Hash(HashMap::new())), |entry| {
            let hash = entry.value.as_hash_mut()?;
            Ok(pairs
                .iter()
                .filter(|(f, v)| hash.insert(f.clone(), v.clone()).is_none())
                .count())
        })
    }

    pub fn hget(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        field: &Bytes,
        now: u64,
    ) -> Result<Option<Bytes>, EngineError> {
        match self.read_entry(map, key, now) {
            None => Ok(None),
            Some(entry) => Ok(entry.value.as_hash()?.get(field).cloned()),
        }
    }

    /// Delete fields; returns how many existed.
    pub fn hdel(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        fields: &[Bytes],
        now: u64,
    ) -> Result<usize, EngineError> {
        if self.peek(map, key, now).is_none() {
            return Ok(0);
        }
        self.mutate(map, key, now, None, |entry| {
            let hash = entry.value.as_hash_mut()?;
            Ok(fields.iter().filter(|f| hash.remove(f.as_ref()).is_some()).count())
        })
    }

    /// All field/value pairs, sorted by field for a stable order.
    pub fn hgetall(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        now: u64,
    ) -> Result<Vec<(Bytes, Bytes)>, EngineError> {
        match self.read_entry(map, key, now) {
            None => Ok(Vec::new()),
            Some(entry) => {
                let mut pairs: Vec<(Bytes, Bytes)> = entry
                    .value
                    .as_hash()?
                    .iter()
                    .map(|(f, v)| (f.clone(), v.clone()))
                    .collect();
                pairs.sort_by(|a, b| a.0.cmp(&b.0));
                Ok(pairs)
            }
        }
    }

    pub fn hlen(&self, map: &mut ShardMap, key: &Bytes, now: u64) -> Result<usize, EngineError> {
        match self.read_entry(map, key, now) {
            None => Ok(0),
            Some(entry) => Ok(entry.value.as_hash()?.len()),
        }
    }

    pub fn hexists(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        field: &Bytes,
        now: u64,
    ) -> Result<bool, EngineError> {
        match self.read_entry(map, key, now) {
            None => Ok(false),
            Some(entry) => Ok(entry.value.as_hash()?.contains_key(field)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_parsing() {
        assert_eq!(parse_i64(b"42").unwrap(), 42);
        assert_eq!(parse_i64(b"-7").unwrap(), -7);
        assert_eq!(parse_i64(b"4.5"), Err(EngineError::NotANumber));
        assert_eq!(parse_i64(b"abc"), Err(EngineError::NotANumber));
        assert_eq!(parse_i64(b""), Err(EngineError::NotANumber));

        assert_eq!(parse_f64(b"3.25").unwrap(), 3.25);
        assert_eq!(parse_f64(b"nan"), Err(EngineError::NotANumber));
        assert_eq!(parse_f64(b"inf"), Err(EngineError::NotANumber));
    }

    #[test]
    fn float_formatting_drops_integral_fraction() {
        assert_eq!(format_f64(3.0), "3");
        assert_eq!(format_f64(3.5), "3.5");
        assert_eq!(format_f64(-2.0), "-2");
    }

    #[test]
    fn range_normalization() {
        // 5-element window, full range via negative stop.
        assert_eq!(normalize_range(0, -1, 5), Some((0, 4)));
        assert_eq!(normalize_range(-2, -1, 5), Some((3, 4)));
        assert_eq!(normalize_range(1, 2, 5), Some((1, 2)));
        // Start past the end or inverted windows are empty.
        assert_eq!(normalize_range(5, 9, 5), None);
        assert_eq!(normalize_range(3, 1, 5), None);
        assert_eq!(normalize_range(0, 0, 0), None);
        // Stop clamped to the last element.
        assert_eq!(normalize_range(0, 99, 3), Some((0, 2)));
    }

    #[test]
    fn vanishing_empty_classification() {
        assert!(Value::List(VecDeque::new()).is_vanishing_empty());
        assert!(Value::Set(HashSet::new()).is_vanishing_empty());
        assert!(Value::Hash(HashMap::new()).is_vanishing_empty());
        assert!(!Value::Str(Bytes::new()).is_vanishing_empty());
        assert!(!Value::Stream(Stream::default()).is_vanishing_empty());
    }

    #[test]
    fn kind_names() {
        assert_eq!(Value::Str(Bytes::new()).kind().as_str(), "string");
        assert_eq!(Value::List(VecDeque::new()).kind().as_str(), "list");
        assert_eq!(Value::Stream(Stream::default()).kind().as_str(), "stream");
    }
}
