//! Streams: an append-only ordered log of field/value entries.
//!
//! Entry IDs are (milliseconds, sequence) pairs and strictly increase; an
//! append with an ID not greater than the stream's maximum is rejected.
//! Consumer groups keep a delivery cursor plus per-consumer pending-entry
//! lists (delivery count and last delivery time per ID). A stream survives
//! being emptied: its last-id and groups outlive the entries.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use hashbrown::HashMap;

use crate::error::EngineError;
use crate::store::value::Value;
use crate::store::{Keyspace, ShardMap};

/// A stream entry ID: monotonically increasing (timestamp, sequence).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };
    pub const MAX: StreamId = StreamId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// One undelivered-but-unacknowledged entry owned by a consumer.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub delivery_count: u64,
    pub last_delivery_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Consumer {
    pub(crate) pending: BTreeMap<StreamId, PendingEntry>,
}

#[derive(Debug, Clone)]
pub struct ConsumerGroup {
    pub(crate) last_delivered: StreamId,
    pub(crate) consumers: HashMap<Bytes, Consumer>,
}

/// A row in an `XPending`-style summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSummary {
    pub id: StreamId,
    pub consumer: Bytes,
    pub delivery_count: u64,
    pub last_delivery_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Stream {
    pub(crate) entries: BTreeMap<StreamId, Vec<(Bytes, Bytes)>>,
    pub(crate) last_id: StreamId,
    pub(crate) groups: HashMap<Bytes, ConsumerGroup>,
}

impl Stream {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_id(&self) -> StreamId {
        self.last_id
    }

    /// Append an entry. An explicit ID must exceed `last_id`; an auto ID
    /// is (now, 0), or (last.ms, last.seq + 1) when the clock has not
    /// advanced past the newest entry.
    pub fn add(
        &mut self,
        id: Option<StreamId>,
        fields: Vec<(Bytes, Bytes)>,
        now: u64,
    ) -> Result<StreamId, EngineError> {
        let id = match id {
            Some(id) => {
                if id <= self.last_id {
                    return Err(EngineError::invalid(
                        "stream id must be greater than the last id",
                    ));
                }
                id
            }
            None => {
                if now > self.last_id.ms {
                    StreamId::new(now, 0)
                } else {
                    StreamId::new(self.last_id.ms, self.last_id.seq + 1)
                }
            }
        };
        self.entries.insert(id, fields);
        self.last_id = id;
        Ok(id)
    }

    /// Entries with `start <= id <= end`, oldest first, at most `count`
    /// when given.
    pub fn range(
        &self,
        start: StreamId,
        end: StreamId,
        count: Option<usize>,
    ) -> Vec<(StreamId, Vec<(Bytes, Bytes)>)> {
        if start > end {
            return Vec::new();
        }
        let iter = self
            .entries
            .range(start..=end)
            .map(|(id, fields)| (*id, fields.clone()));
        match count {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        }
    }

    /// Create a consumer group cursored at `start`.
    pub fn create_group(&mut self, name: Bytes, start: StreamId) -> Result<(), EngineError> {
        if self.groups.contains_key(&name) {
            return Err(EngineError::invalid("consumer group already exists"));
        }
        self.groups.insert(
            name,
            ConsumerGroup {
                last_delivered: start,
                consumers: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Deliver up to `count` entries past the group cursor to `consumer`,
    /// advancing the cursor and recording each ID as pending.
    pub fn read_group(
        &mut self,
        group: &Bytes,
        consumer: &Bytes,
        count: usize,
        now: u64,
    ) -> Result<Vec<(StreamId, Vec<(Bytes, Bytes)>)>, EngineError> {
        let Some(grp) = self.groups.get_mut(group) else {
            return Err(EngineError::KeyNotFound);
        };
        let after = grp.last_delivered;
        let delivered: Vec<(StreamId, Vec<(Bytes, Bytes)>)> = self
            .entries
            .range((
                std::ops::Bound::Excluded(after),
                std::ops::Bound::Unbounded,
            ))
            .take(count)
            .map(|(id, fields)| (*id, fields.clone()))
            .collect();
        if let Some((last, _)) = delivered.last() {
            grp.last_delivered = *last;
        }
        let state = grp.consumers.entry(consumer.clone()).or_default();
        for (id, _) in &delivered {
            state.pending.insert(
                *id,
                PendingEntry {
                    delivery_count: 1,
                    last_delivery_ms: now,
                },
            );
        }
        Ok(delivered)
    }

    /// Acknowledge pending IDs; returns how many were actually pending.
    pub fn ack(&mut self, group: &Bytes, ids: &[StreamId]) -> usize {
        let Some(grp) = self.groups.get_mut(group) else {
            return 0;
        };
        let mut removed = 0;
        for id in ids {
            for consumer in grp.consumers.values_mut() {
                if consumer.pending.remove(id).is_some() {
                    removed += 1;
                    break;
                }
            }
        }
        removed
    }

    /// All pending entries of a group, ordered by ID.
    pub fn pending(&self, group: &Bytes) -> Result<Vec<PendingSummary>, EngineError> {
        let Some(grp) = self.groups.get(group) else {
            return Err(EngineError::KeyNotFound);
        };
        let mut rows: Vec<PendingSummary> = grp
            .consumers
            .iter()
            .flat_map(|(name, consumer)| {
                consumer.pending.iter().map(|(id, p)| PendingSummary {
                    id: *id,
                    consumer: name.clone(),
                    delivery_count: p.delivery_count,
                    last_delivery_ms: p.last_delivery_ms,
                })
            })
            .collect();
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }

    pub fn cost(&self) -> usize {
        let entries: usize = self
            .entries
            .values()
            .map(|fields| {
                48 + fields
                    .iter()
                    .map(|(f, v)| f.len() + v.len() + 16)
                    .sum::<usize>()
            })
            .sum();
        let groups: usize = self
            .groups
            .iter()
            .map(|(name, grp)| {
                name.len()
                    + 64
                    + grp
                        .consumers
                        .iter()
                        .map(|(c, state)| c.len() + 32 + state.pending.len() * 48)
                        .sum::<usize>()
            })
            .sum();
        entries + groups
    }
}

impl Keyspace {
    /// Append to a stream, creating it on first write.
    pub fn xadd(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        id: Option<StreamId>,
        fields: &[(Bytes, Bytes)],
        now: u64,
    ) -> Result<StreamId, EngineError> {
        if fields.is_empty() {
            return Err(EngineError::invalid("stream entry needs at least one field"));
        }
        self.mutate(map, key, now, Some(|| Value::Stream(Stream::default())), |entry| {
            entry.value.as_stream_mut()?.add(id, fields.to_vec(), now)
        })
    }

    pub fn xlen(&self, map: &mut ShardMap, key: &Bytes, now: u64) -> Result<usize, EngineError> {
        match self.read_entry(map, key, now) {
            None => Ok(0),
            Some(entry) => Ok(entry.value.as_stream()?.len()),
        }
    }

    pub fn xrange(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        start: StreamId,
        end: StreamId,
        count: Option<usize>,
        now: u64,
    ) -> Result<Vec<(StreamId, Vec<(Bytes, Bytes)>)>, EngineError> {
        match self.read_entry(map, key, now) {
            None => Ok(Vec::new()),
            Some(entry) => Ok(entry.value.as_stream()?.range(start, end, count)),
        }
    }

    /// Create a consumer group on an existing stream.
    pub fn xgroup_create(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        group: &Bytes,
        start: StreamId,
        now: u64,
    ) -> Result<(), EngineError> {
        if self.peek(map, key, now).is_none() {
            return Err(EngineError::KeyNotFound);
        }
        self.mutate(map, key, now, None, |entry| {
            entry.value.as_stream_mut()?.create_group(group.clone(), start)
        })
    }

    pub fn xread_group(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        group: &Bytes,
        consumer: &Bytes,
        count: usize,
        now: u64,
    ) -> Result<Vec<(StreamId, Vec<(Bytes, Bytes)>)>, EngineError> {
        if self.peek(map, key, now).is_none() {
            return Err(EngineError::KeyNotFound);
        }
        self.mutate(map, key, now, None, |entry| {
            entry.value.as_stream_mut()?.read_group(group, consumer, count, now)
        })
    }

    pub fn xack(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        group: &Bytes,
        ids: &[StreamId],
        now: u64,
    ) -> Result<usize, EngineError> {
        if self.peek(map, key, now).is_none() {
            return Ok(0);
        }
        self.mutate(map, key, now, None, |entry| {
            Ok(entry.value.as_stream_mut()?.ack(group, ids))
        })
    }

    pub fn xpending(
        &self,
        map: &mut ShardMap,
        key: &Bytes,
        group: &Bytes,
        now: u64,
    ) -> Result<Vec<PendingSummary>, EngineError> {
        match self.read_entry(map, key, now) {
            None => Err(EngineError::KeyNotFound),
            Some(entry) => entry.value.as_stream()?.pending(group),
        }
    }
}
