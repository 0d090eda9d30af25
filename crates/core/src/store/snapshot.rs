//! Snapshots: a self-contained, consistent serialization of the keyspace.
//!
//! # Format
//!
//! ```text
//! +----------------+
//! | Magic (5B)     |  "KSTRL"
//! +----------------+
//! | Version (4B)   |  u32 little-endian
//! +----------------+
//! | Timestamp (8B) |  u64 unix millis
//! +----------------+
//! | [Entries...]   |  typed records
//! +----------------+
//! | EOF Marker     |  0xFF
//! +----------------+
//! | Entry Count    |  u64
//! +----------------+
//! | Checksum (4B)  |  CRC32 of all preceding bytes
//! +----------------+
//! ```
//!
//! Each entry record is `kind: u8 | key | expire_at: u64 (0 = none) |
//! kind-specific payload`. Unordered containers are written in sorted
//! order so identical keyspaces serialize identically. Anything wrong
//! (bad magic, short read, count or checksum mismatch, trailing bytes)
//! fails restore with `CorruptSnapshot`; restore never silently truncates.

use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Write};

use bytes::Bytes;
use crc32fast::Hasher;
use hashbrown::HashMap;

use crate::error::PersistError;
use crate::store::entry::Entry;
use crate::store::stream::{Consumer, ConsumerGroup, PendingEntry, Stream, StreamId};
use crate::store::value::Value;
use crate::store::zset::SortedSet;

pub const SNAPSHOT_MAGIC: &[u8; 5] = b"KSTRL";
pub const SNAPSHOT_VERSION: u32 = 1;

const EOF_MARKER: u8 = 0xFF;

mod kind {
    pub const STR: u8 = 0;
    pub const LIST: u8 = 1;
    pub const SET: u8 = 2;
    pub const ZSET: u8 = 3;
    pub const HASH: u8 = 4;
    pub const STREAM: u8 = 5;
}

/// Streaming snapshot writer. Entries are fed one at a time; `finish`
/// seals the file with the count and checksum footer.
pub struct SnapshotWriter<W: Write> {
    writer: W,
    hasher: Hasher,
    count: u64,
}

impl<W: Write> SnapshotWriter<W> {
    pub fn new(writer: W, timestamp: u64) -> Result<Self, PersistError> {
        let mut this = Self {
            writer,
            hasher: Hasher::new(),
            count: 0,
        };
        this.put(SNAPSHOT_MAGIC)?;
        this.put(&SNAPSHOT_VERSION.to_le_bytes())?;
        this.put(&timestamp.to_le_bytes())?;
        Ok(this)
    }

    /// Write one entry (key, typed value, expiry).
    pub fn write_entry(&mut self, key: &[u8], entry: &Entry) -> Result<(), PersistError> {
        let expire = entry.expire_at.unwrap_or(0);
        match &entry.value {
            Value::Str(data) => {
                self.entry_header(kind::STR, key, expire)?;
                self.put_bytes(data)?;
            }
            Value::List(list) => {
                self.entry_header(kind::LIST, key, expire)?;
                self.put(&(list.len() as u32).to_le_bytes())?;
                for elem in list {
                    self.put_bytes(elem)?;
                }
            }
            Value::Set(set) => {
                self.entry_header(kind::SET, key, expire)?;
                let mut members: Vec<&Bytes> = set.iter().collect();
                members.sort();
                self.put(&(members.len() as u32).to_le_bytes())?;
                for member in members {
                    self.put_bytes(member)?;
                }
            }
            Value::Zset(zset) => {
                self.entry_header(kind::ZSET, key, expire)?;
                let sorted = zset.sorted();
                self.put(&(sorted.len() as u32).to_le_bytes())?;
                for (member, score) in sorted {
                    self.put(&score.to_le_bytes())?;
                    self.put_bytes(&member)?;
                }
            }
            Value::Hash(hash) => {
                self.entry_header(kind::HASH, key, expire)?;
                let mut pairs: Vec<(&Bytes, &Bytes)> = hash.iter().collect();
                pairs.sort_by(|a, b| a.0.cmp(b.0));
                self.put(&(pairs.len() as u32).to_le_bytes())?;
                for (field, value) in pairs {
                    self.put_bytes(field)?;
                    self.put_bytes(value)?;
                }
            }
            Value::Stream(stream) => {
                self.entry_header(kind::STREAM, key, expire)?;
                self.write_stream(stream)?;
            }
        }
        self.count += 1;
        Ok(())
    }

    fn write_stream(&mut self, stream: &Stream) -> Result<(), PersistError> {
        self.put(&(stream.entries.len() as u64).to_le_bytes())?;
        for (id, fields) in &stream.entries {
            self.put_id(*id)?;
            self.put(&(fields.len() as u32).to_le_bytes())?;
            for (field, value) in fields {
                self.put_bytes(field)?;
                self.put_bytes(value)?;
            }
        }
        self.put_id(stream.last_id)?;

        let mut groups: Vec<(&Bytes, &ConsumerGroup)> = stream.groups.iter().collect();
        groups.sort_by(|a, b| a.0.cmp(b.0));
        self.put(&(groups.len() as u32).to_le_bytes())?;
        for (name, group) in groups {
            self.put_bytes(name)?;
            self.put_id(group.last_delivered)?;
            let mut consumers: Vec<(&Bytes, &Consumer)> = group.consumers.iter().collect();
            consumers.sort_by(|a, b| a.0.cmp(b.0));
            self.put(&(consumers.len() as u32).to_le_bytes())?;
            for (consumer, state) in consumers {
                self.put_bytes(consumer)?;
                self.put(&(state.pending.len() as u32).to_le_bytes())?;
                for (id, pending) in &state.pending {
                    self.put_id(*id)?;
                    self.put(&pending.delivery_count.to_le_bytes())?;
                    self.put(&pending.last_delivery_ms.to_le_bytes())?;
                }
            }
        }
        Ok(())
    }

    /// Seal the snapshot; returns the inner writer flushed.
    pub fn finish(mut self) -> Result<W, PersistError> {
        self.put(&[EOF_MARKER])?;
        let count = self.count;
        self.put(&count.to_le_bytes())?;
        let checksum = self.hasher.clone().finalize();
        self.writer.write_all(&checksum.to_le_bytes())?;
        self.writer.flush()?;
        Ok(self.writer)
    }

    fn entry_header(&mut self, kind: u8, key: &[u8], expire: u64) -> Result<(), PersistError> {
        self.put(&[kind])?;
        self.put_bytes(key)?;
        self.put(&expire.to_le_bytes())?;
        Ok(())
    }

    fn put(&mut self, data: &[u8]) -> Result<(), PersistError> {
        self.writer.write_all(data)?;
        self.hasher.update(data);
        Ok(())
    }

    fn put_id(&mut self, id: StreamId) -> Result<(), PersistError> {
        self.put(&id.ms.to_le_bytes())?;
        self.put(&id.seq.to_le_bytes())
    }

    fn put_bytes(&mut self, data: &[u8]) -> Result<(), PersistError> {
        self.put(&(data.len() as u32).to_le_bytes())?;
        self.put(data)
    }
}

/// Snapshot reader. Validates the header up front and the count/checksum
/// footer after the last entry.
#[derive(Debug)]
pub struct SnapshotReader<R: Read> {
    reader: R,
    hasher: Hasher,
    timestamp: u64,
}

impl<R: Read> SnapshotReader<R> {
    pub fn new(mut reader: R) -> Result<Self, PersistError> {
        let mut hasher = Hasher::new();
        let mut magic = [0u8; 5];
        reader
            .read_exact(&mut magic)
            .map_err(|_| PersistError::CorruptSnapshot("header too short".into()))?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(PersistError::CorruptSnapshot("bad magic".into()));
        }
        hasher.update(&magic);

        let mut word = [0u8; 4];
        reader
            .read_exact(&mut word)
            .map_err(|_| PersistError::CorruptSnapshot("header too short".into()))?;
        let version = u32::from_le_bytes(word);
        if version != SNAPSHOT_VERSION {
            return Err(PersistError::UnsupportedVersion(version));
        }
        hasher.update(&word);

        let mut stamp = [0u8; 8];
        reader
            .read_exact(&mut stamp)
            .map_err(|_| PersistError::CorruptSnapshot("header too short".into()))?;
        hasher.update(&stamp);

        Ok(Self {
            reader,
            hasher,
            timestamp: u64::from_le_bytes(stamp),
        })
    }

    /// When the snapshot was taken, unix milliseconds.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Read every entry, verify the footer and reject trailing garbage.
    /// Returns the entry count.
    pub fn read_entries(
        mut self,
        mut visit: impl FnMut(Bytes, Value, Option<u64>),
    ) -> Result<u64, PersistError> {
        let mut count = 0u64;
        loop {
            let tag = self.take_u8()?;
            if tag == EOF_MARKER {
                break;
            }
            let key = self.take_bytes()?;
            let expire_raw = self.take_u64()?;
            let expire_at = (expire_raw != 0).then_some(expire_raw);
            let value = match tag {
                kind::STR => Value::Str(self.take_bytes()?),
                kind::LIST => {
                    let n = self.take_u32()? as usize;
                    let mut list = VecDeque::with_capacity(n.min(4096));
                    for _ in 0..n {
                        list.push_back(self.take_bytes()?);
                    }
                    Value::List(list)
                }
                kind::SET => {
                    let n = self.take_u32()? as usize;
                    let mut set = hashbrown::HashSet::with_capacity(n.min(4096));
                    for _ in 0..n {
                        set.insert(self.take_bytes()?);
                    }
                    Value::Set(set)
                }
                kind::ZSET => {
                    let n = self.take_u32()? as usize;
                    let mut zset = SortedSet::default();
                    for _ in 0..n {
                        let score = f64::from_le_bytes(self.take_array::<8>()?);
                        let member = self.take_bytes()?;
                        zset.insert(member, score);
                    }
                    Value::Zset(zset)
                }
                kind::HASH => {
                    let n = self.take_u32()? as usize;
                    let mut hash = HashMap::with_capacity(n.min(4096));
                    for _ in 0..n {
                        let field = self.take_bytes()?;
                        hash.insert(field, self.take_bytes()?);
                    }
                    Value::Hash(hash)
                }
                kind::STREAM => Value::Stream(self.read_stream()?),
                other => {
                    return Err(PersistError::CorruptSnapshot(format!(
                        "unknown entry kind {other}"
                    )));
                }
            };
            visit(key, value, expire_at);
            count += 1;
        }

        let stored_count = self.take_u64()?;
        if stored_count != count {
            return Err(PersistError::CorruptSnapshot(format!(
                "entry count mismatch: read {count}, footer says {stored_count}"
            )));
        }

        let expected = self.hasher.clone().finalize();
        let mut checksum = [0u8; 4];
        self.reader
            .read_exact(&mut checksum)
            .map_err(|_| PersistError::CorruptSnapshot("missing checksum".into()))?;
        if u32::from_le_bytes(checksum) != expected {
            return Err(PersistError::CorruptSnapshot("checksum mismatch".into()));
        }

        // Anything after the checksum is not ours.
        let mut probe = [0u8; 1];
        if self.reader.read(&mut probe)? != 0 {
            return Err(PersistError::CorruptSnapshot(
                "trailing data after checksum".into(),
            ));
        }
        Ok(count)
    }

    fn read_stream(&mut self) -> Result<Stream, PersistError> {
        let entry_count = self.take_u64()?;
        let mut entries = BTreeMap::new();
        for _ in 0..entry_count {
            let id = self.take_id()?;
            let field_count = self.take_u32()? as usize;
            let mut fields = Vec::with_capacity(field_count.min(1024));
            for _ in 0..field_count {
                let field = self.take_bytes()?;
                fields.push((field, self.take_bytes()?));
            }
            entries.insert(id, fields);
        }
        let last_id = self.take_id()?;

        let group_count = self.take_u32()? as usize;
        let mut groups = HashMap::with_capacity(group_count.min(1024));
        for _ in 0..group_count {
            let name = self.take_bytes()?;
            let last_delivered = self.take_id()?;
            let consumer_count = self.take_u32()? as usize;
            let mut consumers = HashMap::with_capacity(consumer_count.min(1024));
            for _ in 0..consumer_count {
                let consumer_name = self.take_bytes()?;
                let pending_count = self.take_u32()? as usize;
                let mut pending = BTreeMap::new();
                for _ in 0..pending_count {
                    let id = self.take_id()?;
                    let delivery_count = self.take_u64()?;
                    let last_delivery_ms = self.take_u64()?;
                    pending.insert(
                        id,
                        PendingEntry {
                            delivery_count,
                            last_delivery_ms,
                        },
                    );
                }
                consumers.insert(consumer_name, Consumer { pending });
            }
            groups.insert(
                name,
                ConsumerGroup {
                    last_delivered,
                    consumers,
                },
            );
        }
        Ok(Stream {
            entries,
            last_id,
            groups,
        })
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], PersistError> {
        let mut buf = [0u8; N];
        self.reader
            .read_exact(&mut buf)
            .map_err(|_| PersistError::CorruptSnapshot("unexpected end of file".into()))?;
        self.hasher.update(&buf);
        Ok(buf)
    }

    fn take_u8(&mut self) -> Result<u8, PersistError> {
        Ok(self.take_array::<1>()?[0])
    }

    fn take_u32(&mut self) -> Result<u32, PersistError> {
        Ok(u32::from_le_bytes(self.take_array::<4>()?))
    }

    fn take_u64(&mut self) -> Result<u64, PersistError> {
        Ok(u64::from_le_bytes(self.take_array::<8>()?))
    }

    fn take_id(&mut self) -> Result<StreamId, PersistError> {
        let ms = self.take_u64()?;
        let seq = self.take_u64()?;
        Ok(StreamId::new(ms, seq))
    }

    fn take_bytes(&mut self) -> Result<Bytes, PersistError> {
        let len = self.take_u32()? as usize;
        let mut data = vec![0u8; len];
        self.reader
            .read_exact(&mut data)
            .map_err(|_| PersistError::CorruptSnapshot("unexpected end of file".into()))?;
        self.hasher.update(&data);
        Ok(Bytes::from(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn entry(value: Value, expire_at: Option<u64>) -> Entry {
        let mut e = Entry::new(value, 0, 1);
        e.expire_at = expire_at;
        e
    }

    fn mixed_entries() -> Vec<(Bytes, Entry)> {
        let mut set = hashbrown::HashSet::new();
        set.insert(b("m1"));
        set.insert(b("m2"));

        let mut zset = SortedSet::default();
        zset.insert(b("a"), 2.0);
        zset.insert(b("b"), 1.0);

        let mut hash = HashMap::new();
        hash.insert(b("f"), b("v"));

        let mut stream = Stream::default();
        stream
            .add(Some(StreamId::new(5, 1)), vec![(b("k"), b("v"))], 0)
            .unwrap();
        stream.create_group(b("g"), StreamId::ZERO).unwrap();
        stream.read_group(&b("g"), &b("c"), 10, 77).unwrap();

        vec![
            (b("str"), entry(Value::Str(b("hello")), Some(9_000))),
            (
                b("list"),
                entry(Value::List(VecDeque::from([b("x"), b("y")])), None),
            ),
            (b("set"), entry(Value::Set(set), None)),
            (b("zset"), entry(Value::Zset(zset), None)),
            (b("hash"), entry(Value::Hash(hash), None)),
            (b("stream"), entry(Value::Stream(stream), None)),
        ]
    }

    fn snapshot_bytes(entries: &[(Bytes, Entry)]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut writer = SnapshotWriter::new(&mut buf, 1234).unwrap();
        for (key, e) in entries {
            writer.write_entry(key, e).unwrap();
        }
        writer.finish().unwrap();
        buf
    }

    #[test]
    fn round_trip_preserves_every_kind() {
        let entries = mixed_entries();
        let buf = snapshot_bytes(&entries);

        let reader = SnapshotReader::new(Cursor::new(&buf)).unwrap();
        assert_eq!(reader.timestamp(), 1234);

        let mut restored = Vec::new();
        let count = reader
            .read_entries(|key, value, expire| restored.push((key, value, expire)))
            .unwrap();
        assert_eq!(count, 6);

        for ((key, original), (rkey, rvalue, rexpire)) in entries.iter().zip(&restored) {
            assert_eq!(key, rkey);
            assert_eq!(original.expire_at, *rexpire);
            assert_eq!(original.value.kind(), rvalue.kind());
        }

        // Spot-check deep stream state survived.
        let (_, stream_value, _) = &restored[5];
        let stream = stream_value.as_stream().unwrap();
        assert_eq!(stream.last_id(), StreamId::new(5, 1));
        let pending = stream.pending(&b("g")).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].consumer, b("c"));
        assert_eq!(pending[0].last_delivery_ms, 77);
    }

    #[test]
    fn identical_keyspaces_serialize_identically() {
        let a = snapshot_bytes(&mixed_entries());
        let b = snapshot_bytes(&mixed_entries());
        assert_eq!(a, b);
    }

    #[test]
    fn corrupted_byte_fails_restore() {
        let mut buf = snapshot_bytes(&mixed_entries());
        let mid = buf.len() / 2;
        buf[mid] ^= 0xFF;
        let outcome = SnapshotReader::new(Cursor::new(&buf))
            .and_then(|r| r.read_entries(|_, _, _| {}));
        assert!(outcome.is_err());
    }

    #[test]
    fn trailing_garbage_fails_restore() {
        let mut buf = snapshot_bytes(&mixed_entries());
        buf.extend_from_slice(b"junk");
        let err = SnapshotReader::new(Cursor::new(&buf))
            .and_then(|r| r.read_entries(|_, _, _| {}))
            .unwrap_err();
        assert!(matches!(err, PersistError::CorruptSnapshot(_)));
    }

    #[test]
    fn truncated_snapshot_fails_restore() {
        let buf = snapshot_bytes(&mixed_entries());
        let cut = &buf[..buf.len() - 7];
        let err = SnapshotReader::new(Cursor::new(cut))
            .and_then(|r| r.read_entries(|_, _, _| {}))
            .unwrap_err();
        assert!(matches!(err, PersistError::CorruptSnapshot(_)));
    }

    #[test]
    fn foreign_file_is_rejected() {
        let err = SnapshotReader::new(Cursor::new(b"GARBAGEFILE".to_vec())).unwrap_err();
        assert!(matches!(err, PersistError::CorruptSnapshot(_)));
    }
}
