//! The write journal: an append-only log of mutating operations.
//!
//! # Format
//!
//! ```text
//! +-------------------+
//! | Magic (5B)        |  "KSTRL"
//! +-------------------+
//! | Version (4B)      |  u32 little-endian
//! +-------------------+
//! | [Records...]      |
//! +-------------------+
//! ```
//!
//! Each record is framed `len: u32 | crc32: u32 | payload`, the checksum
//! covering the payload. The payload is self-describing: the executor's
//! clock reading, an opcode and its operands, with expiry deadlines stored
//! absolute so replay is deterministic. A trailing record that is short or
//! fails its checksum is the signature of a crash mid-append; replay stops
//! there and reports [`PersistError::JournalReplayTruncated`] instead of
//! failing recovery.
//!
//! Compaction rewrites the baseline as a snapshot and truncates this file
//! back to its header; see `snapshot_scheduler`.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;

use crate::error::PersistError;
use crate::store::stream::StreamId;

pub const JOURNAL_MAGIC: &[u8; 5] = b"KSTRL";
pub const JOURNAL_VERSION: u32 = 1;
pub const JOURNAL_HEADER_LEN: u64 = 9;

/// Upper bound on a single record frame; anything larger is treated as
/// corruption rather than an allocation request.
const MAX_RECORD_LEN: u32 = 1 << 31;

/// A mutating operation as recorded on disk.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalOp {
    Set {
        key: Bytes,
        value: Bytes,
        /// Resolved absolute deadline; `keep_ttl` and relative TTLs are
        /// resolved before the record is written.
        expire_at: Option<u64>,
    },
    Del {
        key: Bytes,
    },
    ExpireAt {
        key: Bytes,
        at: u64,
    },
    Persist {
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
    Append {
        key: Bytes,
        data: Bytes,
    },
    Push {
        key: Bytes,
        front: bool,
        elems: Vec<Bytes>,
    },
    Pop {
        key: Bytes,
        front: bool,
    },
    SAdd {
        key: Bytes,
        members: Vec<Bytes>,
    },
    SRem {
        key: Bytes,
        members: Vec<Bytes>,
    },
    ZAdd {
        key: Bytes,
        pairs: Vec<(f64, Bytes)>,
    },
    ZRem {
        key: Bytes,
        members: Vec<Bytes>,
    },
    ZIncrBy {
        key: Bytes,
        delta: f64,
        member: Bytes,
    },
    HSet {
        key: Bytes,
        pairs: Vec<(Bytes, Bytes)>,
    },
    HDel {
        key: Bytes,
        fields: Vec<Bytes>,
    },
    XAdd {
        key: Bytes,
        /// Always the concrete assigned ID, never "auto".
        id: StreamId,
        fields: Vec<(Bytes, Bytes)>,
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
        count: u64,
    },
    XAck {
        key: Bytes,
        group: Bytes,
        ids: Vec<StreamId>,
    },
    FlushAll,
}

impl JournalOp {
    /// The key this operation touches; None for keyspace-wide operations.
    pub fn key(&self) -> Option<&Bytes> {
        match self {
            JournalOp::Set { key, .. }
            | JournalOp::Del { key }
            | JournalOp::ExpireAt { key, .. }
            | JournalOp::Persist { key }
            | JournalOp::IncrBy { key, .. }
            | JournalOp::IncrByFloat { key, .. }
            | JournalOp::Append { key, .. }
            | JournalOp::Push { key, .. }
            | JournalOp::Pop { key, .. }
            | JournalOp::SAdd { key, .. }
            | JournalOp::SRem { key, .. }
            | JournalOp::ZAdd { key, .. }
            | JournalOp::ZRem { key, .. }
            | JournalOp::ZIncrBy { key, .. }
            | JournalOp::HSet { key, .. }
            | JournalOp::HDel { key, .. }
            | JournalOp::XAdd { key, .. }
            | JournalOp::XGroupCreate { key, .. }
            | JournalOp::XReadGroup { key, .. }
            | JournalOp::XAck { key, .. } => Some(key),
            JournalOp::FlushAll => None,
        }
    }

    /// Stable operation name, used for mutation events.
    pub fn name(&self) -> &'static str {
        match self {
            JournalOp::Set { .. } => "set",
            JournalOp::Del { .. } => "del",
            JournalOp::ExpireAt { .. } => "expire",
            JournalOp::Persist { .. } => "persist",
            JournalOp::IncrBy { .. } => "incrby",
            JournalOp::IncrByFloat { .. } => "incrbyfloat",
            JournalOp::Append { .. } => "append",
            JournalOp::Push { front: true, .. } => "lpush",
            JournalOp::Push { front: false, .. } => "rpush",
            JournalOp::Pop { front: true, .. } => "lpop",
            JournalOp::Pop { front: false, .. } => "rpop",
            JournalOp::SAdd { .. } => "sadd",
            JournalOp::SRem { .. } => "srem",
            JournalOp::ZAdd { .. } => "zadd",
            JournalOp::ZRem { .. } => "zrem",
            JournalOp::ZIncrBy { .. } => "zincrby",
            JournalOp::HSet { .. } => "hset",
            JournalOp::HDel { .. } => "hdel",
            JournalOp::XAdd { .. } => "xadd",
            JournalOp::XGroupCreate { .. } => "xgroup-create",
            JournalOp::XReadGroup { .. } => "xreadgroup",
            JournalOp::XAck { .. } => "xack",
            JournalOp::FlushAll => "flushall",
        }
    }
}

/// One journal record: the executor's clock reading plus the operation.
/// Replay applies the operation at the recorded time, reproducing the
/// original outcome exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalRecord {
    pub now: u64,
    pub op: JournalOp,
}

mod opcode {
    pub const SET: u8 = 1;
    pub const DEL: u8 = 2;
    pub const EXPIRE_AT: u8 = 3;
    pub const PERSIST: u8 = 4;
    pub const INCR_BY: u8 = 5;
    pub const INCR_BY_FLOAT: u8 = 6;
    pub const APPEND: u8 = 7;
    pub const PUSH: u8 = 8;
    pub const POP: u8 = 9;
    pub const SADD: u8 = 10;
    pub const SREM: u8 = 11;
    pub const ZADD: u8 = 12;
    pub const ZREM: u8 = 13;
    pub const ZINCR_BY: u8 = 14;
    pub const HSET: u8 = 15;
    pub const HDEL: u8 = 16;
    pub const XADD: u8 = 17;
    pub const XGROUP_CREATE: u8 = 18;
    pub const XREAD_GROUP: u8 = 19;
    pub const XACK: u8 = 20;
    pub const FLUSH_ALL: u8 = 21;
}

fn put_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
}

fn put_many(buf: &mut Vec<u8>, items: &[Bytes]) {
    buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
    for item in items {
        put_bytes(buf, item);
    }
}

fn put_id(buf: &mut Vec<u8>, id: StreamId) {
    buf.extend_from_slice(&(id.ms).to_le_bytes());
    buf.extend_from_slice(&(id.seq).to_le_bytes());
}

fn get_bytes(cur: &mut Cursor<&[u8]>) -> Result<Bytes, PersistError> {
    let len = cur.read_u32::<LittleEndian>()? as usize;
    let mut data = vec![0u8; len];
    cur.read_exact(&mut data)?;
    Ok(Bytes::from(data))
}

fn get_many(cur: &mut Cursor<&[u8]>) -> Result<Vec<Bytes>, PersistError> {
    let count = cur.read_u32::<LittleEndian>()? as usize;
    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        items.push(get_bytes(cur)?);
    }
    Ok(items)
}

fn get_id(cur: &mut Cursor<&[u8]>) -> Result<StreamId, PersistError> {
    let ms = cur.read_u64::<LittleEndian>()?;
    let seq = cur.read_u64::<LittleEndian>()?;
    Ok(StreamId::new(ms, seq))
}

impl JournalRecord {
    /// Serialize the payload (excluding the frame).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&(self.now).to_le_bytes());
        match &self.op {
            JournalOp::Set {
                key,
                value,
                expire_at,
            } => {
                buf.push(opcode::SET);
                put_bytes(&mut buf, key);
                put_bytes(&mut buf, value);
                buf.extend_from_slice(&(expire_at.unwrap_or(0)).to_le_bytes());
            }
            JournalOp::Del { key } => {
                buf.push(opcode::DEL);
                put_bytes(&mut buf, key);
            }
            JournalOp::ExpireAt { key, at } => {
                buf.push(opcode::EXPIRE_AT);
                put_bytes(&mut buf, key);
                buf.extend_from_slice(&(*at).to_le_bytes());
            }
            JournalOp::Persist { key } => {
                buf.push(opcode::PERSIST);
                put_bytes(&mut buf, key);
            }
            JournalOp::IncrBy { key, delta } => {
                buf.push(opcode::INCR_BY);
                put_bytes(&mut buf, key);
                buf.extend_from_slice(&(*delta).to_le_bytes());
            }
            JournalOp::IncrByFloat { key, delta } => {
                buf.push(opcode::INCR_BY_FLOAT);
                put_bytes(&mut buf, key);
                buf.extend_from_slice(&(*delta).to_le_bytes());
            }
            JournalOp::Append { key, data } => {
                buf.push(opcode::APPEND);
                put_bytes(&mut buf, key);
                put_bytes(&mut buf, data);
            }
            JournalOp::Push { key, front, elems } => {
                buf.push(opcode::PUSH);
                put_bytes(&mut buf, key);
                buf.push(u8::from(*front));
                put_many(&mut buf, elems);
            }
            JournalOp::Pop { key, front } => {
                buf.push(opcode::POP);
                put_bytes(&mut buf, key);
                buf.push(u8::from(*front));
            }
            JournalOp::SAdd { key, members } => {
                buf.push(opcode::SADD);
                put_bytes(&mut buf, key);
                put_many(&mut buf, members);
            }
            JournalOp::SRem { key, members } => {
                buf.push(opcode::SREM);
                put_bytes(&mut buf, key);
                put_many(&mut buf, members);
            }
            JournalOp::ZAdd { key, pairs } => {
                buf.push(opcode::ZADD);
                put_bytes(&mut buf, key);
                buf.extend_from_slice(&(pairs.len() as u32).to_le_bytes());
                for (score, member) in pairs {
                    buf.extend_from_slice(&(*score).to_le_bytes());
                    put_bytes(&mut buf, member);
                }
            }
            JournalOp::ZRem { key, members } => {
                buf.push(opcode::ZREM);
                put_bytes(&mut buf, key);
                put_many(&mut buf, members);
            }
            JournalOp::ZIncrBy { key, delta, member } => {
                buf.push(opcode::ZINCR_BY);
                put_bytes(&mut buf, key);
                buf.extend_from_slice(&(*delta).to_le_bytes());
                put_bytes(&mut buf, member);
            }
            JournalOp::HSet { key, pairs } => {
                buf.push(opcode::HSET);
                put_bytes(&mut buf, key);
                buf.extend_from_slice(&(pairs.len() as u32).to_le_bytes());
                for (field, value) in pairs {
                    put_bytes(&mut buf, field);
                    put_bytes(&mut buf, value);
                }
            }
            JournalOp::HDel { key, fields } => {
                buf.push(opcode::HDEL);
                put_bytes(&mut buf, key);
                put_many(&mut buf, fields);
            }
            JournalOp::XAdd { key, id, fields } => {
                buf.push(opcode::XADD);
                put_bytes(&mut buf, key);
                put_id(&mut buf, *id);
                buf.extend_from_slice(&(fields.len() as u32).to_le_bytes());
                for (field, value) in fields {
                    put_bytes(&mut buf, field);
                    put_bytes(&mut buf, value);
                }
            }
            JournalOp::XGroupCreate { key, group, start } => {
                buf.push(opcode::XGROUP_CREATE);
                put_bytes(&mut buf, key);
                put_bytes(&mut buf, group);
                put_id(&mut buf, *start);
            }
            JournalOp::XReadGroup {
                key,
                group,
                consumer,
                count,
            } => {
                buf.push(opcode::XREAD_GROUP);
                put_bytes(&mut buf, key);
                put_bytes(&mut buf, group);
                put_bytes(&mut buf, consumer);
                buf.extend_from_slice(&(*count).to_le_bytes());
            }
            JournalOp::XAck { key, group, ids } => {
                buf.push(opcode::XACK);
                put_bytes(&mut buf, key);
                put_bytes(&mut buf, group);
                buf.extend_from_slice(&(ids.len() as u32).to_le_bytes());
                for id in ids {
                    put_id(&mut buf, *id);
                }
            }
            JournalOp::FlushAll => buf.push(opcode::FLUSH_ALL),
        }
        buf
    }

    /// Parse a payload. The frame checksum has already been verified;
    /// failures here mean a foreign or newer format.
    pub fn decode(payload: &[u8]) -> Result<Self, PersistError> {
        let mut cur = Cursor::new(payload);
        let now = cur.read_u64::<LittleEndian>()?;
        let tag = cur.read_u8()?;
        let op = match tag {
            opcode::SET => {
                let key = get_bytes(&mut cur)?;
                let value = get_bytes(&mut cur)?;
                let raw = cur.read_u64::<LittleEndian>()?;
                JournalOp::Set {
                    key,
                    value,
                    expire_at: (raw != 0).then_some(raw),
                }
            }
            opcode::DEL => JournalOp::Del {
                key: get_bytes(&mut cur)?,
            },
            opcode::EXPIRE_AT => JournalOp::ExpireAt {
                key: get_bytes(&mut cur)?,
                at: cur.read_u64::<LittleEndian>()?,
            },
            opcode::PERSIST => JournalOp::Persist {
                key: get_bytes(&mut cur)?,
            },
            opcode::INCR_BY => JournalOp::IncrBy {
                key: get_bytes(&mut cur)?,
                delta: cur.read_i64::<LittleEndian>()?,
            },
            opcode::INCR_BY_FLOAT => JournalOp::IncrByFloat {
                key: get_bytes(&mut cur)?,
                delta: cur.read_f64::<LittleEndian>()?,
            },
            opcode::APPEND => JournalOp::Append {
                key: get_bytes(&mut cur)?,
                data: get_bytes(&mut cur)?,
            },
            opcode::PUSH => JournalOp::Push {
                key: get_bytes(&mut cur)?,
                front: cur.read_u8()? != 0,
                elems: get_many(&mut cur)?,
            },
            opcode::POP => JournalOp::Pop {
                key: get_bytes(&mut cur)?,
                front: cur.read_u8()? != 0,
            },
            opcode::SADD => JournalOp::SAdd {
                key: get_bytes(&mut cur)?,
                members: get_many(&mut cur)?,
            },
            opcode::SREM => JournalOp::SRem {
                key: get_bytes(&mut cur)?,
                members: get_many(&mut cur)?,
            },
            opcode::ZADD => {
                let key = get_bytes(&mut cur)?;
                let count = cur.read_u32::<LittleEndian>()? as usize;
                let mut pairs = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let score = cur.read_f64::<LittleEndian>()?;
                    pairs.push((score, get_bytes(&mut cur)?));
                }
                JournalOp::ZAdd { key, pairs }
            }
            opcode::ZREM => JournalOp::ZRem {
                key: get_bytes(&mut cur)?,
                members: get_many(&mut cur)?,
            },
            opcode::ZINCR_BY => JournalOp::ZIncrBy {
                key: get_bytes(&mut cur)?,
                delta: cur.read_f64::<LittleEndian>()?,
                member: get_bytes(&mut cur)?,
            },
            opcode::HSET => {
                let key = get_bytes(&mut cur)?;
                let count = cur.read_u32::<LittleEndian>()? as usize;
                let mut pairs = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let field = get_bytes(&mut cur)?;
                    pairs.push((field, get_bytes(&mut cur)?));
                }
                JournalOp::HSet { key, pairs }
            }
            opcode::HDEL => JournalOp::HDel {
                key: get_bytes(&mut cur)?,
                fields: get_many(&mut cur)?,
            },
            opcode::XADD => {
                let key = get_bytes(&mut cur)?;
                let id = get_id(&mut cur)?;
                let count = cur.read_u32::<LittleEndian>()? as usize;
                let mut fields = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let field = get_bytes(&mut cur)?;
                    fields.push((field, get_bytes(&mut cur)?));
                }
                JournalOp::XAdd { key, id, fields }
            }
            opcode::XGROUP_CREATE => JournalOp::XGroupCreate {
                key: get_bytes(&mut cur)?,
                group: get_bytes(&mut cur)?,
                start: get_id(&mut cur)?,
            },
            opcode::XREAD_GROUP => JournalOp::XReadGroup {
                key: get_bytes(&mut cur)?,
                group: get_bytes(&mut cur)?,
                consumer: get_bytes(&mut cur)?,
                count: cur.read_u64::<LittleEndian>()?,
            },
            opcode::XACK => {
                let key = get_bytes(&mut cur)?;
                let group = get_bytes(&mut cur)?;
                let count = cur.read_u32::<LittleEndian>()? as usize;
                let mut ids = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    ids.push(get_id(&mut cur)?);
                }
                JournalOp::XAck { key, group, ids }
            }
            opcode::FLUSH_ALL => JournalOp::FlushAll,
            other => {
                return Err(PersistError::CorruptJournal(format!(
                    "unknown opcode {other}"
                )));
            }
        };
        Ok(Self { now, op })
    }
}

/// Appending side of the journal. Flush/sync cadence is the caller's
/// decision; this type only buffers and frames.
pub struct JournalWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    len: u64,
}

impl JournalWriter {
    /// Open (or create) the journal for appending, writing the header on
    /// a fresh file.
    pub fn open(path: &Path) -> Result<Self, PersistError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        let mut writer = BufWriter::new(file);
        let len = if len == 0 {
            writer.write_all(JOURNAL_MAGIC)?;
            writer.write_u32::<LittleEndian>(JOURNAL_VERSION)?;
            writer.flush()?;
            JOURNAL_HEADER_LEN
        } else {
            len
        };
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            len,
        })
    }

    /// Append one record; returns the byte offset its frame starts at.
    pub fn append(&mut self, record: &JournalRecord) -> Result<u64, PersistError> {
        let payload = record.encode();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        let offset = self.len;
        self.writer.write_u32::<LittleEndian>(payload.len() as u32)?;
        self.writer.write_u32::<LittleEndian>(hasher.finalize())?;
        self.writer.write_all(&payload)?;
        self.len += 8 + payload.len() as u64;
        Ok(offset)
    }

    pub fn flush(&mut self) -> Result<(), PersistError> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flush and fsync to the platter.
    pub fn sync(&mut self) -> Result<(), PersistError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Bytes currently in the journal, buffered writes included.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len <= JOURNAL_HEADER_LEN
    }

    /// Discard all records: truncate back to a bare header. Used after a
    /// snapshot establishes a fresh baseline.
    pub fn reset(&mut self) -> Result<(), PersistError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(JOURNAL_MAGIC)?;
        writer.write_u32::<LittleEndian>(JOURNAL_VERSION)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        self.writer = writer;
        self.len = JOURNAL_HEADER_LEN;
        Ok(())
    }
}

/// Reading side, used for recovery and for restarting mutation feeds from
/// an offset.
pub struct JournalReader {
    reader: BufReader<File>,
    offset: u64,
}

impl JournalReader {
    pub fn open(path: &Path) -> Result<Self, PersistError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut header = [0u8; JOURNAL_HEADER_LEN as usize];
        reader
            .read_exact(&mut header)
            .map_err(|_| PersistError::CorruptJournal("header too short".into()))?;
        if &header[..5] != JOURNAL_MAGIC {
            return Err(PersistError::CorruptJournal("bad magic".into()));
        }
        let version = u32::from_le_bytes([header[5], header[6], header[7], header[8]]);
        if version != JOURNAL_VERSION {
            return Err(PersistError::UnsupportedVersion(version));
        }
        Ok(Self {
            reader,
            offset: JOURNAL_HEADER_LEN,
        })
    }

    /// Open and seek past records up to `offset` (a value previously
    /// returned by [`JournalWriter::append`]).
    pub fn open_at(path: &Path, offset: u64) -> Result<Self, PersistError> {
        let mut this = Self::open(path)?;
        if offset > JOURNAL_HEADER_LEN {
            this.reader.seek(SeekFrom::Start(offset))?;
            this.offset = offset;
        }
        Ok(this)
    }

    /// Byte offset of the next record to be read.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Next record with the offset it was stored at. `Ok(None)` at a clean
    /// end of file; `JournalReplayTruncated` when the tail is partial or
    /// fails its checksum.
    pub fn next_record(&mut self) -> Result<Option<(u64, JournalRecord)>, PersistError> {
        let start = self.offset;
        let mut frame = [0u8; 8];
        match read_full(&mut self.reader, &mut frame)? {
            0 => return Ok(None),
            8 => {}
            _ => return Err(PersistError::JournalReplayTruncated { offset: start }),
        }
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let crc = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        if len > MAX_RECORD_LEN {
            return Err(PersistError::JournalReplayTruncated { offset: start });
        }
        let mut payload = vec![0u8; len as usize];
        if read_full(&mut self.reader, &mut payload)? != payload.len() {
            return Err(PersistError::JournalReplayTruncated { offset: start });
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != crc {
            return Err(PersistError::JournalReplayTruncated { offset: start });
        }
        let record = JournalRecord::decode(&payload)
            .map_err(|_| PersistError::JournalReplayTruncated { offset: start })?;
        self.offset += 8 + len as u64;
        Ok(Some((start, record)))
    }
}

/// Read until `buf` is full or EOF; returns bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
