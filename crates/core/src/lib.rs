//! kestrel-core: an in-memory multi-model key-value engine.
//!
//! The engine stores strings, lists, sets, sorted sets, hashes and
//! streams in a sharded concurrent keyspace with per-key expiration,
//! memory-bounded eviction and crash-recoverable persistence: every
//! mutation is framed into an append-only journal, and point-in-time
//! snapshots compact that journal while doubling as backups.
//!
//! The wire protocol, client handling, clustering and auth live outside
//! this crate; they drive the engine through [`Engine::execute`] and the
//! mutation feed.
//!
//! ```no_run
//! use kestrel_core::{Engine, EngineConfig, Operation, Reply};
//! use bytes::Bytes;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::open(EngineConfig::default(), "/var/lib/kestrel")?;
//! engine.execute(Operation::Set {
//!     key: Bytes::from("greeting"),
//!     value: Bytes::from("hello"),
//!     ttl_ms: None,
//!     keep_ttl: false,
//! })?;
//! assert_eq!(
//!     engine.execute(Operation::Get { key: Bytes::from("greeting") })?,
//!     Reply::Bytes(Bytes::from("hello")),
//! );
//! # Ok(())
//! # }
//! ```

pub mod blocking;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod pattern;
pub mod store;

pub use config::{EngineConfig, EvictionPolicy, FsyncPolicy, SweepConfig};
pub use engine::{Engine, Maintenance, Operation, Reply, WatchToken};
pub use error::{EngineError, PersistError};
pub use events::{MutationEvent, MutationFeed};
pub use store::stream::{PendingSummary, StreamId};
pub use store::{Entry, Keyspace, TtlState, Value, ValueKind};

/// Wall clock in unix milliseconds, the engine's single time source.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
