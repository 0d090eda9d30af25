//! Error types for the engine.
//!
//! Two families, mirroring the two failure surfaces:
//! - [`EngineError`]: command-facing errors surfaced synchronously to the
//!   executor's caller. No operation partially applies before one of these
//!   is returned (validate-then-mutate ordering).
//! - [`PersistError`]: durability-path errors (journal and snapshot I/O,
//!   corrupt files). During normal operation these degrade durability
//!   rather than failing commands; at startup an unreadable snapshot plus
//!   an unreadable journal is fatal.

use thiserror::Error;

/// Command-facing error taxonomy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Operation against a key holding a different value type.
    #[error("operation against a key holding the wrong kind of value")]
    WrongType,

    /// Malformed or semantically invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Index, offset or count outside the valid range.
    #[error("{0} is out of range")]
    OutOfRange(String),

    /// Numeric operation on a string that does not parse as a number.
    #[error("value is not a number or out of range")]
    NotANumber,

    /// Memory limit reached and the eviction policy could not free space.
    #[error("command not allowed when used memory exceeds the limit")]
    OutOfMemory,

    /// A watched key was mutated between watch registration and commit.
    #[error("watched key modified before commit")]
    WatchConflict,

    /// The operation's contract distinguishes absence from an empty result.
    #[error("no such key")]
    KeyNotFound,
}

impl EngineError {
    /// Short identifier, stable across messages.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::WrongType => "WRONGTYPE",
            EngineError::InvalidArgument(_) => "EINVAL",
            EngineError::OutOfRange(_) => "ERANGE",
            EngineError::NotANumber => "ENAN",
            EngineError::OutOfMemory => "OOM",
            EngineError::WatchConflict => "CONFLICT",
            EngineError::KeyNotFound => "NOKEY",
        }
    }

    pub(crate) fn out_of_range(what: impl Into<String>) -> Self {
        EngineError::OutOfRange(what.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidArgument(msg.into())
    }
}

/// Durability-path error taxonomy.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot failed validation: bad magic, bad checksum, short read or
    /// trailing garbage. Restore never silently truncates.
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    /// File written by an incompatible engine version.
    #[error("unsupported on-disk format version {0}")]
    UnsupportedVersion(u32),

    /// The journal ends in an incomplete or checksum-failing record, the
    /// normal signature of a crash mid-append. Recoverable: replay stops at
    /// the last valid record and the engine continues.
    #[error("journal truncated at byte {offset}")]
    JournalReplayTruncated { offset: u64 },

    /// Journal header is unreadable; the file cannot be replayed at all.
    #[error("corrupt journal: {0}")]
    CorruptJournal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_codes_are_stable() {
        assert_eq!(EngineError::WrongType.code(), "WRONGTYPE");
        assert_eq!(EngineError::OutOfMemory.code(), "OOM");
        assert_eq!(EngineError::WatchConflict.code(), "CONFLICT");
    }

    #[test]
    fn display_messages() {
        let err = EngineError::invalid("stream id must increase");
        assert_eq!(err.to_string(), "invalid argument: stream id must increase");

        let err = EngineError::out_of_range("list index");
        assert_eq!(err.to_string(), "list index is out of range");
    }

    #[test]
    fn truncated_journal_is_distinguishable() {
        let err = PersistError::JournalReplayTruncated { offset: 42 };
        assert!(matches!(
            err,
            PersistError::JournalReplayTruncated { offset: 42 }
        ));
    }
}
