//! Crash-recovery integration tests: journal replay, snapshot restore,
//! compaction, and tolerance of torn writes.

use std::io::Write as _;

use bytes::Bytes;
use kestrel_core::{Engine, EngineConfig, Operation, Reply, StreamId, TtlState};
use tempfile::tempdir;

fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

fn config() -> EngineConfig {
    EngineConfig::default()
}

fn seed_mixed_state(engine: &Engine) {
    engine
        .execute(Operation::Set {
            key: b("counter"),
            value: b("1"),
            ttl_ms: None,
            keep_ttl: false,
        })
        .unwrap();
    engine
        .execute(Operation::IncrBy {
            key: b("counter"),
            delta: 41,
        })
        .unwrap();
    engine
        .execute(Operation::RPush {
            key: b("queue"),
            elems: vec![b("a"), b("b"), b("c")],
        })
        .unwrap();
    engine
        .execute(Operation::LPop { key: b("queue") })
        .unwrap();
    engine
        .execute(Operation::SAdd {
            key: b("tags"),
            members: vec![b("red"), b("blue")],
        })
        .unwrap();
    engine
        .execute(Operation::ZAdd {
            key: b("board"),
            pairs: vec![(2.5, b("alice")), (1.0, b("bob"))],
        })
        .unwrap();
    engine
        .execute(Operation::HSet {
            key: b("user:1"),
            pairs: vec![(b("name"), b("Ada"))],
        })
        .unwrap();
    engine
        .execute(Operation::XAdd {
            key: b("events"),
            id: Some(StreamId::new(100, 0)),
            fields: vec![(b("kind"), b("login"))],
        })
        .unwrap();
    engine
        .execute(Operation::XGroupCreate {
            key: b("events"),
            group: b("g"),
            start: StreamId::ZERO,
        })
        .unwrap();
    engine
        .execute(Operation::XReadGroup {
            key: b("events"),
            group: b("g"),
            consumer: b("c1"),
            count: 10,
        })
        .unwrap();
    engine
        .execute(Operation::Set {
            key: b("volatile"),
            value: b("v"),
            ttl_ms: Some(3_600_000),
            keep_ttl: false,
        })
        .unwrap();
}

fn assert_mixed_state(engine: &Engine) {
    assert_eq!(
        engine.execute(Operation::Get { key: b("counter") }).unwrap(),
        Reply::Bytes(b("42"))
    );
    assert_eq!(
        engine
            .execute(Operation::LRange {
                key: b("queue"),
                start: 0,
                stop: -1,
            })
            .unwrap(),
        Reply::Array(vec![b("b"), b("c")])
    );
    assert_eq!(
        engine
            .execute(Operation::SMembers { key: b("tags") })
            .unwrap(),
        Reply::Array(vec![b("blue"), b("red")])
    );
    assert_eq!(
        engine
            .execute(Operation::ZRange {
                key: b("board"),
                start: 0,
                stop: -1,
            })
            .unwrap(),
        Reply::Scored(vec![(b("bob"), 1.0), (b("alice"), 2.5)])
    );
    assert_eq!(
        engine
            .execute(Operation::HGet {
                key: b("user:1"),
                field: b("name"),
            })
            .unwrap(),
        Reply::Bytes(b("Ada"))
    );
    assert_eq!(
        engine.execute(Operation::XLen { key: b("events") }).unwrap(),
        Reply::Int(1)
    );
    // The consumer-group cursor and pending entry survived.
    match engine
        .execute(Operation::XPending {
            key: b("events"),
            group: b("g"),
        })
        .unwrap()
    {
        Reply::Pending(rows) => {
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].id, StreamId::new(100, 0));
            assert_eq!(rows[0].consumer, b("c1"));
        }
        other => panic!("unexpected reply {other:?}"),
    }
    match engine
        .execute(Operation::Ttl { key: b("volatile") })
        .unwrap()
    {
        Reply::Ttl(TtlState::Remaining(_)) => {}
        other => panic!("expected a surviving deadline, got {other:?}"),
    }
}

#[test]
fn journal_replay_reconstructs_state() {
    let dir = tempdir().unwrap();

    {
        let engine = Engine::open(config(), dir.path()).unwrap();
        seed_mixed_state(&engine);
        engine.shutdown().unwrap();
    }

    let engine = Engine::open(config(), dir.path()).unwrap();
    assert_mixed_state(&engine);
}

#[test]
fn snapshot_plus_journal_tail_reconstructs_state() {
    let dir = tempdir().unwrap();

    {
        let engine = Engine::open(config(), dir.path()).unwrap();
        seed_mixed_state(&engine);
        // Compaction: snapshot becomes the baseline, journal restarts.
        engine.save_snapshot().unwrap();
        // Post-snapshot writes live only in the journal tail.
        engine
            .execute(Operation::Set {
                key: b("after-snapshot"),
                value: b("tail"),
                ttl_ms: None,
                keep_ttl: false,
            })
            .unwrap();
        engine.shutdown().unwrap();
    }

    let engine = Engine::open(config(), dir.path()).unwrap();
    assert_mixed_state(&engine);
    assert_eq!(
        engine
            .execute(Operation::Get {
                key: b("after-snapshot"),
            })
            .unwrap(),
        Reply::Bytes(b("tail"))
    );
}

#[test]
fn torn_journal_tail_recovers_the_valid_prefix() {
    let dir = tempdir().unwrap();

    {
        let engine = Engine::open(config(), dir.path()).unwrap();
        seed_mixed_state(&engine);
        engine.shutdown().unwrap();
    }

    // Simulate a crash mid-append: half a frame of garbage at the tail.
    let journal_path = dir.path().join("journal.kst");
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(&journal_path)
        .unwrap();
    file.write_all(&[0xDE, 0xAD, 0xBE]).unwrap();
    file.sync_all().unwrap();

    let engine = Engine::open(config(), dir.path()).unwrap();
    assert_mixed_state(&engine);

    // The engine keeps accepting and persisting writes after recovery.
    engine
        .execute(Operation::Set {
            key: b("post-crash"),
            value: b("ok"),
            ttl_ms: None,
            keep_ttl: false,
        })
        .unwrap();
    engine.shutdown().unwrap();

    let engine = Engine::open(config(), dir.path()).unwrap();
    assert_eq!(
        engine
            .execute(Operation::Get {
                key: b("post-crash"),
            })
            .unwrap(),
        Reply::Bytes(b("ok"))
    );
}

#[test]
fn expired_deadline_is_absent_after_recovery() {
    let dir = tempdir().unwrap();

    {
        let engine = Engine::open(config(), dir.path()).unwrap();
        engine
            .execute(Operation::Set {
                key: b("flash"),
                value: b("v"),
                ttl_ms: Some(10),
                keep_ttl: false,
            })
            .unwrap();
        engine.shutdown().unwrap();
    }

    std::thread::sleep(std::time::Duration::from_millis(30));
    let engine = Engine::open(config(), dir.path()).unwrap();
    assert_eq!(
        engine
            .execute(Operation::Exists {
                keys: vec![b("flash")],
            })
            .unwrap(),
        Reply::Int(0)
    );
}

#[test]
fn snapshot_stream_round_trip_through_memory() {
    let source = Engine::ephemeral(config());
    seed_mixed_state(&source);

    let mut buf = Vec::new();
    let written = source.write_snapshot(&mut buf).unwrap();
    assert!(written > 0);

    let restored = Engine::restore(config(), buf.as_slice()).unwrap();
    assert_mixed_state(&restored);
    assert_eq!(
        source.execute(Operation::DbSize).unwrap(),
        restored.execute(Operation::DbSize).unwrap()
    );
}

#[test]
fn corrupt_snapshot_with_readable_journal_is_not_fatal() {
    let dir = tempdir().unwrap();

    {
        let engine = Engine::open(config(), dir.path()).unwrap();
        seed_mixed_state(&engine);
        engine.shutdown().unwrap();
    }

    // A corrupt snapshot alongside a readable journal: recovery falls
    // back to replaying the journal from scratch.
    std::fs::write(dir.path().join("dump.kst"), b"this is not a snapshot").unwrap();
    let engine = Engine::open(config(), dir.path()).unwrap();
    assert_mixed_state(&engine);
}

#[test]
fn events_are_replayable_from_a_journal_offset() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(config(), dir.path()).unwrap();

    engine
        .execute(Operation::Set {
            key: b("k1"),
            value: b("v"),
            ttl_ms: None,
            keep_ttl: false,
        })
        .unwrap();
    engine
        .execute(Operation::RPush {
            key: b("k2"),
            elems: vec![b("x")],
        })
        .unwrap();

    let events = engine.events_from(0).unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, "set");
    assert_eq!(events[0].key, b("k1"));
    assert_eq!(events[1].kind, "rpush");
    assert_eq!(events[1].key, b("k2"));

    // Restarting from the second record's offset skips the first.
    let offset = events[1].offset.unwrap();
    let tail = engine.events_from(offset).unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].key, b("k2"));
}
