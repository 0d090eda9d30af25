//! Optimistic commits, composite-operation atomicity, blocking pops and
//! ordering guarantees.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kestrel_core::{Engine, EngineConfig, EngineError, Operation, Reply};

fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

fn engine() -> Engine {
    Engine::ephemeral(EngineConfig::default())
}

fn set_op(key: &str, value: &str) -> Operation {
    Operation::Set {
        key: b(key),
        value: b(value),
        ttl_ms: None,
        keep_ttl: false,
    }
}

#[test]
fn conditional_commit_succeeds_when_watched_keys_are_untouched() {
    let engine = engine();
    engine.execute(set_op("balance", "100")).unwrap();

    let token = engine.watch(&[b("balance")]);
    let replies = engine
        .execute_batch(
            &[
                Operation::IncrBy {
                    key: b("balance"),
                    delta: -30,
                },
                Operation::RPush {
                    key: b("ledger"),
                    elems: vec![b("withdraw:30")],
                },
            ],
            Some(&token),
        )
        .unwrap();
    assert_eq!(replies[0], Ok(Reply::Int(70)));
    assert_eq!(
        engine
            .execute(Operation::LLen { key: b("ledger") })
            .unwrap(),
        Reply::Int(1)
    );
}

#[test]
fn conditional_commit_fails_wholesale_on_conflict() {
    let engine = engine();
    engine.execute(set_op("balance", "100")).unwrap();

    let token = engine.watch(&[b("balance")]);
    // A concurrent writer gets there first.
    engine.execute(set_op("balance", "0")).unwrap();

    let err = engine
        .execute_batch(
            &[
                Operation::IncrBy {
                    key: b("balance"),
                    delta: -30,
                },
                Operation::RPush {
                    key: b("ledger"),
                    elems: vec![b("withdraw:30")],
                },
            ],
            Some(&token),
        )
        .unwrap_err();
    assert_eq!(err, EngineError::WatchConflict);

    // None of the enclosed operations were applied.
    assert_eq!(
        engine.execute(Operation::Get { key: b("balance") }).unwrap(),
        Reply::Bytes(b("0"))
    );
    assert_eq!(
        engine
            .execute(Operation::Exists {
                keys: vec![b("ledger")],
            })
            .unwrap(),
        Reply::Int(0)
    );
}

#[test]
fn conflict_is_detected_for_deletion_and_recreation() {
    let engine = engine();
    engine.execute(set_op("k", "v1")).unwrap();

    let token = engine.watch(&[b("k")]);
    // Delete and recreate with identical content: still a conflict,
    // because the key's version moved.
    engine
        .execute(Operation::Del { keys: vec![b("k")] })
        .unwrap();
    engine.execute(set_op("k", "v1")).unwrap();

    let err = engine
        .execute_batch(&[set_op("other", "x")], Some(&token))
        .unwrap_err();
    assert_eq!(err, EngineError::WatchConflict);
}

#[test]
fn same_key_operations_serialize_across_threads() {
    let engine = Arc::new(engine());
    let threads = 4;
    let per_thread = 250;

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let engine = engine.clone();
            std::thread::spawn(move || {
                for _ in 0..per_thread {
                    engine
                        .execute(Operation::IncrBy {
                            key: b("shared"),
                            delta: 1,
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(
        engine.execute(Operation::Get { key: b("shared") }).unwrap(),
        Reply::Bytes(b("1000"))
    );
}

#[test]
fn disjoint_keys_proceed_independently() {
    let engine = Arc::new(engine());
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let engine = engine.clone();
            std::thread::spawn(move || {
                let key = format!("worker:{i}");
                for n in 0..100 {
                    engine
                        .execute(Operation::RPush {
                            key: Bytes::from(key.clone()),
                            elems: vec![Bytes::from(n.to_string())],
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for i in 0..8 {
        assert_eq!(
            engine
                .execute(Operation::LLen {
                    key: b(&format!("worker:{i}")),
                })
                .unwrap(),
            Reply::Int(100)
        );
    }
}

#[tokio::test]
async fn blocking_pop_is_resolved_by_the_next_push() {
    let engine = Arc::new(engine());

    let consumer = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.blpop(&[b("jobs")], Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    engine
        .execute(Operation::RPush {
            key: b("jobs"),
            elems: vec![b("payload")],
        })
        .unwrap();

    let got = consumer.await.unwrap().unwrap();
    assert_eq!(got, Some((b("jobs"), b("payload"))));
    // The pop consumed the element.
    assert_eq!(
        engine
            .execute(Operation::Exists { keys: vec![b("jobs")] })
            .unwrap(),
        Reply::Int(0)
    );
}

#[tokio::test]
async fn blocking_pop_times_out_without_side_effects() {
    let engine = engine();
    let got = engine
        .blpop(&[b("nothing")], Duration::from_millis(40))
        .await
        .unwrap();
    assert_eq!(got, None);
    assert_eq!(
        engine
            .execute(Operation::Exists {
                keys: vec![b("nothing")],
            })
            .unwrap(),
        Reply::Int(0)
    );
}

#[tokio::test]
async fn blocking_pop_watches_multiple_keys() {
    let engine = Arc::new(engine());

    let consumer = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .blpop(&[b("q1"), b("q2")], Duration::from_secs(5))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    engine
        .execute(Operation::RPush {
            key: b("q2"),
            elems: vec![b("from-q2")],
        })
        .unwrap();

    let got = consumer.await.unwrap().unwrap();
    assert_eq!(got, Some((b("q2"), b("from-q2"))));
}

#[tokio::test]
async fn cancelled_blocking_pop_releases_its_registration() {
    let engine = Arc::new(engine());

    let consumer = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.blpop(&[b("q")], Duration::from_secs(60)).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    consumer.abort();
    let _ = consumer.await;

    // A later push is not consumed by the cancelled waiter.
    engine
        .execute(Operation::RPush {
            key: b("q"),
            elems: vec![b("survivor")],
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(
        engine.execute(Operation::LLen { key: b("q") }).unwrap(),
        Reply::Int(1)
    );
}

#[test]
fn batch_without_watch_still_excludes_interleaving() {
    // Observable contract: every enclosed operation applies, and the
    // batch's own reads see its own writes.
    let engine = engine();
    let replies = engine
        .execute_batch(
            &[
                set_op("a", "1"),
                Operation::IncrBy { key: b("a"), delta: 1 },
                Operation::Get { key: b("a") },
            ],
            None,
        )
        .unwrap();
    assert_eq!(replies[1], Ok(Reply::Int(2)));
    assert_eq!(replies[2], Ok(Reply::Bytes(b("2"))));
}

#[test]
fn batch_reports_per_operation_errors_without_rolling_back() {
    let engine = engine();
    engine.execute(set_op("text", "abc")).unwrap();

    let replies = engine
        .execute_batch(
            &[
                set_op("first", "applied"),
                Operation::IncrBy {
                    key: b("text"),
                    delta: 1,
                },
                set_op("second", "also-applied"),
            ],
            None,
        )
        .unwrap();
    assert_eq!(replies[0], Ok(Reply::Ok));
    assert_eq!(replies[1], Err(EngineError::NotANumber));
    assert_eq!(replies[2], Ok(Reply::Ok));

    assert_eq!(
        engine.execute(Operation::Get { key: b("first") }).unwrap(),
        Reply::Bytes(b("applied"))
    );
    assert_eq!(
        engine.execute(Operation::Get { key: b("second") }).unwrap(),
        Reply::Bytes(b("also-applied"))
    );
}
