//! Mutation events.
//!
//! Every successful mutation publishes a [`MutationEvent`] carrying the
//! key, the operation name and, when the engine is persistent, the
//! journal offset of its record. Feeds are pattern-filtered and lazy; a
//! consumer that lost its place can re-read historical events from a
//! journal offset via the engine and then resume a live feed. This is the
//! hook the external replication and pub/sub layers consume.

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::warn;

use crate::pattern::Pattern;

/// One observed mutation.
#[derive(Debug, Clone)]
pub struct MutationEvent {
    /// Affected key; empty for keyspace-wide operations (flush).
    pub key: Bytes,
    /// Stable operation name, e.g. `"set"`, `"lpush"`, `"del"`.
    pub kind: &'static str,
    /// Offset of the corresponding journal record, when one was written.
    pub offset: Option<u64>,
    /// Executor clock reading at apply time, unix milliseconds.
    pub at: u64,
}

pub(crate) struct EventBus {
    tx: broadcast::Sender<MutationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish; a bus with no subscribers simply drops the event.
    pub fn publish(&self, event: MutationEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self, pattern: Pattern) -> MutationFeed {
        MutationFeed {
            rx: self.tx.subscribe(),
            pattern,
        }
    }
}

/// A lazy, infinite sequence of mutations whose keys match a pattern.
pub struct MutationFeed {
    rx: broadcast::Receiver<MutationEvent>,
    pattern: Pattern,
}

impl MutationFeed {
    /// Next matching event. `None` once the engine is gone. A slow
    /// consumer that overflows the bus skips the lost events (with a
    /// warning) rather than stalling the engine.
    pub async fn recv(&mut self) -> Option<MutationEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    // Keyspace-wide events reach every subscriber.
                    if event.key.is_empty() || self.pattern.matches(&event.key) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "mutation feed lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn event(key: &str, kind: &'static str) -> MutationEvent {
        MutationEvent {
            key: b(key),
            kind,
            offset: None,
            at: 0,
        }
    }

    #[tokio::test]
    async fn feed_filters_by_pattern() {
        let bus = EventBus::new(16);
        let mut feed = bus.subscribe(Pattern::new(b"user:*"));

        bus.publish(event("other:1", "set"));
        bus.publish(event("user:1", "set"));

        let got = feed.recv().await.unwrap();
        assert_eq!(got.key, b("user:1"));
    }

    #[tokio::test]
    async fn keyspace_wide_events_bypass_the_filter() {
        let bus = EventBus::new(16);
        let mut feed = bus.subscribe(Pattern::new(b"nothing-matches-this"));

        bus.publish(MutationEvent {
            key: Bytes::new(),
            kind: "flushall",
            offset: None,
            at: 0,
        });
        let got = feed.recv().await.unwrap();
        assert_eq!(got.kind, "flushall");
    }

    #[tokio::test]
    async fn feed_ends_when_bus_is_dropped() {
        let bus = EventBus::new(16);
        let mut feed = bus.subscribe(Pattern::new(b"*"));
        drop(bus);
        assert!(feed.recv().await.is_none());
    }
}
