//! Waiter registry for blocking reads.
//!
//! A blocking pop that finds nothing registers a waiter per watched key
//! and suspends on a notify handle; the next operation that produces data
//! for one of those keys wakes the oldest registered waiter. The woken
//! task re-runs its pop; consumption happens through the normal
//! serialization point, never here. Deregistration is by guard drop, so a
//! timeout or a cancelled caller releases its slots without side effects.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Notify;

#[derive(Default)]
pub(crate) struct WaiterRegistry {
    queues: DashMap<Bytes, VecDeque<Waiter>>,
    next_id: AtomicU64,
}

struct Waiter {
    id: u64,
    notify: Arc<Notify>,
}

/// A registered waiter. Dropping it removes the registration everywhere.
pub(crate) struct WaitGuard<'a> {
    registry: &'a WaiterRegistry,
    keys: Vec<Bytes>,
    id: u64,
    notify: Arc<Notify>,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one waiter across `keys`, sharing a single notify handle.
    pub fn register(&self, keys: &[Bytes]) -> WaitGuard<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let notify = Arc::new(Notify::new());
        for key in keys {
            self.queues.entry(key.clone()).or_default().push_back(Waiter {
                id,
                notify: notify.clone(),
            });
        }
        WaitGuard {
            registry: self,
            keys: keys.to_vec(),
            id,
            notify,
        }
    }

    /// Wake the oldest waiter registered for `key`, if any. The permit is
    /// stored, so a waiter registering-then-awaiting cannot miss it.
    pub fn wake_one(&self, key: &Bytes) {
        if let Some(queue) = self.queues.get(key)
            && let Some(waiter) = queue.front()
        {
            waiter.notify.notify_one();
        }
    }

    /// True when someone is blocked on `key`.
    pub fn has_waiters(&self, key: &Bytes) -> bool {
        self.queues.get(key).is_some_and(|q| !q.is_empty())
    }
}

impl WaitGuard<'_> {
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        for key in &self.keys {
            if let Some(mut queue) = self.registry.queues.get_mut(key) {
                queue.retain(|w| w.id != self.id);
            }
            self.registry
                .queues
                .remove_if(key, |_, queue| queue.is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn drop_deregisters_everywhere() {
        let registry = WaiterRegistry::new();
        let keys = [b("a"), b("b")];
        {
            let _guard = registry.register(&keys);
            assert!(registry.has_waiters(&keys[0]));
            assert!(registry.has_waiters(&keys[1]));
        }
        assert!(!registry.has_waiters(&keys[0]));
        assert!(!registry.has_waiters(&keys[1]));
    }

    #[tokio::test]
    async fn wake_reaches_the_oldest_waiter() {
        let registry = Arc::new(WaiterRegistry::new());
        let key = b("k");

        let first = registry.register(std::slice::from_ref(&key));
        let _second = registry.register(std::slice::from_ref(&key));

        registry.wake_one(&key);
        // The permit went to the oldest registration.
        tokio::time::timeout(Duration::from_millis(100), first.notified())
            .await
            .expect("oldest waiter should be woken");
    }

    #[tokio::test]
    async fn permit_is_stored_for_late_awaiters() {
        let registry = WaiterRegistry::new();
        let key = b("k");
        let guard = registry.register(std::slice::from_ref(&key));
        // Wake before the waiter awaits: the permit must not be lost.
        registry.wake_one(&key);
        tokio::time::timeout(Duration::from_millis(100), guard.notified())
            .await
            .expect("stored permit should wake the waiter");
    }
}
