//! Named-event waiter registry.
//!
//! Readers that find a holder invalid register here and wait for the next
//! publication of that holder. Waiter counting is what coalesces duplicate
//! force-fetch requests: only the first waiter of an event enqueues the
//! fetch, the rest await the broadcast.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Opaque handle for deregistering one waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterId(u64);

pub struct EventManager<E, P> {
    inner: Mutex<Inner<E, P>>,
    capacity: usize,
}

struct Inner<E, P> {
    waiters: HashMap<E, Vec<(WaiterId, oneshot::Sender<P>)>>,
    next_id: u64,
    total: usize,
}

impl<E, P> EventManager<E, P>
where
    E: Eq + Hash + Clone,
    P: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                waiters: HashMap::new(),
                next_id: 0,
                total: 0,
            }),
            capacity,
        }
    }

    /// Register a waiter for `event`. The returned receiver resolves with the
    /// payload of the next [`notify`](Self::notify) of that event. Returns the
    /// number of waiters now registered for the event (including this one),
    /// which callers use to decide whether to enqueue the underlying fetch.
    pub fn register(
        &self,
        event: E,
    ) -> crate::Result<(WaiterId, oneshot::Receiver<P>, usize)> {
        let mut inner = self.inner.lock().unwrap();
        if inner.total >= self.capacity {
            return Err(crate::Error::EventCapacity);
        }
        let id = WaiterId(inner.next_id);
        inner.next_id += 1;
        inner.total += 1;

        let (tx, rx) = oneshot::channel();
        let slot = inner.waiters.entry(event).or_default();
        slot.push((id, tx));
        let count = slot.len();

        Ok((id, rx, count))
    }

    /// Deliver `payload` to every waiter currently registered for `event`,
    /// dropping their registrations. Waiters registered after this call see
    /// the next notification. Returns the number of waiters notified.
    pub fn notify(&self, event: &E, payload: P) -> usize {
        let drained = {
            let mut inner = self.inner.lock().unwrap();
            let drained = inner.waiters.remove(event).unwrap_or_default();
            inner.total -= drained.len();
            drained
        };
        let count = drained.len();
        for (_, tx) in drained {
            // A waiter may have timed out and dropped its receiver.
            let _ = tx.send(payload.clone());
        }
        count
    }

    /// Number of waiters currently registered for `event`.
    pub fn count(&self, event: &E) -> usize {
        self.inner
            .lock()
            .unwrap()
            .waiters
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Remove one waiter. Idempotent: unknown ids are ignored.
    pub fn unregister(&self, event: &E, id: WaiterId) {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        if let Some(slot) = inner.waiters.get_mut(event) {
            let before = slot.len();
            slot.retain(|(waiter, _)| *waiter != id);
            inner.total -= before - slot.len();
            if slot.is_empty() {
                inner.waiters.remove(event);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn notify_reaches_every_registered_waiter() {
        let mgr: EventManager<&str, u32> = EventManager::new(8);

        let (_, rx1, n1) = mgr.register("nodes").unwrap();
        let (_, rx2, n2) = mgr.register("nodes").unwrap();
        assert_eq!((n1, n2), (1, 2));
        assert_eq!(mgr.count(&"nodes"), 2);

        assert_eq!(mgr.notify(&"nodes", 42), 2);
        assert_eq!(rx1.await.unwrap(), 42);
        assert_eq!(rx2.await.unwrap(), 42);

        // Registrations were dropped with the broadcast.
        assert_eq!(mgr.count(&"nodes"), 0);
        assert_eq!(mgr.notify(&"nodes", 43), 0);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let mgr: EventManager<&str, ()> = EventManager::new(8);
        let (id, _rx, _) = mgr.register("bucket").unwrap();

        mgr.unregister(&"bucket", id);
        mgr.unregister(&"bucket", id);
        assert_eq!(mgr.count(&"bucket"), 0);

        // Capacity was released.
        for _ in 0..8 {
            mgr.register("bucket").unwrap();
        }
    }

    #[tokio::test]
    async fn capacity_is_enforced_across_events() {
        let mgr: EventManager<u32, ()> = EventManager::new(2);
        let _a = mgr.register(1).unwrap();
        let _b = mgr.register(2).unwrap();
        assert!(matches!(mgr.register(3), Err(crate::Error::EventCapacity)));
    }
}
