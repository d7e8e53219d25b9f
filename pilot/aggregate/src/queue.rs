use mesh_pilot_core::{ChangeEvent, ConfigKey, EventStream};
use parking_lot::Mutex;
use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Weak},
};
use tokio::sync::Notify;

/// Fans merged events out to subscribers.
///
/// Publishing never waits on a subscriber: each subscriber has its own
/// buffer, and a subscriber that falls behind has its buffered events
/// coalesced rather than blocking the merge loop.
#[derive(Debug)]
pub(crate) struct Subscribers {
    capacity: usize,
    subscriptions: Mutex<Vec<Weak<Subscription>>>,
}

#[derive(Debug)]
struct Subscription {
    queue: Mutex<Queue>,
    notify: Notify,
}

/// A subscriber's buffered events.
///
/// Up to `capacity` events are buffered as-is. Beyond that, an event for a
/// key that already has a pending event is folded into the latest pending
/// event for that key, so the subscriber observes the key's latest state
/// without observing every intermediate revision. An event that cannot be
/// folded evicts the oldest pending `Updated`, or failing that the oldest
/// pending `Added`, so the buffer stays within `capacity`.
///
/// Per key, the subscriber still observes an `Added` before any `Updated` or
/// `Deleted`. A `Deleted` is never evicted, and is only folded away when an
/// earlier pending `Deleted` for the same key already conveys it. When only
/// deletions are pending the buffer may exceed `capacity` by one deletion
/// per distinct key.
#[derive(Debug)]
pub(crate) struct Queue {
    capacity: usize,
    events: VecDeque<ChangeEvent>,

    /// Keys whose `Added` was evicted before the subscriber saw it.
    unseen: HashSet<ConfigKey>,
}

/// How a published event was buffered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Push {
    Queued,

    /// The buffer was full and the event was folded into a pending event.
    Coalesced,

    /// The buffer was full and the event could not be folded. A pending
    /// event was evicted to make room, or the event itself was dropped.
    Overflowed,
}

/// Counts of how events were buffered for all subscribers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Delivery {
    pub coalesced: usize,
    pub overflowed: usize,
}

// === impl Subscribers ===

impl Subscribers {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> EventStream {
        let sub = Arc::new(Subscription {
            queue: Mutex::new(Queue::new(self.capacity)),
            notify: Notify::new(),
        });
        self.subscriptions.lock().push(Arc::downgrade(&sub));

        Box::pin(futures::stream::unfold(sub, |sub| async move {
            loop {
                let next = sub.queue.lock().pop();
                if let Some(ev) = next {
                    return Some((ev, sub));
                }
                sub.notify.notified().await;
            }
        }))
    }

    pub(crate) fn publish(&self, event: &ChangeEvent) -> Delivery {
        let mut delivery = Delivery::default();
        self.subscriptions.lock().retain(|weak| {
            let Some(sub) = weak.upgrade() else {
                return false;
            };
            let push = sub.queue.lock().push(event.clone());
            match push {
                Push::Queued => {}
                Push::Coalesced => delivery.coalesced += 1,
                Push::Overflowed => delivery.overflowed += 1,
            }
            sub.notify.notify_one();
            true
        });
        delivery
    }

    pub(crate) fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }
}

// === impl Queue ===

impl Queue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: VecDeque::new(),
            unseen: HashSet::new(),
        }
    }

    pub(crate) fn pop(&mut self) -> Option<ChangeEvent> {
        self.events.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    pub(crate) fn push(&mut self, event: ChangeEvent) -> Push {
        // The subscriber never saw the addition of an unseen key.
        let event = match event {
            ChangeEvent::Updated(obj) if self.unseen.remove(&obj.key) => ChangeEvent::Added(obj),
            ChangeEvent::Deleted(key) if self.unseen.remove(&key) => return Push::Coalesced,
            event => event,
        };

        if self.events.len() < self.capacity {
            self.events.push_back(event);
            return Push::Queued;
        }

        let key = event.key().clone();
        let Some(latest) = self.events.iter().rposition(|ev| *ev.key() == key) else {
            return self.overflow(event);
        };

        let folded = match (&self.events[latest], event) {
            (ChangeEvent::Added(_), ChangeEvent::Added(obj) | ChangeEvent::Updated(obj)) => {
                ChangeEvent::Added(obj)
            }
            (ChangeEvent::Updated(_), ChangeEvent::Added(obj) | ChangeEvent::Updated(obj)) => {
                ChangeEvent::Updated(obj)
            }
            (ChangeEvent::Updated(_), ChangeEvent::Deleted(key)) => ChangeEvent::Deleted(key),
            (ChangeEvent::Added(_), ChangeEvent::Deleted(key)) => {
                let deleted_before = self
                    .events
                    .iter()
                    .take(latest)
                    .rposition(|ev| *ev.key() == key)
                    .map(|idx| self.events[idx].is_deleted())
                    .unwrap_or(false);
                if deleted_before {
                    // The earlier pending deletion already describes the
                    // key's final state.
                    self.events.remove(latest);
                    return Push::Coalesced;
                }
                // The subscriber has not seen the key yet, so the deletion
                // must follow the pending addition.
                return self.overflow(ChangeEvent::Deleted(key));
            }
            (ChangeEvent::Deleted(_), ChangeEvent::Deleted(_)) => return Push::Coalesced,
            (ChangeEvent::Deleted(_), event) => {
                // Folding a re-creation into the deletion would hide the
                // deletion.
                return self.overflow(event);
            }
        };

        self.events[latest] = folded;
        Push::Coalesced
    }

    /// Buffers an event that could not be folded into a full buffer.
    fn overflow(&mut self, event: ChangeEvent) -> Push {
        if self.evict(event.key()) || event.is_deleted() {
            self.events.push_back(event);
        } else if let ChangeEvent::Added(obj) = event {
            self.unseen.insert(obj.key.clone());
        }
        Push::Overflowed
    }

    /// Evicts the oldest pending `Updated`, or else the oldest pending
    /// `Added`, of a key other than `keep`. Deletions are never evicted.
    fn evict(&mut self, keep: &ConfigKey) -> bool {
        let evictable = |want_added: bool| {
            self.events.iter().position(|ev| {
                *ev.key() != *keep
                    && match ev {
                        ChangeEvent::Updated(_) => !want_added,
                        ChangeEvent::Added(_) => want_added,
                        ChangeEvent::Deleted(_) => false,
                    }
            })
        };
        let Some(idx) = evictable(false).or_else(|| evictable(true)) else {
            return false;
        };
        let Some(ChangeEvent::Added(obj)) = self.events.remove(idx) else {
            // An older revision stays visible until the key changes again.
            return true;
        };

        // The subscriber will not see the key's addition, so its next pending
        // event for the key is rewritten to match.
        let next = self.events.iter().skip(idx).position(|ev| *ev.key() == obj.key);
        match next.map(|n| n + idx) {
            Some(next) => match self.events[next].clone() {
                ChangeEvent::Updated(obj) => self.events[next] = ChangeEvent::Added(obj),
                ChangeEvent::Deleted(_) => {
                    self.events.remove(next);
                }
                ChangeEvent::Added(_) => {}
            },
            None => {
                self.unseen.insert(obj.key.clone());
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{FutureExt, StreamExt};
    use mesh_pilot_core::{ConfigKey, ConfigObject};

    fn key(name: &str) -> ConfigKey {
        ConfigKey::new("route-rule", "default", name)
    }

    fn obj(name: &str, rev: &str) -> Arc<ConfigObject> {
        Arc::new(ConfigObject::new(key(name), rev, serde_json::json!({})))
    }

    fn added(name: &str, rev: &str) -> ChangeEvent {
        ChangeEvent::Added(obj(name, rev))
    }

    fn updated(name: &str, rev: &str) -> ChangeEvent {
        ChangeEvent::Updated(obj(name, rev))
    }

    fn deleted(name: &str) -> ChangeEvent {
        ChangeEvent::Deleted(key(name))
    }

    fn drain(q: &mut Queue) -> Vec<ChangeEvent> {
        std::iter::from_fn(|| q.pop()).collect()
    }

    #[test]
    fn buffers_up_to_capacity() {
        let mut q = Queue::new(2);
        assert_eq!(q.push(added("a", "1")), Push::Queued);
        assert_eq!(q.push(updated("a", "2")), Push::Queued);
        assert_eq!(drain(&mut q), vec![added("a", "1"), updated("a", "2")]);
    }

    #[test]
    fn overflow_folds_updates_into_pending_added() {
        let mut q = Queue::new(2);
        q.push(added("a", "1"));
        q.push(added("b", "1"));
        assert_eq!(q.push(updated("a", "2")), Push::Coalesced);
        assert_eq!(q.push(updated("a", "3")), Push::Coalesced);
        assert_eq!(q.len(), 2);
        // The subscriber still observes an Added first, with the latest
        // revision.
        assert_eq!(drain(&mut q), vec![added("a", "3"), added("b", "1")]);
    }

    #[test]
    fn overflow_folds_updates_into_pending_updated() {
        let mut q = Queue::new(1);
        q.push(updated("a", "2"));
        assert_eq!(q.push(updated("a", "3")), Push::Coalesced);
        assert_eq!(drain(&mut q), vec![updated("a", "3")]);
    }

    #[test]
    fn overflow_never_drops_deletes() {
        let mut q = Queue::new(1);
        q.push(updated("a", "2"));
        assert_eq!(q.push(deleted("a")), Push::Coalesced);
        assert_eq!(drain(&mut q), vec![deleted("a")]);

        let mut q = Queue::new(1);
        q.push(deleted("a"));
        assert_eq!(q.push(added("a", "3")), Push::Overflowed);
        assert_eq!(drain(&mut q), vec![deleted("a")]);
        // The re-creation is delivered with the key's next change.
        assert_eq!(q.push(updated("a", "4")), Push::Queued);
        assert_eq!(drain(&mut q), vec![added("a", "4")]);

        let mut q = Queue::new(1);
        q.push(added("a", "1"));
        assert_eq!(q.push(deleted("a")), Push::Overflowed);
        assert_eq!(drain(&mut q), vec![added("a", "1"), deleted("a")]);
    }

    #[test]
    fn flapping_key_stays_bounded() {
        let mut q = Queue::new(1);
        q.push(deleted("a"));
        for rev in 0..10 {
            q.push(added("a", &rev.to_string()));
            q.push(deleted("a"));
        }
        assert_eq!(drain(&mut q), vec![deleted("a")]);
    }

    #[test]
    fn distinct_keys_stay_within_capacity() {
        let mut q = Queue::new(4);
        for n in 0..1000 {
            q.push(added(&format!("k{n}"), "1"));
        }
        assert_eq!(q.len(), 4);
        // The newest keys are buffered.
        assert_eq!(q.pop(), Some(added("k996", "1")));
    }

    #[test]
    fn updates_are_evicted_before_additions() {
        let mut q = Queue::new(2);
        q.push(added("a", "1"));
        q.push(updated("b", "2"));
        assert_eq!(q.push(added("c", "1")), Push::Overflowed);
        assert_eq!(drain(&mut q), vec![added("a", "1"), added("c", "1")]);
    }

    #[test]
    fn evicted_additions_keep_per_key_order() {
        let mut q = Queue::new(1);
        q.push(added("a", "1"));
        assert_eq!(q.push(added("b", "1")), Push::Overflowed);
        assert_eq!(drain(&mut q), vec![added("b", "1")]);

        // The subscriber never saw "a", so its next update is an addition.
        assert_eq!(q.push(updated("a", "2")), Push::Queued);
        assert_eq!(drain(&mut q), vec![added("a", "2")]);

        q.push(added("c", "1"));
        q.push(added("d", "1"));
        // Deleting a key the subscriber never saw is not delivered.
        assert_eq!(q.push(deleted("c")), Push::Coalesced);
        assert_eq!(drain(&mut q), vec![added("d", "1")]);
    }

    #[test]
    fn deletes_are_never_evicted() {
        let mut q = Queue::new(2);
        q.push(deleted("a"));
        q.push(deleted("b"));
        assert_eq!(q.push(added("c", "1")), Push::Overflowed);
        assert_eq!(q.push(deleted("d")), Push::Overflowed);
        assert_eq!(
            drain(&mut q),
            vec![deleted("a"), deleted("b"), deleted("d")]
        );

        let mut q = Queue::new(2);
        q.push(added("a", "1"));
        q.push(deleted("b"));
        assert_eq!(q.push(deleted("c")), Push::Overflowed);
        assert_eq!(drain(&mut q), vec![deleted("b"), deleted("c")]);
    }

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let subs = Subscribers::new(8);
        let mut a = subs.subscribe();
        let mut b = subs.subscribe();
        assert_eq!(subs.len(), 2);

        subs.publish(&added("a", "1"));
        subs.publish(&updated("a", "2"));

        assert_eq!(a.next().await, Some(added("a", "1")));
        assert_eq!(a.next().await, Some(updated("a", "2")));
        assert_eq!(b.next().await, Some(added("a", "1")));

        drop(a);
        drop(b);
        subs.publish(&deleted("a"));
        assert_eq!(subs.len(), 0);
    }

    #[tokio::test]
    async fn subscriber_waits_for_events() {
        let subs = Subscribers::new(8);
        let mut a = subs.subscribe();
        assert!(a.next().now_or_never().is_none());
        subs.publish(&added("a", "1"));
        assert_eq!(a.next().await, Some(added("a", "1")));
    }
}
