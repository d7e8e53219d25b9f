//! Keyed object storage for config sources.
//!
//! A [`Store`] holds a source's current objects and publishes a
//! [`ChangeEvent`] to every subscriber whenever an apply, delete, or
//! replacement changes its contents. Re-applying an object with an unchanged
//! revision is a no-op.

use crate::{ChangeEvent, ConfigKey, ConfigObject, EventStream};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Fans events out to any number of subscribers without blocking the
/// publisher.
#[derive(Debug, Default)]
pub struct Publisher {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ChangeEvent>>>,
}

#[derive(Debug, Default)]
pub struct Store {
    objects: BTreeMap<ConfigKey, Arc<ConfigObject>>,
    events: Publisher,
}

// === impl Publisher ===

impl Publisher {
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        Box::pin(UnboundedReceiverStream::new(rx))
    }

    pub fn publish(&self, event: ChangeEvent) {
        // Subscribers whose streams were dropped are pruned here.
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

// === impl Store ===

impl Store {
    pub fn get(&self, key: &ConfigKey) -> Option<Arc<ConfigObject>> {
        self.objects.get(key).cloned()
    }

    /// Lists objects of `kind` ordered by namespace and name.
    pub fn list(&self, kind: &str) -> Vec<Arc<ConfigObject>> {
        self.objects
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ConfigKey> {
        self.objects.keys()
    }

    /// The distinct kinds of the stored objects.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds = self
            .objects
            .keys()
            .map(|key| key.kind.clone())
            .collect::<Vec<_>>();
        kinds.dedup();
        kinds
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Inserts or replaces an object, publishing `Added` or `Updated`.
    ///
    /// Returns false when an object with the same revision is already stored.
    pub fn apply(&mut self, obj: ConfigObject) -> bool {
        if let Some(current) = self.objects.get(&obj.key) {
            if current.revision == obj.revision {
                return false;
            }
            let obj = Arc::new(obj);
            self.objects.insert(obj.key.clone(), obj.clone());
            self.events.publish(ChangeEvent::Updated(obj));
            return true;
        }

        let obj = Arc::new(obj);
        self.objects.insert(obj.key.clone(), obj.clone());
        self.events.publish(ChangeEvent::Added(obj));
        true
    }

    /// Removes an object, publishing `Deleted` if it was present.
    pub fn delete(&mut self, key: &ConfigKey) -> bool {
        if self.objects.remove(key).is_none() {
            return false;
        }
        self.events.publish(ChangeEvent::Deleted(key.clone()));
        true
    }

    /// Reconciles the store with a complete listing.
    ///
    /// Every stored key for which `in_scope` holds and that is absent from
    /// `objects` is deleted; everything in `objects` is applied. Returns the
    /// number of changes published.
    pub fn replace(
        &mut self,
        in_scope: impl Fn(&ConfigKey) -> bool,
        objects: impl IntoIterator<Item = ConfigObject>,
    ) -> usize {
        let mut changes = 0;
        let mut live = BTreeSet::new();
        for obj in objects {
            live.insert(obj.key.clone());
            if self.apply(obj) {
                changes += 1;
            }
        }

        let stale = self
            .objects
            .keys()
            .filter(|key| in_scope(key) && !live.contains(*key))
            .cloned()
            .collect::<Vec<_>>();
        for key in stale {
            if self.delete(&key) {
                changes += 1;
            }
        }

        changes
    }
}
