//! Merges configuration from several sources into one keyed view.
//!
//! Sources are registered in priority order. When two sources publish an
//! object with the same key, the object of the first-registered source is
//! visible and the other is shadowed until the winner deletes its object.
//! Every such collision is reported as a [`Conflict`].
//!
//! The merged index is mutated only by the cache's own run loop; readers
//! take a shared lock and never observe a partially applied event.
//! Subscribers each get a bounded buffer so that a slow subscriber never
//! stalls the merge loop.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod index;
mod metrics;
mod queue;


pub use self::metrics::CacheMetrics;
use self::{index::Index, queue::Subscribers};
use futures::{prelude::*, stream::SelectAll};
use mesh_pilot_core::{
    ChangeEvent, ConfigKey, ConfigObject, ConfigSource, ConfigStoreCache, Conflict, Controller,
    Error, EventStream, StopSignal, Synced, SyncedTx,
};
use parking_lot::RwLock;
use std::{collections::HashSet, sync::Arc};
use tokio::task::JoinSet;
use tracing::Instrument;

/// The default number of events buffered per subscriber before coalescing.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

pub struct AggregateCache {
    sources: Vec<Arc<dyn ConfigSource>>,
    index: Arc<RwLock<Index>>,
    subscribers: Subscribers,
    synced: SyncedTx,
    metrics: CacheMetrics,
}

// === impl AggregateCache ===

impl AggregateCache {
    /// Builds a cache over `sources`, highest priority first.
    ///
    /// Fails if no sources are given or if two sources share a name.
    pub fn new(
        sources: Vec<Arc<dyn ConfigSource>>,
        capacity: usize,
        metrics: CacheMetrics,
    ) -> Result<Self, Error> {
        if sources.is_empty() {
            return Err(Error::InvalidSources("no config sources".to_string()));
        }

        let mut names = HashSet::new();
        for source in &sources {
            if !names.insert(source.name()) {
                return Err(Error::InvalidSources(format!(
                    "duplicate source name {}",
                    source.name()
                )));
            }
        }

        let names = sources.iter().map(|s| s.name().to_string()).collect();
        Ok(Self {
            sources,
            index: Arc::new(RwLock::new(Index::new(names))),
            subscribers: Subscribers::new(capacity),
            synced: SyncedTx::default(),
            metrics,
        })
    }

    /// Registers gauges describing the merged index.
    pub fn register_metrics(&self, prom: &mut prometheus_client::registry::Registry) {
        metrics::register_index(prom, self.index.clone());
    }

    /// Keys currently published by more than one source.
    pub fn conflicts(&self) -> Vec<Conflict> {
        self.index.read().conflicts()
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().map(|s| s.name())
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn apply(&self, source: usize, event: ChangeEvent) {
        self.metrics.event(self.sources[source].name(), &event);
        self.merge(source, event);
    }

    fn merge(&self, source: usize, event: ChangeEvent) {
        let name = self.sources[source].name();
        tracing::trace!(source = %name, key = %event.key(), deleted = event.is_deleted(), "Applying");

        let outcome = self.index.write().apply(source, event);

        if let Some(conflict) = outcome.conflict {
            self.metrics.conflict(&conflict);
            let error = Error::ConflictDetected(conflict);
            tracing::warn!(%error);
        }

        if let Some(event) = outcome.event {
            let delivery = self.subscribers.publish(&event);
            self.metrics.delivery(delivery);
            if delivery.overflowed > 0 {
                let error = Error::SubscriberOverflow(event.key().clone());
                tracing::debug!(%error, subscribers = delivery.overflowed);
            }
        }
    }

    /// Brings the index in line with a source's current listing.
    ///
    /// Listed objects are applied as additions; unchanged revisions are
    /// ignored by the index. Keys the source claims but no longer lists are
    /// deleted. A source that fails to list is left as it is.
    fn reconcile(&self, source: usize) {
        let src = &self.sources[source];
        let mut listed = HashSet::new();
        let mut objects = vec![];
        for kind in src.kinds() {
            match src.list(&kind) {
                Ok(objs) => objects.extend(objs),
                Err(error) => {
                    tracing::warn!(%error, "Failed to list source");
                    return;
                }
            }
        }

        for obj in objects {
            listed.insert(obj.key.clone());
            self.merge(source, ChangeEvent::Added(obj));
        }

        let stale = self.index.read().claimed_by(source);
        for key in stale.into_iter().filter(|key| !listed.contains(key)) {
            self.merge(source, ChangeEvent::Deleted(key));
        }
    }
}

#[async_trait::async_trait]
impl Controller for AggregateCache {
    async fn run(&self, stop: StopSignal) {
        // Subscribe before any source runs so that no event is missed.
        let mut events = self
            .sources
            .iter()
            .enumerate()
            .map(|(idx, source)| source.subscribe().map(move |ev| (idx, ev)).boxed())
            .collect::<SelectAll<_>>();

        let mut tasks = JoinSet::new();
        for (idx, source) in self.sources.iter().enumerate() {
            let source = source.clone();
            let stop = stop.clone();
            let span = tracing::info_span!("source", name = %source.name());
            tasks.spawn(
                async move {
                    source.run(stop).await;
                    idx
                }
                .instrument(span),
            );
        }

        let synced = future::join_all(self.sources.iter().map(|s| s.synced().wait()));
        tokio::pin!(synced);
        let mut is_synced = false;

        let shutdown = stop.signaled();
        tokio::pin!(shutdown);

        let release = loop {
            tokio::select! {
                release = &mut shutdown => break release,

                Some((idx, event)) = events.next() => self.apply(idx, event),

                _ = &mut synced, if !is_synced => {
                    // A source that synced before this loop subscribed has
                    // published its state without us, so its listing is
                    // authoritative.
                    while let Some(Some((idx, event))) = events.next().now_or_never() {
                        self.apply(idx, event);
                    }
                    for idx in 0..self.sources.len() {
                        self.reconcile(idx);
                    }
                    is_synced = true;
                    self.synced.mark();
                    tracing::info!(objects = self.len(), "Synced");
                }

                Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                    let name = match res {
                        Ok(idx) => self.sources[idx].name(),
                        Err(error) => {
                            tracing::error!(%error, "Source task failed");
                            continue;
                        }
                    };
                    // The source's last known objects are kept.
                    tracing::warn!(source = %name, "Source stopped before shutdown");
                    self.metrics.source_exit(name);
                }
            }
        };

        tracing::debug!("Waiting for sources to stop");
        while let Some(res) = tasks.join_next().await {
            if let Err(error) = res {
                tracing::error!(%error, "Source task failed");
            }
        }
        drop(release);
    }

    fn synced(&self) -> Synced {
        self.synced.subscribe()
    }
}

impl ConfigStoreCache for AggregateCache {
    fn get(&self, key: &ConfigKey) -> Option<Arc<ConfigObject>> {
        self.index.read().get(key)
    }

    fn list(&self, kind: &str) -> Vec<Arc<ConfigObject>> {
        self.index.read().list(kind)
    }

    fn subscribe(&self) -> EventStream {
        self.subscribers.subscribe()
    }
}
