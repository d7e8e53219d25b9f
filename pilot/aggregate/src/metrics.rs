use crate::{index::Index, queue::Delivery};
use mesh_pilot_core::{ChangeEvent, Conflict};
use parking_lot::RwLock;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeLabelSet, EncodeMetric},
    metrics::{counter::Counter, family::Family, gauge::ConstGauge, MetricType},
    registry::Registry,
};
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct CacheMetrics {
    events: Family<EventLabels, Counter>,
    conflicts: Family<ConflictLabels, Counter>,
    source_exits: Family<SourceLabels, Counter>,
    coalesced: Counter,
    overflowed: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct EventLabels {
    source: String,
    kind: String,
    op: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ConflictLabels {
    winner: String,
    loser: String,
    kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SourceLabels {
    source: String,
}

#[derive(Debug)]
struct Instrumented(Arc<RwLock<Index>>);

pub(crate) fn register_index(reg: &mut Registry, index: Arc<RwLock<Index>>) {
    reg.register_collector(Box::new(Instrumented(index)));
}

// === impl CacheMetrics ===

impl CacheMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let events = Family::default();
        prom.register(
            "source_events",
            "Count of change events received from config sources",
            events.clone(),
        );

        let conflicts = Family::default();
        prom.register(
            "conflicts",
            "Count of objects shadowed by a higher-priority source",
            conflicts.clone(),
        );

        let source_exits = Family::default();
        prom.register(
            "source_exits",
            "Count of config sources that stopped before shutdown",
            source_exits.clone(),
        );

        let coalesced = Counter::default();
        prom.register(
            "subscriber_coalesced_events",
            "Count of events folded into a pending event of a lagging subscriber",
            coalesced.clone(),
        );

        let overflowed = Counter::default();
        prom.register(
            "subscriber_overflowed_events",
            "Count of events that overflowed a full subscriber buffer",
            overflowed.clone(),
        );

        Self {
            events,
            conflicts,
            source_exits,
            coalesced,
            overflowed,
        }
    }

    pub(crate) fn event(&self, source: &str, event: &ChangeEvent) {
        let op = match event {
            ChangeEvent::Added(_) => "added",
            ChangeEvent::Updated(_) => "updated",
            ChangeEvent::Deleted(_) => "deleted",
        };
        self.events
            .get_or_create(&EventLabels {
                source: source.to_string(),
                kind: event.key().kind.clone(),
                op,
            })
            .inc();
    }

    pub(crate) fn conflict(&self, conflict: &Conflict) {
        self.conflicts
            .get_or_create(&ConflictLabels {
                winner: conflict.winner.clone(),
                loser: conflict.loser.clone(),
                kind: conflict.key.kind.clone(),
            })
            .inc();
    }

    pub(crate) fn source_exit(&self, source: &str) {
        self.source_exits
            .get_or_create(&SourceLabels {
                source: source.to_string(),
            })
            .inc();
    }

    pub(crate) fn delivery(&self, delivery: Delivery) {
        self.coalesced.inc_by(delivery.coalesced as u64);
        self.overflowed.inc_by(delivery.overflowed as u64);
    }

    pub fn source_exits(&self, source: &str) -> u64 {
        self.source_exits
            .get_or_create(&SourceLabels {
                source: source.to_string(),
            })
            .get()
    }

    pub fn coalesced(&self) -> u64 {
        self.coalesced.get()
    }

    pub fn overflowed(&self) -> u64 {
        self.overflowed.get()
    }
}

// === impl Instrumented ===

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let index = self.0.read();

        let mut size_encoder = encoder.encode_descriptor(
            "index_size",
            "The number of objects in the merged index",
            None,
            MetricType::Gauge,
        )?;
        for (kind, size) in index.kinds() {
            let labels = [("kind", kind)];
            let size = ConstGauge::new(size as u32);
            let size_encoder = size_encoder.encode_family(&labels)?;
            size.encode(size_encoder)?;
        }

        let shadowed_encoder = encoder.encode_descriptor(
            "shadowed_objects",
            "The number of objects currently shadowed by a higher-priority source",
            None,
            MetricType::Gauge,
        )?;
        let shadowed = ConstGauge::new(index.conflicts().len() as u32);
        shadowed.encode(shadowed_encoder)?;

        Ok(())
    }
}
