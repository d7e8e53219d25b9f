use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Counts index updates for each watched resource kind.
#[derive(Clone, Debug, Default)]
pub struct IndexMetrics {
    size: Family<KindLabels, Gauge>,
    applies: Family<KindLabels, Counter>,
    deletes: Family<KindLabels, Counter>,
    resets: Family<KindLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: String,
}

impl IndexMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let size = Family::default();
        prom.register(
            "index_size",
            "Gauge of the number of resources in the index",
            size.clone(),
        );

        let applies = Family::default();
        prom.register(
            "index_applies",
            "Count of applies to the index",
            applies.clone(),
        );

        let deletes = Family::default();
        prom.register(
            "index_deletes",
            "Count of deletes to the index",
            deletes.clone(),
        );

        let resets = Family::default();
        prom.register(
            "index_resets",
            "Count of resets to the index",
            resets.clone(),
        );

        Self {
            size,
            applies,
            deletes,
            resets,
        }
    }

    pub(crate) fn applied(&self, kind: &str, size: usize) {
        let labels = KindLabels::new(kind);
        self.applies.get_or_create(&labels).inc();
        self.size.get_or_create(&labels).set(size as i64);
    }

    pub(crate) fn deleted(&self, kind: &str, size: usize) {
        let labels = KindLabels::new(kind);
        self.deletes.get_or_create(&labels).inc();
        self.size.get_or_create(&labels).set(size as i64);
    }

    pub(crate) fn reset(&self, kind: &str, size: usize) {
        let labels = KindLabels::new(kind);
        self.resets.get_or_create(&labels).inc();
        self.size.get_or_create(&labels).set(size as i64);
    }

    #[cfg(test)]
    pub(crate) fn resets(&self, kind: &str) -> u64 {
        self.resets.get_or_create(&KindLabels::new(kind)).get()
    }
}

impl KindLabels {
    fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
        }
    }
}
