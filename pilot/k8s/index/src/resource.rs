use crate::{metrics::IndexMetrics, watch, ClusterInfo};
use kube::{runtime::watcher, ResourceExt};
use kubert::index::{IndexNamespacedResource, NamespacedRemoved};
use mesh_pilot_core::{
    store::Store, ConfigKey, ConfigObject, ConfigSource, Controller, Error, EventStream,
    StopSignal, Synced, SyncedTx,
};
use mesh_pilot_k8s_api::config::{DestinationPolicy, RouteRule};
use parking_lot::RwLock;
use std::{collections::BTreeSet, sync::Arc};
use tracing::{info_span, Instrument};

/// Serves `RouteRule` and `DestinationPolicy` resources as configuration
/// objects.
pub struct KubeConfigSource {
    client: kube::Client,
    cluster: ClusterInfo,
    index: Arc<RwLock<Index>>,
    synced: SyncedTx,
}

pub(crate) struct Index {
    store: Store,
    synced_kinds: BTreeSet<&'static str>,
    synced: SyncedTx,
    metrics: IndexMetrics,
}

/// A custom resource that maps onto a single configuration object.
pub(crate) trait ConfigResource: kube::Resource<DynamicType = ()> {
    const KIND: &'static str;

    fn spec_json(&self) -> serde_json::Result<serde_json::Value>;
}

impl ConfigResource for RouteRule {
    const KIND: &'static str = mesh_pilot_core::ROUTE_RULE;

    fn spec_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(&self.spec)
    }
}

impl ConfigResource for DestinationPolicy {
    const KIND: &'static str = mesh_pilot_core::DESTINATION_POLICY;

    fn spec_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(&self.spec)
    }
}

const KINDS: [&str; 2] = [RouteRule::KIND, DestinationPolicy::KIND];

// === impl KubeConfigSource ===

impl KubeConfigSource {
    pub const NAME: &'static str = "kubernetes";

    pub fn new(client: kube::Client, cluster: ClusterInfo, metrics: IndexMetrics) -> Self {
        let synced = SyncedTx::default();
        Self {
            client,
            cluster,
            index: Arc::new(RwLock::new(Index::new(synced.clone(), metrics))),
            synced,
        }
    }
}

#[async_trait::async_trait]
impl Controller for KubeConfigSource {
    async fn run(&self, stop: StopSignal) {
        let rules = watch::index(
            self.cluster.api::<RouteRule>(self.client.clone()),
            watcher::Config::default(),
            self.index.clone(),
            self.cluster.resync,
            stop.clone(),
        )
        .instrument(info_span!("routerules"));

        let policies = watch::index(
            self.cluster.api::<DestinationPolicy>(self.client.clone()),
            watcher::Config::default(),
            self.index.clone(),
            self.cluster.resync,
            stop,
        )
        .instrument(info_span!("destinationpolicies"));

        tokio::join!(rules, policies);
    }

    fn synced(&self) -> Synced {
        self.synced.subscribe()
    }
}

impl ConfigSource for KubeConfigSource {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn list(&self, kind: &str) -> Result<Vec<Arc<ConfigObject>>, Error> {
        self.index.read().list(Self::NAME, kind)
    }

    fn kinds(&self) -> Vec<String> {
        self.index.read().store.kinds()
    }

    fn subscribe(&self) -> EventStream {
        self.index.read().store.subscribe()
    }
}

// === impl Index ===

impl Index {
    pub(crate) fn new(synced: SyncedTx, metrics: IndexMetrics) -> Self {
        Self {
            store: Store::default(),
            synced_kinds: BTreeSet::new(),
            synced,
            metrics,
        }
    }

    fn list(&self, source: &str, kind: &str) -> Result<Vec<Arc<ConfigObject>>, Error> {
        if !self.synced.is_synced() {
            return Err(Error::unavailable(source, "resources have not been listed yet"));
        }
        Ok(self.store.list(kind))
    }

    fn size(&self, kind: &str) -> usize {
        self.store.keys().filter(|k| k.kind == kind).count()
    }

    fn mark_synced(&mut self, kind: &'static str) {
        if self.synced_kinds.insert(kind) && KINDS.iter().all(|k| self.synced_kinds.contains(k)) {
            tracing::info!(objects = self.store.len(), "Synced");
            self.synced.mark();
        }
    }
}

fn to_object<R: ConfigResource>(resource: &R) -> Option<ConfigObject> {
    let namespace = resource.namespace()?;
    let name = resource.name_unchecked();
    let spec = match resource.spec_json() {
        Ok(spec) => spec,
        Err(error) => {
            tracing::warn!(%namespace, %name, %error, "Skipping unserializable resource");
            return None;
        }
    };
    let revision = resource
        .resource_version()
        .or_else(|| resource.meta().generation.map(|g| g.to_string()))
        .unwrap_or_default();
    Some(ConfigObject::new(
        ConfigKey::new(R::KIND, namespace, name),
        revision,
        spec,
    ))
}

impl<R: ConfigResource> IndexNamespacedResource<R> for Index {
    fn apply(&mut self, resource: R) {
        if let Some(obj) = to_object(&resource) {
            tracing::debug!(key = %obj.key, revision = %obj.revision, "Applying");
            self.store.apply(obj);
        }
        self.metrics.applied(R::KIND, self.size(R::KIND));
    }

    fn delete(&mut self, namespace: String, name: String) {
        let key = ConfigKey::new(R::KIND, namespace, name);
        tracing::debug!(%key, "Deleting");
        self.store.delete(&key);
        self.metrics.deleted(R::KIND, self.size(R::KIND));
    }

    fn reset(&mut self, resources: Vec<R>, _removed: NamespacedRemoved) {
        // The watch may have been restarted, so deletions are found by
        // diffing against the store rather than trusting `removed`.
        let objects = resources.iter().filter_map(to_object).collect::<Vec<_>>();
        let changes = self.store.replace(|key| key.kind == R::KIND, objects);
        tracing::debug!(kind = R::KIND, changes, "Reset");
        self.metrics.reset(R::KIND, self.size(R::KIND));
        self.mark_synced(R::KIND);
    }
}
