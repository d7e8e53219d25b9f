use crate::{metrics::IndexMetrics, watch, ClusterInfo};
use ahash::AHashMap as HashMap;
use kube::{runtime::watcher, ResourceExt};
use kubert::index::{IndexNamespacedResource, NamespacedRemoved};
use mesh_pilot_core::{
    store::Store, ConfigKey, ConfigObject, ConfigSource, Controller, Error, EventStream,
    StopSignal, Synced, SyncedTx, ROUTE_RULE,
};
use mesh_pilot_k8s_api::{
    api::networking::v1::{HTTPIngressPath, IngressBackend},
    config::{
        route_rule::{MatchCondition, RequestMatch, StringMatch},
        RouteRuleSpec, ServiceRef,
    },
    Ingress, IngressMode, MeshConfig,
};
use parking_lot::RwLock;
use std::{collections::BTreeSet, sync::Arc};
use tracing::{info_span, Instrument};

/// The annotation that selects an ingress controller.
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

// Exact paths are evaluated before prefixes, and both before the catch-all
// default backend.
const EXACT_PRECEDENCE: i32 = 3;
const PREFIX_PRECEDENCE: i32 = 2;
const DEFAULT_BACKEND_PRECEDENCE: i32 = 1;

/// Derives route rules from the ingresses managed by the mesh.
///
/// The derived rules are read-only: they are regenerated whenever their
/// ingress changes and removed when it is deleted or no longer managed.
pub struct IngressSource {
    client: kube::Client,
    cluster: ClusterInfo,
    index: Arc<RwLock<Index>>,
    synced: SyncedTx,
}

pub(crate) struct Index {
    mode: IngressMode,
    class: String,
    domain_suffix: String,
    store: Store,
    by_ingress: HashMap<(String, String), BTreeSet<ConfigKey>>,
    synced: SyncedTx,
    metrics: IndexMetrics,
}

// === impl IngressSource ===

impl IngressSource {
    pub const NAME: &'static str = "ingress";

    pub fn new(
        client: kube::Client,
        cluster: ClusterInfo,
        mesh: &MeshConfig,
        metrics: IndexMetrics,
    ) -> Self {
        let synced = SyncedTx::default();
        let index = Index::new(mesh, &cluster.domain_suffix, synced.clone(), metrics);
        Self {
            client,
            cluster,
            index: Arc::new(RwLock::new(index)),
            synced,
        }
    }
}

#[async_trait::async_trait]
impl Controller for IngressSource {
    async fn run(&self, stop: StopSignal) {
        if self.index.read().mode == IngressMode::Off {
            tracing::info!("Ingress processing is disabled");
            self.synced.mark();
            drop(stop.signaled().await);
            return;
        }

        watch::index(
            self.cluster.api::<Ingress>(self.client.clone()),
            watcher::Config::default(),
            self.index.clone(),
            self.cluster.resync,
            stop,
        )
        .instrument(info_span!("ingresses"))
        .await
    }

    fn synced(&self) -> Synced {
        self.synced.subscribe()
    }
}

impl ConfigSource for IngressSource {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn list(&self, kind: &str) -> Result<Vec<Arc<ConfigObject>>, Error> {
        let index = self.index.read();
        if !index.synced.is_synced() {
            return Err(Error::unavailable(Self::NAME, "ingresses have not been listed yet"));
        }
        Ok(index.store.list(kind))
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
    pub(crate) fn new(
        mesh: &MeshConfig,
        domain_suffix: &str,
        synced: SyncedTx,
        metrics: IndexMetrics,
    ) -> Self {
        Self {
            mode: mesh.ingress_controller_mode,
            class: mesh.ingress_class.clone(),
            domain_suffix: domain_suffix.to_string(),
            store: Store::default(),
            by_ingress: HashMap::new(),
            synced,
            metrics,
        }
    }

    fn manages(&self, ingress: &Ingress) -> bool {
        self.mode.manages(ingress_class(ingress), &self.class)
    }

    /// Replaces the rules derived from one ingress.
    fn update(&mut self, id: (String, String), objects: Vec<ConfigObject>) {
        let keys = objects.iter().map(|o| o.key.clone()).collect::<BTreeSet<_>>();
        let stale = self.by_ingress.remove(&id).unwrap_or_default();
        for obj in objects {
            self.store.apply(obj);
        }
        for key in stale.difference(&keys) {
            self.store.delete(key);
        }
        if !keys.is_empty() {
            self.by_ingress.insert(id, keys);
        }
    }

    fn derive(&self, ingress: &Ingress) -> Vec<ConfigObject> {
        if !self.manages(ingress) {
            return vec![];
        }
        convert(ingress, &self.domain_suffix)
    }
}

impl IndexNamespacedResource<Ingress> for Index {
    fn apply(&mut self, ingress: Ingress) {
        let Some(ns) = ingress.namespace() else {
            return;
        };
        let id = (ns, ingress.name_unchecked());
        let objects = self.derive(&ingress);
        tracing::debug!(namespace = %id.0, name = %id.1, rules = objects.len(), "Applying");
        self.update(id, objects);
        self.metrics.applied("Ingress", self.by_ingress.len());
    }

    fn delete(&mut self, namespace: String, name: String) {
        tracing::debug!(%namespace, %name, "Deleting");
        self.update((namespace, name), vec![]);
        self.metrics.deleted("Ingress", self.by_ingress.len());
    }

    fn reset(&mut self, ingresses: Vec<Ingress>, _removed: NamespacedRemoved) {
        let mut vanished = self.by_ingress.keys().cloned().collect::<BTreeSet<_>>();
        for ingress in ingresses {
            let Some(ns) = ingress.namespace() else {
                continue;
            };
            let id = (ns, ingress.name_unchecked());
            vanished.remove(&id);
            let objects = self.derive(&ingress);
            self.update(id, objects);
        }
        for id in vanished {
            self.update(id, vec![]);
        }

        self.metrics.reset("Ingress", self.by_ingress.len());
        if self.synced.mark() {
            tracing::info!(rules = self.store.len(), "Synced");
        }
    }
}

pub(crate) fn ingress_class(ingress: &Ingress) -> Option<&str> {
    ingress
        .annotations()
        .get(INGRESS_CLASS_ANNOTATION)
        .map(String::as_str)
        .or_else(|| ingress.spec.as_ref()?.ingress_class_name.as_deref())
}

/// Translates an ingress into one route rule per host and path, plus one for
/// the default backend.
///
/// Rules are named `{ingress}-{rule}-{path}` after the positions of the rule
/// and path within the ingress.
pub(crate) fn convert(ingress: &Ingress, domain_suffix: &str) -> Vec<ConfigObject> {
    let Some(ns) = ingress.namespace() else {
        return vec![];
    };
    let name = ingress.name_unchecked();
    let revision = ingress.resource_version().unwrap_or_default();
    let Some(spec) = ingress.spec.as_ref() else {
        return vec![];
    };

    let mut rules = vec![];
    for (i, rule) in spec.rules.iter().flatten().enumerate() {
        let paths = rule.http.iter().flat_map(|http| http.paths.iter());
        for (j, path) in paths.enumerate() {
            let Some(destination) = backend_ref(&path.backend, &ns, domain_suffix) else {
                tracing::debug!(ingress = %name, rule = i, path = j, "Skipping non-service backend");
                continue;
            };
            let (uri, precedence) = path_match(path);
            let mut headers = std::collections::BTreeMap::new();
            if let Some(host) = rule.host.as_ref() {
                headers.insert("authority".to_string(), StringMatch::Exact(host.clone()));
            }
            if let Some(uri) = uri {
                headers.insert("uri".to_string(), uri);
            }
            let spec = RouteRuleSpec {
                destination,
                precedence,
                matches: (!headers.is_empty()).then(|| MatchCondition {
                    source: None,
                    request: Some(RequestMatch { headers }),
                }),
                ..Default::default()
            };
            rules.push((format!("{name}-{i}-{j}"), spec));
        }
    }

    if let Some(backend) = spec.default_backend.as_ref() {
        if let Some(destination) = backend_ref(backend, &ns, domain_suffix) {
            let spec = RouteRuleSpec {
                destination,
                precedence: DEFAULT_BACKEND_PRECEDENCE,
                ..Default::default()
            };
            rules.push((format!("{name}-default"), spec));
        }
    }

    rules
        .into_iter()
        .filter_map(|(rule_name, spec)| {
            let spec = serde_json::to_value(spec).ok()?;
            Some(ConfigObject::new(
                ConfigKey::new(ROUTE_RULE, &ns, rule_name),
                &revision,
                spec,
            ))
        })
        .collect()
}

fn backend_ref(backend: &IngressBackend, ns: &str, domain_suffix: &str) -> Option<ServiceRef> {
    let svc = backend.service.as_ref()?;
    Some(ServiceRef {
        name: svc.name.clone(),
        namespace: Some(ns.to_string()),
        domain: Some(domain_suffix.to_string()),
        ..Default::default()
    })
}

fn path_match(path: &HTTPIngressPath) -> (Option<StringMatch>, i32) {
    let Some(p) = path.path.as_ref().filter(|p| !p.is_empty() && *p != "/") else {
        return (None, PREFIX_PRECEDENCE);
    };
    match path.path_type.as_str() {
        "Exact" => (Some(StringMatch::Exact(p.clone())), EXACT_PRECEDENCE),
        _ => (Some(StringMatch::Prefix(p.clone())), PREFIX_PRECEDENCE),
    }
}
