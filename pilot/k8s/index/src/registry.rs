use crate::{metrics::IndexMetrics, watch, ClusterInfo};
use ahash::{AHashMap as HashMap, AHashSet};
use kube::{runtime::watcher, ResourceExt};
use kubert::index::{IndexNamespacedResource, NamespacedRemoved};
use mesh_pilot_core::{
    registry::{
        Catalog, Endpoint, Labels, Protocol, Service, ServiceInstance, ServicePort,
    },
    Controller, ServiceAccounts, ServiceDiscovery, StopSignal, Synced, SyncedTx,
};
use mesh_pilot_k8s_api::{self as k8s, EndpointSlice, Pod};
use parking_lot::RwLock;
use std::{
    collections::{BTreeSet, HashSet},
    net::IpAddr,
    sync::Arc,
};
use tokio::sync::watch as tokio_watch;
use tracing::{info_span, Instrument};

/// The label linking an endpoint slice to its service.
const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Discovers services and their instances from `Service`, `EndpointSlice`
/// and `Pod` resources.
pub struct KubeServiceRegistry {
    client: kube::Client,
    cluster: ClusterInfo,
    index: Arc<RwLock<Index>>,
    synced: SyncedTx,
}

type Id = (String, String);

pub(crate) struct Index {
    domain_suffix: String,
    services: HashMap<Id, k8s::Service>,
    slices: HashMap<Id, EndpointSlice>,
    pods: HashMap<Id, PodInfo>,
    pods_by_ip: HashMap<IpAddr, Id>,
    catalog: Catalog,
    synced_kinds: BTreeSet<&'static str>,
    synced: SyncedTx,
    metrics: IndexMetrics,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct PodInfo {
    ips: Vec<IpAddr>,
    labels: Labels,
    service_account: Option<String>,
}

const SERVICE: &str = "Service";
const ENDPOINT_SLICE: &str = "EndpointSlice";
const POD: &str = "Pod";

// === impl KubeServiceRegistry ===

impl KubeServiceRegistry {
    pub fn new(client: kube::Client, cluster: ClusterInfo, metrics: IndexMetrics) -> Self {
        let synced = SyncedTx::default();
        let index = Index::new(&cluster.domain_suffix, synced.clone(), metrics);
        Self {
            client,
            cluster,
            index: Arc::new(RwLock::new(index)),
            synced,
        }
    }
}

#[async_trait::async_trait]
impl Controller for KubeServiceRegistry {
    async fn run(&self, stop: StopSignal) {
        let services = watch::index(
            self.cluster.api::<k8s::Service>(self.client.clone()),
            watcher::Config::default(),
            self.index.clone(),
            self.cluster.resync,
            stop.clone(),
        )
        .instrument(info_span!("services"));

        let slices = watch::index(
            self.cluster.api::<EndpointSlice>(self.client.clone()),
            watcher::Config::default().labels(SERVICE_NAME_LABEL),
            self.index.clone(),
            self.cluster.resync,
            stop.clone(),
        )
        .instrument(info_span!("endpointslices"));

        let pods = watch::index(
            self.cluster.api::<Pod>(self.client.clone()),
            watcher::Config::default(),
            self.index.clone(),
            self.cluster.resync,
            stop,
        )
        .instrument(info_span!("pods"));

        tokio::join!(services, slices, pods);
    }

    fn synced(&self) -> Synced {
        self.synced.subscribe()
    }
}

impl ServiceDiscovery for KubeServiceRegistry {
    fn services(&self) -> Vec<Service> {
        self.index.read().catalog.services()
    }

    fn get_service(&self, hostname: &str) -> Option<Service> {
        self.index.read().catalog.get_service(hostname)
    }

    fn instances(&self, hostname: &str, ports: &[&str], labels: &[Labels]) -> Vec<ServiceInstance> {
        self.index.read().catalog.instances(hostname, ports, labels)
    }

    fn host_instances(&self, addrs: &HashSet<IpAddr>) -> Vec<ServiceInstance> {
        self.index.read().catalog.host_instances(addrs)
    }

    fn revision(&self) -> tokio_watch::Receiver<u64> {
        self.index.read().catalog.subscribe()
    }
}

impl ServiceAccounts for KubeServiceRegistry {
    fn service_accounts(&self, hostname: &str, ports: &[&str]) -> Vec<String> {
        self.index.read().catalog.service_accounts(hostname, ports)
    }
}

// === impl Index ===

impl Index {
    pub(crate) fn new(domain_suffix: &str, synced: SyncedTx, metrics: IndexMetrics) -> Self {
        Self {
            domain_suffix: domain_suffix.to_string(),
            services: HashMap::new(),
            slices: HashMap::new(),
            pods: HashMap::new(),
            pods_by_ip: HashMap::new(),
            catalog: Catalog::default(),
            synced_kinds: BTreeSet::new(),
            synced,
            metrics,
        }
    }

    fn hostname(&self, (ns, name): &Id) -> String {
        format!("{name}.{ns}.svc.{}", self.domain_suffix)
    }

    fn identity(&self, ns: &str, service_account: &str) -> String {
        format!("spiffe://{}/ns/{ns}/sa/{service_account}", self.domain_suffix)
    }

    /// Recomputes the catalog entries of one service.
    fn refresh(&mut self, id: &Id) {
        let hostname = self.hostname(id);
        let Some(svc) = self.services.get(id) else {
            self.catalog.remove_service(&hostname);
            self.catalog.set_instances(&hostname, vec![]);
            return;
        };

        let service = convert_service(svc, hostname.clone());
        let instances = self.instances(id, &service);
        self.catalog.upsert_service(service);
        self.catalog.set_instances(&hostname, instances);
    }

    fn instances(&self, id: &Id, service: &Service) -> Vec<ServiceInstance> {
        let mut instances = vec![];
        let slices = self
            .slices
            .iter()
            .filter(|((ns, _), slice)| *ns == id.0 && slice_service(slice) == Some(id.1.as_str()));
        for (_, slice) in slices {
            for ep in &slice.endpoints {
                if ep.conditions.as_ref().and_then(|c| c.ready) == Some(false) {
                    continue;
                }
                for addr in ep.addresses.iter().filter_map(|a| a.parse::<IpAddr>().ok()) {
                    let pod = self
                        .pods_by_ip
                        .get(&addr)
                        .and_then(|pod| self.pods.get(pod));
                    for port in slice.ports.iter().flatten() {
                        let name = port.name.clone().unwrap_or_default();
                        let Some(service_port) = service.ports.iter().find(|p| p.name == name)
                        else {
                            continue;
                        };
                        let Some(target) = port.port.and_then(|p| u16::try_from(p).ok()) else {
                            continue;
                        };
                        instances.push(ServiceInstance {
                            endpoint: Endpoint {
                                address: addr,
                                port: target,
                                service_port: service_port.clone(),
                            },
                            hostname: service.hostname.clone(),
                            labels: pod.map(|p| p.labels.clone()).unwrap_or_default(),
                            service_account: pod
                                .and_then(|p| p.service_account.as_deref())
                                .map(|sa| self.identity(&id.0, sa)),
                        });
                    }
                }
            }
        }
        instances.sort_by(|a, b| {
            (a.endpoint.address, a.endpoint.port).cmp(&(b.endpoint.address, b.endpoint.port))
        });
        instances
    }

    /// The services with an endpoint at any of `ips`.
    fn services_at(&self, ips: &[IpAddr]) -> AHashSet<Id> {
        self.slices
            .iter()
            .filter(|(_, slice)| {
                slice.endpoints.iter().any(|ep| {
                    ep.addresses
                        .iter()
                        .filter_map(|a| a.parse::<IpAddr>().ok())
                        .any(|a| ips.contains(&a))
                })
            })
            .filter_map(|((ns, _), slice)| Some((ns.clone(), slice_service(slice)?.to_string())))
            .collect()
    }

    fn mark_synced(&mut self, kind: &'static str) {
        self.synced_kinds.insert(kind);
        if [SERVICE, ENDPOINT_SLICE, POD]
            .iter()
            .all(|k| self.synced_kinds.contains(k))
            && self.synced.mark()
        {
            tracing::info!(services = self.catalog.len(), "Synced");
        }
    }
}

fn slice_service(slice: &EndpointSlice) -> Option<&str> {
    slice.labels().get(SERVICE_NAME_LABEL).map(String::as_str)
}

fn convert_service(svc: &k8s::Service, hostname: String) -> Service {
    let spec = svc.spec.clone().unwrap_or_default();
    let address = spec
        .cluster_ip
        .as_deref()
        .filter(|ip| *ip != "None")
        .and_then(|ip| ip.parse().ok());
    let ports = spec
        .ports
        .iter()
        .flatten()
        .filter_map(|p| {
            let name = p.name.clone().unwrap_or_default();
            let protocol = match p.protocol.as_deref() {
                Some("UDP") => Protocol::Udp,
                _ => Protocol::from_port_name(&name),
            };
            Some(ServicePort {
                port: u16::try_from(p.port).ok()?,
                name,
                protocol,
            })
        })
        .collect();
    let external_name = match spec.type_.as_deref() {
        Some("ExternalName") => spec.external_name,
        _ => None,
    };
    Service {
        hostname,
        address,
        ports,
        external_name,
    }
}

fn pod_info(pod: &Pod) -> PodInfo {
    let status = pod.status.as_ref();
    let ips = status
        .and_then(|s| s.pod_ips.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|ip| ip.ip.parse().ok())
        .chain(
            status
                .and_then(|s| s.pod_ip.as_deref())
                .and_then(|ip| ip.parse().ok()),
        )
        .collect::<BTreeSet<IpAddr>>()
        .into_iter()
        .collect();
    PodInfo {
        ips,
        labels: pod.labels().clone(),
        service_account: pod
            .spec
            .as_ref()
            .and_then(|s| s.service_account_name.clone()),
    }
}

impl IndexNamespacedResource<k8s::Service> for Index {
    fn apply(&mut self, svc: k8s::Service) {
        let Some(ns) = svc.namespace() else { return };
        let id = (ns, svc.name_unchecked());
        self.services.insert(id.clone(), svc);
        self.refresh(&id);
        self.metrics.applied(SERVICE, self.services.len());
    }

    fn delete(&mut self, ns: String, name: String) {
        let id = (ns, name);
        self.services.remove(&id);
        self.refresh(&id);
        self.metrics.deleted(SERVICE, self.services.len());
    }

    fn reset(&mut self, services: Vec<k8s::Service>, _removed: NamespacedRemoved) {
        let mut stale = self.services.keys().cloned().collect::<AHashSet<_>>();
        for svc in services {
            let Some(ns) = svc.namespace() else { continue };
            let id = (ns, svc.name_unchecked());
            stale.remove(&id);
            self.services.insert(id, svc);
        }
        for id in &stale {
            self.services.remove(id);
        }
        let ids = self.services.keys().cloned().chain(stale).collect::<Vec<_>>();
        for id in ids {
            self.refresh(&id);
        }
        self.metrics.reset(SERVICE, self.services.len());
        self.mark_synced(SERVICE);
    }
}

impl IndexNamespacedResource<EndpointSlice> for Index {
    fn apply(&mut self, slice: EndpointSlice) {
        let Some(ns) = slice.namespace() else { return };
        let id = (ns, slice.name_unchecked());
        let prior = self.slices.insert(id.clone(), slice);
        let mut affected = AHashSet::new();
        for slice in prior.iter().chain(self.slices.get(&id)) {
            if let Some(svc) = slice_service(slice) {
                affected.insert((id.0.clone(), svc.to_string()));
            }
        }
        for svc in affected {
            self.refresh(&svc);
        }
        self.metrics.applied(ENDPOINT_SLICE, self.slices.len());
    }

    fn delete(&mut self, ns: String, name: String) {
        if let Some(slice) = self.slices.remove(&(ns.clone(), name)) {
            if let Some(svc) = slice_service(&slice) {
                self.refresh(&(ns, svc.to_string()));
            }
        }
        self.metrics.deleted(ENDPOINT_SLICE, self.slices.len());
    }

    fn reset(&mut self, slices: Vec<EndpointSlice>, _removed: NamespacedRemoved) {
        let mut affected = self
            .slices
            .iter()
            .filter_map(|((ns, _), s)| Some((ns.clone(), slice_service(s)?.to_string())))
            .collect::<AHashSet<_>>();
        self.slices.clear();
        for slice in slices {
            let Some(ns) = slice.namespace() else { continue };
            if let Some(svc) = slice_service(&slice) {
                affected.insert((ns.clone(), svc.to_string()));
            }
            self.slices.insert((ns, slice.name_unchecked()), slice);
        }
        for svc in affected {
            self.refresh(&svc);
        }
        self.metrics.reset(ENDPOINT_SLICE, self.slices.len());
        self.mark_synced(ENDPOINT_SLICE);
    }
}

impl IndexNamespacedResource<Pod> for Index {
    fn apply(&mut self, pod: Pod) {
        let Some(ns) = pod.namespace() else { return };
        let id = (ns, pod.name_unchecked());
        let info = pod_info(&pod);
        if self.pods.get(&id) == Some(&info) {
            return;
        }
        let mut ips = info.ips.clone();
        if let Some(prior) = self.pods.insert(id.clone(), info) {
            for ip in &prior.ips {
                if self.pods_by_ip.get(ip) == Some(&id) {
                    self.pods_by_ip.remove(ip);
                }
            }
            ips.extend(prior.ips);
        }
        if let Some(info) = self.pods.get(&id) {
            for ip in &info.ips {
                self.pods_by_ip.insert(*ip, id.clone());
            }
        }
        for svc in self.services_at(&ips) {
            self.refresh(&svc);
        }
        self.metrics.applied(POD, self.pods.len());
    }

    fn delete(&mut self, ns: String, name: String) {
        let id = (ns, name);
        if let Some(info) = self.pods.remove(&id) {
            for ip in &info.ips {
                if self.pods_by_ip.get(ip) == Some(&id) {
                    self.pods_by_ip.remove(ip);
                }
            }
            for svc in self.services_at(&info.ips) {
                self.refresh(&svc);
            }
        }
        self.metrics.deleted(POD, self.pods.len());
    }

    fn reset(&mut self, pods: Vec<Pod>, _removed: NamespacedRemoved) {
        self.pods.clear();
        self.pods_by_ip.clear();
        for pod in pods {
            let Some(ns) = pod.namespace() else { continue };
            let id = (ns, pod.name_unchecked());
            let info = pod_info(&pod);
            for ip in &info.ips {
                self.pods_by_ip.insert(*ip, id.clone());
            }
            self.pods.insert(id, info);
        }
        let ids = self.services.keys().cloned().collect::<Vec<_>>();
        for id in ids {
            self.refresh(&id);
        }
        self.metrics.reset(POD, self.pods.len());
        self.mark_synced(POD);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::{
        core::v1::{PodIP, PodSpec, PodStatus, ServicePort as K8sServicePort, ServiceSpec},
        discovery::v1::{Endpoint as K8sEndpoint, EndpointConditions, EndpointPort},
    };
    use kube::api::ObjectMeta;
    use maplit::btreemap;

    fn mk_service(ns: &str, name: &str, ip: &str, ports: &[(&str, i32)]) -> k8s::Service {
        k8s::Service {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some(ip.to_string()),
                ports: Some(
                    ports
                        .iter()
                        .map(|(name, port)| K8sServicePort {
                            name: Some(name.to_string()),
                            port: *port,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn mk_slice(ns: &str, name: &str, svc: &str, addrs: &[(&str, bool)], ports: &[(&str, i32)]) -> EndpointSlice {
        EndpointSlice {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                labels: Some(btreemap! { SERVICE_NAME_LABEL.to_string() => svc.to_string() }),
                ..Default::default()
            },
            address_type: "IPv4".to_string(),
            endpoints: addrs
                .iter()
                .map(|(addr, ready)| K8sEndpoint {
                    addresses: vec![addr.to_string()],
                    conditions: Some(EndpointConditions {
                        ready: Some(*ready),
                        ..Default::default()
                    }),
                    ..Default::default()
                })
                .collect(),
            ports: Some(
                ports
                    .iter()
                    .map(|(name, port)| EndpointPort {
                        name: Some(name.to_string()),
                        port: Some(*port),
                        ..Default::default()
                    })
                    .collect(),
            ),
        }
    }

    fn mk_pod(ns: &str, name: &str, ip: &str, version: &str, sa: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                labels: Some(btreemap! { "version".to_string() => version.to_string() }),
                ..Default::default()
            },
            spec: Some(PodSpec {
                service_account_name: Some(sa.to_string()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: Some(ip.to_string()),
                pod_ips: Some(vec![PodIP { ip: ip.to_string() }]),
                ..Default::default()
            }),
        }
    }

    fn index() -> Index {
        Index::new("cluster.local", SyncedTx::default(), IndexMetrics::default())
    }

    const HOST: &str = "reviews.ns-0.svc.cluster.local";

    #[test]
    fn joins_services_slices_and_pods() {
        let mut idx = index();
        idx.apply(mk_service("ns-0", "reviews", "10.96.0.10", &[("http", 9080), ("grpc-api", 9090)]));
        idx.apply(mk_pod("ns-0", "reviews-v1", "10.0.0.1", "v1", "bookinfo-reviews"));
        idx.apply(mk_slice(
            "ns-0",
            "reviews-abc",
            "reviews",
            &[("10.0.0.1", true), ("10.0.0.2", false)],
            &[("http", 8080)],
        ));

        let svc = idx.catalog.get_service(HOST).expect("service must exist");
        assert_eq!(svc.address, Some("10.96.0.10".parse().unwrap()));
        assert_eq!(svc.ports[1].protocol, Protocol::Grpc);

        let instances = idx.catalog.instances(HOST, &[], &[]);
        assert_eq!(instances.len(), 1, "unready endpoints are skipped");
        let inst = &instances[0];
        assert_eq!(inst.endpoint.address, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(inst.endpoint.port, 8080);
        assert_eq!(inst.endpoint.service_port.port, 9080);
        assert_eq!(inst.labels.get("version").map(String::as_str), Some("v1"));
        assert_eq!(
            idx.catalog.service_accounts(HOST, &["http"]),
            vec!["spiffe://cluster.local/ns/ns-0/sa/bookinfo-reviews"]
        );
    }

    #[test]
    fn pod_changes_refresh_instances() {
        let mut idx = index();
        idx.apply(mk_service("ns-0", "reviews", "10.96.0.10", &[("http", 9080)]));
        idx.apply(mk_slice("ns-0", "reviews-abc", "reviews", &[("10.0.0.1", true)], &[("http", 8080)]));
        assert!(idx.catalog.service_accounts(HOST, &[]).is_empty());

        let rev = idx.catalog.subscribe();
        let before = *rev.borrow();
        idx.apply(mk_pod("ns-0", "reviews-v1", "10.0.0.1", "v1", "reviews"));
        assert!(*rev.borrow() > before);
        assert_eq!(idx.catalog.service_accounts(HOST, &[]).len(), 1);

        IndexNamespacedResource::<Pod>::delete(&mut idx, "ns-0".into(), "reviews-v1".into());
        assert!(idx.catalog.service_accounts(HOST, &[]).is_empty());
    }

    #[test]
    fn deleting_a_service_removes_it() {
        let mut idx = index();
        idx.apply(mk_service("ns-0", "reviews", "None", &[("http", 9080)]));
        idx.apply(mk_slice("ns-0", "reviews-abc", "reviews", &[("10.0.0.1", true)], &[("http", 8080)]));
        assert_eq!(idx.catalog.get_service(HOST).unwrap().address, None);
        assert_eq!(idx.catalog.instances(HOST, &[], &[]).len(), 1);

        IndexNamespacedResource::<k8s::Service>::delete(&mut idx, "ns-0".into(), "reviews".into());
        assert!(idx.catalog.get_service(HOST).is_none());
        assert!(idx.catalog.instances(HOST, &[], &[]).is_empty());
    }

    #[test]
    fn synced_after_every_kind_is_listed() {
        let synced = SyncedTx::default();
        let mut idx = Index::new("cluster.local", synced.clone(), IndexMetrics::default());
        idx.reset(vec![mk_service("ns-0", "reviews", "10.96.0.10", &[("http", 9080)])], Default::default());
        IndexNamespacedResource::<EndpointSlice>::reset(&mut idx, vec![], Default::default());
        assert!(!synced.is_synced());
        IndexNamespacedResource::<Pod>::reset(&mut idx, vec![], Default::default());
        assert!(synced.is_synced());

        // A relist without the service removes it.
        IndexNamespacedResource::<k8s::Service>::reset(&mut idx, vec![], Default::default());
        assert!(idx.catalog.is_empty());
    }
}
