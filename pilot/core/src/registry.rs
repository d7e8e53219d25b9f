//! Service registry model.
//!
//! Registries expose services and the workload instances behind them. Each
//! registry keeps its state in a [`Catalog`], which bumps a revision on every
//! change so consumers can invalidate anything derived from it.

use crate::Controller;
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    net::IpAddr,
};
use tokio::sync::watch;

pub type Labels = BTreeMap<String, String>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Service {
    /// Fully qualified name, e.g. `reviews.default.svc.cluster.local`.
    pub hostname: String,
    pub address: Option<IpAddr>,
    pub ports: Vec<ServicePort>,
    /// Set for services that alias an external DNS name.
    pub external_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ServicePort {
    pub name: String,
    pub port: u16,
    pub protocol: Protocol,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Grpc,
    Http,
    Http2,
    Https,
    Tcp,
    Udp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServiceInstance {
    pub endpoint: Endpoint,
    pub hostname: String,
    pub labels: Labels,
    pub service_account: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub address: IpAddr,
    pub port: u16,
    pub service_port: ServicePort,
}

/// Service and endpoint discovery.
pub trait ServiceDiscovery: Send + Sync {
    fn services(&self) -> Vec<Service>;

    fn get_service(&self, hostname: &str) -> Option<Service>;

    /// Instances of `hostname` listening on any of the named `ports` (all
    /// ports when empty) whose labels are a superset of any of `labels` (all
    /// instances when empty).
    fn instances(&self, hostname: &str, ports: &[&str], labels: &[Labels]) -> Vec<ServiceInstance>;

    /// Instances whose endpoint address is one of `addrs`.
    fn host_instances(&self, addrs: &HashSet<IpAddr>) -> Vec<ServiceInstance>;

    /// A revision that increases whenever the registry's contents change.
    fn revision(&self) -> watch::Receiver<u64>;
}

/// Service identity lookups.
pub trait ServiceAccounts: Send + Sync {
    /// The distinct identities of the workloads backing `hostname` on the
    /// named `ports`, sorted.
    fn service_accounts(&self, hostname: &str, ports: &[&str]) -> Vec<String>;
}

/// A runnable source of service data.
pub trait ServiceRegistry: Controller + ServiceDiscovery + ServiceAccounts {}

impl<T: Controller + ServiceDiscovery + ServiceAccounts + ?Sized> ServiceRegistry for T {}

/// In-memory registry state.
#[derive(Debug)]
pub struct Catalog {
    services: BTreeMap<String, Service>,
    instances: BTreeMap<String, Vec<ServiceInstance>>,
    revision: watch::Sender<u64>,
}

// === impl Protocol ===

impl Protocol {
    /// Infers a protocol from a port name by its prefix (`http-web`,
    /// `grpc`, ...). Unknown names are treated as TCP.
    pub fn from_port_name(name: &str) -> Self {
        let prefix = name.split('-').next().unwrap_or_default();
        match prefix.to_ascii_lowercase().as_str() {
            "grpc" => Self::Grpc,
            "http" => Self::Http,
            "http2" => Self::Http2,
            "https" => Self::Https,
            "udp" => Self::Udp,
            _ => Self::Tcp,
        }
    }
}

// === impl Catalog ===

impl Default for Catalog {
    fn default() -> Self {
        Self {
            services: BTreeMap::new(),
            instances: BTreeMap::new(),
            revision: watch::channel(0).0,
        }
    }
}

impl Catalog {
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn upsert_service(&mut self, svc: Service) {
        if self.services.get(&svc.hostname) == Some(&svc) {
            return;
        }
        self.services.insert(svc.hostname.clone(), svc);
        self.bump();
    }

    pub fn remove_service(&mut self, hostname: &str) {
        let removed = self.services.remove(hostname).is_some();
        if removed {
            self.bump();
        }
    }

    pub fn set_instances(&mut self, hostname: &str, instances: Vec<ServiceInstance>) {
        let current = self.instances.get(hostname);
        if current.map(Vec::as_slice).unwrap_or_default() == instances.as_slice() {
            return;
        }
        if instances.is_empty() {
            self.instances.remove(hostname);
        } else {
            self.instances.insert(hostname.to_string(), instances);
        }
        self.bump();
    }

    /// Replaces the entire catalog, bumping the revision only if anything
    /// changed.
    pub fn replace(
        &mut self,
        services: impl IntoIterator<Item = Service>,
        instances: impl IntoIterator<Item = ServiceInstance>,
    ) {
        let services = services
            .into_iter()
            .map(|s| (s.hostname.clone(), s))
            .collect::<BTreeMap<_, _>>();
        let mut by_host = BTreeMap::<String, Vec<ServiceInstance>>::new();
        for inst in instances {
            by_host.entry(inst.hostname.clone()).or_default().push(inst);
        }
        if services == self.services && by_host == self.instances {
            return;
        }
        self.services = services;
        self.instances = by_host;
        self.bump();
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}

impl ServiceDiscovery for Catalog {
    fn services(&self) -> Vec<Service> {
        self.services.values().cloned().collect()
    }

    fn get_service(&self, hostname: &str) -> Option<Service> {
        self.services.get(hostname).cloned()
    }

    fn instances(&self, hostname: &str, ports: &[&str], labels: &[Labels]) -> Vec<ServiceInstance> {
        self.instances
            .get(hostname)
            .into_iter()
            .flatten()
            .filter(|inst| ports.is_empty() || ports.contains(&inst.endpoint.service_port.name.as_str()))
            .filter(|inst| {
                labels.is_empty()
                    || labels.iter().any(|want| {
                        want.iter()
                            .all(|(k, v)| inst.labels.get(k).map(|l| l == v).unwrap_or(false))
                    })
            })
            .cloned()
            .collect()
    }

    fn host_instances(&self, addrs: &HashSet<IpAddr>) -> Vec<ServiceInstance> {
        self.instances
            .values()
            .flatten()
            .filter(|inst| addrs.contains(&inst.endpoint.address))
            .cloned()
            .collect()
    }

    fn revision(&self) -> watch::Receiver<u64> {
        self.subscribe()
    }
}

impl ServiceAccounts for Catalog {
    fn service_accounts(&self, hostname: &str, ports: &[&str]) -> Vec<String> {
        self.instances(hostname, ports, &[])
            .into_iter()
            .filter_map(|inst| inst.service_account)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}
