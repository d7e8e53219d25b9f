//! Kubernetes adapters for the pilot.
//!
//! Each adapter keeps its own index, fed by `kubert::index::namespaced` from a
//! `kube` watcher:
//!
//! - [`KubeConfigSource`] indexes `RouteRule` and `DestinationPolicy`
//!   resources as configuration objects.
//! - [`IngressSource`] derives route rules from `Ingress` resources managed by
//!   the mesh.
//! - [`KubeServiceRegistry`] joins `Service`, `EndpointSlice` and `Pod`
//!   resources into service instances.
//!
//! ```text
//! [ RouteRule ] [ DestinationPolicy ] -> [ KubeConfigSource ]
//! [ Ingress ] ------------------------> [ IngressSource ]
//! [ Service ] <- [ EndpointSlice ] -> [ Pod ] -> [ KubeServiceRegistry ]
//! ```
//!
//! Once a watch has completed its initial listing, it is restarted on the
//! configured resync interval. The fresh listing is reconciled against the index so that objects deleted while a
//! watch was broken are removed.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod crd;
mod ingress;
mod lease;
mod metrics;
mod registry;
mod resource;
mod status;
mod watch;

pub use self::{
    ingress::IngressSource,
    lease::{init as init_lease, Lease},
    metrics::IndexMetrics,
    registry::KubeServiceRegistry,
    resource::KubeConfigSource,
    status::StatusSyncer,
};
use std::time::Duration;

/// Holds cluster metadata shared by the Kubernetes adapters.
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    /// Restricts watches to a single namespace. All namespaces are watched
    /// when unset.
    pub namespace: Option<String>,

    /// The cluster's DNS domain suffix, e.g. `cluster.local`.
    pub domain_suffix: String,

    /// How often watches are restarted with a full listing.
    pub resync: Duration,
}

impl ClusterInfo {
    fn api<K>(&self, client: kube::Client) -> kube::Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match self.namespace.as_deref() {
            Some(ns) => kube::Api::namespaced(client, ns),
            None => kube::Api::all(client),
        }
    }

    /// The fully qualified name of a service.
    pub fn service_hostname(&self, ns: &str, name: &str) -> String {
        format!("{name}.{ns}.svc.{}", self.domain_suffix)
    }
}
