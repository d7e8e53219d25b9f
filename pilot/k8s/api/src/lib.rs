#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod duration;
pub mod mesh;

pub use self::{
    duration::GoDuration,
    mesh::{IngressMode, MeshConfig},
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{ConfigMap, Pod, PodSpec, PodStatus, Service, ServicePort, ServiceSpec},
        discovery::v1::{Endpoint, EndpointSlice},
        networking::v1::{Ingress, IngressSpec, IngressStatus},
    },
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
};
pub use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, ResourceExt},
    runtime::watcher,
    Client, CustomResourceExt, Error, Resource,
};

/// The definitions of every custom resource the pilot watches.
pub fn crds() -> Vec<CustomResourceDefinition> {
    vec![config::RouteRule::crd(), config::DestinationPolicy::crd()]
}
