//! Wires adapters, the config cache and its consumers into a running pilot.
//!
//! Loops are started in two phases by the [`Orchestrator`]: the service
//! registry and the config cache first, then the consumers that read them
//! (the [`DiscoveryServer`] or a [`ConfigWatcher`], and the ingress status
//! writer). The kubert admin server reports liveness, readiness and metrics
//! throughout.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use mesh_pilot_aggregate as aggregate;
pub use mesh_pilot_core as core;
pub use mesh_pilot_k8s_api as k8s;
pub use mesh_pilot_k8s_index as index;
pub use mesh_pilot_vms as vms;

mod args;
mod discovery;
mod orchestrator;
mod runner;
mod watcher;

#[cfg(test)]
mod tests;

pub use self::{
    args::Args,
    discovery::{DiscoveryMetrics, DiscoveryServer},
    orchestrator::Orchestrator,
    runner::{ControllerRunner, LoopState},
    watcher::{ConfigWatcher, ProxyIdentity, ProxySnapshot},
};
