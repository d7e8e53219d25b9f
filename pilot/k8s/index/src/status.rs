use crate::{ingress::ingress_class, lease::Lease, ClusterInfo};
use anyhow::{Context, Result};
use k8s_openapi::api::{
    core::v1::LoadBalancerIngress,
    networking::v1::IngressLoadBalancerIngress,
};
use kube::{
    api::{ListParams, Patch, PatchParams},
    ResourceExt,
};
use mesh_pilot_core::{Controller, StopSignal, Synced};
use mesh_pilot_k8s_api::{self as k8s, Ingress, MeshConfig};
use std::time::Duration;

/// Writes the load balancer addresses of the mesh ingress service into the
/// status of every ingress the mesh manages.
///
/// Only the holder of the status lease writes; other replicas idle until they
/// acquire it.
pub struct StatusSyncer {
    client: kube::Client,
    cluster: ClusterInfo,
    mesh: MeshConfig,
    /// The namespace of the mesh ingress service.
    namespace: String,
    hostname: String,
    interval: Duration,
    lease: Lease,
}

impl StatusSyncer {
    pub fn new(
        client: kube::Client,
        cluster: ClusterInfo,
        mesh: MeshConfig,
        namespace: String,
        hostname: String,
        interval: Duration,
        lease: Lease,
    ) -> Self {
        Self {
            client,
            cluster,
            mesh,
            namespace,
            hostname,
            interval,
            lease,
        }
    }

    fn is_leader(&self) -> bool {
        self.lease.claims.borrow().is_current_for(&self.hostname)
    }

    async fn sync(&self) -> Result<usize> {
        let services = kube::Api::<k8s::Service>::namespaced(self.client.clone(), &self.namespace);
        let service = services
            .get_opt(&self.mesh.ingress_service)
            .await
            .with_context(|| format!("failed to get service {}", self.mesh.ingress_service))?;
        let addresses = service
            .and_then(|svc| svc.status?.load_balancer?.ingress)
            .unwrap_or_default();
        let desired = desired_status(&addresses);

        let api = self.cluster.api::<Ingress>(self.client.clone());
        let ingresses = api
            .list(&ListParams::default())
            .await
            .context("failed to list ingresses")?;

        let mut patched = 0;
        for ingress in ingresses {
            let managed = self
                .mesh
                .ingress_controller_mode
                .manages(ingress_class(&ingress), &self.mesh.ingress_class);
            if !managed || !needs_update(&ingress, &desired) {
                continue;
            }
            let Some(ns) = ingress.namespace() else { continue };
            let name = ingress.name_unchecked();
            let patch = Patch::Merge(serde_json::json!({
                "status": { "loadBalancer": { "ingress": desired } }
            }));
            let api = kube::Api::<Ingress>::namespaced(self.client.clone(), &ns);
            match api.patch_status(&name, &PatchParams::default(), &patch).await {
                Ok(_) => patched += 1,
                Err(error) => {
                    tracing::warn!(%ns, %name, %error, "Failed to update ingress status")
                }
            }
        }
        Ok(patched)
    }
}

#[async_trait::async_trait]
impl Controller for StatusSyncer {
    async fn run(&self, stop: StopSignal) {
        let shutdown = stop.signaled();
        tokio::pin!(shutdown);

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                release = &mut shutdown => {
                    self.lease.task.abort();
                    drop(release);
                    return;
                }

                _ = interval.tick() => {
                    if !self.is_leader() {
                        tracing::trace!("Not the status lease holder");
                        continue;
                    }
                    match self.sync().await {
                        Ok(0) => {}
                        Ok(patched) => tracing::info!(patched, "Updated ingress statuses"),
                        Err(error) => tracing::warn!(%error, "Ingress status sync failed"),
                    }
                }
            }
        }
    }

    fn synced(&self) -> Synced {
        Synced::ready()
    }
}

/// The ingress status entries matching a service's load balancer, sorted so
/// that statuses can be compared.
pub(crate) fn desired_status(addresses: &[LoadBalancerIngress]) -> Vec<IngressLoadBalancerIngress> {
    let mut status = addresses
        .iter()
        .map(|lb| IngressLoadBalancerIngress {
            ip: lb.ip.clone(),
            hostname: lb.hostname.clone(),
            ports: None,
        })
        .collect::<Vec<_>>();
    sort(&mut status);
    status
}

pub(crate) fn needs_update(ingress: &Ingress, desired: &[IngressLoadBalancerIngress]) -> bool {
    let mut current = ingress
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.clone())
        .unwrap_or_default();
    sort(&mut current);
    current != desired
}

fn sort(status: &mut [IngressLoadBalancerIngress]) {
    status.sort_by(|a, b| (&a.ip, &a.hostname).cmp(&(&b.ip, &b.hostname)));
}
