use anyhow::Result;
use k8s_openapi::api::coordination::v1 as coordv1;
use kube::api::{ObjectMeta, Patch, PatchParams};
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::AbortHandle};

const LEASE_DURATION: Duration = Duration::from_secs(30);
const LEASE_NAME: &str = "mesh-pilot-ingress-status";
const RENEW_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// A claim on the ingress status lease, renewed in the background until the
/// task is aborted.
pub struct Lease {
    pub claims: watch::Receiver<Arc<kubert::lease::Claim>>,
    pub task: AbortHandle,
}

/// Ensures the ingress status lease exists in `ns` and starts contending for
/// it as `hostname`.
pub async fn init(client: kube::Client, ns: &str, hostname: &str) -> Result<Lease> {
    let lease = coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            namespace: Some(ns.to_string()),
            // A resource version of "0" only creates the Lease if it is absent.
            resource_version: Some("0".to_string()),
            labels: Some(
                [("app.kubernetes.io/component".to_string(), "pilot".to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let api = kube::Api::<coordv1::Lease>::namespaced(client, ns);
    let params = PatchParams {
        field_manager: Some("mesh-pilot".to_string()),
        ..Default::default()
    };
    match api.patch(LEASE_NAME, &params, &Patch::Apply(lease)).await {
        Ok(lease) => tracing::info!(?lease, "Created Lease resource"),
        Err(kube::Error::Api(_)) => tracing::debug!("Lease already exists"),
        Err(error) => return Err(error.into()),
    }

    let params = kubert::lease::ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, task) = kubert::lease::LeaseManager::init(api, LEASE_NAME)
        .await?
        .spawn(hostname, params)
        .await?;
    Ok(Lease {
        claims,
        task: task.abort_handle(),
    })
}
