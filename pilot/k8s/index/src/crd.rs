//! Registration of the mesh's custom resource definitions.

use anyhow::{bail, Context, Result};
use kube::{
    api::{Patch, PatchParams},
    runtime::wait::{await_condition, conditions},
    ResourceExt,
};
use mesh_pilot_k8s_api::CustomResourceDefinition;
use std::time::Duration;

const FIELD_MANAGER: &str = "mesh-pilot";

/// Applies the `RouteRule` and `DestinationPolicy` definitions and waits for
/// the API server to establish them.
///
/// Applying is idempotent, so every replica may register on startup.
pub async fn register(client: kube::Client, timeout: Duration) -> Result<()> {
    let api = kube::Api::<CustomResourceDefinition>::all(client);
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in mesh_pilot_k8s_api::crds() {
        let name = crd.name_unchecked();
        api.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .with_context(|| format!("failed to apply {name}"))?;
        tracing::debug!(%name, "Applied CustomResourceDefinition");

        let established = await_condition(api.clone(), &name, conditions::is_crd_established());
        match tokio::time::timeout(timeout, established).await {
            Ok(Ok(_)) => tracing::info!(%name, "Registered CustomResourceDefinition"),
            Ok(Err(error)) => {
                return Err(error).with_context(|| format!("failed to wait for {name}"))
            }
            Err(_) => bail!("timed out waiting for {name} to be established"),
        }
    }
    Ok(())
}
