pub mod destination_policy;
pub mod route_rule;

pub use self::{
    destination_policy::{DestinationPolicy, DestinationPolicySpec},
    route_rule::{RouteRule, RouteRuleSpec},
};
use std::collections::BTreeMap;

/// The API group of the mesh configuration resources.
pub const GROUP: &str = "config.mesh.io";

/// Names a service, optionally narrowed to the instances carrying `labels`.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRef {
    pub name: String,

    /// Defaults to the namespace of the referencing resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Defaults to the cluster's DNS domain suffix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ServiceRef {
    /// The fully qualified hostname of the referenced service.
    pub fn hostname(&self, default_ns: &str, default_domain: &str) -> String {
        format!(
            "{}.{}.svc.{}",
            self.name,
            self.namespace.as_deref().unwrap_or(default_ns),
            self.domain.as_deref().unwrap_or(default_domain),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_ref_hostname_defaults() {
        let svc = ServiceRef {
            name: "reviews".to_string(),
            ..Default::default()
        };
        assert_eq!(
            svc.hostname("default", "cluster.local"),
            "reviews.default.svc.cluster.local"
        );

        let svc = ServiceRef {
            name: "reviews".to_string(),
            namespace: Some("bookinfo".to_string()),
            domain: Some("mesh.internal".to_string()),
            ..Default::default()
        };
        assert_eq!(
            svc.hostname("default", "cluster.local"),
            "reviews.bookinfo.svc.mesh.internal"
        );
    }
}
