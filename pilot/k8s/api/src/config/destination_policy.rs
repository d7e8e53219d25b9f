use super::ServiceRef;
use crate::duration::GoDuration;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Describes load balancing and circuit breaking for a destination service.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "config.mesh.io",
    version = "v1alpha2",
    kind = "DestinationPolicy",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DestinationPolicySpec {
    pub destination: ServiceRef,

    /// Limits the policy to requests from this source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ServiceRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancing: Option<LoadBalancing>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreaker>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalancing {
    RoundRobin,
    LeastConn,
    Random,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreaker {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_max_pending_requests: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_consecutive_errors: Option<u32>,

    /// How long an ejected host stays out of the load balancing pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub sleep_window: Option<GoDuration>,
}
