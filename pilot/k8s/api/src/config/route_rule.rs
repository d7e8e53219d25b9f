use super::ServiceRef;
use crate::duration::GoDuration;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Describes how requests to a destination service are routed.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "config.mesh.io",
    version = "v1alpha2",
    kind = "RouteRule",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct RouteRuleSpec {
    pub destination: ServiceRef,

    /// Rules with higher precedence are evaluated first.
    #[serde(default)]
    pub precedence: i32,

    #[serde(default, rename = "match", skip_serializing_if = "Option::is_none")]
    pub matches: Option<MatchCondition>,

    /// Weighted destinations. When empty, all traffic goes to `destination`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub route: Vec<DestinationWeight>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub timeout: Option<GoDuration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<Retries>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<Rewrite>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ServiceRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestMatch>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestMatch {
    /// Matches on request headers. The pseudo-headers `authority` and `uri`
    /// match the request host and path.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, StringMatch>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum StringMatch {
    Exact(String),
    Prefix(String),
    Regex(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DestinationWeight {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<ServiceRef>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Percentage of traffic, 0 to 100.
    pub weight: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Retries {
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub per_try_timeout: Option<GoDuration>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Rewrite {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority: Option<String>,
}

impl RouteRuleSpec {
    /// The sum of route weights, which must be 100 when any route is given.
    pub fn total_weight(&self) -> u32 {
        self.route.iter().map(|r| r.weight).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn deserializes_route_rule() {
        let spec = serde_json::from_value::<RouteRuleSpec>(serde_json::json!({
            "destination": { "name": "reviews" },
            "precedence": 2,
            "match": {
                "request": { "headers": { "cookie": { "regex": "^(.*?;)?(user=jason)(;.*)?$" } } }
            },
            "route": [
                { "labels": { "version": "v1" }, "weight": 75 },
                { "labels": { "version": "v3" }, "weight": 25 }
            ],
            "timeout": "2s"
        }))
        .expect("valid route rule");

        assert_eq!(spec.precedence, 2);
        assert_eq!(spec.total_weight(), 100);
        assert_eq!(spec.timeout, Some(GoDuration::from_secs(2)));
        assert_eq!(
            spec.matches.unwrap().request.unwrap().headers,
            btreemap! {
                "cookie".to_string() => StringMatch::Regex("^(.*?;)?(user=jason)(;.*)?$".to_string()),
            }
        );
        assert_eq!(spec.route[0].labels, btreemap! { "version".to_string() => "v1".to_string() });
    }
}
