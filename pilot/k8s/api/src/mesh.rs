//! Mesh-wide settings shared by every pilot command.

use crate::duration::GoDuration;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The ConfigMap key holding the JSON-encoded [`MeshConfig`].
pub const CONFIG_MAP_KEY: &str = "mesh";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeshConfig {
    pub ingress_controller_mode: IngressMode,

    /// Ingresses annotated with this class are managed by the mesh.
    pub ingress_class: String,

    /// The service whose load balancer addresses are written to the status
    /// of managed ingresses.
    pub ingress_service: String,

    /// How often proxies should poll discovery.
    pub discovery_refresh_delay: GoDuration,

    /// The port proxies listen on for captured traffic.
    pub proxy_listen_port: u16,
}

/// Which ingresses the mesh translates into route rules.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngressMode {
    /// Ingresses are ignored.
    Off,

    /// Ingresses with the mesh class, or with no class at all.
    #[default]
    Default,

    /// Only ingresses with the mesh class.
    Strict,
}

// === impl MeshConfig ===

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ingress_controller_mode: IngressMode::Default,
            ingress_class: "mesh".to_string(),
            ingress_service: "mesh-ingress".to_string(),
            discovery_refresh_delay: GoDuration::from_secs(1),
            proxy_listen_port: 15001,
        }
    }
}

impl MeshConfig {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

// === impl IngressMode ===

impl IngressMode {
    /// Whether the mesh manages an ingress annotated with `class`, given the
    /// mesh's own ingress class.
    pub fn manages(&self, class: Option<&str>, mesh_class: &str) -> bool {
        match self {
            Self::Off => false,
            Self::Default => class.map(|c| c == mesh_class).unwrap_or(true),
            Self::Strict => class == Some(mesh_class),
        }
    }
}

impl FromStr for IngressMode {
    type Err = InvalidIngressMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "default" => Ok(Self::Default),
            "strict" => Ok(Self::Strict),
            _ => Err(InvalidIngressMode(s.to_string())),
        }
    }
}

impl fmt::Display for IngressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => "off".fmt(f),
            Self::Default => "default".fmt(f),
            Self::Strict => "strict".fmt(f),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid ingress mode {0:?}; expected off, default, or strict")]
pub struct InvalidIngressMode(String);
