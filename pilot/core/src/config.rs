use futures::Stream;
use serde::Serialize;
use std::{fmt, pin::Pin, sync::Arc};

/// Uniquely identifies a configuration object across all sources.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ConfigKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// An immutable, versioned configuration payload.
///
/// Objects are shared behind an `Arc` once published; an update replaces the
/// object rather than mutating it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConfigObject {
    #[serde(flatten)]
    pub key: ConfigKey,

    /// Source-assigned token. Two objects with the same key and revision are
    /// considered identical.
    pub revision: String,

    pub spec: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ChangeEvent {
    Added(Arc<ConfigObject>),
    Updated(Arc<ConfigObject>),
    Deleted(ConfigKey),
}

/// An infinite stream of change events.
pub type EventStream = Pin<Box<dyn Stream<Item = ChangeEvent> + Send + 'static>>;

// === impl ConfigKey ===

impl ConfigKey {
    pub fn new(kind: impl ToString, namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

// === impl ConfigObject ===

impl ConfigObject {
    pub fn new(key: ConfigKey, revision: impl ToString, spec: serde_json::Value) -> Self {
        Self {
            key,
            revision: revision.to_string(),
            spec,
        }
    }

    #[inline]
    pub fn kind(&self) -> &str {
        &self.key.kind
    }
}

// === impl ChangeEvent ===

impl ChangeEvent {
    pub fn key(&self) -> &ConfigKey {
        match self {
            Self::Added(obj) | Self::Updated(obj) => &obj.key,
            Self::Deleted(key) => key,
        }
    }

    pub fn object(&self) -> Option<&Arc<ConfigObject>> {
        match self {
            Self::Added(obj) | Self::Updated(obj) => Some(obj),
            Self::Deleted(_) => None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted(_))
    }
}
